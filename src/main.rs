//! ocimod CLI - unpack OCI images into bundles and repack them

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ocimod::cas::{
    delete_reference, list_references, list_references_matching, resolve_reference,
    update_reference, ImageRef, Store,
};
use ocimod::compress::Compression;
use ocimod::idmap::{parse_mappings, MapOptions};
use ocimod::ops::{gc, repack, snapshot_bundle, unpack, RepackOptions};
use ocimod::snapshot::{diff, Snapshot};
use ocimod::{bundle, BundleMeta, Config};

#[derive(Parser)]
#[command(name = "ocimod")]
#[command(about = "unpack OCI images into runtime bundles and repack changes as new layers")]
#[command(version)]
struct Cli {
    /// configuration file
    #[arg(long, env = "OCIMOD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// create an empty image layout
    Init {
        #[arg(long)]
        layout: PathBuf,
    },

    /// list tags
    Ls {
        #[arg(long)]
        layout: PathBuf,

        /// only tags matching this glob
        pattern: Option<String>,
    },

    /// add a tag for an existing image
    Tag {
        /// source image, path[:tag]
        #[arg(long)]
        image: String,

        new_tag: String,
    },

    /// remove a tag
    Rm {
        /// image to untag, path[:tag]
        #[arg(long)]
        image: String,
    },

    /// unpack an image into a runtime bundle
    Unpack {
        /// image to unpack, path[:tag]
        #[arg(long)]
        image: String,

        /// uid mapping containerID:hostID[:size], repeatable
        #[arg(long = "uid-map")]
        uid_map: Vec<String>,

        /// gid mapping containerID:hostID[:size], repeatable
        #[arg(long = "gid-map")]
        gid_map: Vec<String>,

        /// unpack without privileges
        #[arg(long)]
        rootless: bool,

        /// destination bundle
        bundle: PathBuf,
    },

    /// store a bundle's changes as a new layer
    Repack {
        /// tag to create, path[:tag]
        #[arg(long)]
        image: String,

        /// layer compression: none, gzip or zstd
        #[arg(long)]
        compression: Option<Compression>,

        /// point the bundle at the new image afterwards
        #[arg(long)]
        refresh_bundle: bool,

        /// comment recorded in the image history
        #[arg(long)]
        history_comment: Option<String>,

        bundle: PathBuf,
    },

    /// show changes made to a bundle since it was unpacked
    Status { bundle: PathBuf },

    /// garbage collect unreachable blobs
    Gc {
        #[arg(long)]
        layout: PathBuf,

        /// only show what would be removed
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_image(reference: &str, config: &Config) -> ocimod::Result<(Store, String)> {
    let image = ImageRef::parse(reference, &config.default_tag)?;
    Ok((Store::open(&image.layout)?, image.tag))
}

fn run(cli: Cli) -> ocimod::Result<()> {
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Init { layout } => {
            Store::create(&layout)?;
            println!("created image layout at {}", layout.display());
        }

        Commands::Ls { layout, pattern } => {
            let store = Store::open(&layout)?;
            let tags = match pattern {
                Some(pattern) => list_references_matching(&store, &pattern)?,
                None => list_references(&store)?,
            };
            for tag in tags {
                let desc = resolve_reference(&store, &tag)?;
                println!("{} {}", desc.digest, tag);
            }
        }

        Commands::Tag { image, new_tag } => {
            let (store, tag) = open_image(&image, &config)?;
            let desc = resolve_reference(&store, &tag)?;
            update_reference(&store, &new_tag, &desc)?;
            println!("{} {}", desc.digest, new_tag);
        }

        Commands::Rm { image } => {
            let (store, tag) = open_image(&image, &config)?;
            delete_reference(&store, &tag)?;
            println!("removed tag {}", tag);
        }

        Commands::Unpack {
            image,
            uid_map,
            gid_map,
            rootless,
            bundle,
        } => {
            let (store, tag) = open_image(&image, &config)?;
            let uid_mappings = parse_mappings(uid_map.as_slice())?;
            let gid_mappings = parse_mappings(gid_map.as_slice())?;
            let map_options = if rootless {
                MapOptions::rootless(uid_mappings, gid_mappings)
            } else {
                MapOptions {
                    rootless: false,
                    uid_mappings,
                    gid_mappings,
                }
            };
            let desc = unpack(&store, &tag, &bundle, &map_options)?;
            println!("unpacked {} to {}", desc.digest, bundle.display());
        }

        Commands::Repack {
            image,
            compression,
            refresh_bundle,
            history_comment,
            bundle,
        } => {
            let (store, tag) = open_image(&image, &config)?;
            let mut settings = config.compression.clone();
            if let Some(compression) = compression {
                settings.algorithm = compression;
            }
            let opts = RepackOptions {
                compression: settings,
                refresh_bundle,
                history_comment,
            };
            let desc = repack(&store, &bundle, &tag, &opts)?;
            println!("{} {}", desc.digest, tag);
        }

        Commands::Status { bundle } => {
            for change in bundle_changes(&bundle)? {
                println!("{}", change);
            }
        }

        Commands::Gc { layout, dry_run } => {
            let store = Store::open(&layout)?;
            let stats = gc(&store, dry_run)?;

            let action = if dry_run { "would remove" } else { "removed" };
            println!(
                "{} {} blobs, {} temporary files",
                action, stats.blobs_removed, stats.temp_files_removed
            );
            println!("freed {} bytes", stats.bytes_freed);
        }
    }

    Ok(())
}

fn bundle_changes(bundle: &Path) -> ocimod::Result<Vec<ocimod::DiffEntry>> {
    let meta = BundleMeta::read(bundle)?;
    let recorded = Snapshot::read_from(&bundle::mtree_path(bundle, &meta.from.digest))?;
    let current = snapshot_bundle(bundle)?;
    Ok(diff(&recorded, &current))
}
