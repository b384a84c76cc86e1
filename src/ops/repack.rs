use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::SystemTime;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::bundle::{mtree_path, rootfs_path, BundleMeta};
use crate::cas::{
    fetch_config, fetch_manifest, put_blob, put_json, update_reference, validate_reference_name,
    Store,
};
use crate::compress::{pipe, PIPE_CAPACITY};
use crate::config::CompressionConfig;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::fs::{fs_eval_for, FsEval};
use crate::idmap::MapOptions;
use crate::layer::write_layer;
use crate::snapshot::{diff, walk, Snapshot};
use crate::types::{media_type, Descriptor, DiffEntry, Manifest};

/// repack options
#[derive(Clone, Debug, Default)]
pub struct RepackOptions {
    /// compression of the new layer
    pub compression: CompressionConfig,
    /// point the bundle at the new manifest afterwards
    pub refresh_bundle: bool,
    /// comment for the new history entry
    pub history_comment: Option<String>,
}

/// turn the changes made to a bundle's rootfs into a new layer
///
/// the layer is appended to the manifest the bundle was unpacked from, and
/// `tag` is pointed at the resulting manifest.
pub fn repack(store: &Store, bundle: &Path, tag: &str, opts: &RepackOptions) -> Result<Descriptor> {
    validate_reference_name(tag)?;
    let meta = BundleMeta::read(bundle)?;
    let eval = fs_eval_for(&meta.map_options);
    let rootfs = rootfs_path(bundle);

    let old_mtree = mtree_path(bundle, &meta.from.digest);
    let old = match Snapshot::read_from(&old_mtree) {
        Err(Error::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            return Err(Error::InvalidBundle {
                path: bundle.to_path_buf(),
                message: format!("missing snapshot {}", old_mtree.display()),
            })
        }
        other => other?,
    };
    let new = walk(&rootfs, eval)?;
    let changes = diff(&old, &new);
    info!(
        bundle = %bundle.display(),
        from = %meta.from.digest,
        changes = changes.len(),
        "repacking bundle"
    );
    for change in &changes {
        debug!(%change, "change");
    }

    let manifest = fetch_manifest(store, &meta.from)?;
    let mut config = fetch_config(store, &manifest.config)?;

    let (layer, diff_id) = store_layer(store, &rootfs, &changes, &new, &meta.map_options, eval, opts)?;
    info!(digest = %layer.digest, diff_id = %diff_id, size = layer.size, "stored layer");

    append_layer_to_config(&mut config, &diff_id, opts.history_comment.as_deref())?;
    let config_desc = put_json(store, &manifest.config.media_type, &config)?;

    let mut next = manifest.clone();
    next.config = config_desc;
    next.layers.push(layer);
    let manifest_media_type = manifest_media_type(&meta.from, &manifest);
    let manifest_desc = put_json(store, &manifest_media_type, &next)?;
    update_reference(store, tag, &manifest_desc)?;

    if opts.refresh_bundle && manifest_desc.digest != meta.from.digest {
        new.write_new(&mtree_path(bundle, &manifest_desc.digest))?;
        BundleMeta {
            from: manifest_desc.clone(),
            ..meta
        }
        .replace(bundle)?;
        fs::remove_file(&old_mtree).map_err(|source| Error::Io {
            path: old_mtree.clone(),
            source,
        })?;
        debug!(digest = %manifest_desc.digest, "refreshed bundle");
    }

    Ok(manifest_desc)
}

/// generate, compress and store the layer concurrently
///
/// returns the stored blob's descriptor and the digest of the uncompressed
/// tar stream.
fn store_layer(
    store: &Store,
    rootfs: &Path,
    changes: &[DiffEntry],
    new: &Snapshot,
    map: &MapOptions,
    eval: &dyn FsEval,
    opts: &RepackOptions,
) -> Result<(Descriptor, Digest)> {
    let compression = opts.compression.algorithm;
    let compressor = compression.compressor(&opts.compression);
    let layer_media_type = compression.layer_media_type();

    thread::scope(|s| {
        let (writer, reader) = pipe(PIPE_CAPACITY);
        let producer = thread::Builder::new()
            .name("layer-generate".to_string())
            .spawn_scoped(s, move || write_layer(writer, rootfs, changes, new, map, eval))
            .map_err(|source| Error::Spawn {
                name: "layer-generate",
                source,
            })?;

        let stored = compressor
            .compress(reader)
            .and_then(|mut stream| put_blob(store, &layer_media_type, &mut stream));
        debug!(uncompressed = compressor.bytes_read(), "layer stream drained");
        let generated = match producer.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        match (generated, stored) {
            (Ok(diff_id), Ok(desc)) => Ok((desc, diff_id)),
            // the producer only saw the consumer go away
            (Err(Error::Io { source, .. }), Err(e)) if source.kind() == io::ErrorKind::BrokenPipe => {
                Err(e)
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    })
}

/// record a new layer in an image config
fn append_layer_to_config(config: &mut Value, diff_id: &Digest, comment: Option<&str>) -> Result<()> {
    let config = config
        .as_object_mut()
        .ok_or_else(|| Error::InvalidImageConfig("config is not a json object".to_string()))?;

    let rootfs = config
        .entry("rootfs")
        .or_insert_with(|| json!({ "type": "layers", "diff_ids": [] }))
        .as_object_mut()
        .ok_or_else(|| Error::InvalidImageConfig("rootfs is not an object".to_string()))?;
    rootfs
        .entry("diff_ids")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| Error::InvalidImageConfig("rootfs.diff_ids is not an array".to_string()))?
        .push(Value::String(diff_id.to_string()));

    let mut entry = Map::new();
    entry.insert(
        "created".to_string(),
        Value::String(humantime::format_rfc3339_seconds(SystemTime::now()).to_string()),
    );
    entry.insert("created_by".to_string(), Value::String("ocimod repack".to_string()));
    if let Some(comment) = comment {
        entry.insert("comment".to_string(), Value::String(comment.to_string()));
    }
    config
        .entry("history")
        .or_insert_with(|| Value::Array(Vec::new()))
        .as_array_mut()
        .ok_or_else(|| Error::InvalidImageConfig("history is not an array".to_string()))?
        .push(Value::Object(entry));
    Ok(())
}

fn manifest_media_type(from: &Descriptor, manifest: &Manifest) -> String {
    manifest
        .media_type
        .clone()
        .filter(|m| media_type::is_manifest(m))
        .unwrap_or_else(|| from.media_type.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::mtree_file_name;
    use crate::cas::resolve_reference;
    use crate::compress::Compression;
    use crate::ops::unpack;
    use crate::testutil::{build_image, rootless_map, LayerBuilder};
    use tempfile::tempdir;

    fn unpacked(dir: &Path) -> (Store, std::path::PathBuf) {
        let store = Store::create(&dir.join("image")).unwrap();
        let layer = LayerBuilder::new()
            .dir("etc", 0o755)
            .file("etc/hostname", b"box\n", 0o644)
            .file("etc/issue", b"v1\n", 0o644)
            .build();
        build_image(&store, "latest", &[layer], Compression::Gzip);
        let bundle = dir.join("bundle");
        unpack(&store, "latest", &bundle, &rootless_map()).unwrap();
        (store, bundle)
    }

    #[test]
    fn test_repack_roundtrip() {
        let dir = tempdir().unwrap();
        let (store, bundle) = unpacked(dir.path());
        let rootfs = rootfs_path(&bundle);

        fs::write(rootfs.join("etc/hostname"), "changed\n").unwrap();
        fs::remove_file(rootfs.join("etc/issue")).unwrap();
        fs::create_dir(rootfs.join("opt")).unwrap();
        fs::write(rootfs.join("opt/tool"), "#!/bin/sh\n").unwrap();

        let opts = RepackOptions {
            history_comment: Some("edit".to_string()),
            ..Default::default()
        };
        let desc = repack(&store, &bundle, "next", &opts).unwrap();
        assert_eq!(resolve_reference(&store, "next").unwrap(), desc);

        let manifest = fetch_manifest(&store, &desc).unwrap();
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[1].media_type, Compression::Gzip.layer_media_type());
        let config = fetch_config(&store, &manifest.config).unwrap();
        assert_eq!(config["rootfs"]["diff_ids"].as_array().unwrap().len(), 2);
        assert_eq!(config["history"][0]["comment"], "edit");
        assert_eq!(config["history"][0]["created_by"], "ocimod repack");

        let second = dir.path().join("second");
        unpack(&store, "next", &second, &rootless_map()).unwrap();
        let rootfs2 = rootfs_path(&second);
        assert_eq!(fs::read(rootfs2.join("etc/hostname")).unwrap(), b"changed\n");
        assert!(!rootfs2.join("etc/issue").exists());
        assert_eq!(fs::read(rootfs2.join("opt/tool")).unwrap(), b"#!/bin/sh\n");

        // the original tag is untouched
        let original = resolve_reference(&store, "latest").unwrap();
        assert_eq!(fetch_manifest(&store, &original).unwrap().layers.len(), 1);
    }

    #[test]
    fn test_repack_zstd_layer() {
        let dir = tempdir().unwrap();
        let (store, bundle) = unpacked(dir.path());
        fs::write(rootfs_path(&bundle).join("added"), "z").unwrap();

        let opts = RepackOptions {
            compression: CompressionConfig::with_algorithm(Compression::Zstd),
            ..Default::default()
        };
        let desc = repack(&store, &bundle, "zst", &opts).unwrap();
        let manifest = fetch_manifest(&store, &desc).unwrap();
        assert!(manifest.layers[1].media_type.ends_with("+zstd"));

        let out = dir.path().join("out");
        unpack(&store, "zst", &out, &rootless_map()).unwrap();
        assert_eq!(fs::read(rootfs_path(&out).join("added")).unwrap(), b"z");
    }

    #[test]
    fn test_refresh_bundle_moves_snapshot() {
        let dir = tempdir().unwrap();
        let (store, bundle) = unpacked(dir.path());
        let before = BundleMeta::read(&bundle).unwrap();
        fs::write(rootfs_path(&bundle).join("added"), "x").unwrap();

        let opts = RepackOptions {
            refresh_bundle: true,
            ..Default::default()
        };
        let desc = repack(&store, &bundle, "latest", &opts).unwrap();

        let after = BundleMeta::read(&bundle).unwrap();
        assert_eq!(after.from, desc);
        assert!(bundle.join(mtree_file_name(&desc.digest)).exists());
        assert!(!bundle.join(mtree_file_name(&before.from.digest)).exists());

        // a second repack starts from the refreshed snapshot
        let again = repack(&store, &bundle, "latest", &opts).unwrap();
        let manifest = fetch_manifest(&store, &again).unwrap();
        assert_eq!(manifest.layers.len(), 3);
    }

    #[test]
    fn test_repack_without_bundle_metadata() {
        let dir = tempdir().unwrap();
        let store = Store::create(&dir.path().join("image")).unwrap();
        assert!(matches!(
            repack(&store, dir.path(), "x", &RepackOptions::default()),
            Err(Error::InvalidBundle { .. })
        ));
    }

    #[test]
    fn test_append_layer_to_config() {
        let mut config = json!({ "os": "linux" });
        let diff_id = Digest::of(b"layer");
        append_layer_to_config(&mut config, &diff_id, None).unwrap();
        assert_eq!(config["rootfs"]["type"], "layers");
        assert_eq!(config["rootfs"]["diff_ids"][0], diff_id.to_string());
        assert!(config["history"][0].get("comment").is_none());

        let mut broken = json!([1, 2]);
        assert!(matches!(
            append_layer_to_config(&mut broken, &diff_id, None),
            Err(Error::InvalidImageConfig(_))
        ));
    }
}
