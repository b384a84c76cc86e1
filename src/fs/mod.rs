pub mod eval;
pub mod path;
pub mod read;
pub mod write;
pub mod xattr;

pub use eval::{fs_eval_for, DefaultFsEval, FsEval, RootlessFsEval};
pub use path::{clean, resolve_in_root};
pub use read::{read_symlink_target, read_xattrs, FileMetadata, FileType};
pub use write::{
    apply_xattrs, fsync_dir, remove_all, set_mode, set_times, ParentGuard, Timestamp,
};
