mod change;
mod descriptor;

pub use change::{ChangeKind, DiffEntry, Xattr};
pub use descriptor::{media_type, Descriptor, Index, Manifest, REF_NAME_ANNOTATION};
