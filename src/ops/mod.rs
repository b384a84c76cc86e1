//! high-level operations on image layouts and bundles

mod gc;
mod repack;
mod unpack;

pub use gc::{gc, GcStats};
pub use repack::{repack, RepackOptions};
pub use unpack::{snapshot_bundle, unpack, unpack_with};
