//! content-addressed storage over an OCI image layout directory

mod blob;
mod refs;
mod store;

use std::path::PathBuf;

pub use blob::{
    blob_exists, blob_path, fetch_blob, fetch_config, fetch_manifest, put_blob, put_json,
    read_blob, verify_blob, Blob, BlobData,
};
pub use refs::{
    delete_reference, find_references, list_references, list_references_matching, read_index,
    resolve_reference, update_reference, validate_reference_name,
};
pub(crate) use refs::write_index;
pub use store::{Store, StoreLock, LAYOUT_VERSION};

use crate::error::{Error, Result};

/// an image named as `<layout path>[:<tag>]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub layout: PathBuf,
    pub tag: String,
}

impl ImageRef {
    /// split `reference` at its last `:`; without one, `default_tag` is used
    pub fn parse(reference: &str, default_tag: &str) -> Result<Self> {
        let (layout, tag) = match reference.rsplit_once(':') {
            Some((layout, tag)) if !tag.contains('/') => (layout, tag),
            _ => (reference, default_tag),
        };
        if layout.is_empty() {
            return Err(Error::InvalidReference(format!("no layout path in {:?}", reference)));
        }
        validate_reference_name(tag)?;
        Ok(Self {
            layout: PathBuf::from(layout),
            tag: tag.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_with_tag() {
        let r = ImageRef::parse("/srv/images/base:v2", "latest").unwrap();
        assert_eq!(r.layout, PathBuf::from("/srv/images/base"));
        assert_eq!(r.tag, "v2");
    }

    #[test]
    fn test_image_ref_default_tag() {
        let r = ImageRef::parse("./image", "latest").unwrap();
        assert_eq!(r.layout, PathBuf::from("./image"));
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_image_ref_colon_in_directory() {
        let r = ImageRef::parse("/odd:dir/image", "latest").unwrap();
        assert_eq!(r.layout, PathBuf::from("/odd:dir/image"));
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_image_ref_invalid() {
        assert!(ImageRef::parse(":tag", "latest").is_err());
        assert!(ImageRef::parse("image:", "latest").is_err());
        assert!(ImageRef::parse("image:bad tag", "latest").is_err());
    }
}
