use std::fs;

use crate::cas::Store;
use crate::error::{Error, IoResultExt, Result};
use crate::types::{Descriptor, Index};

/// read the layout's index.json
pub fn read_index(store: &Store) -> Result<Index> {
    let path = store.index_path();
    let content = fs::read(&path).with_path(&path)?;
    serde_json::from_slice(&content).map_err(|e| Error::InvalidLayout {
        path: store.path().to_path_buf(),
        message: format!("unreadable index.json: {}", e),
    })
}

/// replace index.json atomically
pub(crate) fn write_index(store: &Store, index: &Index) -> Result<()> {
    store.write_atomic(&store.index_path(), &serde_json::to_vec_pretty(index)?)
}

/// every index entry tagged `name`
pub fn find_references(store: &Store, name: &str) -> Result<Vec<Descriptor>> {
    let index = read_index(store)?;
    Ok(index
        .manifests
        .into_iter()
        .filter(|desc| desc.ref_name() == Some(name))
        .collect())
}

/// the single descriptor tagged `name`
pub fn resolve_reference(store: &Store, name: &str) -> Result<Descriptor> {
    let mut found = find_references(store, name)?;
    match found.len() {
        0 => Err(Error::ReferenceNotFound(name.to_string())),
        1 => Ok(found.remove(0)),
        count => Err(Error::AmbiguousReference {
            name: name.to_string(),
            count,
        }),
    }
}

/// point tag `name` at `desc`, replacing any previous entries with that tag
pub fn update_reference(store: &Store, name: &str, desc: &Descriptor) -> Result<()> {
    validate_reference_name(name)?;
    let _lock = store.lock()?;

    let mut index = read_index(store)?;
    index.manifests.retain(|d| d.ref_name() != Some(name));
    index.manifests.push(desc.with_ref_name(name));
    write_index(store, &index)?;

    tracing::info!(tag = name, digest = %desc.digest, "updated reference");
    Ok(())
}

/// remove every entry tagged `name`
pub fn delete_reference(store: &Store, name: &str) -> Result<()> {
    let _lock = store.lock()?;

    let mut index = read_index(store)?;
    let before = index.manifests.len();
    index.manifests.retain(|d| d.ref_name() != Some(name));
    if index.manifests.len() == before {
        return Err(Error::ReferenceNotFound(name.to_string()));
    }
    write_index(store, &index)?;

    tracing::info!(tag = name, "deleted reference");
    Ok(())
}

/// list all tag names, sorted and deduplicated
pub fn list_references(store: &Store) -> Result<Vec<String>> {
    let index = read_index(store)?;
    let mut names: Vec<String> = index
        .manifests
        .iter()
        .filter_map(|d| d.ref_name().map(str::to_string))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// list tag names matching a glob pattern
pub fn list_references_matching(store: &Store, pattern: &str) -> Result<Vec<String>> {
    let all = list_references(store)?;
    let glob = glob::Pattern::new(pattern).map_err(|e| Error::InvalidReference(e.to_string()))?;

    Ok(all.into_iter().filter(|r| glob.matches(r)).collect())
}

/// validate a tag name
///
/// names are `/` separated components; each component starts and ends with
/// an ascii letter or digit and may contain `-._:@+` in between.
pub fn validate_reference_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidReference("empty reference name".to_string()));
    }

    for component in name.split('/') {
        let bytes = component.as_bytes();
        let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
            return Err(Error::InvalidReference(format!(
                "reference name has an empty component: {}",
                name
            )));
        };
        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(Error::InvalidReference(format!(
                "reference name components must start and end alphanumeric: {}",
                name
            )));
        }
        if let Some(bad) = component
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !"-._:@+".contains(*c))
        {
            return Err(Error::InvalidReference(format!(
                "reference name cannot contain {:?}: {}",
                bad, name
            )));
        }
    }

    Ok(())
}
