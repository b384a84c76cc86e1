use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// a single range in a uid/gid mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    /// start of range as seen inside the container
    #[serde(rename = "containerID")]
    pub container_id: u32,
    /// start of range as stored on the host filesystem
    #[serde(rename = "hostID")]
    pub host_id: u32,
    /// number of ids in this range
    pub size: u32,
}

impl MapEntry {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// check if a container id falls within this range
    pub fn contains_container(&self, id: u32) -> bool {
        id >= self.container_id && id < self.container_id.saturating_add(self.size)
    }

    /// check if a host id falls within this range
    pub fn contains_host(&self, id: u32) -> bool {
        id >= self.host_id && id < self.host_id.saturating_add(self.size)
    }
}

/// convert a container id to a host id
pub fn container_to_host(id: u32, map: &[MapEntry]) -> Option<u32> {
    map.iter()
        .find(|entry| entry.contains_container(id))
        .and_then(|entry| entry.host_id.checked_add(id - entry.container_id))
}

/// convert a host id back to a container id
pub fn host_to_container(id: u32, map: &[MapEntry]) -> Option<u32> {
    map.iter()
        .find(|entry| entry.contains_host(id))
        .and_then(|entry| entry.container_id.checked_add(id - entry.host_id))
}

/// reject maps whose container-side ranges overlap
pub fn validate_map(map: &[MapEntry]) -> Result<()> {
    for entry in map {
        if entry.size == 0 {
            return Err(Error::InvalidMapping(format!(
                "{}:{}:0 has an empty range",
                entry.container_id, entry.host_id
            )));
        }
    }

    let mut sorted: Vec<&MapEntry> = map.iter().collect();
    sorted.sort_by_key(|e| e.container_id);
    for window in sorted.windows(2) {
        let end = u64::from(window[0].container_id) + u64::from(window[0].size);
        if end > u64::from(window[1].container_id) {
            return Err(Error::InvalidMapping(format!(
                "container ranges starting at {} and {} overlap",
                window[0].container_id, window[1].container_id
            )));
        }
    }
    Ok(())
}

/// mapping options recorded for an unpacked bundle
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapOptions {
    #[serde(default)]
    pub rootless: bool,
    #[serde(default)]
    pub uid_mappings: Vec<MapEntry>,
    #[serde(default)]
    pub gid_mappings: Vec<MapEntry>,
}

impl MapOptions {
    /// rootless options that place container root on the invoking user
    /// when no explicit mappings were given
    pub fn rootless(uid_mappings: Vec<MapEntry>, gid_mappings: Vec<MapEntry>) -> Self {
        let mut opts = Self {
            rootless: true,
            uid_mappings,
            gid_mappings,
        };
        opts.fill_rootless_defaults(
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        );
        opts
    }

    /// fill empty mapping lists with a single-entry map of container root to the given ids
    pub fn fill_rootless_defaults(&mut self, euid: u32, egid: u32) {
        if self.uid_mappings.is_empty() {
            self.uid_mappings.push(MapEntry::new(0, euid, 1));
        }
        if self.gid_mappings.is_empty() {
            self.gid_mappings.push(MapEntry::new(0, egid, 1));
        }
    }

    /// check both lists for overlapping ranges
    pub fn validate(&self) -> Result<()> {
        validate_map(&self.uid_mappings)?;
        validate_map(&self.gid_mappings)
    }

    /// container uid to host uid
    pub fn host_uid(&self, id: u32) -> Result<u32> {
        map_id(id, &self.uid_mappings, container_to_host, "uid")
    }

    /// container gid to host gid
    pub fn host_gid(&self, id: u32) -> Result<u32> {
        map_id(id, &self.gid_mappings, container_to_host, "gid")
    }

    /// host uid back to container uid
    pub fn container_uid(&self, id: u32) -> Result<u32> {
        map_id(id, &self.uid_mappings, host_to_container, "uid")
    }

    /// host gid back to container gid
    pub fn container_gid(&self, id: u32) -> Result<u32> {
        map_id(id, &self.gid_mappings, host_to_container, "gid")
    }
}

/// identity when no mappings are configured, otherwise the id must be covered
fn map_id(
    id: u32,
    map: &[MapEntry],
    lookup: fn(u32, &[MapEntry]) -> Option<u32>,
    kind: &'static str,
) -> Result<u32> {
    if map.is_empty() {
        return Ok(id);
    }
    lookup(id, map).ok_or(Error::IdOutOfRange { kind, id })
}
