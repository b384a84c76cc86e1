use crate::error::{Error, Result};
use crate::idmap::MapEntry;

/// parse a `containerID:hostID[:size]` mapping rule; size defaults to 1
pub fn parse_mapping(rule: &str) -> Result<MapEntry> {
    let invalid = |why: &str| Error::InvalidMapping(format!("{}: {}", rule, why));

    let parts: Vec<&str> = rule.trim().split(':').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return Err(invalid("expected containerID:hostID[:size]"));
    }

    let container_id: u32 = parts[0]
        .parse()
        .map_err(|_| invalid("container id is not a number"))?;
    let host_id: u32 = parts[1]
        .parse()
        .map_err(|_| invalid("host id is not a number"))?;
    let size: u32 = match parts.get(2) {
        Some(s) => s.parse().map_err(|_| invalid("size is not a number"))?,
        None => 1,
    };

    if size == 0 {
        return Err(invalid("size must be positive"));
    }
    if container_id.checked_add(size - 1).is_none() || host_id.checked_add(size - 1).is_none() {
        return Err(invalid("range exceeds the id space"));
    }

    Ok(MapEntry::new(container_id, host_id, size))
}

/// parse a list of mapping rules, rejecting overlapping container ranges
pub fn parse_mappings<S: AsRef<str>>(rules: &[S]) -> Result<Vec<MapEntry>> {
    let entries = rules
        .iter()
        .map(|r| parse_mapping(r.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    crate::idmap::validate_map(&entries)?;
    Ok(entries)
}
