mod mapping;
mod parse;

pub use mapping::{container_to_host, host_to_container, validate_map, MapEntry, MapOptions};
pub use parse::{parse_mapping, parse_mappings};
