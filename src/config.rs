use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compress::Compression;
use crate::error::{IoResultExt, Result};

/// tag used when an image reference names no tag
pub const DEFAULT_TAG: &str = "latest";

/// gzip block size used when none is configured
pub const DEFAULT_GZIP_BLOCK_SIZE: usize = 256 * 1024;

/// tool configuration, read from a toml file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// tag assumed for references without one
    #[serde(default = "default_tag")]
    pub default_tag: String,
    /// settings for newly generated layers
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// load from `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_tag: default_tag(),
            compression: CompressionConfig::default(),
        }
    }
}

/// layer compression settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub algorithm: Compression,
    /// bytes per independently compressed gzip block
    #[serde(default = "default_gzip_block_size")]
    pub gzip_block_size: usize,
    /// blocks compressed at once; twice the cpu count when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gzip_concurrency: Option<usize>,
    /// zstd level, 0 selects the library default
    #[serde(default)]
    pub zstd_level: i32,
}

impl CompressionConfig {
    /// settings for `algorithm` with everything else at defaults
    pub fn with_algorithm(algorithm: Compression) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    /// effective gzip concurrency
    pub fn gzip_concurrency(&self) -> usize {
        self.gzip_concurrency.filter(|n| *n > 0).unwrap_or_else(|| {
            2 * std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: Compression::default(),
            gzip_block_size: DEFAULT_GZIP_BLOCK_SIZE,
            gzip_concurrency: None,
            zstd_level: 0,
        }
    }
}

fn default_tag() -> String {
    DEFAULT_TAG.to_string()
}

fn default_gzip_block_size() -> usize {
    DEFAULT_GZIP_BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config {
            default_tag: "stable".to_string(),
            compression: CompressionConfig {
                algorithm: Compression::Zstd,
                gzip_block_size: 1024,
                gzip_concurrency: Some(3),
                zstd_level: 9,
            },
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_config_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.default_tag, "latest");
        assert_eq!(config.compression.algorithm, Compression::Gzip);
        assert_eq!(config.compression.gzip_block_size, 256 * 1024);
    }

    #[test]
    fn test_config_partial_compression() {
        let toml_str = r#"
[compression]
algorithm = "none"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.compression.algorithm, Compression::None);
        assert_eq!(config.compression.gzip_block_size, DEFAULT_GZIP_BLOCK_SIZE);
    }

    #[test]
    fn test_gzip_concurrency_default() {
        let settings = CompressionConfig::default();
        assert!(settings.gzip_concurrency() >= 2);

        let fixed = CompressionConfig {
            gzip_concurrency: Some(5),
            ..Default::default()
        };
        assert_eq!(fixed.gzip_concurrency(), 5);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ocimod.toml");
        std::fs::write(&path, "default_tag = \"edge\"\n").unwrap();
        let config = Config {
            default_tag: "edge".to_string(),
            ..Default::default()
        };
        assert_eq!(Config::load(&path).unwrap(), config);
        assert_eq!(Config::load_or_default(None).unwrap(), Config::default());
    }
}
