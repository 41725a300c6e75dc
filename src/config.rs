//! Daemon configuration: a small TOML file with serde-filled defaults.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::filestore::PartitionConfig;

pub const DEFAULT_CONFIG_FILE: &str = "fanout.toml";
pub const DEFAULT_DATA_DIR: &str = "fanout-data";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster node id; 0 runs standalone.
    pub node_id: u8,
    /// Directory holding partition log and index files.
    pub data_dir: PathBuf,
    pub partition: PartitionConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 0,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            partition: PartitionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("cannot read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config at {path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cannot write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config does not serialize: {source}")]
    Render {
        #[source]
        source: toml::ser::Error,
    },
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the config. A missing file is seeded with defaults; an unreadable
/// or unparsable one is left alone and defaults are used for this run.
pub fn load_or_init(path: &Path) -> Config {
    match load(path) {
        Ok(cfg) => cfg,
        Err(ConfigError::Read { ref source, .. }) if source.kind() == ErrorKind::NotFound => {
            let cfg = Config::default();
            if let Err(err) = write_config(path, &cfg) {
                tracing::warn!(%err, "could not seed default config");
            }
            cfg
        }
        Err(err) => {
            tracing::warn!(%err, "ignoring unusable config, running with defaults");
            Config::default()
        }
    }
}

/// Render and atomically replace the config file: the TOML is staged in a
/// sibling `.tmp` file and moved over the target in a single rename.
pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(cfg).map_err(|source| ConfigError::Render { source })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let staged = staging_path(path);
    fs::write(&staged, rendered.as_bytes()).map_err(|source| ConfigError::Write {
        path: staged.clone(),
        source,
    })?;
    fs::rename(&staged, path).map_err(|source| {
        let _ = fs::remove_file(&staged);
        ConfigError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fanout.toml");
        let cfg = Config {
            node_id: 3,
            data_dir: PathBuf::from("/var/lib/fanout"),
            partition: PartitionConfig {
                max_file_bytes: 1024,
                max_file_records: 99,
                index_cache_files: 2,
            },
            logging: LoggingConfig {
                stdout: false,
                format: LogFormat::Json,
            },
        };
        write_config(&path, &cfg).expect("write config");

        let loaded = load(&path).expect("load config");
        assert_eq!(loaded.node_id, 3);
        assert_eq!(loaded.data_dir, PathBuf::from("/var/lib/fanout"));
        assert_eq!(loaded.partition.max_file_records, 99);
        assert_eq!(loaded.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_file_is_seeded_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fanout.toml");

        let cfg = load_or_init(&path);
        assert_eq!(cfg.node_id, 0);
        assert!(path.exists());

        let reloaded = load(&path).expect("load written defaults");
        assert_eq!(reloaded.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn unparsable_file_is_preserved_and_defaults_used() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fanout.toml");
        fs::write(&path, "node_id = \"not a number\"\n").unwrap();

        let cfg = load_or_init(&path);
        assert_eq!(cfg.node_id, 0);

        // The broken file is left for the operator to inspect.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("not a number"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fanout.toml");
        fs::write(&path, "node_id = 7\n").unwrap();

        let cfg = load(&path).expect("load partial config");
        assert_eq!(cfg.node_id, 7);
        assert_eq!(
            cfg.partition.max_file_records,
            PartitionConfig::default().max_file_records
        );
    }

    #[test]
    fn write_replaces_without_leaving_staging_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fanout.toml");

        write_config(&path, &Config::default()).expect("first write");
        let mut cfg = Config::default();
        cfg.node_id = 9;
        write_config(&path, &cfg).expect("second write");

        assert_eq!(load(&path).expect("reload").node_id, 9);
        assert!(!staging_path(&path).exists());
    }
}
