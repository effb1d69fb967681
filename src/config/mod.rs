use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::core::catalog::{ExchangeDecl, QueueDecl};
use crate::core::journal::{JournalGeometry, DEFAULT_FILE_PAGES, DEFAULT_NUM_FILES};
use crate::core::store::StoreOptions;
use crate::core::wal::WalConfig;

/// Effective store configuration after file values and environment overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub fsync_policy: Option<String>,
    pub num_jfiles: u32,
    pub jfile_size_pgs: u32,
    pub flush_interval_ms: u64,
    pub log_filter: Option<String>,
    /// Entities declared when the store starts.
    pub exchanges: Vec<ExchangeDecl>,
    pub queues: Vec<QueueDecl>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("blipstore-data"),
            fsync_policy: None,
            num_jfiles: DEFAULT_NUM_FILES,
            jfile_size_pgs: DEFAULT_FILE_PAGES,
            flush_interval_ms: 1000,
            log_filter: None,
            exchanges: Vec::new(),
            queues: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileConfig {
    pub dir: Option<PathBuf>,
    pub fsync_policy: Option<String>,
    pub num_jfiles: Option<u32>,
    pub jfile_size_pgs: Option<u32>,
    pub flush_interval_ms: Option<u64>,
    pub log: Option<String>,
    pub exchanges: Option<Vec<ExchangeDecl>>,
    pub queues: Option<Vec<QueueDecl>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

impl StoreConfig {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<FileConfig, ConfigError> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)?;
        let ext = path_ref
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("toml")
            .to_ascii_lowercase();

        if ext == "yaml" || ext == "yml" {
            let cfg: FileConfig = serde_yaml::from_str(&raw)?;
            Ok(cfg)
        } else {
            let cfg: FileConfig = toml::from_str(&raw)?;
            Ok(cfg)
        }
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: built-in defaults, then the file (`path` or `BLIPSTORE_CONFIG`),
    /// then `BLIPSTORE_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("BLIPSTORE_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let file_cfg = if let Some(p) = effective_path {
            Self::load_file(p)?
        } else {
            FileConfig::default()
        };

        let defaults = StoreConfig::default();
        let mut cfg = StoreConfig {
            dir: file_cfg.dir.unwrap_or(defaults.dir),
            fsync_policy: file_cfg.fsync_policy,
            num_jfiles: file_cfg.num_jfiles.unwrap_or(defaults.num_jfiles),
            jfile_size_pgs: file_cfg.jfile_size_pgs.unwrap_or(defaults.jfile_size_pgs),
            flush_interval_ms: file_cfg
                .flush_interval_ms
                .unwrap_or(defaults.flush_interval_ms),
            log_filter: file_cfg.log,
            exchanges: file_cfg.exchanges.unwrap_or_default(),
            queues: file_cfg.queues.unwrap_or_default(),
        };

        // Env overrides.
        if let Ok(v) = env::var("BLIPSTORE_DIR") {
            cfg.dir = PathBuf::from(v);
        }

        if let Ok(v) = env::var("BLIPSTORE_FSYNC_POLICY") {
            cfg.fsync_policy = Some(v);
        }

        if let Ok(v) = env::var("BLIPSTORE_NUM_JFILES") {
            cfg.num_jfiles = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("BLIPSTORE_NUM_JFILES: {e}")))?;
        }

        if let Ok(v) = env::var("BLIPSTORE_JFILE_SIZE_PGS") {
            cfg.jfile_size_pgs = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("BLIPSTORE_JFILE_SIZE_PGS: {e}")))?;
        }

        if let Ok(v) = env::var("BLIPSTORE_LOG") {
            cfg.log_filter = Some(v);
        }

        Ok(cfg)
    }

    /// Engine options derived from this configuration.
    pub fn store_options(&self) -> Result<StoreOptions, ConfigError> {
        let wal = match self.fsync_policy.as_deref() {
            Some(policy) => WalConfig::from_policy(policy)
                .map_err(|e| ConfigError::Parse(format!("fsync_policy: {e}")))?,
            None => WalConfig::default(),
        };
        let geometry = JournalGeometry::new(self.num_jfiles, self.jfile_size_pgs)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(StoreOptions::new(self.dir.clone())
            .with_wal(wal)
            .with_default_journal(geometry))
    }
}
