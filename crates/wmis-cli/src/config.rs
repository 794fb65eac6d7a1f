use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use wmis_collector::jsonl_source::DEFAULT_PAGE_SIZE;
use wmis_collector::{CollectionOptions, RetryPolicy, DEFAULT_MAX_PAGE_FETCHES};
use wmis_pipeline::{PipelineOptions, DEFAULT_BATCH_SIZE};

pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_EXTRACTOR_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub export_dir: PathBuf,
    pub page_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("exports"),
            page_size: DEFAULT_PAGE_SIZE,
            max_retries: 0,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub max_page_fetches: u32,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_page_fetches: DEFAULT_MAX_PAGE_FETCHES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub command: Vec<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Per-batch deadline for the command; `0` waits indefinitely.
    pub timeout_secs: u64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "extract.py".to_string()],
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: 1,
            retry_backoff_ms: 1_000,
            timeout_secs: DEFAULT_EXTRACTOR_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/market_data.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/checkpoints.json"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub groups: Vec<String>,
    pub source: SourceConfig,
    pub collection: CollectionConfig,
    pub extractor: ExtractorConfig,
    pub database: DatabaseConfig,
    pub checkpoint: CheckpointConfig,
    /// Directory of the config file; relative paths above resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_yaml(&contents, &base_dir).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml(contents: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        // An empty file deserializes to unit, not to an empty mapping.
        let mut config = if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(contents).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?
        };

        config.base_dir = base_dir.to_path_buf();
        config.source.export_dir = resolve(base_dir, &config.source.export_dir);
        config.database.path = resolve(base_dir, &config.database.path);
        config.checkpoint.path = resolve(base_dir, &config.checkpoint.path);
        config.groups.retain(|group| !group.trim().is_empty());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extractor.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "extractor.batch_size must be at least 1".to_string(),
            ));
        }
        if self.collection.max_page_fetches == 0 {
            return Err(ConfigError::Invalid(
                "collection.max_page_fetches must be at least 1".to_string(),
            ));
        }
        if self.source.page_size == 0 {
            return Err(ConfigError::Invalid(
                "source.page_size must be at least 1".to_string(),
            ));
        }
        if self
            .extractor
            .command
            .first()
            .map_or(true, |program| program.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "extractor.command must name a program".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            batch_size: self.extractor.batch_size,
            collection: CollectionOptions {
                max_page_fetches: self.collection.max_page_fetches,
            },
        }
    }

    pub fn source_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.source.max_retries, self.source.retry_backoff_ms)
    }

    pub fn extractor_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.extractor.max_retries, self.extractor.retry_backoff_ms)
    }

    pub fn extractor_timeout(&self) -> Option<Duration> {
        let secs = self.extractor.timeout_secs;
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
