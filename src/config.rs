use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime configuration, loaded from a YAML file.
///
/// Every field has a default, so a partial file (or no file at all) yields a
/// working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the database and downloaded audio. Defaults to the
    /// platform data directory.
    pub data_dir: Option<PathBuf>,
    pub audio: AudioConfig,
    pub whisper: WhisperConfig,
    pub ollama: OllamaConfig,
    pub search: SearchConfig,
    pub jobs: JobsConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Audio longer than this is split into fixed-length parts before
    /// transcription, each part independently retryable.
    pub max_minutes_before_split: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    pub embedding_model: String,
    pub chat_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of top-ranked chunks retrieved per question.
    pub top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
    pub retry: RetryTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent worker tasks drawing from the job queue.
    pub parallelism: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Default number of queued jobs included in a status snapshot.
    pub status_limit: usize,
}

/// Per-stage retry policy. The network-bound stages get more attempts
/// than the index stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryTable {
    pub download: RetryConfig,
    pub transcribe: RetryConfig,
    pub index: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay in seconds before attempt 2, 3, ... The last entry repeats if
    /// there are more attempts than entries.
    pub backoff_seconds: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often all podcast feeds are re-synced.
    pub interval_minutes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            audio: AudioConfig::default(),
            whisper: WhisperConfig::default(),
            ollama: OllamaConfig::default(),
            search: SearchConfig::default(),
            jobs: JobsConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            max_minutes_before_split: 60,
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            chat_model: "llama2".to_string(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryTable::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { parallelism: 1 }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { status_limit: 50 }
    }
}

impl Default for RetryTable {
    fn default() -> Self {
        Self {
            download: RetryConfig {
                max_attempts: 3,
                backoff_seconds: vec![2, 8, 30],
            },
            transcribe: RetryConfig {
                max_attempts: 3,
                backoff_seconds: vec![2, 8, 30],
            },
            index: RetryConfig {
                max_attempts: 2,
                backoff_seconds: vec![2, 8],
            },
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
        }
    }
}

impl Config {
    /// Load configuration from the given path, the default location, or
    /// fall back to built-in defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = Self::default_config_path();
                if !default.exists() {
                    log::info!("No config file found, using defaults");
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("podcast-indexer")
            .join("config.yaml")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("podcast-indexer")
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("podcast_indexer.db")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.data_dir().join("audio")
    }

    /// Part length in seconds for split transcription.
    pub fn split_seconds(&self) -> u64 {
        self.audio.max_minutes_before_split * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.audio.max_minutes_before_split, 60);
        assert_eq!(config.split_seconds(), 3600);
        assert_eq!(config.search.top_k, 5);
        assert_eq!(config.jobs.worker.parallelism, 1);
        assert_eq!(config.jobs.queue.status_limit, 50);
        assert_eq!(config.jobs.retry.download.max_attempts, 3);
        assert_eq!(config.jobs.retry.index.max_attempts, 2);
        assert_eq!(config.ollama.embedding_model, "nomic-embed-text");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
audio:
  max_minutes_before_split: 30
jobs:
  worker:
    parallelism: 4
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.audio.max_minutes_before_split, 30);
        assert_eq!(config.jobs.worker.parallelism, 4);
        // Everything unspecified keeps its default
        assert_eq!(config.jobs.queue.status_limit, 50);
        assert_eq!(config.whisper.url, "http://localhost:8000");
        assert_eq!(config.sync.interval_minutes, 60);
    }

    #[test]
    fn test_retry_table_yaml() {
        let yaml = r#"
jobs:
  retry:
    transcribe:
      max_attempts: 5
      backoff_seconds: [1, 4, 16, 64]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.jobs.retry.transcribe.max_attempts, 5);
        assert_eq!(config.jobs.retry.transcribe.backoff_seconds, vec![1, 4, 16, 64]);
        assert_eq!(config.jobs.retry.download.max_attempts, 3);
    }
}
