use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug)]
pub struct BusConfig {
    #[serde(default = "defaults::shm_dir")]
    pub shm_dir: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

#[derive(Deserialize, Debug)]
pub struct ChannelConfig {
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "defaults::poll_interval_us")]
    pub poll_interval_us: u64,
}

#[derive(Deserialize, Debug)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub kind: QueueKind,
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Slot size, single-writer queues only.
    pub record_len: Option<usize>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    SingleWriter,
    #[default]
    MultiWriter,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyConfig {
    #[default]
    BestEffort,
    Blocking,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Length prefix in front of every multi-writer record (an `i32`).
const LEN_PREFIX: usize = 4;

mod defaults {
    pub fn shm_dir() -> String {
        "/dev/shm".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn request_timeout_ms() -> u64 {
        5_000
    }

    pub fn poll_interval_us() -> u64 {
        50
    }

    pub fn capacity() -> usize {
        1 << 20
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: defaults::request_timeout_ms(),
            poll_interval_us: defaults::poll_interval_us(),
        }
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }
}

impl BusConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for q in &self.queues {
            if !seen.insert(q.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate queue '{}'", q.name)));
            }
            if q.capacity == 0 {
                return Err(ConfigError::Invalid(format!("queue '{}' has zero capacity", q.name)));
            }
            match q.kind {
                QueueKind::SingleWriter => match q.record_len {
                    None | Some(0) => {
                        return Err(ConfigError::Invalid(format!(
                            "single-writer queue '{}' needs a record_len",
                            q.name
                        )));
                    }
                    Some(len) if q.capacity / 2 < len => {
                        return Err(ConfigError::Invalid(format!(
                            "queue '{}': capacity {} must hold at least two records of {len}",
                            q.name, q.capacity
                        )));
                    }
                    Some(_) => {}
                },
                QueueKind::MultiWriter if q.capacity <= LEN_PREFIX => {
                    return Err(ConfigError::Invalid(format!(
                        "queue '{}': capacity {} must exceed the {LEN_PREFIX}-byte length prefix",
                        q.name, q.capacity
                    )));
                }
                QueueKind::MultiWriter => {}
            }
        }
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }
}
