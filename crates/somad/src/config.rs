//! soma.toml configuration.
//!
//! Every key is optional; missing keys take the defaults below and CLI
//! flags override whatever the file says.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use soma_lifecycle::EngineConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SomaConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
    pub lifecycle: LifecycleConfig,
    pub keeper: KeeperConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds between deployment engine cycles.
    pub interval_secs: u64,
    /// Upper bound for one poke, in milliseconds.
    pub poke_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub mailbox_capacity: usize,
}

impl Default for SomaConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8443)),
            data_dir: PathBuf::from("/var/lib/soma"),
            log_format: LogFormat::Text,
            lifecycle: LifecycleConfig::default(),
            keeper: KeeperConfig::default(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 20,
            poke_timeout_ms: 500,
        }
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
        }
    }
}

/// Values given on the command line. `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<SocketAddr>,
    pub data_dir: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
    pub interval_secs: Option<u64>,
    pub poke_timeout_ms: Option<u64>,
    pub mailbox_capacity: Option<usize>,
}

impl SomaConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: SomaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(mut self, overrides: &Overrides) -> anyhow::Result<Self> {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(data_dir) = &overrides.data_dir {
            self.data_dir = data_dir.clone();
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(interval) = overrides.interval_secs {
            self.lifecycle.interval_secs = interval;
        }
        if let Some(timeout) = overrides.poke_timeout_ms {
            self.lifecycle.poke_timeout_ms = timeout;
        }
        if let Some(capacity) = overrides.mailbox_capacity {
            self.keeper.mailbox_capacity = capacity;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.lifecycle.interval_secs == 0 {
            anyhow::bail!("lifecycle.interval_secs must be greater than 0");
        }
        if self.lifecycle.poke_timeout_ms == 0 {
            anyhow::bail!("lifecycle.poke_timeout_ms must be greater than 0");
        }
        if self.keeper.mailbox_capacity == 0 {
            anyhow::bail!("keeper.mailbox_capacity must be greater than 0");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("soma.redb")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            interval: Duration::from_secs(self.lifecycle.interval_secs),
            poke_timeout: Duration::from_millis(self.lifecycle.poke_timeout_ms),
        }
    }
}
