use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure that can be loaded from CLI or a config file
///
/// Example configuration file content
/// # Video Thumbnailer Configuration
///
/// listen_on_port = 32145
/// permits = 5
///
/// # Per-step limits, in seconds
/// metadata_timeout_secs = 15
/// seek_timeout_secs = 15
///
/// # Bare filenames are fetched from here (optional)
/// media_base_url = "https://media.example.com/uploads"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = 32145)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Number of concurrent extractions
    #[arg(short, long, default_value_t = 5)]
    #[serde(default = "default_permits")]
    pub permits: usize,

    /// Seconds to wait for a video's metadata to load
    #[arg(long, default_value_t = 15)]
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,

    /// Seconds to wait for a seek to settle on a frame
    #[arg(long, default_value_t = 15)]
    #[serde(default = "default_seek_timeout_secs")]
    pub seek_timeout_secs: u64,

    /// Base URL that scheme-less locators are resolved against
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_base_url: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            permits: default_permits(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            seek_timeout_secs: default_seek_timeout_secs(),
            media_base_url: None,
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence unless left at default
    fn merge_with_file(mut self, file_config: Config) -> Self {
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.permits == default_permits() {
            self.permits = file_config.permits;
        }
        if self.metadata_timeout_secs == default_metadata_timeout_secs() {
            self.metadata_timeout_secs = file_config.metadata_timeout_secs;
        }
        if self.seek_timeout_secs == default_seek_timeout_secs() {
            self.seek_timeout_secs = file_config.seek_timeout_secs;
        }
        if self.media_base_url.is_none() {
            self.media_base_url = file_config.media_base_url;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.permits == 0 {
            return Err(anyhow::anyhow!("permits must be at least 1"));
        }
        if self.metadata_timeout_secs == 0 || self.seek_timeout_secs == 0 {
            return Err(anyhow::anyhow!("step timeouts must be at least 1 second"));
        }

        if let Some(base) = &self.media_base_url {
            if base.is_empty() {
                return Err(anyhow::anyhow!("Media base URL cannot be empty"));
            }
            if !base.starts_with("http://") && !base.starts_with("https://") {
                return Err(anyhow::anyhow!(
                    "Media base URL must start with http:// or https://"
                ));
            }
        }

        Ok(())
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_secs(self.seek_timeout_secs)
    }
}

// Default value functions
fn default_port() -> u16 {
    32145
}

fn default_permits() -> usize {
    5
}

fn default_metadata_timeout_secs() -> u64 {
    15
}

fn default_seek_timeout_secs() -> u64 {
    15
}
