//! Server configuration module
//!
//! Parses and manages server configuration from YAML files.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes; serde fills in the rest.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::AuthPolicy;
use crate::network::{FrameLimits, MAX_TAG_LEN};

/// Smallest frame body limit that still fits a login request
pub const MIN_FRAME_LEN: usize = 1024;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // Listener
    // ============================================
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Connections accepted at once; further sockets are closed on accept
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    // ============================================
    // Wire limits
    // ============================================
    /// Largest accepted frame body in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Longest accepted frame tag
    #[serde(default = "default_max_string_len")]
    pub max_string_len: usize,

    /// Frames buffered per connection before events start being dropped
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Seconds without a complete frame before a connection is closed (0 = never)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    // ============================================
    // Persistence
    // ============================================
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Full checkpoint interval in seconds (0 = only on shutdown)
    #[serde(default = "default_checkpoint_secs")]
    pub checkpoint_secs: u64,

    #[serde(default = "default_history_cache_secs")]
    pub history_cache_secs: u64,

    #[serde(default = "default_history_cache_capacity")]
    pub history_cache_capacity: usize,

    // ============================================
    // Authentication
    // ============================================
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Failed password attempts within `lockout_secs` that lock an account (0 = never)
    #[serde(default = "default_max_failed_logins")]
    pub max_failed_logins: u32,

    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,

    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,

    /// Sent to a connection as a notification right after it logs in
    #[serde(default)]
    pub motd: String,
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2600
}

fn default_max_sessions() -> usize {
    1024
}

fn default_max_frame_len() -> usize {
    1024 * 1024
}

fn default_max_string_len() -> usize {
    MAX_TAG_LEN
}

fn default_outbound_queue() -> usize {
    256
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_data_dir() -> String {
    "./data/".to_string()
}

fn default_checkpoint_secs() -> u64 {
    300
}

fn default_history_cache_secs() -> u64 {
    60
}

fn default_history_cache_capacity() -> usize {
    1024
}

fn default_token_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_max_failed_logins() -> u32 {
    5
}

fn default_lockout_secs() -> u64 {
    300
}

fn default_bcrypt_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            max_frame_len: default_max_frame_len(),
            max_string_len: default_max_string_len(),
            outbound_queue: default_outbound_queue(),
            idle_timeout_secs: default_idle_timeout_secs(),
            data_dir: default_data_dir(),
            checkpoint_secs: default_checkpoint_secs(),
            history_cache_secs: default_history_cache_secs(),
            history_cache_capacity: default_history_cache_capacity(),
            token_ttl_secs: default_token_ttl_secs(),
            max_failed_logins: default_max_failed_logins(),
            lockout_secs: default_lockout_secs(),
            bcrypt_cost: default_bcrypt_cost(),
            motd: String::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use parley::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("conf/server.yaml")
    ///     .expect("Failed to load config");
    /// println!("Listening on {}", config.bind_addr());
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    ///
    /// Useful for testing
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.bind_ip
            .parse::<IpAddr>()
            .with_context(|| format!("bind_ip is not an IP address: {}", self.bind_ip))?;
        anyhow::ensure!(!self.data_dir.is_empty(), "data_dir cannot be empty");
        anyhow::ensure!(self.max_sessions > 0, "max_sessions must be at least 1");
        anyhow::ensure!(self.outbound_queue > 0, "outbound_queue must be at least 1");

        anyhow::ensure!(
            self.max_frame_len >= MIN_FRAME_LEN && self.max_frame_len <= u32::MAX as usize,
            "max_frame_len out of range: {} (min {}, max {})",
            self.max_frame_len,
            MIN_FRAME_LEN,
            u32::MAX
        );
        anyhow::ensure!(
            self.max_string_len > 0 && self.max_string_len <= MAX_TAG_LEN,
            "max_string_len out of range: {} (max {})",
            self.max_string_len,
            MAX_TAG_LEN
        );

        // bcrypt rejects costs outside 4..=31
        anyhow::ensure!(
            (4..=31).contains(&self.bcrypt_cost),
            "bcrypt_cost out of range: {} (4-31)",
            self.bcrypt_cost
        );
        anyhow::ensure!(self.token_ttl_secs > 0, "token_ttl_secs must be positive");

        Ok(())
    }

    /// Save configuration to a YAML file
    ///
    /// Useful for generating config templates or saving modified configs
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits { max_tag_len: self.max_string_len, max_body_len: self.max_frame_len }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_secs > 0).then(|| Duration::from_secs(self.checkpoint_secs))
    }

    pub fn history_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.history_cache_secs)
    }

    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy {
            token_ttl: Duration::from_secs(self.token_ttl_secs),
            max_failed_logins: self.max_failed_logins,
            lockout: Duration::from_secs(self.lockout_secs),
            bcrypt_cost: self.bcrypt_cost,
        }
    }
}
