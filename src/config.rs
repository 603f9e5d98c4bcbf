//! Suite configuration: TOML file, environment overrides, validation.
//!
//! Loading order (later wins):
//! 1. `Default` values
//! 2. The TOML file
//! 3. `DEVRIG_{SECTION}_{FIELD}` environment variables
//!
//! ```no_run
//! # async fn example() -> Result<(), devrig::config::ConfigError> {
//! use devrig::config::SuiteConfig;
//!
//! let config = SuiteConfig::load("devrig.toml").await?;
//! let config = SuiteConfig::parse("[suite]\nid = \"rig-01\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::poll::PollOptions;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was tried.
        path: String,
    },

    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {reason}")]
    ParseFailed {
        /// Parser message.
        reason: String,
    },

    /// A value is out of range or inconsistent.
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue {
        /// Dotted field name.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Logging and scratch space.
    #[serde(default)]
    pub general: GeneralConfig,
    /// What is being provisioned.
    #[serde(default)]
    pub suite: SuiteSection,
    /// Cloud account.
    #[serde(default)]
    pub balena: BalenaConfig,
    /// Device network.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Condition polling.
    #[serde(default)]
    pub poll: PollConfig,
    /// Cleanup.
    #[serde(default)]
    pub teardown: TeardownConfig,
    /// Whole-run limits.
    #[serde(default)]
    pub run: RunConfig,
}

/// `[general]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub log_level: String,
    /// `json` or `pretty`.
    pub log_format: String,
    /// Scratch directory for checkouts, keys and captured logs.
    pub tmpdir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            tmpdir: std::env::temp_dir().join("devrig"),
        }
    }
}

/// `[suite]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuiteSection {
    /// Run identifier; also the application name and SSH key label.
    pub id: String,
    /// Device type slug.
    pub device_type: String,
    /// Repository holding the release to push.
    pub release_repository: String,
    /// Delay between registering the device and reading its id back.
    pub register_settle_ms: u64,
}

impl Default for SuiteSection {
    fn default() -> Self {
        Self {
            id: String::new(),
            device_type: String::new(),
            release_repository: "https://github.com/balena-io-examples/balena-node-hello-world.git"
                .to_owned(),
            register_settle_ms: 10_000,
        }
    }
}

/// `[balena]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalenaConfig {
    /// API endpoint.
    pub api_url: String,
    /// API token used to log in.
    pub api_key: String,
    /// Organization owning the application.
    pub organization: String,
}

impl Default for BalenaConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.balena-cloud.com".to_owned(),
            api_key: String::new(),
            organization: String::new(),
        }
    }
}

/// `[network]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Give the device a wired, NATed uplink.
    pub wired: bool,
    /// Give the device a wireless access point named after the suite id.
    pub wireless: bool,
}

/// `[poll]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Delay between attempts.
    pub interval_ms: u64,
    /// Budget per wait.
    pub timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        let defaults = PollOptions::default();
        Self {
            interval_ms: defaults.interval.as_millis() as u64,
            timeout_ms: defaults.timeout.as_millis() as u64,
        }
    }
}

impl PollConfig {
    /// Poll options with errors halting the wait.
    pub fn options(&self) -> PollOptions {
        PollOptions::default()
            .interval(Duration::from_millis(self.interval_ms))
            .timeout(Duration::from_millis(self.timeout_ms))
    }
}

/// `[teardown]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Per-action limit; `0` means unbounded.
    pub action_timeout_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            action_timeout_ms: 120_000,
        }
    }
}

impl TeardownConfig {
    /// The per-action limit, if any.
    pub fn action_timeout(&self) -> Option<Duration> {
        (self.action_timeout_ms > 0).then(|| Duration::from_millis(self.action_timeout_ms))
    }
}

/// `[run]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Whole-run limit; `0` means none.
    pub deadline_ms: u64,
}

impl RunConfig {
    /// The run deadline, if any.
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_ms > 0).then(|| Duration::from_millis(self.deadline_ms))
    }
}

impl SuiteConfig {
    /// Load a TOML file, apply environment overrides and validate.
    ///
    /// Validation runs once, after the overrides, so a required value may
    /// come from the environment alone.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::parse(&read_config(path.as_ref()).await?)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::parse(&read_config(path.as_ref()).await?)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string. Missing sections take their defaults.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Override values from `DEVRIG_{SECTION}_{FIELD}` environment variables.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "DEVRIG_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "DEVRIG_GENERAL_LOG_FORMAT");
        override_path(&mut self.general.tmpdir, "DEVRIG_GENERAL_TMPDIR");

        override_string(&mut self.suite.id, "DEVRIG_SUITE_ID");
        override_string(&mut self.suite.device_type, "DEVRIG_SUITE_DEVICE_TYPE");
        override_string(
            &mut self.suite.release_repository,
            "DEVRIG_SUITE_RELEASE_REPOSITORY",
        );
        override_u64(
            &mut self.suite.register_settle_ms,
            "DEVRIG_SUITE_REGISTER_SETTLE_MS",
        );

        override_string(&mut self.balena.api_url, "DEVRIG_BALENA_API_URL");
        override_string(&mut self.balena.api_key, "DEVRIG_BALENA_API_KEY");
        override_string(&mut self.balena.organization, "DEVRIG_BALENA_ORGANIZATION");

        override_bool(&mut self.network.wired, "DEVRIG_NETWORK_WIRED");
        override_bool(&mut self.network.wireless, "DEVRIG_NETWORK_WIRELESS");

        override_u64(&mut self.poll.interval_ms, "DEVRIG_POLL_INTERVAL_MS");
        override_u64(&mut self.poll.timeout_ms, "DEVRIG_POLL_TIMEOUT_MS");

        override_u64(
            &mut self.teardown.action_timeout_ms,
            "DEVRIG_TEARDOWN_ACTION_TIMEOUT_MS",
        );

        override_u64(&mut self.run.deadline_ms, "DEVRIG_RUN_DEADLINE_MS");
    }

    /// Check values for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        for (field, value) in [
            ("suite.id", &self.suite.id),
            ("suite.device_type", &self.suite.device_type),
            ("suite.release_repository", &self.suite.release_repository),
            ("balena.api_url", &self.balena.api_url),
            ("balena.api_key", &self.balena.api_key),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty".to_owned()));
            }
        }

        if self.poll.interval_ms == 0 {
            return Err(invalid("poll.interval_ms", "must be positive".to_owned()));
        }
        if self.poll.timeout_ms < self.poll.interval_ms {
            return Err(invalid(
                "poll.timeout_ms",
                format!("must be at least poll.interval_ms ({})", self.poll.interval_ms),
            ));
        }

        Ok(())
    }
}

async fn read_config(path: &Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            ConfigError::Io(e)
        }
    })
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
}

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_path(target: &mut PathBuf, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = PathBuf::from(val);
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}
