//! # Configuration Management Module
//!
//! Process-wide settings for the bridge, loaded once at startup from a TOML file and
//! immutable afterwards. Every section has defaults, so a minimal file only needs the
//! values that differ from them.
//!
//! ## Configuration Structure
//!
//! - [`BridgeConfig`] - instance naming
//! - [`SerialConfig`] - serial link parameters, connect retry budget, framing timeouts
//! - [`PollingConfig`] - intervals of the discovery / telemetry / balance loops
//! - [`CommandsConfig`] - modem-specific commands (network info, USSD balance code)
//! - [`StorageConfig`] - registry location and store retry policy
//! - [`LoggingConfig`] - log level and optional log file
//! - [`ControlConfig`] - local request endpoint of a running bridge
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gsmbridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Baud rate: {}", config.serial.baud_rate);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [bridge]
//! name = "gsmbridge"
//!
//! [serial]
//! baud_rate = 115200
//! usb_filter = "USB"
//! connect_budget_ms = 10000
//!
//! [polling]
//! discovery_interval_ms = 1000
//! telemetry_interval_ms = 5000
//! balance_interval_ms = 5000
//!
//! [storage]
//! data_dir = "data"
//!
//! [control]
//! listen = "127.0.0.1:7420"
//! ```

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// Substring a port description must contain to be considered a modem.
    pub usb_filter: String,
    /// Wall-clock budget for opening a port while it reports transient errors.
    pub connect_budget_ms: u64,
    pub connect_retry_delay_ms: u64,
    /// Default deadline of a single AT exchange.
    pub command_timeout_ms: u64,
    /// Serial read timeout of one poll inside an exchange.
    pub read_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub discovery_interval_ms: u64,
    pub telemetry_interval_ms: u64,
    /// Pause between two ports inside one telemetry or balance cycle.
    pub port_pacing_ms: u64,
    pub balance_interval_ms: u64,
    /// A balance older than this is refreshed.
    pub balance_refresh_secs: u64,
    pub balance_batch: usize,
    /// Pause after a failed loop iteration.
    pub error_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Vendor command reporting the serving network (Quectel default).
    pub network_info: String,
    pub ussd_balance_code: String,
    pub ussd_timeout_ms: u64,
    /// `AT+CMGL` can be slow on a full SIM.
    pub sms_list_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Line-delimited JSON endpoint through which `sim` / `sims` / `sms` reach a running
/// bridge (and so share its registry and port locks).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub listen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub serial: SerialConfig,
    pub polling: PollingConfig,
    pub commands: CommandsConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub control: ControlConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;
        config.validate()?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values that would make a loop spin or a deadline meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.serial.baud_rate == 0 {
            bail!("serial.baud_rate must be positive");
        }
        if self.serial.command_timeout_ms == 0 || self.serial.read_poll_ms == 0 {
            bail!("serial.command_timeout_ms and serial.read_poll_ms must be positive");
        }
        if self.serial.read_poll_ms >= self.serial.command_timeout_ms {
            bail!("serial.read_poll_ms must be shorter than serial.command_timeout_ms");
        }
        if self.polling.discovery_interval_ms == 0
            || self.polling.telemetry_interval_ms == 0
            || self.polling.balance_interval_ms == 0
        {
            bail!("polling intervals must be positive");
        }
        if self.polling.balance_batch == 0 {
            bail!("polling.balance_batch must be at least 1");
        }
        if self.storage.max_retries == 0 {
            bail!("storage.max_retries must be at least 1");
        }
        if self.control.enabled && self.control.listen.trim().is_empty() {
            bail!("control.listen must be set when control.enabled is true");
        }
        if self.commands.ussd_balance_code.trim().is_empty() {
            bail!("commands.ussd_balance_code must not be empty");
        }
        Ok(())
    }

    /// Retry policy for opening a serial port.
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::within(
            Duration::from_millis(self.serial.connect_budget_ms),
            Duration::from_millis(self.serial.connect_retry_delay_ms),
        )
    }

    /// Retry policy for registry reads and writes.
    pub fn store_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.storage.max_retries,
            Duration::from_millis(self.storage.base_backoff_ms),
            Duration::from_millis(self.storage.max_backoff_ms),
        )
    }

    /// Pause after a loop iteration fails.
    pub fn iteration_backoff(&self) -> Backoff {
        Backoff::Fixed(Duration::from_millis(self.polling.error_backoff_ms))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.serial.command_timeout_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "gsmbridge".to_string(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            usb_filter: "USB".to_string(),
            connect_budget_ms: 10_000,
            connect_retry_delay_ms: 500,
            command_timeout_ms: 2_000,
            read_poll_ms: 50,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 1_000,
            telemetry_interval_ms: 5_000,
            port_pacing_ms: 1_000,
            balance_interval_ms: 5_000,
            balance_refresh_secs: 3_600,
            balance_batch: 10,
            error_backoff_ms: 5_000,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            network_info: "AT+QNWINFO".to_string(),
            ussd_balance_code: "*101#".to_string(),
            ussd_timeout_ms: 20_000,
            sms_list_timeout_ms: 10_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            max_retries: 8,
            base_backoff_ms: 250,
            max_backoff_ms: 5_000,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:7420".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}
