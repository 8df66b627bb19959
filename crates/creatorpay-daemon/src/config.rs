//! Configuration file management.

use std::path::PathBuf;

use creatorpay_payout::orchestrator::{DEFAULT_MIN_PAYOUT, DEFAULT_PROCESSING_TIMEOUT_SECS};
use creatorpay_payout::PayoutPolicy;
use creatorpay_types::referral::ReferralTier;
use creatorpay_types::shares::ShareTable;
use creatorpay_types::DEFAULT_CURRENCY;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CREATORPAY_DATA_DIR";

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Payout policy and background reconciliation.
    #[serde(default)]
    pub payout: PayoutConfig,
    /// Platform share per revenue source.
    #[serde(default)]
    pub shares: ShareTable,
    /// Referral tier table.
    #[serde(default)]
    pub referral: ReferralConfig,
    /// Advanced settings.
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
}

/// Payout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
    /// Smallest amount a creator may request.
    #[serde(default = "default_min_payout")]
    pub min_payout: Decimal,
    /// ISO currency code handed to the payment gateway.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Seconds a request may stay in `processing` before it is polled.
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout_secs: u64,
    /// Period of the background reconcile loop. 0 disables it.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

/// Referral configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferralConfig {
    /// Replaces the stored tier table at startup. Empty = keep what is stored.
    #[serde(default)]
    pub tiers: Vec<ReferralTier>,
}

/// Advanced configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_min_payout() -> Decimal {
    DEFAULT_MIN_PAYOUT
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_processing_timeout() -> u64 {
    DEFAULT_PROCESSING_TIMEOUT_SECS
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            min_payout: default_min_payout(),
            currency: default_currency(),
            processing_timeout_secs: default_processing_timeout(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl PayoutConfig {
    /// The engine policy these settings describe.
    pub fn policy(&self) -> PayoutPolicy {
        PayoutPolicy {
            min_payout: self.min_payout,
            currency: self.currency.clone(),
            processing_timeout_secs: self.processing_timeout_secs,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    fn config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".creatorpay"))
            .unwrap_or_else(|_| PathBuf::from("/var/lib/creatorpay"))
    }
}
