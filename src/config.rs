//! Configuration for rewards-redemption

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rewards-redemption")
}

/// Logical entity → physical sled tree name
///
/// Resolved once when the store opens; never re-discovered per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableNames {
    #[serde(default = "default_rewards_table")]
    pub rewards: String,
    #[serde(default = "default_businesses_table")]
    pub businesses: String,
    #[serde(default = "default_redemptions_table")]
    pub redemptions: String,
    #[serde(default = "default_redemption_codes_table")]
    pub redemption_codes: String,
    #[serde(default = "default_ledger_table")]
    pub ledger: String,
    #[serde(default = "default_balances_table")]
    pub balances: String,
    #[serde(default = "default_affiliate_clicks_table")]
    pub affiliate_clicks: String,
}

fn default_rewards_table() -> String {
    "Reward".to_string()
}

fn default_businesses_table() -> String {
    "Business".to_string()
}

fn default_redemptions_table() -> String {
    "RewardRedemption".to_string()
}

fn default_redemption_codes_table() -> String {
    "RewardRedemption-byCode".to_string()
}

fn default_ledger_table() -> String {
    "PointsTransaction".to_string()
}

fn default_balances_table() -> String {
    "PointsTransaction-balances".to_string()
}

fn default_affiliate_clicks_table() -> String {
    "AffiliateClick".to_string()
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            rewards: default_rewards_table(),
            businesses: default_businesses_table(),
            redemptions: default_redemptions_table(),
            redemption_codes: default_redemption_codes_table(),
            ledger: default_ledger_table(),
            balances: default_balances_table(),
            affiliate_clicks: default_affiliate_clicks_table(),
        }
    }
}

impl TableNames {
    /// Every physical name must be non-empty and distinct
    pub fn validate(&self) -> Result<(), StorageError> {
        let names = [
            &self.rewards,
            &self.businesses,
            &self.redemptions,
            &self.redemption_codes,
            &self.ledger,
            &self.balances,
            &self.affiliate_clicks,
        ];
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(StorageError::Config("table names must not be empty".into()));
            }
            if names[..i].contains(name) {
                return Err(StorageError::Config(format!("duplicate table name: {}", name)));
            }
        }
        Ok(())
    }
}

/// Redemption policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionPolicy {
    /// Hold window for in-person rewards, in hours
    #[serde(default = "default_in_person_hold_hours")]
    pub in_person_hold_hours: i64,

    /// Hold window for affiliate rewards, in days
    #[serde(default = "default_affiliate_hold_days")]
    pub affiliate_hold_days: i64,

    /// Reject in-person redemptions the ledger balance cannot cover
    #[serde(default)]
    pub require_sufficient_balance: bool,

    /// Credit spent points back when a pending redemption is cancelled
    #[serde(default = "default_true")]
    pub refund_on_cancel: bool,

    /// Shown when the business lookup fails
    #[serde(default = "default_business_name")]
    pub default_business_name: String,

    /// Recorded when the verifier does not identify themselves
    #[serde(default = "default_operator_label")]
    pub unknown_operator_label: String,

    /// Attempts at a unique code before giving up
    #[serde(default = "default_code_attempts")]
    pub max_code_attempts: u32,

    /// Amazon associate tag added to links that lack one
    #[serde(default)]
    pub amazon_associate_tag: Option<String>,
}

fn default_in_person_hold_hours() -> i64 {
    48
}

fn default_affiliate_hold_days() -> i64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_business_name() -> String {
    "Business".to_string()
}

fn default_operator_label() -> String {
    "unknown operator".to_string()
}

fn default_code_attempts() -> u32 {
    5
}

impl Default for RedemptionPolicy {
    fn default() -> Self {
        Self {
            in_person_hold_hours: default_in_person_hold_hours(),
            affiliate_hold_days: default_affiliate_hold_days(),
            require_sufficient_balance: false,
            refund_on_cancel: true,
            default_business_name: default_business_name(),
            unknown_operator_label: default_operator_label(),
            max_code_attempts: default_code_attempts(),
            amazon_associate_tag: None,
        }
    }
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for the sled database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP bind host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Physical table names
    #[serde(default)]
    pub tables: TableNames,

    /// Redemption policy
    #[serde(default)]
    pub policy: RedemptionPolicy,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8095
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_host: default_http_host(),
            http_port: default_http_port(),
            tables: TableNames::default(),
            policy: RedemptionPolicy::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), StorageError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StorageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), StorageError> {
        self.tables.validate()?;
        if self.policy.in_person_hold_hours <= 0 {
            return Err(StorageError::Config("in_person_hold_hours must be positive".into()));
        }
        if self.policy.affiliate_hold_days <= 0 {
            return Err(StorageError::Config("affiliate_hold_days must be positive".into()));
        }
        if self.policy.max_code_attempts == 0 {
            return Err(StorageError::Config("max_code_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("rewards.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            http_port = 9000

            [policy]
            require_sufficient_balance = true
            "#,
        )
        .unwrap();

        assert_eq!(config.http_port, 9000);
        assert!(config.policy.require_sufficient_balance);
        assert_eq!(config.policy.in_person_hold_hours, 48);
        assert_eq!(config.policy.affiliate_hold_days, 30);
        assert_eq!(config.tables, TableNames::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.tables.redemptions = "RewardRedemption-abc123-NONE".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.tables.redemptions, "RewardRedemption-abc123-NONE");
    }

    #[test]
    fn test_duplicate_table_names_rejected() {
        let mut tables = TableNames::default();
        tables.balances = tables.ledger.clone();
        assert!(matches!(tables.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_zero_hold_window_rejected() {
        let mut config = Config::default();
        config.policy.in_person_hold_hours = 0;
        assert!(config.validate().is_err());
    }
}
