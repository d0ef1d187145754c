//! Configuration for the operator.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::engine::{EngineSettings, Policy};
use crate::redfish::{AuthMode, ClientSettings};

/// Operator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the aggregation service.
    pub aggregator_url: String,

    pub aggregator_username: String,
    pub aggregator_password: String,

    pub auth_mode: AuthMode,

    /// Accept invalid TLS certificates.
    pub insecure_skip_verify: bool,

    /// Time between full passes.
    pub poll_interval: Duration,

    pub policy: Policy,

    /// Task monitor bound.
    pub task_retry_count: u32,
    pub task_retry_interval: Duration,

    /// Post-reset re-poll bound.
    pub settle_attempts: u32,
    pub settle_interval: Duration,

    /// Attempts before an uncompletable BMC is removed.
    pub add_max_attempts: u32,

    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,

    /// Directory of the local record database.
    pub data_dir: PathBuf,

    /// Listen address for the event webhook.
    pub event_listen_addr: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let aggregator_url = lookup("BMC_AGGREGATOR_URL")
            .unwrap_or_else(|| "https://127.0.0.1:45000".to_string());

        let aggregator_username = lookup("BMC_AGGREGATOR_USERNAME")
            .context("BMC_AGGREGATOR_USERNAME is required")?;
        let aggregator_password = lookup("BMC_AGGREGATOR_PASSWORD")
            .context("BMC_AGGREGATOR_PASSWORD is required")?;

        let auth_mode = match lookup("BMC_AUTH_MODE") {
            Some(raw) => raw.parse().map_err(|e: String| anyhow!(e))?,
            None => AuthMode::Basic,
        };

        let policy = match lookup("BMC_RECONCILIATION") {
            Some(raw) => raw.parse().map_err(|e: String| anyhow!(e))?,
            None => Policy::Accommodate,
        };

        let insecure_skip_verify = lookup("BMC_INSECURE_SKIP_VERIFY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        // Zero would make the scheduler spin.
        let poll_interval = match parse_or(lookup("BMC_POLL_INTERVAL"), 0u64) {
            0 => bmcsync_reconcile::DEFAULT_POLL_INTERVAL,
            secs => Duration::from_secs(secs),
        };
        let task_retry_count = parse_or(lookup("BMC_TASK_RETRY_COUNT"), 60u32);
        let task_retry_interval =
            Duration::from_millis(parse_or(lookup("BMC_TASK_RETRY_INTERVAL_MS"), 5000));
        let settle_attempts = parse_or(lookup("BMC_SETTLE_ATTEMPTS"), 10u32);
        let settle_interval =
            Duration::from_millis(parse_or(lookup("BMC_SETTLE_INTERVAL_MS"), 10_000));
        let add_max_attempts = parse_or(
            lookup("BMC_ADD_MAX_ATTEMPTS"),
            bmcsync_reconcile::DEFAULT_MAX_ADD_ATTEMPTS,
        );

        let private_key_path = lookup("BMC_PRIVATE_KEY_PATH")
            .unwrap_or_else(|| "/etc/bmc-operator/keys/private.pem".to_string())
            .into();
        let public_key_path = lookup("BMC_PUBLIC_KEY_PATH")
            .unwrap_or_else(|| "/etc/bmc-operator/keys/public.pem".to_string())
            .into();

        let data_dir = lookup("BMC_DATA_DIR")
            .unwrap_or_else(|| "/var/lib/bmc-operator".to_string())
            .into();

        let event_listen_addr =
            lookup("BMC_EVENT_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:45010".to_string());

        let log_level = lookup("BMC_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            aggregator_url,
            aggregator_username,
            aggregator_password,
            auth_mode,
            insecure_skip_verify,
            poll_interval,
            policy,
            task_retry_count,
            task_retry_interval,
            settle_attempts,
            settle_interval,
            add_max_attempts,
            private_key_path,
            public_key_path,
            data_dir,
            event_listen_addr,
            log_level,
        })
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.aggregator_url.clone(),
            username: self.aggregator_username.clone(),
            password: self.aggregator_password.clone(),
            auth: self.auth_mode,
            insecure_skip_verify: self.insecure_skip_verify,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            policy: self.policy,
            settle_attempts: self.settle_attempts,
            settle_interval: self.settle_interval,
            max_add_attempts: self.add_max_attempts,
        }
    }

    pub fn records_db_path(&self) -> PathBuf {
        self.data_dir.join("records.db")
    }
}

/// Parse `raw`, falling back to `default` when unset or out of range.
fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    const CREDS: [(&str, &str); 2] = [
        ("BMC_AGGREGATOR_USERNAME", "admin"),
        ("BMC_AGGREGATOR_PASSWORD", "secret"),
    ];

    #[test]
    fn test_defaults() {
        let config = load(&CREDS).unwrap();
        assert_eq!(config.aggregator_url, "https://127.0.0.1:45000");
        assert_eq!(config.auth_mode, AuthMode::Basic);
        assert_eq!(config.policy, Policy::Accommodate);
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.task_retry_count, 60);
        assert_eq!(config.add_max_attempts, 3);
        assert_eq!(config.records_db_path(), PathBuf::from("/var/lib/bmc-operator/records.db"));
    }

    #[test]
    fn test_credentials_required() {
        assert!(load(&[("BMC_AGGREGATOR_USERNAME", "admin")]).is_err());
    }

    #[test]
    fn test_invalid_number_falls_back() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("BMC_POLL_INTERVAL", "soon"));
        pairs.push(("BMC_SETTLE_ATTEMPTS", "4"));
        let config = load(&pairs).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.settle_attempts, 4);
    }

    #[test]
    fn test_zero_poll_interval_uses_default() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("BMC_POLL_INTERVAL", "0"));
        assert_eq!(load(&pairs).unwrap().poll_interval, Duration::from_secs(60));

        let mut pairs = CREDS.to_vec();
        pairs.push(("BMC_POLL_INTERVAL", "15"));
        assert_eq!(load(&pairs).unwrap().poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_out_of_range_count_falls_back() {
        let mut pairs = CREDS.to_vec();
        // u32::MAX + 1
        pairs.push(("BMC_TASK_RETRY_COUNT", "4294967296"));
        pairs.push(("BMC_ADD_MAX_ATTEMPTS", "-1"));
        pairs.push(("BMC_SETTLE_ATTEMPTS", " 7 "));
        let config = load(&pairs).unwrap();
        assert_eq!(config.task_retry_count, 60);
        assert_eq!(config.add_max_attempts, 3);
        assert_eq!(config.settle_attempts, 7);
    }

    #[test]
    fn test_invalid_enum_is_error() {
        let mut pairs = CREDS.to_vec();
        pairs.push(("BMC_RECONCILIATION", "sometimes"));
        assert!(load(&pairs).is_err());

        let mut pairs = CREDS.to_vec();
        pairs.push(("BMC_AUTH_MODE", "Session"));
        assert_eq!(load(&pairs).unwrap().auth_mode, AuthMode::Session);
    }
}
