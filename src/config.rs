//! Agent configuration.
//!
//! Tuned constants live in `SyncConfig`. They are resolved in three layers:
//! built-in defaults, then `{data_dir}/sync-config.json` when present, then
//! `COURIER_*` environment variables. Backend credentials come from the
//! environment, a connection string, or the OS credential store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::credentials;
use crate::error::SyncError;
use crate::location::CadencePolicy;
use crate::polling::BackoffPolicy;

pub const CONFIG_FILE_NAME: &str = "sync-config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub max_retry_attempts: u32,
    pub poll_baseline_secs: u64,
    pub poll_cap_secs: u64,
    pub poll_failure_threshold: u32,
    pub battery_high_threshold: u8,
    pub battery_low_threshold: u8,
    pub high_battery_interval_secs: u64,
    pub mid_battery_interval_secs: u64,
    pub low_battery_interval_secs: u64,
    pub baseline_location_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub sensor_timeout_secs: u64,
    pub safety_drain_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub notice_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            poll_baseline_secs: 15,
            poll_cap_secs: 300,
            poll_failure_threshold: 3,
            battery_high_threshold: 50,
            battery_low_threshold: 20,
            high_battery_interval_secs: 45,
            mid_battery_interval_secs: 60,
            low_battery_interval_secs: 120,
            baseline_location_interval_secs: 45,
            request_timeout_secs: 15,
            sensor_timeout_secs: 20,
            safety_drain_interval_secs: 60,
            probe_interval_secs: 15,
            notice_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn cadence(&self) -> CadencePolicy {
        CadencePolicy {
            high_threshold: self.battery_high_threshold,
            low_threshold: self.battery_low_threshold,
            high_interval: Duration::from_secs(self.high_battery_interval_secs),
            mid_interval: Duration::from_secs(self.mid_battery_interval_secs),
            low_interval: Duration::from_secs(self.low_battery_interval_secs),
            baseline_interval: Duration::from_secs(self.baseline_location_interval_secs),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            baseline: Duration::from_secs(self.poll_baseline_secs),
            cap: Duration::from_secs(self.poll_cap_secs),
            failure_threshold: self.poll_failure_threshold,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sensor_timeout(&self) -> Duration {
        Duration::from_secs(self.sensor_timeout_secs)
    }

    pub fn safety_drain_interval(&self) -> Duration {
        Duration::from_secs(self.safety_drain_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let nonzero = [
            ("maxRetryAttempts", u64::from(self.max_retry_attempts)),
            ("pollBaselineSecs", self.poll_baseline_secs),
            ("pollFailureThreshold", u64::from(self.poll_failure_threshold)),
            ("highBatteryIntervalSecs", self.high_battery_interval_secs),
            ("midBatteryIntervalSecs", self.mid_battery_interval_secs),
            ("lowBatteryIntervalSecs", self.low_battery_interval_secs),
            ("baselineLocationIntervalSecs", self.baseline_location_interval_secs),
            ("requestTimeoutSecs", self.request_timeout_secs),
            ("sensorTimeoutSecs", self.sensor_timeout_secs),
            ("safetyDrainIntervalSecs", self.safety_drain_interval_secs),
            ("probeIntervalSecs", self.probe_interval_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(SyncError::Config(format!("{name} must be greater than zero")));
        }
        if self.poll_cap_secs < self.poll_baseline_secs {
            return Err(SyncError::Config(
                "pollCapSecs must not be below pollBaselineSecs".into(),
            ));
        }
        if self.battery_low_threshold > self.battery_high_threshold
            || self.battery_high_threshold > 100
        {
            return Err(SyncError::Config(
                "battery thresholds must satisfy low <= high <= 100".into(),
            ));
        }
        Ok(())
    }

    /// Read `{data_dir}/sync-config.json`. Missing fields keep their
    /// defaults; a missing file means all defaults.
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Apply `COURIER_*` overrides from `lookup` (normally the process
    /// environment).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SyncError> {
        fn parse<T: std::str::FromStr>(var: &str, raw: &str) -> Result<T, SyncError> {
            raw.trim()
                .parse()
                .map_err(|_| SyncError::Config(format!("{var}: invalid value {raw:?}")))
        }

        macro_rules! override_field {
            ($var:literal, $field:ident) => {
                if let Some(raw) = lookup($var) {
                    self.$field = parse($var, &raw)?;
                    debug!(var = $var, "config override applied");
                }
            };
        }

        override_field!("COURIER_MAX_RETRY_ATTEMPTS", max_retry_attempts);
        override_field!("COURIER_POLL_BASELINE_SECS", poll_baseline_secs);
        override_field!("COURIER_POLL_CAP_SECS", poll_cap_secs);
        override_field!("COURIER_POLL_FAILURE_THRESHOLD", poll_failure_threshold);
        override_field!("COURIER_BATTERY_HIGH_THRESHOLD", battery_high_threshold);
        override_field!("COURIER_BATTERY_LOW_THRESHOLD", battery_low_threshold);
        override_field!("COURIER_HIGH_BATTERY_INTERVAL_SECS", high_battery_interval_secs);
        override_field!("COURIER_MID_BATTERY_INTERVAL_SECS", mid_battery_interval_secs);
        override_field!("COURIER_LOW_BATTERY_INTERVAL_SECS", low_battery_interval_secs);
        override_field!(
            "COURIER_BASELINE_LOCATION_INTERVAL_SECS",
            baseline_location_interval_secs
        );
        override_field!("COURIER_REQUEST_TIMEOUT_SECS", request_timeout_secs);
        override_field!("COURIER_SENSOR_TIMEOUT_SECS", sensor_timeout_secs);
        override_field!("COURIER_SAFETY_DRAIN_SECS", safety_drain_interval_secs);
        override_field!("COURIER_PROBE_INTERVAL_SECS", probe_interval_secs);
        override_field!("COURIER_NOTICE_CAPACITY", notice_capacity);
        Ok(())
    }
}

/// Connection details for the backend order service.
#[derive(Clone, PartialEq, Eq)]
pub struct BackendCredentials {
    pub base_url: String,
    pub agent_id: String,
    pub api_key: Zeroizing<String>,
}

impl fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("base_url", &self.base_url)
            .field("agent_id", &self.agent_id)
            .field("api_key", &"***")
            .finish()
    }
}

impl BackendCredentials {
    /// `COURIER_CONNECTION_STRING`, or all of `COURIER_BACKEND_URL`,
    /// `COURIER_AGENT_ID` and `COURIER_API_KEY`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        if let Some(raw) = lookup("COURIER_CONNECTION_STRING") {
            return credentials::decode_connection_string(&raw);
        }
        let non_empty = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        Some(Self {
            base_url: crate::backend::normalize_backend_url(&non_empty("COURIER_BACKEND_URL")?),
            agent_id: non_empty("COURIER_AGENT_ID")?.trim().to_string(),
            api_key: Zeroizing::new(non_empty("COURIER_API_KEY")?.trim().to_string()),
        })
    }
}

/// `explicit`, else `COURIER_DATA_DIR`, else `./courier-data`.
pub fn resolve_data_dir(
    explicit: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
) -> PathBuf {
    explicit
        .or_else(|| lookup("COURIER_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("courier-data"))
}

/// Fully resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub sync: SyncConfig,
    pub credentials: Option<BackendCredentials>,
}

impl AgentConfig {
    /// Resolve configuration from the process environment.
    pub fn load(data_dir: Option<PathBuf>) -> Result<Self, SyncError> {
        Self::load_with(data_dir, |var| std::env::var(var).ok())
    }

    pub fn load_with(
        data_dir: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SyncError> {
        let data_dir = resolve_data_dir(data_dir, &lookup);

        let mut sync = SyncConfig::from_file(&data_dir.join(CONFIG_FILE_NAME))?;
        sync.apply_overrides(&lookup)?;
        sync.validate()?;

        let credentials =
            BackendCredentials::from_lookup(&lookup).or_else(credentials::load_credentials);
        match &credentials {
            Some(creds) => info!(
                agent_id = %creds.agent_id,
                backend = %creds.base_url,
                "Agent credentials resolved"
            ),
            None => info!("No agent credentials configured"),
        }

        Ok(Self {
            data_dir,
            sync,
            credentials,
        })
    }
}
