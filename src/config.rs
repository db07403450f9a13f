//! TOML configuration for trafficctl.
//!
//! Layered model: compiled-in defaults, overridden by a config file located
//! through `TRAFFICCTL_CONFIG` or the standard system path, with individual
//! API settings optionally supplied as a `key=value` parameter map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::operation::PollConfig;
use crate::retry::RetryPolicy;
use crate::stats::ColumnMap;
use crate::verify::{ThresholdConfig, ToleranceSpec, ToleranceTable};

const CONFIG_ENV: &str = "TRAFFICCTL_CONFIG";
const SYSTEM_CONFIG: &str = "/etc/trafficctl/trafficctl.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a controller run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ControllerConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded controller configuration");
        Ok(config)
    }

    /// Config files to try, most specific first: `$TRAFFICCTL_CONFIG`, then
    /// the system path.
    pub fn candidates() -> Vec<PathBuf> {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .into_iter()
            .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG)))
            .collect()
    }

    /// First candidate that exists and parses; compiled-in defaults otherwise.
    /// Broken files are skipped with a warning.
    pub fn load_first(candidates: &[PathBuf]) -> Self {
        candidates
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| match Self::load(path) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable config file");
                    None
                }
            })
            .unwrap_or_else(|| {
                debug!("no usable config file, using compiled-in defaults");
                Self::default()
            })
    }

    pub fn load_or_default() -> Self {
        Self::load_first(&Self::candidates())
    }

    /// Check everything a run needs before the first request goes out.
    pub fn validate(&self) -> std::result::Result<(), ControlError> {
        self.api.validate()?;
        self.verification.tolerance_table()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// Where the controller's REST API lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the API, e.g. `http://server:8080/api/v0/`. A trailing
    /// slash is added when missing.
    pub site_url: String,
    /// Exact API version the remote side must start the session with.
    pub api_version: String,
    /// Per-request HTTP timeout (seconds).
    pub request_timeout_sec: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            api_version: String::new(),
            request_timeout_sec: 30,
        }
    }
}

impl ApiConfig {
    const REQUIRED: [&'static str; 2] = ["site_url", "api_version"];

    /// Build from a flat parameter map (testbed files, `--param` flags).
    ///
    /// Every required key must be present and non-empty; the first one
    /// missing is reported by name.
    pub fn from_params(params: &BTreeMap<String, String>) -> std::result::Result<Self, ControlError> {
        for key in Self::REQUIRED {
            if params.get(key).map_or(true, |v| v.trim().is_empty()) {
                return Err(ControlError::MissingField {
                    field: key.to_string(),
                });
            }
        }

        let mut cfg = Self {
            site_url: params["site_url"].trim().to_string(),
            api_version: params["api_version"].trim().to_string(),
            ..Self::default()
        };
        if let Some(raw) = params.get("request_timeout_sec") {
            cfg.request_timeout_sec = raw.trim().parse().map_err(|_| ControlError::MissingField {
                field: "request_timeout_sec (integer seconds)".to_string(),
            })?;
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> std::result::Result<(), ControlError> {
        if self.site_url.trim().is_empty() {
            return Err(ControlError::MissingField {
                field: "site_url".to_string(),
            });
        }
        if self.api_version.trim().is_empty() {
            return Err(ControlError::MissingField {
                field: "api_version".to_string(),
            });
        }
        Ok(())
    }

    /// Site URL with the trailing slash relative joins depend on.
    pub fn base_url(&self) -> String {
        let trimmed = self.site_url.trim();
        if trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{}/", trimmed)
        }
    }

    /// Payload for the session creation request.
    pub fn session_params(&self) -> serde_json::Value {
        serde_json::json!({ "ixLoadVersion": self.api_version })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Resource paths relative to the session URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Prefix for named test operations (`loadTest`, `runTest`, ...).
    pub operations: String,
    /// Resource reporting `currentState` of the running test.
    pub active_test: String,
    /// Time-keyed metric values sampled while the test runs.
    pub stats_values: String,
    /// Tabular per-stream statistics view.
    pub stats_view: String,
    /// Caption -> field mapping applied to the statistics view.
    pub stats_columns: ColumnMap,
    /// Per-flow-group statistics view (VLAN-tagged rows).
    pub flow_view: String,
    pub flow_columns: ColumnMap,
    /// `currentState` value that means the test is still running.
    pub active_state: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            operations: "ixload/test/operations/".to_string(),
            active_test: "ixload/test/activeTest".to_string(),
            stats_values: "ixload/stats/HTTPClient/values".to_string(),
            stats_view: "ixload/stats/views/traffic".to_string(),
            stats_columns: ColumnMap::default(),
            flow_view: "ixload/stats/views/flow".to_string(),
            flow_columns: ColumnMap::flow_statistics(),
            active_state: "Running".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Status poll interval for quick operations (milliseconds).
    pub fast_interval_ms: u64,
    /// Status poll interval for session start and test loading (milliseconds).
    pub slow_interval_ms: u64,
    /// Upper bound on a single wait (seconds). `0` waits forever.
    pub max_wait_sec: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 500,
            slow_interval_ms: 2_000,
            max_wait_sec: 600,
        }
    }
}

impl PollingConfig {
    fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_sec > 0).then(|| Duration::from_secs(self.max_wait_sec))
    }

    pub fn fast(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.fast_interval_ms),
            max_wait: self.max_wait(),
        }
    }

    pub fn slow(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.slow_interval_ms),
            max_wait: self.max_wait(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts for a state-changing command, including the first.
    pub max_tries: u32,
    /// Pause between attempts (seconds).
    pub delay_sec: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: 5,
            delay_sec: 5,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_tries, Duration::from_secs(self.delay_sec))
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// What the sampler does when a single metrics fetch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerErrorPolicy {
    /// Log, count and keep sampling.
    Skip,
    /// Stop sampling and return the error.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Pause between metric fetches (milliseconds).
    pub interval_ms: u64,
    /// Stop after this many fetches even if the test is still active.
    /// Bounds a run to `max_rounds x interval`; `0` counts as `1`.
    pub max_rounds: u32,
    pub on_error: SamplerErrorPolicy,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 4_000,
            max_rounds: 900,
            on_error: SamplerErrorPolicy::Skip,
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Per-stream tolerance override. Unset fields inherit the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToleranceOverride {
    pub max_outage_sec: Option<f64>,
    pub loss_tolerance_pct: Option<f64>,
    pub rate_tolerance: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub max_outage_sec: f64,
    pub loss_tolerance_pct: f64,
    /// Allowed |tx - rx| frame rate difference (frames per second).
    pub rate_tolerance: f64,
    pub check_iterations: u32,
    pub check_interval_sec: u64,
    /// Loss tolerance used when comparing two profiles.
    pub compare_loss_tolerance: f64,
    /// Rate tolerance used when comparing two profiles.
    pub compare_rate_tolerance: f64,
    /// Overrides keyed by stream (traffic item) name.
    pub streams: BTreeMap<String, ToleranceOverride>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_outage_sec: 120.0,
            loss_tolerance_pct: 15.0,
            rate_tolerance: 5.0,
            check_iterations: 10,
            check_interval_sec: 60,
            compare_loss_tolerance: 5.0,
            compare_rate_tolerance: 2.0,
            streams: BTreeMap::new(),
        }
    }
}

impl VerificationConfig {
    pub fn tolerance_table(&self) -> std::result::Result<ToleranceTable, ControlError> {
        let default = ToleranceSpec::new(
            self.max_outage_sec,
            self.loss_tolerance_pct,
            self.rate_tolerance,
        )?;
        let mut table = ToleranceTable::new(default.clone());
        for (stream, o) in &self.streams {
            let spec = ToleranceSpec::new(
                o.max_outage_sec.unwrap_or(default.max_outage_seconds),
                o.loss_tolerance_pct.unwrap_or(default.loss_tolerance_pct),
                o.rate_tolerance.unwrap_or(default.rate_tolerance),
            )?;
            table.insert(stream.clone(), spec);
        }
        Ok(table)
    }

    pub fn threshold(&self) -> ThresholdConfig {
        ThresholdConfig {
            max_iterations: self.check_iterations,
            interval: Duration::from_secs(self.check_interval_sec),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
