//! Run-time statistics sampling.
//!
//! The controller only keeps a window of recent values, so they have to be
//! pulled out gradually while the test runs.

use std::collections::BTreeMap;

use reqwest::Url;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{SamplerConfig, SamplerErrorPolicy};
use crate::error::{ControlError, Result};
use crate::session::Session;

/// Metric name -> (timestamp in ms -> value). Equal timestamps overwrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    metrics: BTreeMap<String, BTreeMap<u64, f64>>,
}

fn parse_timestamp_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    raw.parse::<u64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.round() as u64)
    })
}

fn metric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

impl TimeSeries {
    pub fn insert(&mut self, metric: &str, timestamp_ms: u64, value: f64) {
        self.metrics
            .entry(metric.to_string())
            .or_default()
            .insert(timestamp_ms, value);
    }

    /// Merge one `{timestamp_ms: {metric: value}}` snapshot. Returns the
    /// number of points taken; malformed entries are skipped.
    pub fn merge_snapshot(&mut self, snapshot: &Map<String, Value>) -> usize {
        let mut merged = 0;
        for (ts, values) in snapshot {
            let Some(timestamp_ms) = parse_timestamp_ms(ts) else {
                debug!(timestamp = %ts, "skipping unparsable timestamp");
                continue;
            };
            let Some(values) = values.as_object() else {
                debug!(timestamp = %ts, "skipping non-object sample");
                continue;
            };
            for (metric, value) in values {
                match metric_value(value) {
                    Some(v) => {
                        self.insert(metric, timestamp_ms, v);
                        merged += 1;
                    }
                    None => debug!(%metric, %value, "skipping non-numeric metric value"),
                }
            }
        }
        merged
    }

    /// Points for `metric` as (elapsed seconds, value), in time order.
    pub fn series(&self, metric: &str) -> Vec<(f64, f64)> {
        self.metrics
            .get(metric)
            .map(|points| {
                points
                    .iter()
                    .map(|(ms, v)| (*ms as f64 / 1000.0, *v))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

impl Serialize for TimeSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.metrics.keys().map(|m| (m, self.series(m))))
    }
}

/// Outcome of one sampling run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SampleRun {
    pub series: TimeSeries,
    /// Successful metric fetches.
    pub fetches: u32,
    /// Fetches that failed and were skipped.
    pub skipped: u32,
    /// Sampling stopped at `max_rounds` while the test was still active.
    pub truncated: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveTest {
    current_state: String,
}

/// Read the `currentState` the probe resource reports.
pub async fn read_state(session: &Session, probe: &Url) -> Result<String> {
    let reply = session.transport().get(probe).await?;
    if !reply.is_success() {
        return Err(ControlError::Transport {
            url: reply.url,
            detail: format!("state probe answered {}", reply.status),
        });
    }
    Ok(reply.json::<ActiveTest>()?.current_state)
}

async fn fetch_metrics(session: &Session, url: &Url) -> Result<Map<String, Value>> {
    let reply = session.transport().get(url).await?;
    if !reply.is_success() {
        return Err(ControlError::Transport {
            url: reply.url,
            detail: format!("metrics endpoint answered {}", reply.status),
        });
    }
    reply.json()
}

/// Sample `metrics_path` every `config.interval()` for as long as
/// `probe_path` reports `active_state`.
pub async fn sample_while_active(
    session: &Session,
    probe_path: &str,
    metrics_path: &str,
    active_state: &str,
    config: &SamplerConfig,
) -> Result<SampleRun> {
    let probe = session.resolve(probe_path)?;
    let metrics = session.resolve(metrics_path)?;
    let mut run = SampleRun::default();

    info!(session = %session.id(), interval = ?config.interval(), "gathering statistics until the test ends");
    loop {
        let state = read_state(session, &probe).await?;
        if !state.eq_ignore_ascii_case(active_state) {
            debug!(%state, "test no longer active");
            break;
        }
        let max_rounds = config.max_rounds.max(1);
        if run.fetches + run.skipped >= max_rounds {
            warn!(max_rounds, "sampling limit reached while the test is still active");
            run.truncated = true;
            break;
        }

        match fetch_metrics(session, &metrics).await {
            Ok(snapshot) => {
                let points = run.series.merge_snapshot(&snapshot);
                run.fetches += 1;
                debug!(points, fetch = run.fetches, "metrics merged");
            }
            Err(e) => match config.on_error {
                SamplerErrorPolicy::Skip => {
                    warn!(error = %e, "metrics fetch failed, skipping sample");
                    run.skipped += 1;
                }
                SamplerErrorPolicy::Abort => return Err(e),
            },
        }
        sleep(config.interval()).await;
    }

    info!(fetches = run.fetches, skipped = run.skipped, "statistics gathering finished");
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Method, ScriptedTransport, BASE};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const PROBE: &str = "/api/v0/sessions/45/ixload/test/activeTest";
    const VALUES: &str = "/api/v0/sessions/45/ixload/stats/HTTPClient/values";

    fn config(on_error: SamplerErrorPolicy) -> SamplerConfig {
        SamplerConfig {
            interval_ms: 4_000,
            max_rounds: 900,
            on_error,
        }
    }

    async fn session(t: &Arc<ScriptedTransport>) -> Session {
        Session::create(t.clone(), BASE, &json!({})).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_while_running() {
        let t = Arc::new(ScriptedTransport::new().with_session());
        t.json(Method::Get, PROBE, json!({"currentState": "Running"}));
        t.json(Method::Get, PROBE, json!({"currentState": "Running"}));
        t.json(Method::Get, PROBE, json!({"currentState": "Stopped"}));
        t.json(Method::Get, VALUES, json!({"4000": {"HTTP Concurrent Connections": 10}}));
        t.json(
            Method::Get,
            VALUES,
            json!({"4000": {"HTTP Concurrent Connections": 12}, "8000": {"HTTP Concurrent Connections": "20"}}),
        );

        let mut s = session(&t).await;
        let started = Instant::now();
        let run = sample_while_active(
            &s,
            "ixload/test/activeTest",
            "ixload/stats/HTTPClient/values",
            "Running",
            &config(SamplerErrorPolicy::Skip),
        )
        .await
        .unwrap();

        assert_eq!(t.count(Method::Get, VALUES), 2);
        assert_eq!(run.fetches, 2);
        assert!(!run.truncated);
        assert_eq!(started.elapsed(), Duration::from_secs(8));
        // Second fetch overwrote the value at 4 s.
        assert_eq!(
            run.series.series("HTTP Concurrent Connections"),
            vec![(4.0, 12.0), (8.0, 20.0)]
        );
        s.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_test_is_never_sampled() {
        let t = Arc::new(ScriptedTransport::new().with_session());
        t.json(Method::Get, PROBE, json!({"currentState": "Unconfigured"}));

        let mut s = session(&t).await;
        let run = sample_while_active(&s, "ixload/test/activeTest", "ixload/stats/HTTPClient/values", "Running", &config(SamplerErrorPolicy::Skip))
            .await
            .unwrap();

        assert_eq!(t.count(Method::Get, VALUES), 0);
        assert!(run.series.is_empty());
        s.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_skipped() {
        let t = Arc::new(ScriptedTransport::new().with_session());
        t.json(Method::Get, PROBE, json!({"currentState": "Running"}));
        t.json(Method::Get, PROBE, json!({"currentState": "Running"}));
        t.json(Method::Get, PROBE, json!({"currentState": "Finished"}));
        t.fail(Method::Get, VALUES, "read timed out");
        t.json(Method::Get, VALUES, json!({"1500": {"TCP Retries": 3}}));

        let mut s = session(&t).await;
        let run = sample_while_active(&s, "ixload/test/activeTest", "ixload/stats/HTTPClient/values", "Running", &config(SamplerErrorPolicy::Skip))
            .await
            .unwrap();

        assert_eq!(run.skipped, 1);
        assert_eq!(run.fetches, 1);
        assert_eq!(run.series.series("TCP Retries"), vec![(1.5, 3.0)]);
        s.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_aborts_when_configured() {
        let t = Arc::new(ScriptedTransport::new().with_session());
        t.json(Method::Get, PROBE, json!({"currentState": "Running"}));
        t.fail(Method::Get, VALUES, "read timed out");

        let mut s = session(&t).await;
        let err = sample_while_active(&s, "ixload/test/activeTest", "ixload/stats/HTTPClient/values", "Running", &config(SamplerErrorPolicy::Abort))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Transport { .. }));
        s.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_rounds_truncates() {
        let t = Arc::new(ScriptedTransport::new().with_session());
        t.json(Method::Get, PROBE, json!({"currentState": "Running"}));
        t.json(Method::Get, VALUES, json!({"1000": {"x": 1}}));

        let mut s = session(&t).await;
        let cfg = SamplerConfig {
            max_rounds: 3,
            ..config(SamplerErrorPolicy::Skip)
        };
        let run = sample_while_active(&s, "ixload/test/activeTest", "ixload/stats/HTTPClient/values", "Running", &cfg)
            .await
            .unwrap();

        assert!(run.truncated);
        assert_eq!(t.count(Method::Get, VALUES), 3);
        s.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_config_bounds_a_stuck_test() {
        let t = Arc::new(ScriptedTransport::new().with_session());
        t.json(Method::Get, PROBE, json!({"currentState": "Running"}));
        t.fail(Method::Get, VALUES, "connection reset");

        let mut s = session(&t).await;
        let cfg = SamplerConfig::default();
        let started = Instant::now();
        let run = sample_while_active(&s, "ixload/test/activeTest", "ixload/stats/HTTPClient/values", "Running", &cfg)
            .await
            .unwrap();

        assert!(run.truncated);
        assert_eq!(run.fetches, 0);
        assert_eq!(run.skipped, cfg.max_rounds);
        assert_eq!(started.elapsed(), cfg.interval() * cfg.max_rounds);
        s.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_propagates() {
        let t = Arc::new(ScriptedTransport::new().with_session());
        t.fail(Method::Get, PROBE, "connection refused");
        t.json(Method::Get, VALUES, json!({"1000": {"x": 1}}));

        let mut s = session(&t).await;
        let err = sample_while_active(&s, "ixload/test/activeTest", "ixload/stats/HTTPClient/values", "Running", &config(SamplerErrorPolicy::Skip))
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::Transport { .. }));
        assert_eq!(t.count(Method::Get, VALUES), 0);
        s.release().await;
    }

    #[test]
    fn test_merge_skips_garbage() {
        let mut ts = TimeSeries::default();
        let snapshot = json!({
            "abc": {"x": 1},
            "2000": {"x": "n/a", "y": 4.5},
            "3000.0": {"x": 2},
            "4000": "not an object"
        });
        let merged = ts.merge_snapshot(snapshot.as_object().unwrap());
        assert_eq!(merged, 2);
        assert_eq!(ts.series("x"), vec![(3.0, 2.0)]);
        assert_eq!(ts.series("y"), vec![(2.0, 4.5)]);
        assert!(ts.series("z").is_empty());
    }

    #[test]
    fn test_serializes_as_elapsed_seconds() {
        let mut ts = TimeSeries::default();
        ts.insert("rps", 4_000, 100.0);
        ts.insert("rps", 8_000, 120.0);
        assert_eq!(
            serde_json::to_value(&ts).unwrap(),
            json!({"rps": [[4.0, 100.0], [8.0, 120.0]]})
        );
    }
}
