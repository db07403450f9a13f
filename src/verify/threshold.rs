use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use super::{evaluate, ToleranceTable, VerificationResult};
use crate::error::{ControlError, Result};
use crate::stats::StatsSource;

/// Iteration budget of a threshold check: at most
/// `max_iterations` snapshots, `interval` apart.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdConfig {
    pub max_iterations: u32,
    pub interval: Duration,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            interval: Duration::from_secs(60),
        }
    }
}

/// Re-check all selected streams until every one is within tolerance.
///
/// Every round reads a fresh snapshot and evaluates all streams again, not
/// just the ones that failed before. Fails only after the last round; there
/// is no sleep after it.
pub async fn check_entities(
    source: &dyn StatsSource,
    streams: &[String],
    tolerances: &ToleranceTable,
    config: &ThresholdConfig,
) -> Result<VerificationResult> {
    let rounds = config.max_iterations.max(1);
    let mut round = 1;

    loop {
        info!(round, rounds, "checking traffic streams for outage/loss");
        let snapshot = source.snapshot().await?;
        let result = evaluate(snapshot.records(), tolerances, streams);

        if result.per_entity.is_empty() {
            warn!(?streams, "no traffic streams matched the selection");
        }
        if result.overall_pass {
            info!(round, streams = result.per_entity.len(), "traffic outage/loss within tolerance");
            return Ok(result);
        }

        let failing = result.failing();
        for entity in &failing {
            error!(%entity, round, "traffic outage/loss out of tolerance");
        }
        if round >= rounds {
            return Err(ControlError::ToleranceExceeded { failing, rounds });
        }

        info!(interval = ?config.interval, "sleeping before re-checking streams");
        sleep(config.interval).await;
        round += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Profile, StreamRecord};
    use crate::verify::ToleranceSpec;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Replays snapshots in order, repeating the last one.
    struct Replay {
        snapshots: Mutex<VecDeque<Vec<StreamRecord>>>,
        reads: AtomicU32,
    }

    impl Replay {
        fn new(snapshots: Vec<Vec<StreamRecord>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots.into()),
                reads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StatsSource for Replay {
        async fn snapshot(&self) -> Result<Profile> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut q = self.snapshots.lock().unwrap();
            let records = if q.len() > 1 {
                q.pop_front().unwrap_or_default()
            } else {
                q.front().cloned().unwrap_or_default()
            };
            Ok(Profile::capture(records))
        }
    }

    fn web(loss: f64) -> StreamRecord {
        StreamRecord::new("web", "1/1-1/2").with_rates(100.0, 100.0).with_loss(loss)
    }

    fn table() -> ToleranceTable {
        ToleranceSpec::new(120.0, 15.0, 5.0).unwrap().into()
    }

    fn config(max_iterations: u32) -> ThresholdConfig {
        ThresholdConfig {
            max_iterations,
            interval: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_first_round_without_sleeping() {
        let source = Replay::new(vec![vec![web(10.0)]]);
        let started = Instant::now();

        let result = check_entities(&source, &[], &table(), &config(10)).await.unwrap();

        assert!(result.overall_pass);
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_rounds_and_names_entity() {
        let source = Replay::new(vec![vec![web(30.0)]]);
        let started = Instant::now();

        let err = check_entities(&source, &[], &table(), &config(4)).await.unwrap_err();

        match err {
            ControlError::ToleranceExceeded { failing, rounds } => {
                assert_eq!(failing, vec!["1/1-1/2 | web".to_string()]);
                assert_eq!(rounds, 4);
            }
            other => panic!("expected ToleranceExceeded, got {:?}", other),
        }
        assert_eq!(source.reads.load(Ordering::SeqCst), 4);
        // Sleeps only between rounds.
        assert_eq!(started.elapsed(), Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_later_round() {
        let source = Replay::new(vec![vec![web(30.0)], vec![web(30.0)], vec![web(1.0)]]);

        let result = check_entities(&source, &[], &table(), &config(10)).await.unwrap();

        assert!(result.overall_pass);
        assert_eq!(source.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rechecks_every_stream_each_round() {
        let dns_bad = StreamRecord::new("dns", "1/3-1/4").with_rates(100.0, 50.0);
        let dns_ok = StreamRecord::new("dns", "1/3-1/4").with_rates(100.0, 100.0);
        // web regresses in round 2 while dns recovers.
        let source = Replay::new(vec![
            vec![web(0.0), dns_bad],
            vec![web(40.0), dns_ok],
        ]);

        let err = check_entities(&source, &[], &table(), &config(2)).await.unwrap_err();
        match err {
            ControlError::ToleranceExceeded { failing, .. } => {
                assert_eq!(failing, vec!["1/1-1/2 | web".to_string()]);
            }
            other => panic!("expected ToleranceExceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_keys_still_name_the_failure() {
        let source = Replay::new(vec![vec![web(40.0), web(0.0)]]);
        let err = check_entities(&source, &[], &table(), &config(2)).await.unwrap_err();
        match err {
            ControlError::ToleranceExceeded { failing, .. } => {
                assert_eq!(failing, vec!["1/1-1/2 | web".to_string()]);
            }
            other => panic!("expected ToleranceExceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_iterations_still_checks_once() {
        let source = Replay::new(vec![vec![web(30.0)]]);
        let err = check_entities(&source, &[], &table(), &config(0)).await.unwrap_err();
        assert!(matches!(err, ControlError::ToleranceExceeded { rounds: 1, .. }));
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
    }
}
