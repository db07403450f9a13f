//! Tolerance-based verification of traffic statistics.
//!
//! Checks are plain predicates returning a [`CheckOutcome`]; errors are only
//! raised once a whole check has run out of chances (see [`threshold`]) or
//! two profiles cannot be compared at all (see [`profile`]).

pub mod profile;
pub mod threshold;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ControlError, Result};
use crate::stats::StreamRecord;

pub use profile::{compare, ComparisonReport, GoldenProfile};
pub use threshold::{check_entities, ThresholdConfig};

/// Acceptable deviation for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceSpec {
    pub max_outage_seconds: f64,
    pub loss_tolerance_pct: f64,
    /// Allowed |tx - rx| in frames per second.
    pub rate_tolerance: f64,
}

pub(crate) fn ensure_tolerance(field: &'static str, value: f64) -> Result<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ControlError::InvalidTolerance { field, value })
    }
}

impl ToleranceSpec {
    pub fn new(max_outage_seconds: f64, loss_tolerance_pct: f64, rate_tolerance: f64) -> Result<Self> {
        Ok(Self {
            max_outage_seconds: ensure_tolerance("max_outage_seconds", max_outage_seconds)?,
            loss_tolerance_pct: ensure_tolerance("loss_tolerance_pct", loss_tolerance_pct)?,
            rate_tolerance: ensure_tolerance("rate_tolerance", rate_tolerance)?,
        })
    }
}

/// Default tolerances plus per-stream overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceTable {
    default: ToleranceSpec,
    overrides: HashMap<String, ToleranceSpec>,
}

impl ToleranceTable {
    pub fn new(default: ToleranceSpec) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn insert(&mut self, stream_id: impl Into<String>, spec: ToleranceSpec) {
        self.overrides.insert(stream_id.into(), spec);
    }

    pub fn for_stream(&self, stream_id: &str) -> &ToleranceSpec {
        self.overrides.get(stream_id).unwrap_or(&self.default)
    }
}

impl From<ToleranceSpec> for ToleranceTable {
    fn from(spec: ToleranceSpec) -> Self {
        Self::new(spec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub reason: String,
}

impl CheckOutcome {
    fn new(passed: bool, reason: String) -> Self {
        Self { passed, reason }
    }
}

pub fn check_outage(record: &StreamRecord, tolerance: &ToleranceSpec) -> CheckOutcome {
    let passed = record.outage_seconds <= tolerance.max_outage_seconds;
    CheckOutcome::new(
        passed,
        format!(
            "outage of {:.3}s is {}within the {}s limit",
            record.outage_seconds,
            if passed { "" } else { "NOT " },
            tolerance.max_outage_seconds
        ),
    )
}

pub fn check_loss(record: &StreamRecord, tolerance: &ToleranceSpec) -> CheckOutcome {
    let passed = record.loss_pct <= tolerance.loss_tolerance_pct;
    CheckOutcome::new(
        passed,
        format!(
            "loss of {}% is {}within the {}% tolerance",
            record.loss_pct,
            if passed { "" } else { "NOT " },
            tolerance.loss_tolerance_pct
        ),
    )
}

pub fn check_rate(record: &StreamRecord, tolerance: &ToleranceSpec) -> CheckOutcome {
    let diff = (record.tx_rate - record.rx_rate).abs();
    let passed = diff <= tolerance.rate_tolerance;
    CheckOutcome::new(
        passed,
        format!(
            "tx {} vs rx {} fps differ by {:.3}, {}within {} fps",
            record.tx_rate,
            record.rx_rate,
            diff,
            if passed { "" } else { "NOT " },
            tolerance.rate_tolerance
        ),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityVerdict {
    pub outage: CheckOutcome,
    pub loss: CheckOutcome,
    pub rate: CheckOutcome,
    pub overall: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerificationResult {
    /// Keyed by [`StreamRecord::entity_key`]; a repeated key gets the
    /// record's row number appended.
    pub per_entity: BTreeMap<String, EntityVerdict>,
    pub overall_pass: bool,
}

impl VerificationResult {
    pub fn failing(&self) -> Vec<String> {
        self.per_entity
            .iter()
            .filter(|(_, v)| !v.overall)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Evaluate every selected record against its tolerances.
///
/// `streams` restricts the check to those stream ids; empty means all.
pub fn evaluate(records: &[StreamRecord], tolerances: &ToleranceTable, streams: &[String]) -> VerificationResult {
    let mut result = VerificationResult {
        per_entity: BTreeMap::new(),
        overall_pass: true,
    };

    for (idx, record) in records.iter().enumerate() {
        if record.stream_id.trim().is_empty() {
            continue;
        }
        if !streams.is_empty() && !streams.iter().any(|s| s == &record.stream_id) {
            continue;
        }

        let tolerance = tolerances.for_stream(&record.stream_id);
        let outage = check_outage(record, tolerance);
        let loss = check_loss(record, tolerance);
        let rate = check_rate(record, tolerance);
        let overall = outage.passed && loss.passed && rate.passed;

        let mut key = record.entity_key();
        if result.per_entity.contains_key(&key) {
            warn!(entity = %key, row = idx + 1, "duplicate entity in snapshot, keeping it apart by row");
            key = format!("{} (row {})", key, idx + 1);
        }
        if overall {
            debug!(entity = %key, "within tolerance");
        } else {
            for check in [&outage, &loss, &rate].into_iter().filter(|c| !c.passed) {
                warn!(entity = %key, "{}", check.reason);
            }
            result.overall_pass = false;
        }
        result.per_entity.insert(
            key,
            EntityVerdict {
                outage,
                loss,
                rate,
                overall,
            },
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ToleranceSpec {
        ToleranceSpec::new(120.0, 15.0, 5.0).unwrap()
    }

    #[test]
    fn test_tolerance_spec_validates() {
        assert!(ToleranceSpec::new(0.0, 0.0, 0.0).is_ok());
        assert!(matches!(
            ToleranceSpec::new(-1.0, 0.0, 0.0),
            Err(ControlError::InvalidTolerance { field: "max_outage_seconds", .. })
        ));
        assert!(ToleranceSpec::new(1.0, f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_predicates_are_inclusive() {
        let r = StreamRecord::new("web", "p")
            .with_rates(100.0, 95.0)
            .with_frames(0.0, 0.0, 12_000.0)
            .with_loss(15.0);
        assert!(check_outage(&r, &spec()).passed);
        assert!(check_loss(&r, &spec()).passed);
        assert!(check_rate(&r, &spec()).passed);

        let r = r.with_rates(100.0, 94.0);
        let outcome = check_rate(&r, &spec());
        assert!(!outcome.passed);
        assert!(outcome.reason.contains("NOT"));
    }

    #[test]
    fn test_evaluate_uses_overrides_and_filter() {
        let mut table = ToleranceTable::from(spec());
        table.insert("voice", ToleranceSpec::new(1.0, 0.5, 1.0).unwrap());

        let records = vec![
            StreamRecord::new("web", "1/1-1/2").with_rates(10.0, 10.0).with_loss(3.0),
            StreamRecord::new("voice", "1/3-1/4").with_rates(10.0, 10.0).with_loss(3.0),
            StreamRecord::new("", "blank"),
        ];

        let all = evaluate(&records, &table, &[]);
        assert!(!all.overall_pass);
        assert_eq!(all.per_entity.len(), 2);
        assert_eq!(all.failing(), vec!["1/3-1/4 | voice".to_string()]);
        let voice = &all.per_entity["1/3-1/4 | voice"];
        assert!(voice.outage.passed);
        assert!(!voice.loss.passed);
        assert!(voice.rate.passed);

        let web_only = evaluate(&records, &table, &["web".to_string()]);
        assert!(web_only.overall_pass);
        assert_eq!(web_only.per_entity.len(), 1);
    }

    #[test]
    fn test_duplicate_entities_are_all_kept() {
        let bad = StreamRecord::new("web", "1/1-1/2").with_loss(40.0);
        let good = StreamRecord::new("web", "1/1-1/2").with_loss(0.0);

        let result = evaluate(&[bad.clone(), good.clone()], &spec().into(), &[]);
        assert!(!result.overall_pass);
        assert_eq!(result.per_entity.len(), 2);
        assert_eq!(result.failing(), vec!["1/1-1/2 | web".to_string()]);

        let result = evaluate(&[good, bad], &spec().into(), &[]);
        assert_eq!(result.failing(), vec!["1/1-1/2 | web (row 2)".to_string()]);
    }
}
