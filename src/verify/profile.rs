use serde::Serialize;
use tracing::{error, info, warn};

use super::ensure_tolerance;
use crate::error::{ControlError, Result};
use crate::stats::Profile;

/// Outcome of comparing two profiles pair by pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub pairs_compared: usize,
    /// Positional pairs whose identities disagreed; not compared.
    pub skipped_pairs: Vec<String>,
    pub violations: Vec<String>,
}

impl ComparisonReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Turn a failed comparison into [`ControlError::ProfileDeviation`].
    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(ControlError::ProfileDeviation {
                violations: self.violations,
            })
        }
    }
}

/// Compare `current` against `baseline`, pairing streams by position.
///
/// Structural problems (an empty profile, differing stream counts) fail
/// before any numbers are looked at. Every pair is evaluated so the report
/// lists all violations at once.
pub fn compare(
    baseline: &Profile,
    current: &Profile,
    loss_tolerance: f64,
    rate_tolerance: f64,
) -> Result<ComparisonReport> {
    let loss_tolerance = ensure_tolerance("loss_tolerance", loss_tolerance)?;
    let rate_tolerance = ensure_tolerance("rate_tolerance", rate_tolerance)?;

    if baseline.is_empty() {
        return Err(ControlError::ConfigurationMismatch {
            detail: "baseline profile carries no traffic data".to_string(),
        });
    }
    if current.is_empty() {
        return Err(ControlError::ConfigurationMismatch {
            detail: "current profile carries no traffic data".to_string(),
        });
    }
    let (n_base, n_cur) = (baseline.entity_count(), current.entity_count());
    if n_base != n_cur {
        return Err(ControlError::ConfigurationMismatch {
            detail: format!(
                "profiles do not have the same traffic streams ({} vs {})",
                n_base, n_cur
            ),
        });
    }

    info!(baseline = %baseline.id(), current = %current.id(), streams = n_base, "comparing traffic profiles");
    let mut report = ComparisonReport::default();

    for (idx, (a, b)) in baseline.records().iter().zip(current.records()).enumerate() {
        if !a.same_entity(b) {
            warn!(
                position = idx,
                baseline = %a.entity_key(),
                current = %b.entity_key(),
                "port pair / stream mismatch between profiles, skipping"
            );
            report
                .skipped_pairs
                .push(format!("#{}: {} vs {}", idx, a.entity_key(), b.entity_key()));
            continue;
        }

        let key = a.entity_key();
        report.pairs_compared += 1;
        let checks = [
            ("Tx rate", a.tx_rate, b.tx_rate, rate_tolerance),
            ("Rx rate", a.rx_rate, b.rx_rate, rate_tolerance),
            ("Loss %", a.loss_pct, b.loss_pct, loss_tolerance),
        ];
        for (what, va, vb, tolerance) in checks {
            if (va - vb).abs() > tolerance {
                let violation = format!(
                    "{}: {} {} vs {} differs by more than {}",
                    key, what, va, vb, tolerance
                );
                error!("{}", violation);
                report.violations.push(violation);
            }
        }
    }

    if report.passed() {
        info!(pairs = report.pairs_compared, "profile comparison passed");
    }
    Ok(report)
}

/// Baseline slot for "capture now, compare later" workflows.
#[derive(Debug, Default)]
pub struct GoldenProfile {
    profile: Option<Profile>,
}

impl GoldenProfile {
    pub fn set(&mut self, profile: Profile) {
        info!(profile = %profile.id(), "setting golden traffic profile");
        self.profile = Some(profile);
    }

    pub fn get(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    pub fn compare_current(
        &self,
        current: &Profile,
        loss_tolerance: f64,
        rate_tolerance: f64,
    ) -> Result<ComparisonReport> {
        let golden = self.profile.as_ref().ok_or_else(|| ControlError::ConfigurationMismatch {
            detail: "no golden profile has been captured".to_string(),
        })?;
        compare(golden, current, loss_tolerance, rate_tolerance)
    }
}
