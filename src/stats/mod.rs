//! Per-stream traffic statistics and captured profiles.

pub mod view;

use std::fmt;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use view::{ColumnMap, ColumnMapping, Field, StatsSource, StatsView, ViewSource};

/// Estimated outage duration from lost frames and the transmit rate.
///
/// Zero when nothing is being transmitted; never negative. Rounded to
/// millisecond precision.
pub fn outage_seconds(frames_delta: f64, tx_rate: f64) -> f64 {
    if tx_rate.is_nan() || tx_rate <= 0.0 || !frames_delta.is_finite() {
        return 0.0;
    }
    let outage = (frames_delta / tx_rate).max(0.0);
    (outage * 1000.0).round() / 1000.0
}

/// Parse a numeric cell, treating empty or garbage text as zero.
pub fn parse_lenient(raw: &str) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => parse_lenient(&s),
        _ => 0.0,
    })
}

/// Statistics of one traffic stream (flow group) at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_id: String,
    pub pair_id: String,
    /// VLAN identity of a flow group; empty for per-stream rows.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vlan_id: String,
    #[serde(default)]
    pub tx_frames: f64,
    #[serde(default)]
    pub rx_frames: f64,
    #[serde(default)]
    pub frames_delta: f64,
    #[serde(default)]
    pub tx_rate: f64,
    #[serde(default)]
    pub rx_rate: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub loss_pct: f64,
    #[serde(default)]
    pub outage_seconds: f64,
}

impl StreamRecord {
    pub fn new(stream_id: impl Into<String>, pair_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            pair_id: pair_id.into(),
            vlan_id: String::new(),
            tx_frames: 0.0,
            rx_frames: 0.0,
            frames_delta: 0.0,
            tx_rate: 0.0,
            rx_rate: 0.0,
            loss_pct: 0.0,
            outage_seconds: 0.0,
        }
    }

    pub fn with_frames(mut self, tx_frames: f64, rx_frames: f64, frames_delta: f64) -> Self {
        self.tx_frames = tx_frames;
        self.rx_frames = rx_frames;
        self.frames_delta = frames_delta;
        self.outage_seconds = outage_seconds(self.frames_delta, self.tx_rate);
        self
    }

    pub fn with_rates(mut self, tx_rate: f64, rx_rate: f64) -> Self {
        self.tx_rate = tx_rate;
        self.rx_rate = rx_rate;
        self.outage_seconds = outage_seconds(self.frames_delta, self.tx_rate);
        self
    }

    pub fn with_loss(mut self, loss_pct: f64) -> Self {
        self.loss_pct = if loss_pct.is_finite() { loss_pct } else { 0.0 };
        self
    }

    pub fn with_vlan(mut self, vlan_id: impl Into<String>) -> Self {
        self.vlan_id = vlan_id.into();
        self
    }

    /// `"<port pair> | <stream>"`, plus `" | <vlan>"` for flow groups. The
    /// identity used in verdicts and logs.
    pub fn entity_key(&self) -> String {
        if self.vlan_id.is_empty() {
            format!("{} | {}", self.pair_id, self.stream_id)
        } else {
            format!("{} | {} | {}", self.pair_id, self.stream_id, self.vlan_id)
        }
    }

    pub fn same_entity(&self, other: &StreamRecord) -> bool {
        self.stream_id == other.stream_id && self.pair_id == other.pair_id && self.vlan_id == other.vlan_id
    }
}

/// Snapshot of every stream's statistics, captured once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    id: Uuid,
    captured_at: DateTime<Utc>,
    records: Vec<StreamRecord>,
}

impl Profile {
    pub fn capture(records: Vec<StreamRecord>) -> Self {
        Self {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            records,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn records(&self) -> &[StreamRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of logical entities (records naming a stream).
    pub fn entity_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.stream_id.trim().is_empty())
            .count()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write profile: {}", path.display()))?;
        Ok(())
    }

    /// Read a saved profile. Outage is derived data and is recomputed from
    /// each record's frame delta and transmit rate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profile: {}", path.display()))?;
        let mut profile: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse profile: {}", path.display()))?;
        for record in &mut profile.records {
            record.outage_seconds = outage_seconds(record.frames_delta, record.tx_rate);
        }
        Ok(profile)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<22} | {:<20} | {:>12} | {:>12} | {:>10} | {:>10} | {:>10} | {:>7} | {:>8}",
            "Port Pair", "Stream", "Tx Frames", "Rx Frames", "Delta", "Tx Rate", "Rx Rate", "Loss %", "Outage"
        )?;
        writeln!(
            f,
            "{:-<22}-|-{:-<20}-|-{:-<12}-|-{:-<12}-|-{:-<10}-|-{:-<10}-|-{:-<10}-|-{:-<7}-|-{:-<8}",
            "", "", "", "", "", "", "", "", ""
        )?;
        for r in &self.records {
            writeln!(
                f,
                "{:<22} | {:<20} | {:>12.0} | {:>12.0} | {:>10.0} | {:>10.3} | {:>10.3} | {:>7.3} | {:>8.3}",
                r.pair_id,
                r.stream_id,
                r.tx_frames,
                r.rx_frames,
                r.frames_delta,
                r.tx_rate,
                r.rx_rate,
                r.loss_pct,
                r.outage_seconds
            )?;
        }
        Ok(())
    }
}
