//! Reading tabular statistics views into profiles.
//!
//! A view is a caption row plus value rows. Columns are located by caption
//! through a [`ColumnMap`], so the remote column order does not matter.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{parse_lenient, Profile, StreamRecord};
use crate::error::{ControlError, Result};
use crate::session::Session;

/// Target field of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    PortPair,
    Stream,
    /// Flow-group VLAN identity (`VLAN:VLAN-ID`).
    Vlan,
    TxFrames,
    RxFrames,
    FramesDelta,
    TxRate,
    RxRate,
    Loss,
}

impl Field {
    fn required(self) -> bool {
        !matches!(self, Field::TxFrames | Field::RxFrames | Field::Vlan)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub caption: String,
    pub field: Field,
}

/// Source caption -> record field table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMap {
    entries: Vec<ColumnMapping>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self::new([
            ("Source/Dest Port Pair", Field::PortPair),
            ("Traffic Item", Field::Stream),
            ("Tx Frames", Field::TxFrames),
            ("Rx Frames", Field::RxFrames),
            ("Frames Delta", Field::FramesDelta),
            ("Tx Frame Rate", Field::TxRate),
            ("Rx Frame Rate", Field::RxRate),
            ("Loss %", Field::Loss),
        ])
    }
}

impl ColumnMap {
    /// Captions of the per-flow-group statistics view, where one traffic
    /// item splits into several VLAN-tagged flow groups.
    pub fn flow_statistics() -> Self {
        Self::new([
            ("Traffic Item", Field::Stream),
            ("VLAN:VLAN-ID", Field::Vlan),
            ("Source/Dest Port Pair", Field::PortPair),
            ("Tx Frames", Field::TxFrames),
            ("Rx Frames", Field::RxFrames),
            ("Frames Delta", Field::FramesDelta),
            ("Tx Frame Rate", Field::TxRate),
            ("Rx Frame Rate", Field::RxRate),
            ("Loss %", Field::Loss),
        ])
    }

    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, Field)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(caption, field)| ColumnMapping {
                    caption: caption.to_string(),
                    field,
                })
                .collect(),
        }
    }

    /// Locate each mapped field among `captions`.
    fn resolve(&self, captions: &[String]) -> Result<HashMap<Field, usize>> {
        let mut positions = HashMap::new();
        for mapping in &self.entries {
            match captions.iter().position(|c| c.trim() == mapping.caption) {
                Some(idx) => {
                    positions.insert(mapping.field, idx);
                }
                None if mapping.field.required() => {
                    return Err(ControlError::protocol(
                        "read statistics view",
                        format!("column '{}' is missing from the view", mapping.caption),
                    ));
                }
                None => debug!(caption = %mapping.caption, "optional column absent"),
            }
        }
        for field in [
            Field::PortPair,
            Field::Stream,
            Field::FramesDelta,
            Field::TxRate,
            Field::RxRate,
            Field::Loss,
        ] {
            if !positions.contains_key(&field) {
                return Err(ControlError::protocol(
                    "read statistics view",
                    format!("no column mapped to {:?}", field),
                ));
            }
        }
        Ok(positions)
    }
}

/// Raw view as returned by the controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsView {
    pub column_captions: Vec<String>,
    #[serde(default)]
    pub row_values: Vec<Vec<Value>>,
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl StatsView {
    pub fn to_records(&self, columns: &ColumnMap) -> Result<Vec<StreamRecord>> {
        let positions = columns.resolve(&self.column_captions)?;

        self.row_values
            .iter()
            .enumerate()
            .map(|(row_idx, row)| {
                let text = |field: Field| -> Option<String> {
                    positions.get(&field).map(|&i| row.get(i).map(cell_text).unwrap_or_default())
                };
                let number = |field: Field| -> Result<f64> {
                    let raw = text(field).unwrap_or_default();
                    if raw.is_empty() {
                        return Ok(0.0);
                    }
                    raw.parse::<f64>().map_err(|_| {
                        ControlError::protocol(
                            "read statistics view",
                            format!("row {}: {:?} value '{}' is not numeric", row_idx + 1, field, raw),
                        )
                    })
                };

                Ok(StreamRecord::new(
                    text(Field::Stream).unwrap_or_default(),
                    text(Field::PortPair).unwrap_or_default(),
                )
                .with_rates(number(Field::TxRate)?, number(Field::RxRate)?)
                .with_frames(
                    number(Field::TxFrames)?,
                    number(Field::RxFrames)?,
                    number(Field::FramesDelta)?,
                )
                .with_loss(parse_lenient(&text(Field::Loss).unwrap_or_default()))
                .with_vlan(text(Field::Vlan).unwrap_or_default()))
            })
            .collect()
    }
}

/// Anything that can produce a fresh statistics snapshot on demand.
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn snapshot(&self) -> Result<Profile>;
}

/// Live source reading a statistics view through a borrowed session.
pub struct ViewSource<'s> {
    session: &'s Session,
    path: String,
    columns: ColumnMap,
}

impl<'s> ViewSource<'s> {
    pub fn new(session: &'s Session, path: impl Into<String>, columns: ColumnMap) -> Self {
        Self {
            session,
            path: path.into(),
            columns,
        }
    }
}

#[async_trait]
impl<'s> StatsSource for ViewSource<'s> {
    async fn snapshot(&self) -> Result<Profile> {
        let url = self.session.resolve(&self.path)?;
        let reply = self.session.transport().get(&url).await?;
        if !reply.is_success() {
            return Err(ControlError::Transport {
                url: reply.url,
                detail: format!("statistics view answered {}", reply.status),
            });
        }
        let view: StatsView = reply.json()?;
        let profile = Profile::capture(view.to_records(&self.columns)?);
        info!(streams = profile.records().len(), "statistics snapshot captured\n{}", profile);
        Ok(profile)
    }
}
