//! Operator-visible consistency alarms.

use serde::{Deserialize, Serialize};

use crate::error::ReactorError;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// No common ancestor inside the lookback window; the reconciler halted.
    ReorgDepthExceeded,
    /// A reorg orphaned events that were already confirmed.
    FinalityViolated,
    /// A revoked event had already been applied to a projection.
    ProjectionDiverged,
}

impl AlarmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReorgDepthExceeded => "reorg_depth_exceeded",
            Self::FinalityViolated => "finality_violated",
            Self::ProjectionDiverged => "projection_diverged",
        }
    }
}

impl std::fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlarmKind {
    type Err = ReactorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reorg_depth_exceeded" => Ok(Self::ReorgDepthExceeded),
            "finality_violated" => Ok(Self::FinalityViolated),
            "projection_diverged" => Ok(Self::ProjectionDiverged),
            other => Err(ReactorError::Decode(format!("unknown alarm kind '{other}'"))),
        }
    }
}

/// An alarm about to be recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlarm {
    pub kind: AlarmKind,
    pub message: String,
    /// The event the alarm is about; `(kind, sequence_id)` alarms are raised once.
    pub sequence_id: Option<u64>,
    pub raised_at: i64,
}

impl NewAlarm {
    pub fn new(kind: AlarmKind, message: impl Into<String>, raised_at: i64) -> Self {
        Self {
            kind,
            message: message.into(),
            sequence_id: None,
            raised_at,
        }
    }

    pub fn for_event(mut self, sequence_id: u64) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }
}

/// A recorded alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub alarm_id: u64,
    pub kind: AlarmKind,
    pub message: String,
    pub sequence_id: Option<u64>,
    pub raised_at: i64,
}

impl Alarm {
    pub fn from_new(alarm_id: u64, new: NewAlarm) -> Self {
        Self {
            alarm_id,
            kind: new.kind,
            message: new.message,
            sequence_id: new.sequence_id,
            raised_at: new.raised_at,
        }
    }
}
