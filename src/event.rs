use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Default topic the validator publishes on and the fixer consumes.
pub const DEFAULT_TOPIC: &str = "migrator_inconsistent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Row exists in base, absent in target.
    TargetMissing,
    /// Row exists in target, absent in base.
    BaseMissing,
    /// Row exists in both with different values.
    NotEqual,
}

/// Which scan produced an event. Labelling only; repair never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    BaseToTarget,
    TargetToBase,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TargetMissing => "target_missing",
            EventKind::BaseMissing => "base_missing",
            EventKind::NotEqual => "not_equal",
        }
    }
}

impl FromStr for EventKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "target_missing" => Ok(EventKind::TargetMissing),
            "base_missing" => Ok(EventKind::BaseMissing),
            "not_equal" => Ok(EventKind::NotEqual),
            other => Err(
                AppError::new(AppError::UNKNOWN_EVENT_KIND, "unknown event type")
                    .with_context("kind", other.to_string()),
            ),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::BaseToTarget => "base_to_target",
            Direction::TargetToBase => "target_to_base",
        }
    }
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base_to_target" => Ok(Direction::BaseToTarget),
            "target_to_base" => Ok(Direction::TargetToBase),
            other => Err(
                AppError::new(AppError::UNKNOWN_DIRECTION, "unknown scan direction")
                    .with_context("direction", other.to_string()),
            ),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected divergence between base and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InconsistentEvent {
    pub id: i64,
    pub kind: EventKind,
    pub direction: Direction,
}

/// On-the-wire shape. Kind and direction stay plain strings here so an
/// unrecognised value surfaces as a typed error instead of a generic
/// deserialisation failure.
#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    id: i64,
    kind: String,
    direction: String,
}

impl InconsistentEvent {
    pub fn new(id: i64, kind: EventKind, direction: Direction) -> Self {
        Self {
            id,
            kind,
            direction,
        }
    }

    pub fn encode(&self) -> AppResult<Vec<u8>> {
        let wire = WireEvent {
            id: self.id,
            kind: self.kind.as_str().to_string(),
            direction: self.direction.as_str().to_string(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(payload: &[u8]) -> AppResult<Self> {
        let wire: WireEvent = serde_json::from_slice(payload).map_err(|err| {
            AppError::new(AppError::EVENT_DECODE, "malformed inconsistency event")
                .with_cause(AppError::from(err))
        })?;
        Ok(Self {
            id: wire.id,
            kind: wire.kind.parse()?,
            direction: wire.direction.parse()?,
        })
    }
}
