use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::AppError;

/// Migration phase. Governs which store receives writes first, whether the
/// other store receives them at all, and which store serves reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pattern {
    SrcOnly,
    SrcFirst,
    DstFirst,
    DstOnly,
}

/// Which of the two physical stores an operation is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    Base,
    Target,
}

impl StoreRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreRole::Base => "base",
            StoreRole::Target => "target",
        }
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Pattern {
    pub const ALL: [Pattern; 4] = [
        Pattern::SrcOnly,
        Pattern::SrcFirst,
        Pattern::DstFirst,
        Pattern::DstOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::SrcOnly => "SrcOnly",
            Pattern::SrcFirst => "SrcFirst",
            Pattern::DstFirst => "DstFirst",
            Pattern::DstOnly => "DstOnly",
        }
    }

    /// Store whose outcome decides the outcome of a write. Reads are served
    /// from here too.
    pub fn primary(&self) -> StoreRole {
        match self {
            Pattern::SrcOnly | Pattern::SrcFirst => StoreRole::Base,
            Pattern::DstFirst | Pattern::DstOnly => StoreRole::Target,
        }
    }

    /// Store that receives a best-effort copy of each write, if any.
    pub fn secondary(&self) -> Option<StoreRole> {
        match self {
            Pattern::SrcOnly | Pattern::DstOnly => None,
            Pattern::SrcFirst => Some(StoreRole::Target),
            Pattern::DstFirst => Some(StoreRole::Base),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Pattern::SrcOnly => 0,
            Pattern::SrcFirst => 1,
            Pattern::DstFirst => 2,
            Pattern::DstOnly => 3,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Pattern::SrcOnly),
            1 => Some(Pattern::SrcFirst),
            2 => Some(Pattern::DstFirst),
            3 => Some(Pattern::DstOnly),
            _ => None,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown pattern: {value}")]
pub struct PatternParseError {
    value: String,
}

impl PatternParseError {
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl From<PatternParseError> for AppError {
    fn from(error: PatternParseError) -> Self {
        AppError::unknown_pattern(error.value)
    }
}

impl FromStr for Pattern {
    type Err = PatternParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PatternParseError {
                value: s.to_string(),
            })
    }
}

/// Atomically swappable pattern shared between the control plane and every
/// in-flight write. Callers take one snapshot per operation via [`load`].
///
/// [`load`]: PatternCell::load
#[derive(Debug)]
pub struct PatternCell {
    raw: AtomicU8,
}

impl PatternCell {
    pub fn new(initial: Pattern) -> Self {
        Self {
            raw: AtomicU8::new(initial.to_u8()),
        }
    }

    pub fn load(&self) -> Result<Pattern, AppError> {
        let raw = self.raw.load(Ordering::Acquire);
        Pattern::from_u8(raw).ok_or_else(|| AppError::unknown_pattern(raw.to_string()))
    }

    /// Install `pattern` and return the one it replaced. The new pattern is in
    /// effect even when the replaced value does not decode.
    pub fn store(&self, pattern: Pattern) -> Result<Pattern, AppError> {
        let previous = self.raw.swap(pattern.to_u8(), Ordering::AcqRel);
        Pattern::from_u8(previous).ok_or_else(|| AppError::unknown_pattern(previous.to_string()))
    }

    /// Parse `name` and swap it in. A rejected name leaves the cell untouched.
    pub fn update(&self, name: &str) -> Result<Pattern, AppError> {
        let next: Pattern = name.parse()?;
        self.store(next)
    }
}

impl Default for PatternCell {
    fn default() -> Self {
        Self::new(Pattern::SrcOnly)
    }
}
