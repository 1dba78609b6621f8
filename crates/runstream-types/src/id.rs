//! Run and event identifiers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Identity of a single run.
///
/// Stable for the run's whole lifetime and used as the key in every
/// per-run structure (registry entry, log, broker channel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generates a fresh random run identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned event identifier.
///
/// Encodes the append time in milliseconds plus a sequence within that
/// millisecond, so ordering stays total under bursts. Rendered on the wire
/// as `"<millis>-<seq>"`, which clients echo back verbatim as a reconnect
/// token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventId {
    /// Coarse append timestamp (Unix milliseconds).
    pub millis: u64,
    /// Position within `millis`, starting at 0.
    pub seq: u64,
}

impl EventId {
    /// The smallest possible identifier. Every real event sorts after it.
    pub const MIN: EventId = EventId { millis: 0, seq: 0 };

    /// The largest possible identifier.
    pub const MAX: EventId = EventId {
        millis: i64::MAX as u64,
        seq: i64::MAX as u64,
    };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Returns the identifier that must follow `self` when the store clock
    /// reads `now_millis`.
    ///
    /// A clock that has not advanced (or went backwards) keeps the current
    /// millisecond and bumps the sequence.
    pub fn successor(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl std::str::FromStr for EventId {
    type Err = ParseEventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseEventIdError(s.to_string()))?;
        // The store keeps both parts in signed 64-bit columns, so larger
        // values can never name a stored event.
        let part = |value: &str| -> Result<u64, ParseEventIdError> {
            value
                .parse::<u64>()
                .ok()
                .filter(|n| *n <= Self::MAX.millis)
                .ok_or_else(|| ParseEventIdError(s.to_string()))
        };
        Ok(Self {
            millis: part(millis)?,
            seq: part(seq)?,
        })
    }
}

impl TryFrom<String> for EventId {
    type Error = ParseEventIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventId> for String {
    fn from(value: EventId) -> Self {
        value.to_string()
    }
}

/// Error returned when an event identifier string is malformed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid event id: {0}")]
pub struct ParseEventIdError(pub String);
