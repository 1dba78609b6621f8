//! Range bounds for log reads.

use runstream_types::EventId;

/// One end of an inclusive range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCursor {
    /// Before the oldest retained event. Spelled `-` or `earliest`.
    Earliest,
    /// After the newest event. Spelled `+` or `latest`.
    Latest,
    /// A concrete event id.
    At(EventId),
}

impl LogCursor {
    /// Resolves the cursor to a concrete id for use as a range bound.
    pub fn resolve(self) -> EventId {
        match self {
            Self::Earliest => EventId::MIN,
            Self::Latest => EventId::MAX,
            Self::At(id) => id,
        }
    }
}

impl From<EventId> for LogCursor {
    fn from(id: EventId) -> Self {
        Self::At(id)
    }
}

impl std::fmt::Display for LogCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Earliest => f.write_str("-"),
            Self::Latest => f.write_str("+"),
            Self::At(id) => write!(f, "{id}"),
        }
    }
}

impl std::str::FromStr for LogCursor {
    type Err = ParseLogCursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "-" | "earliest" => Ok(Self::Earliest),
            "+" | "latest" => Ok(Self::Latest),
            other => other
                .parse()
                .map(Self::At)
                .map_err(|_| ParseLogCursorError(s.to_string())),
        }
    }
}

/// Error returned when a range bound is neither a sentinel nor an event id.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid log cursor: {0}")]
pub struct ParseLogCursorError(pub String);
