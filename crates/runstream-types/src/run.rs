//! Run status state machine and the cancellation signal.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
///
/// Transitions are `Pending → Running → {Completed | Failed | Cancelled}`.
/// A `Pending` run may also go straight to `Cancelled`. Terminal states
/// never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) | (Self::Pending, Self::Cancelled) => true,
            (Self::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ParseRunStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseRunStatusError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown run status string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown run status: {0}")]
pub struct ParseRunStatusError(pub String);

/// Raised into the executor at the first emission after a run was
/// cancelled.
///
/// This is the only signal that travels from the telemetry path back into
/// the executor's control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("run cancellation requested")]
pub struct CancellationRequested;
