//! Shared types for the runstream workspace.
//!
//! This crate defines the identity and record types that flow between the
//! event log, the stream broker, and the run coordinator: run identifiers,
//! store-assigned event identifiers, the event record itself, and the run
//! status state machine.
//!
//! No crate in the workspace depends on anything *except* `runstream-types`
//! for cross-cutting type definitions.

mod event;
mod id;
mod run;

pub use event::{
    Category, Event, EventDraft, EventSource, ParseCategoryError, ParseProducerTypeError,
    ProducerType,
};
pub use id::{EventId, ParseEventIdError, RunId};
pub use run::{CancellationRequested, ParseRunStatusError, RunStatus};

/// Well-known `action` strings for [`Category::Lifecycle`] events.
pub mod lifecycle {
    /// The coordinator handed the run to its executor.
    pub const STARTED: &str = "started";
    /// The executor returned a result.
    pub const COMPLETED: &str = "completed";
    /// The executor returned an error or panicked.
    pub const FAILED: &str = "failed";
    /// The run unwound after a cancellation request.
    pub const CANCELLED: &str = "cancelled";
}
