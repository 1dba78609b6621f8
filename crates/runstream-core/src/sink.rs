//! The per-run sink that writes every event to the log and then to the
//! live broker.

use runstream_log::EventLog;
use runstream_types::{Event, EventDraft, RunId};
use std::sync::{Arc, Mutex, PoisonError};

use crate::broker::StreamBroker;
use crate::registry::EventSink;

struct SinkState {
    next_sequence: u64,
    sealed: bool,
}

/// Dual-write sink for one run.
///
/// Sequence assignment, the log append and the broker publish all happen
/// under one per-run lock, so live order always matches log order. The lock
/// is never shared between runs.
pub(crate) struct RunSink {
    run_id: RunId,
    log: Arc<dyn EventLog>,
    broker: Arc<StreamBroker>,
    state: Mutex<SinkState>,
}

impl RunSink {
    pub(crate) fn new(run_id: RunId, log: Arc<dyn EventLog>, broker: Arc<StreamBroker>) -> Self {
        Self {
            run_id,
            log,
            broker,
            state: Mutex::new(SinkState {
                next_sequence: 1,
                sealed: false,
            }),
        }
    }

    /// Writes the run's terminal event and refuses all later emissions.
    ///
    /// Returns `None` if the sink was already sealed or the write failed.
    pub(crate) fn seal_with(&self, draft: EventDraft) -> Option<Event> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sealed {
            return None;
        }
        state.sealed = true;
        self.write(&mut state, &draft)
    }

    fn write(&self, state: &mut SinkState, draft: &EventDraft) -> Option<Event> {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let timestamp_millis = chrono::Utc::now().timestamp_millis();

        match self.log.append(&self.run_id, sequence, timestamp_millis, draft) {
            Ok(event) => {
                self.broker.publish(&self.run_id, &event);
                Some(event)
            }
            Err(e) => {
                // The sequence number stays consumed so the gap is visible.
                tracing::warn!(
                    run_id = %self.run_id,
                    sequence,
                    action = %draft.action,
                    error = %e,
                    "failed to append event, dropping"
                );
                None
            }
        }
    }
}

impl EventSink for RunSink {
    fn emit(&self, draft: EventDraft) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sealed {
            tracing::debug!(
                run_id = %self.run_id,
                action = %draft.action,
                "run already finished, dropping late event"
            );
            return;
        }
        self.write(&mut state, &draft);
    }
}
