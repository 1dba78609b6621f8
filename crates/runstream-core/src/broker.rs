//! Live fan-out of run events to attached subscribers.
//!
//! Each open run has a channel holding one bounded `mpsc` sender per
//! subscriber. Publishing never blocks: a subscriber whose buffer is full
//! is disconnected on the spot and sees [`RunError::SubscriberOverflow`]
//! once it has drained what it already received.

use runstream_log::EventLog;
use runstream_types::{Event, EventId, RunId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::error::RunError;
use crate::subscription::{LiveFeed, Subscription};

/// Tuning for live delivery.
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    /// Idle interval after which a subscriber is handed a heartbeat.
    pub heartbeat: Duration,
    /// Capacity of each subscriber's live buffer.
    pub subscriber_buffer: usize,
    /// Page size for catch-up reads from the log.
    pub catch_up_batch: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            subscriber_buffer: 256,
            catch_up_batch: 500,
        }
    }
}

/// Messages on a subscriber's live channel.
#[derive(Debug)]
pub(crate) enum LiveMessage {
    Event(Arc<Event>),
    /// The run finished and no further events will be published.
    Terminal,
}

struct SubscriberSlot {
    tx: mpsc::Sender<LiveMessage>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct RunChannel {
    subscribers: HashMap<Uuid, SubscriberSlot>,
    closed: bool,
}

/// Per-run registry of live subscribers.
pub struct StreamBroker {
    log: Arc<dyn EventLog>,
    settings: BrokerSettings,
    channels: RwLock<HashMap<RunId, Arc<Mutex<RunChannel>>>>,
}

impl StreamBroker {
    pub fn new(log: Arc<dyn EventLog>, settings: BrokerSettings) -> Self {
        Self {
            log,
            settings,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> BrokerSettings {
        self.settings
    }

    pub(crate) fn log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.log)
    }

    /// Opens the live channel for a run. Returns `false` if it was already
    /// open.
    pub fn open(&self, run_id: RunId) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels.contains_key(&run_id) {
            return false;
        }
        channels.insert(run_id, Arc::new(Mutex::new(RunChannel::default())));
        true
    }

    pub fn is_open(&self, run_id: &RunId) -> bool {
        self.channel(run_id).is_some()
    }

    /// Number of subscribers currently attached to a run.
    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.channel(run_id)
            .map(|channel| {
                channel
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscribers
                    .len()
            })
            .unwrap_or(0)
    }

    fn channel(&self, run_id: &RunId) -> Option<Arc<Mutex<RunChannel>>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    /// Delivers one event to every subscriber of `run_id`.
    ///
    /// Returns the number of subscribers the event was handed to.
    pub fn publish(&self, run_id: &RunId, event: &Event) -> usize {
        if event.run_id != *run_id {
            tracing::warn!(
                run_id = %run_id,
                event_run_id = %event.run_id,
                "refusing to publish event into another run's channel"
            );
            return 0;
        }
        let Some(channel) = self.channel(run_id) else {
            return 0;
        };

        let event = Arc::new(event.clone());
        let mut channel = channel.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        channel.subscribers.retain(|subscriber_id, slot| {
            match slot.tx.try_send(LiveMessage::Event(Arc::clone(&event))) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    slot.overflowed.store(true, Ordering::Release);
                    tracing::warn!(
                        run_id = %run_id,
                        subscriber_id = %subscriber_id,
                        event_id = %event.id,
                        "disconnecting subscriber: live buffer full (slow consumer)"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    /// Ends live delivery for a run. Attached subscribers drain what they
    /// have and then observe the stream closing.
    pub fn close(&self, run_id: &RunId) {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        let Some(channel) = removed else {
            return;
        };

        let mut channel = channel.lock().unwrap_or_else(PoisonError::into_inner);
        channel.closed = true;
        let count = channel.subscribers.len();
        for (_, slot) in channel.subscribers.drain() {
            // A full buffer still closes cleanly once the sender is dropped.
            let _ = slot.tx.try_send(LiveMessage::Terminal);
        }
        tracing::debug!(run_id = %run_id, subscribers = count, "closed live channel");
    }

    /// Removes one subscriber. Safe to call for subscribers that were
    /// already dropped by `publish` or `close`.
    pub fn detach(&self, run_id: &RunId, subscriber_id: Uuid) {
        if let Some(channel) = self.channel(run_id) {
            channel
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .remove(&subscriber_id);
        }
    }

    /// Attaches a subscriber to a run.
    ///
    /// The live slot is registered before the log is read, so an event
    /// appended while catch-up is in progress is seen at least once and
    /// de-duplicated by id. `last_seen` of `None` replays the whole
    /// retained history.
    ///
    /// A run with no open channel is served from the log alone and closes
    /// after the last stored event.
    ///
    /// # Errors
    ///
    /// For a run with no open channel, returns `NotFound` or `Expired` if
    /// its log cannot be read, and `StoreUnavailable` if the store fails.
    pub async fn attach(
        self: &Arc<Self>,
        run_id: RunId,
        last_seen: Option<EventId>,
    ) -> Result<Subscription, RunError> {
        let subscriber_id = Uuid::new_v4();
        let live = self.channel(&run_id).and_then(|channel| {
            let mut channel = channel.lock().unwrap_or_else(PoisonError::into_inner);
            if channel.closed {
                return None;
            }
            let (tx, rx) = mpsc::channel(self.settings.subscriber_buffer.max(1));
            let overflowed = Arc::new(AtomicBool::new(false));
            channel.subscribers.insert(
                subscriber_id,
                SubscriberSlot {
                    tx,
                    overflowed: Arc::clone(&overflowed),
                },
            );
            Some(LiveFeed { rx, overflowed })
        });

        if live.is_none() {
            // Nothing live to attach to; make sure there is history to
            // replay before handing out a subscription.
            let log = self.log();
            let probe_run = run_id.clone();
            tokio::task::spawn_blocking(move || {
                log.range_after(&probe_run, EventId::MIN, Some(1))
            })
            .await
            .map_err(|e| RunError::StoreUnavailable(format!("log probe task failed: {e}")))??;
        }

        tracing::debug!(
            run_id = %run_id,
            subscriber_id = %subscriber_id,
            last_seen = ?last_seen.map(|id| id.to_string()),
            live = live.is_some(),
            "subscriber attached"
        );

        Ok(Subscription::new(
            Arc::clone(self),
            run_id,
            subscriber_id,
            last_seen,
            live,
        ))
    }
}
