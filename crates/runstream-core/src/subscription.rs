//! A subscriber's view of one run: catch-up from the log, then live events.

use futures_util::stream::{self, Stream};
use runstream_log::LogError;
use runstream_types::{Event, EventId, RunId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::{LiveMessage, StreamBroker};
use crate::error::RunError;

/// One item delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(Event),
    /// Nothing happened for a heartbeat interval.
    Heartbeat,
    /// The run finished (or has no live channel) and every event has been
    /// delivered.
    Closed,
}

pub(crate) struct LiveFeed {
    pub(crate) rx: mpsc::Receiver<LiveMessage>,
    pub(crate) overflowed: Arc<AtomicBool>,
}

/// An attached subscriber.
///
/// Yields stored events newer than the resume point first, then live
/// events, with strictly increasing ids and no duplicates. Dropping the
/// subscription detaches it from the broker.
pub struct Subscription {
    broker: Arc<StreamBroker>,
    run_id: RunId,
    subscriber_id: Uuid,
    cursor: EventId,
    backlog: VecDeque<Event>,
    catching_up: bool,
    live: Option<LiveFeed>,
    heartbeat: Duration,
    batch: usize,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        broker: Arc<StreamBroker>,
        run_id: RunId,
        subscriber_id: Uuid,
        last_seen: Option<EventId>,
        live: Option<LiveFeed>,
    ) -> Self {
        let settings = broker.settings();
        Self {
            broker,
            run_id,
            subscriber_id,
            cursor: last_seen.unwrap_or(EventId::MIN),
            backlog: VecDeque::new(),
            catching_up: true,
            live,
            heartbeat: settings.heartbeat,
            batch: settings.catch_up_batch.max(1),
            finished: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn id(&self) -> Uuid {
        self.subscriber_id
    }

    /// The id a client should reconnect with, if anything has been seen.
    pub fn last_event_id(&self) -> Option<EventId> {
        (self.cursor > EventId::MIN).then_some(self.cursor)
    }

    /// Waits for the next item.
    ///
    /// Returns `None` after `Closed` or an error has been yielded.
    pub async fn next(&mut self) -> Option<Result<StreamItem, RunError>> {
        if self.finished {
            return None;
        }

        loop {
            if let Some(event) = self.backlog.pop_front() {
                if let Some(item) = self.advance(event) {
                    return Some(Ok(item));
                }
                continue;
            }

            if self.catching_up {
                match self.fetch_page().await {
                    Ok(more) => {
                        self.catching_up = more;
                        continue;
                    }
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }

            let Some(live) = self.live.as_mut() else {
                self.finished = true;
                return Some(Ok(StreamItem::Closed));
            };

            match tokio::time::timeout(self.heartbeat, live.rx.recv()).await {
                Err(_) => return Some(Ok(StreamItem::Heartbeat)),
                Ok(Some(LiveMessage::Event(event))) => {
                    if let Some(item) = self.advance(Arc::unwrap_or_clone(event)) {
                        return Some(Ok(item));
                    }
                }
                Ok(Some(LiveMessage::Terminal)) => {
                    self.finished = true;
                    return Some(Ok(StreamItem::Closed));
                }
                Ok(None) => {
                    self.finished = true;
                    if live.overflowed.load(Ordering::Acquire) {
                        return Some(Err(RunError::SubscriberOverflow(self.run_id.clone())));
                    }
                    return Some(Ok(StreamItem::Closed));
                }
            }
        }
    }

    /// Consumes the subscription as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamItem, RunError>> + Send {
        stream::unfold(self, |mut subscription| async move {
            let item = subscription.next().await?;
            Some((item, subscription))
        })
    }

    /// Moves the cursor past `event`, or skips it if it was already
    /// delivered.
    fn advance(&mut self, event: Event) -> Option<StreamItem> {
        if event.id <= self.cursor {
            return None;
        }
        self.cursor = event.id;
        Some(StreamItem::Event(event))
    }

    /// Queues the next page of stored events past the cursor. Returns
    /// whether another page may follow.
    async fn fetch_page(&mut self) -> Result<bool, RunError> {
        let log = self.broker.log();
        let run_id = self.run_id.clone();
        let after = self.cursor;
        let batch = self.batch;

        let result = tokio::task::spawn_blocking(move || log.range_after(&run_id, after, Some(batch)))
            .await
            .map_err(|e| RunError::StoreUnavailable(format!("catch-up read task failed: {e}")))?;

        match result {
            Ok(events) => {
                let full = events.len() >= batch;
                let queued = self.backlog.len();
                self.backlog
                    .extend(events.into_iter().filter(|event| event.id > after));
                // A page with nothing past the cursor ends catch-up.
                Ok(full && self.backlog.len() > queued)
            }
            // A live run that has not emitted yet has no log.
            Err(LogError::NotFound(_)) if self.live.is_some() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.detach(&self.run_id, self.subscriber_id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("run_id", &self.run_id)
            .field("subscriber_id", &self.subscriber_id)
            .field("cursor", &self.cursor.to_string())
            .field("live", &self.live.is_some())
            .finish()
    }
}
