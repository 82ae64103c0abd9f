//! In-process event log.
//!
//! Same semantics as the Postgres log, held in memory behind a single
//! mutex. Used by tests and by `memory://` deployments. Offers hooks to
//! force-drop attached subscriptions and to fail upcoming attaches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt as _, TryFutureExt as _};
use tokio::sync::{Mutex, watch};

use super::{
    AppendResult, Delivery, EventLog, NackAction, NewRecord, ParkedEvent, RecordStream,
    RecordedEvent, Subscription,
};
use crate::error::{Error, Result};

/// In-memory [`EventLog`].
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    /// Bumped on every change a waiting subscription may care about.
    changes: watch::Sender<u64>,
}

#[derive(Default)]
struct State {
    /// Index `i` holds position `i + 1`.
    records: Vec<RecordedEvent>,
    streams: HashMap<String, Vec<usize>>,
    groups: HashMap<String, Group>,
    /// Handles attached under an older generation are dropped.
    generation: u64,
    attach_failures: u32,
    closed: bool,
}

#[derive(Default)]
struct Group {
    position: u64,
    parked: BTreeMap<u64, Parked>,
}

struct Parked {
    reason: String,
    parked_at: DateTime<Utc>,
    replaying: bool,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
            }),
        }
    }

    /// Drop every attached subscription handle. Their next `recv` yields
    /// [`Delivery::Dropped`].
    pub async fn drop_subscriptions(&self) {
        self.inner.state.lock().await.generation += 1;
        self.inner.notify();
    }

    /// Make the next `count` attach attempts fail.
    pub async fn fail_attaches(&self, count: u32) {
        self.inner.state.lock().await.attach_failures = count;
    }

    /// Total number of records across all streams.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Inner {
    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, stream: &str, record: NewRecord) -> Result<AppendResult> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        if state.records.iter().any(|r| r.event_id == record.event_id) {
            return Err(Error::Other(format!(
                "duplicate event id {}",
                record.event_id
            )));
        }

        let index = state.records.len();
        let revision = state.streams.get(stream).map_or(0, |ix| ix.len()) as u64;
        let position = index as u64 + 1;
        state.records.push(RecordedEvent {
            event_id: record.event_id,
            stream: stream.to_string(),
            revision,
            position,
            event_type: record.event_type,
            content_type: record.content_type,
            data: record.data,
            metadata: record.metadata,
            created_at: Utc::now(),
        });
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .push(index);
        drop(state);

        self.inner.notify();
        Ok(AppendResult { position, revision })
    }

    fn read_stream<'a>(&'a self, stream: &'a str, from: u64, max_count: u64) -> RecordStream<'a> {
        async move {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(Error::Closed);
            }
            let records: Vec<RecordedEvent> = state
                .streams
                .get(stream)
                .map(|indexes| {
                    indexes
                        .iter()
                        .skip(from as usize)
                        .take(max_count as usize)
                        .map(|&i| state.records[i].clone())
                        .collect()
                })
                .unwrap_or_default();
            Ok(futures::stream::iter(records.into_iter().map(Ok)))
        }
        .try_flatten_stream()
        .boxed()
    }

    fn read_all(&self, after: u64, max_count: u64) -> RecordStream<'_> {
        async move {
            let state = self.inner.state.lock().await;
            if state.closed {
                return Err(Error::Closed);
            }
            let records: Vec<RecordedEvent> = state
                .records
                .iter()
                .skip(after as usize)
                .take(max_count as usize)
                .cloned()
                .collect();
            Ok(futures::stream::iter(records.into_iter().map(Ok)))
        }
        .try_flatten_stream()
        .boxed()
    }

    async fn create_subscription(&self, group: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.groups.contains_key(group) {
            return Err(Error::SubscriptionExists(group.to_string()));
        }
        state.groups.insert(group.to_string(), Group::default());
        Ok(())
    }

    async fn attach_subscription(&self, group: &str) -> Result<Box<dyn Subscription>> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        if state.attach_failures > 0 {
            state.attach_failures -= 1;
            return Err(Error::Unavailable("attach refused".to_string()));
        }
        let position = state
            .groups
            .get(group)
            .map(|g| g.position)
            .ok_or_else(|| Error::SubscriptionNotFound(group.to_string()))?;

        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            generation: state.generation,
            position,
            pending_retry: None,
            changes: self.inner.changes.subscribe(),
        }))
    }

    async fn subscription_position(&self, group: &str) -> Result<u64> {
        let state = self.inner.state.lock().await;
        state
            .groups
            .get(group)
            .map(|g| g.position)
            .ok_or_else(|| Error::SubscriptionNotFound(group.to_string()))
    }

    async fn parked_events(&self, group: &str) -> Result<Vec<ParkedEvent>> {
        let state = self.inner.state.lock().await;
        let entry = state
            .groups
            .get(group)
            .ok_or_else(|| Error::SubscriptionNotFound(group.to_string()))?;
        Ok(entry
            .parked
            .iter()
            .map(|(&position, parked)| ParkedEvent {
                group: group.to_string(),
                record: state.records[position as usize - 1].clone(),
                reason: parked.reason.clone(),
                parked_at: parked.parked_at,
                replaying: parked.replaying,
            })
            .collect())
    }

    async fn replay_parked(&self, group: &str) -> Result<usize> {
        let mut state = self.inner.state.lock().await;
        let entry = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::SubscriptionNotFound(group.to_string()))?;
        let mut queued = 0;
        for parked in entry.parked.values_mut().filter(|p| !p.replaying) {
            parked.replaying = true;
            queued += 1;
        }
        drop(state);

        self.inner.notify();
        Ok(queued)
    }

    async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.closed {
            state.closed = true;
            state.generation += 1;
            drop(state);
            self.inner.notify();
        }
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
    group: String,
    generation: u64,
    /// Last settled position.
    position: u64,
    pending_retry: Option<(RecordedEvent, u32)>,
    changes: watch::Receiver<u64>,
}

impl MemorySubscription {
    /// Next delivery if one is ready.
    fn poll_state(&self, state: &State) -> Option<Delivery> {
        if state.closed {
            return Some(Delivery::Dropped {
                reason: "event log closed".to_string(),
            });
        }
        if state.generation != self.generation {
            return Some(Delivery::Dropped {
                reason: "subscription dropped by server".to_string(),
            });
        }
        if let Some((record, retry_count)) = &self.pending_retry {
            return Some(Delivery::Event {
                record: record.clone(),
                retry_count: *retry_count,
            });
        }
        let Some(group) = state.groups.get(&self.group) else {
            return Some(Delivery::Dropped {
                reason: format!("subscription group {} removed", self.group),
            });
        };
        if let Some((&position, _)) = group.parked.iter().find(|(_, p)| p.replaying) {
            return Some(Delivery::Event {
                record: state.records[position as usize - 1].clone(),
                retry_count: 0,
            });
        }
        state
            .records
            .get(self.position as usize)
            .map(|record| Delivery::Event {
                record: record.clone(),
                retry_count: 0,
            })
    }

    fn check_live(&self, state: &State) -> Result<()> {
        if state.closed {
            return Err(Error::Closed);
        }
        if state.generation != self.generation {
            return Err(Error::SubscriptionDropped(self.group.clone()));
        }
        Ok(())
    }

    /// Advance past `record` and clear any retry or replay bookkeeping.
    fn settle(&mut self, state: &mut State, record: &RecordedEvent) -> Result<()> {
        if self
            .pending_retry
            .as_ref()
            .is_some_and(|(r, _)| r.event_id == record.event_id)
        {
            self.pending_retry = None;
        }
        let group = state
            .groups
            .get_mut(&self.group)
            .ok_or_else(|| Error::SubscriptionNotFound(self.group.clone()))?;
        if group
            .parked
            .get(&record.position)
            .is_some_and(|p| p.replaying)
        {
            group.parked.remove(&record.position);
        }
        if record.position > self.position {
            self.position = record.position;
            group.position = group.position.max(record.position);
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Delivery {
        loop {
            self.changes.borrow_and_update();
            {
                let state = self.inner.state.lock().await;
                if let Some(delivery) = self.poll_state(&state) {
                    return delivery;
                }
            }
            if self.changes.changed().await.is_err() {
                return Delivery::Dropped {
                    reason: "event log gone".to_string(),
                };
            }
        }
    }

    async fn ack(&mut self, record: &RecordedEvent) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock().await;
        self.check_live(&state)?;
        self.settle(&mut state, record)
    }

    async fn nack(
        &mut self,
        record: &RecordedEvent,
        action: NackAction,
        reason: &str,
    ) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock().await;
        self.check_live(&state)?;
        match action {
            NackAction::Retry => {
                let retry_count = match &self.pending_retry {
                    Some((pending, count)) if pending.event_id == record.event_id => count + 1,
                    _ => 1,
                };
                self.pending_retry = Some((record.clone(), retry_count));
                Ok(())
            }
            NackAction::Park => {
                self.settle(&mut state, record)?;
                if let Some(group) = state.groups.get_mut(&self.group) {
                    group.parked.insert(
                        record.position,
                        Parked {
                            reason: reason.to_string(),
                            parked_at: Utc::now(),
                            replaying: false,
                        },
                    );
                }
                Ok(())
            }
            NackAction::Skip => self.settle(&mut state, record),
        }
    }
}
