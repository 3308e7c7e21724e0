//! Session-keyed fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use prlens_core::Event;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::subscription::Subscription;

/// Errors from [`SessionRouter::subscribe`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// [`SessionRouter::shutdown`] was called.
    #[error("session router is shut down")]
    ShutDown,
}

/// Outcome of one [`SessionRouter::publish`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the event.
    pub delivered: usize,
    /// Subscribers whose queue was full.
    pub dropped: usize,
    /// Subscribers found closed and removed.
    pub closed: usize,
}

/// Router-side half of a subscription.
pub(crate) struct Slot {
    pub(crate) id: u64,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
}

pub(crate) struct Inner {
    capacity: usize,
    slots: RwLock<HashMap<String, Slot>>,
    shut_down: AtomicBool,
    next_id: AtomicU64,
}

impl Inner {
    /// Remove the slot for `session_id` if it still belongs to subscription `id`.
    pub(crate) fn release(&self, session_id: &str, id: u64) -> bool {
        let mut slots = self.slots.write();
        if slots.get(session_id).is_none_or(|slot| slot.id != id) {
            return false;
        }
        if let Some(slot) = slots.remove(session_id) {
            slot.cancel.cancel();
        }
        gauge!("router_subscriptions_active").set(slots.len() as f64);
        debug!(session_id, sub_id = id, "subscription released");
        true
    }
}

/// Fans events out to per-session subscriber queues.
///
/// Cheap to clone; clones share the same subscriber map.
#[derive(Clone)]
pub struct SessionRouter {
    inner: Arc<Inner>,
}

impl SessionRouter {
    /// Router whose subscriptions buffer at most `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                slots: RwLock::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Per-subscription queue bound.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Open the subscription for `session_id`, retiring any existing one.
    pub fn subscribe(&self, session_id: &str) -> Result<Subscription, RouterError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(RouterError::ShutDown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let cancel = CancellationToken::new();
        let dropped = Arc::new(AtomicU64::new(0));

        let mut slots = self.inner.slots.write();
        // Re-check under the lock so shutdown cannot race an insert.
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(RouterError::ShutDown);
        }
        let slot = Slot {
            id,
            tx,
            cancel: cancel.clone(),
            dropped: Arc::clone(&dropped),
        };
        if let Some(previous) = slots.insert(session_id.to_string(), slot) {
            previous.cancel.cancel();
            info!(session_id, old_sub_id = previous.id, sub_id = id, "subscription replaced");
        } else {
            debug!(session_id, sub_id = id, "subscription opened");
        }
        gauge!("router_subscriptions_active").set(slots.len() as f64);

        Ok(Subscription::new(
            id,
            session_id.to_string(),
            rx,
            cancel,
            dropped,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Deliver `event` to its session's subscription, or to every
    /// subscription for `Connected`. Never blocks.
    pub fn publish(&self, event: &Event) -> PublishReport {
        let mut report = PublishReport::default();
        let mut closed: Vec<(String, u64)> = Vec::new();
        {
            let slots = self.inner.slots.read();
            match event.session_id() {
                Some(session_id) => {
                    if let Some(slot) = slots.get(session_id) {
                        deliver(session_id, slot, event, &mut report, &mut closed);
                    }
                }
                None => {
                    for (session_id, slot) in slots.iter() {
                        deliver(session_id, slot, event, &mut report, &mut closed);
                    }
                }
            }
        }

        for (session_id, id) in &closed {
            let _ = self.inner.release(session_id, *id);
        }

        if report.delivered > 0 {
            counter!("router_events_delivered_total").increment(report.delivered as u64);
        }
        report
    }

    /// Retire the subscription for `session_id`. Returns whether one existed.
    pub fn unsubscribe(&self, session_id: &str) -> bool {
        let mut slots = self.inner.slots.write();
        let Some(slot) = slots.remove(session_id) else {
            return false;
        };
        slot.cancel.cancel();
        gauge!("router_subscriptions_active").set(slots.len() as f64);
        debug!(session_id, sub_id = slot.id, "unsubscribed");
        true
    }

    /// Retire every subscription and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        let drained: Vec<Slot> = {
            let mut slots = self.inner.slots.write();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &drained {
            slot.cancel.cancel();
        }
        gauge!("router_subscriptions_active").set(0.0);
        info!(released = drained.len(), "session router shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Whether `session_id` has a live subscription.
    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.inner.slots.read().contains_key(session_id)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.slots.read().len()
    }

    /// Session ids with a live subscription.
    pub fn sessions(&self) -> Vec<String> {
        self.inner.slots.read().keys().cloned().collect()
    }
}

impl Default for SessionRouter {
    fn default() -> Self {
        Self::new(crate::DEFAULT_QUEUE_CAPACITY)
    }
}

impl std::fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter")
            .field("capacity", &self.inner.capacity)
            .field("subscriptions", &self.subscription_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn deliver(
    session_id: &str,
    slot: &Slot,
    event: &Event,
    report: &mut PublishReport,
    closed: &mut Vec<(String, u64)>,
) {
    match slot.tx.try_send(event.clone()) {
        Ok(()) => report.delivered += 1,
        Err(TrySendError::Full(_)) => {
            report.dropped += 1;
            let total = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            counter!("router_events_dropped_total").increment(1);
            warn!(
                session_id,
                sub_id = slot.id,
                event_type = event.event_type(),
                total_drops = total,
                "subscriber queue full, event dropped"
            );
        }
        Err(TrySendError::Closed(_)) => {
            report.closed += 1;
            closed.push((session_id.to_string(), slot.id));
        }
    }
}
