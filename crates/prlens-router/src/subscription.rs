//! Consumer half of a router slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use prlens_core::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::router::Inner;

/// One session's view of the router: a bounded queue plus a cancellation
/// handle.
///
/// Dropping it releases the router slot, unless a newer subscription for
/// the same session has already replaced it.
pub struct Subscription {
    id: u64,
    session_id: String,
    rx: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
    router: Weak<Inner>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        session_id: String,
        rx: mpsc::Receiver<Event>,
        cancel: CancellationToken,
        dropped: Arc<AtomicU64>,
        router: Weak<Inner>,
    ) -> Self {
        Self {
            id,
            session_id,
            rx,
            cancel,
            dropped,
            router,
        }
    }

    /// Router-assigned id, unique per router.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session this subscription receives events for.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, or `None` once the subscription is retired.
    ///
    /// Retirement wins over buffered events, so a drain loop stops within
    /// one poll of an unsubscribe, replacement or shutdown.
    pub async fn recv(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            self.rx.close();
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                self.rx.close();
                None
            }
            event = self.rx.recv() => event,
        }
    }

    /// Non-blocking receive. `None` when empty or retired.
    pub fn try_recv(&mut self) -> Option<Event> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Events dropped because this queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the subscription has been retired.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the subscription is retired.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Retire this subscription and release its router slot.
    pub fn close(&self) {
        self.release();
        self.cancel.cancel();
    }

    fn release(&self) {
        if let Some(router) = self.router.upgrade() {
            let _ = router.release(&self.session_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}
