// ── Change fan-out ──
//
// Delivers `EntityChange` notifications to subscribers in registration
// order through bounded per-subscriber queues. Delivery uses `try_send`
// so a slow subscriber can never stall the mutating context; its
// overflowing changes are dropped with a warning while every other
// subscriber keeps receiving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

use crate::model::{Address, EntityChange};

/// Queue depth per subscriber.
pub(crate) const SUBSCRIBER_QUEUE_CAPACITY: usize = 128;

/// Opaque handle returned by `subscribe`; pass it back to
/// `unsubscribe` to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscriber {
    handle: SubscriptionHandle,
    /// `None` receives every change; `Some` only that address.
    filter: Option<Address>,
    tx: mpsc::Sender<Arc<EntityChange>>,
}

#[derive(Default)]
pub(crate) struct ChangeFanout {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl ChangeFanout {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(
        &self,
        filter: Option<Address>,
    ) -> (SubscriptionHandle, mpsc::Receiver<Arc<EntityChange>>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscriber { handle, filter, tx });
        (handle, rx)
    }

    /// Detach a subscriber. Unknown handles are ignored.
    pub(crate) fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.lock().retain(|s| s.handle != handle);
    }

    /// Deliver one change to every matching subscriber, in registration
    /// order. Closed receivers are pruned as a side effect.
    pub(crate) fn publish(&self, change: &Arc<EntityChange>) {
        self.lock().retain(|subscriber| {
            if let Some(filter) = &subscriber.filter {
                if *filter != change.address {
                    return true;
                }
            }
            match subscriber.tx.try_send(Arc::clone(change)) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        address = %change.address,
                        "subscriber queue full, dropping change notification"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
