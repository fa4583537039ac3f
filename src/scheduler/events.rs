use crate::command::EntityRef;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Lifecycle notifications emitted by the retry scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    CommandEnqueued {
        id: u64,
        entity: EntityRef,
    },
    CommandSucceeded {
        id: u64,
        entity: EntityRef,
        attempts: u32,
    },
    CommandFailed {
        id: u64,
        entity: EntityRef,
        error: String,
    },
    ObjectUpdated {
        entity: EntityRef,
    },
    ObjectRemoved {
        entity: EntityRef,
    },
}

type Registry = Mutex<HashMap<u64, mpsc::UnboundedSender<QueueEvent>>>;

/// Explicit subscription registry owned by the scheduler. Subscribers get
/// bounded-lifetime handles; dropping a handle unsubscribes it, so there
/// is no ambient shared listener state.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().insert(id, tx);
        EventSubscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn publish(&self, event: QueueEvent) {
        let mut registry = self.registry.lock();
        registry.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }
}

pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<QueueEvent>,
    registry: Weak<Registry>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<QueueEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
    }
}
