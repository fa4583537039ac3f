use crate::command::EntityRef;
use crate::error::SynqError;
use crate::transport::CanonicalEntityState;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Resolution of one chained operation, cheap to clone so every dependent
/// can observe it through the shared tail future.
pub type ChainOutcome = Result<Arc<CanonicalEntityState>, Arc<SynqError>>;

type SharedTail = Shared<BoxFuture<'static, ChainOutcome>>;

struct TailEntry {
    generation: u64,
    tail: SharedTail,
    /// Pending command currently at the tail, once known. A later submit
    /// that chains onto this entry captures the command as predecessor,
    /// which blocks its cancellation.
    command_id: Option<u64>,
}

struct ChainInner {
    tails: Mutex<HashMap<EntityRef, TailEntry>>,
    captured: Mutex<HashSet<u64>>,
    next_generation: AtomicU64,
}

/// Binds a freshly appended command to the chain entry that produced it,
/// so dependency tracking survives until the command resolves.
pub struct ChainSlot {
    inner: Arc<ChainInner>,
    key: EntityRef,
    generation: u64,
}

impl ChainSlot {
    pub fn bind_command(&self, command_id: u64) {
        let mut tails = self.inner.tails.lock();
        if let Some(entry) = tails.get_mut(&self.key)
            && entry.generation == self.generation
        {
            entry.command_id = Some(command_id);
        }
    }
}

/// Per-entity chain forcing operations on one logical entity to execute in
/// submission order while unrelated entities proceed concurrently.
///
/// Each entity key maps to the shared future of its last
/// submitted-but-unresolved operation. A new submission runs after that
/// tail resolves, success or failure alike (non-cancelling chain), and its
/// factory receives the prior outcome so it can snapshot entity state at
/// the correct causal point rather than at submission time.
#[derive(Clone)]
pub struct EntityChains {
    inner: Arc<ChainInner>,
}

impl Default for EntityChains {
    fn default() -> Self {
        Self {
            inner: Arc::new(ChainInner {
                tails: Mutex::new(HashMap::new()),
                captured: Mutex::new(HashSet::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }
}

impl EntityChains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an operation behind the entity's current tail and makes its
    /// completion the new tail.
    pub fn submit<F>(&self, key: EntityRef, factory: F) -> SharedTail
    where
        F: FnOnce(Option<ChainOutcome>, ChainSlot) -> BoxFuture<'static, ChainOutcome>
            + Send
            + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let slot = ChainSlot {
            inner: Arc::clone(&inner),
            key: key.clone(),
            generation,
        };

        let mut tails = self.inner.tails.lock();
        let prior = tails.get(&key).map(|entry| {
            if let Some(id) = entry.command_id {
                inner.captured.lock().insert(id);
            }
            entry.tail.clone()
        });

        let gc_inner = Arc::clone(&inner);
        let gc_key = key.clone();
        let fut = async move {
            let prior_outcome = match prior {
                Some(tail) => Some(tail.await),
                None => None,
            };
            let outcome = factory(prior_outcome, slot).await;
            remove_if_current(&gc_inner, &gc_key, generation);
            outcome
        }
        .boxed()
        .shared();

        tails.insert(
            key,
            TailEntry {
                generation,
                tail: fut.clone(),
                command_id: None,
            },
        );
        fut
    }

    /// Installs the completion future of a recovered command as the
    /// entity's tail, so post-restart submissions chain behind the work
    /// that was already queued before the crash. Called in ascending
    /// queue order; every superseded tail command gains a dependent.
    pub fn preload(
        &self,
        key: EntityRef,
        command_id: u64,
        completion: BoxFuture<'static, ChainOutcome>,
    ) -> SharedTail {
        let inner = Arc::clone(&self.inner);
        let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);

        let mut tails = self.inner.tails.lock();
        if let Some(previous) = tails.get(&key)
            && let Some(prev_id) = previous.command_id
        {
            inner.captured.lock().insert(prev_id);
        }

        let gc_inner = Arc::clone(&inner);
        let gc_key = key.clone();
        let fut = async move {
            let outcome = completion.await;
            remove_if_current(&gc_inner, &gc_key, generation);
            outcome
        }
        .boxed()
        .shared();

        tails.insert(
            key,
            TailEntry {
                generation,
                tail: fut.clone(),
                command_id: Some(command_id),
            },
        );
        fut
    }

    /// Whether a later operation has chained onto this command as its
    /// predecessor. Such a command can no longer be cancelled.
    pub fn has_dependent(&self, command_id: u64) -> bool {
        self.inner.captured.lock().contains(&command_id)
    }

    /// Drops dependency bookkeeping once a command has resolved.
    pub fn release_command(&self, command_id: u64) {
        self.inner.captured.lock().remove(&command_id);
    }

    pub fn pending_entities(&self) -> usize {
        self.inner.tails.lock().len()
    }
}

fn remove_if_current(inner: &ChainInner, key: &EntityRef, generation: u64) {
    let mut tails = inner.tails.lock();
    if tails.get(key).is_some_and(|e| e.generation == generation) {
        tails.remove(key);
    }
}
