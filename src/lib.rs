pub mod chain;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod lock;
pub mod pins;
pub mod query;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transport;

pub use crate::codec::{CodecRegistry, EntityCodec, JsonEntityCodec, MutationSet};
pub use crate::command::{Command, EntityId, EntityRef, OperationKind};
pub use crate::config::{DurabilityMode, RecoveryMode, SynqConfig};
pub use crate::error::{ChainError, LockError, StoreError, SynqError, TransportError};
pub use crate::query::{QueryDelegate, QueryPredicate, QuerySource};
pub use crate::scheduler::events::{EventSubscription, QueueEvent};
pub use crate::scheduler::{SchedulerMetrics, SchedulerState};
pub use crate::session::{SessionProvider, StaticSessionProvider};
pub use crate::transport::{CanonicalEntityState, Transport};

use crate::chain::EntityChains;
use crate::lock::{LockController, ProcessLock};
use crate::pins::LocalPinnedStore;
use crate::scheduler::RetryScheduler;
use crate::store::DurableStore;
use futures::FutureExt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Injected collaborators consumed through narrow interfaces.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub session: Arc<dyn SessionProvider>,
    pub query_delegate: Option<Arc<dyn QueryDelegate>>,
    pub codecs: CodecRegistry,
}

impl Collaborators {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            transport,
            session,
            query_delegate: None,
            codecs: CodecRegistry::new(),
        }
    }

    pub fn with_query_delegate(mut self, delegate: Arc<dyn QueryDelegate>) -> Self {
        self.query_delegate = Some(delegate);
        self
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }
}

/// Client-side synchronization engine: a durable FIFO queue of pending
/// mutations drained through an injected transport, per-entity submission
/// ordering, and a pinned offline snapshot cache, all sharing one storage
/// directory safely across cooperating processes.
pub struct SynqInstance {
    store: Arc<DurableStore>,
    pins: Arc<LocalPinnedStore>,
    chains: EntityChains,
    scheduler: Arc<RetryScheduler>,
    session: Arc<dyn SessionProvider>,
    codecs: CodecRegistry,
    delegate: Option<Arc<dyn QueryDelegate>>,
    shut_down: AtomicBool,
}

impl SynqInstance {
    /// Opens the storage directory, replays the recovery protocol
    /// (acquire lock, enumerate pending records in queue order, rebuild
    /// entity chains), and starts the drain worker. Corruption of the
    /// pin table or a record fails the open in strict mode; permissive
    /// mode isolates and logs.
    pub async fn open(
        config: SynqConfig,
        data_dir: &Path,
        collaborators: Collaborators,
    ) -> Result<Self, SynqError> {
        fs::create_dir_all(data_dir).map_err(StoreError::from)?;
        let lock = LockController::new(ProcessLock::new(
            data_dir.join("synq.lock"),
            config.lock_wait_timeout,
            config.lock_poll_interval,
        ));

        let store = Arc::new(DurableStore::open(data_dir, lock.clone(), config.clone())?);
        let pins = Arc::new(LocalPinnedStore::open(data_dir, lock, config.clone())?);
        let chains = EntityChains::new();
        let scheduler = Arc::new(RetryScheduler::new(
            Arc::clone(&store),
            Arc::clone(&pins),
            Arc::clone(&collaborators.transport),
            chains.clone(),
            &config,
        ));

        let recovered = store.list_all()?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "rebuilding chains for recovered commands");
        }
        for command in &recovered {
            let completion = scheduler.register_completion(command.id);
            let tail = chains.preload(
                command.entity.clone(),
                command.id,
                completion
                    .map(|received| {
                        received.unwrap_or_else(|_| Err(Arc::new(SynqError::Shutdown)))
                    })
                    .boxed(),
            );
            // Drive the recovered tail so its chain entry is reclaimed
            // even when no later submission ever polls it.
            tokio::spawn(async move {
                let _ = tail.await;
            });
        }

        scheduler.start();
        Ok(Self {
            store,
            pins,
            chains,
            scheduler,
            session: collaborators.session,
            codecs: collaborators.codecs,
            delegate: collaborators.query_delegate,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Submits a mutation against an entity. The returned future resolves
    /// only on remote success or a terminal rejection; transient
    /// transport failures are retried behind the scenes indefinitely.
    ///
    /// Operations against the same entity are admitted strictly in
    /// submission order. The session token and payload are captured after
    /// the entity's previous operation resolved, so they reflect the
    /// correct causal point.
    pub async fn submit(
        &self,
        entity: EntityRef,
        kind: OperationKind,
        mutation: MutationSet,
    ) -> Result<CanonicalEntityState, SynqError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SynqError::Shutdown);
        }
        let scheduler = Arc::clone(&self.scheduler);
        let session = Arc::clone(&self.session);
        let codecs = self.codecs.clone();

        let chained = self.chains.submit(entity.clone(), move |_prior, slot| {
            async move {
                let token = session.current_token().await;
                let codec = codecs.codec_for(&entity.class);
                let payload = codec
                    .encode_mutation(&entity, &mutation)
                    .map_err(|e| Arc::new(SynqError::from(e)))?;
                let (command, completion) = scheduler
                    .enqueue(entity, kind, payload, token)
                    .map_err(|e| Arc::new(SynqError::from(e)))?;
                slot.bind_command(command.id);
                match completion.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Arc::new(SynqError::Shutdown)),
                }
            }
            .boxed()
        });

        match chained.await {
            Ok(state) => Ok((*state).clone()),
            Err(err) => Err(detach_error(&err)),
        }
    }

    /// Serves pinned-source predicates entirely from the local store;
    /// remote-source predicates go to the query delegate.
    pub async fn query(
        &self,
        predicate: QueryPredicate,
    ) -> Result<Vec<CanonicalEntityState>, SynqError> {
        if predicate.is_local() {
            return Ok(self.pins.find(&predicate));
        }
        match &self.delegate {
            Some(delegate) => Ok(delegate.find(&predicate).await?),
            None => Err(SynqError::Unavailable {
                message: "no query delegate configured for remote predicates".into(),
            }),
        }
    }

    /// Reads one entity: pinned snapshot first, delegate fallback.
    pub async fn get(&self, key: &EntityRef) -> Result<Option<CanonicalEntityState>, SynqError> {
        if let Some(snapshot) = self.pins.get(key) {
            return Ok(Some(snapshot));
        }
        match &self.delegate {
            Some(delegate) => Ok(delegate.fetch(key).await?),
            None => Err(SynqError::Unavailable {
                message: "no query delegate configured and entity is not pinned".into(),
            }),
        }
    }

    /// Retains entities offline under a named pin. Entities without a
    /// resident snapshot are fetched through the delegate first.
    pub async fn pin(&self, name: &str, keys: &[EntityRef]) -> Result<(), SynqError> {
        for key in keys {
            if self.pins.add_to_pin(name, key)? {
                continue;
            }
            let state = self.get(key).await?.ok_or_else(|| SynqError::Unavailable {
                message: format!("entity {key} not found for pinning"),
            })?;
            self.pins.put(state, &[name.to_string()])?;
        }
        Ok(())
    }

    /// Pins a snapshot the application already holds, without any fetch.
    pub fn pin_snapshot(
        &self,
        name: &str,
        state: CanonicalEntityState,
    ) -> Result<(), SynqError> {
        Ok(self.pins.put(state, &[name.to_string()])?)
    }

    pub fn unpin(&self, name: &str) -> Result<(), SynqError> {
        Ok(self.pins.remove_pin(name)?)
    }

    pub fn unpin_keys(&self, name: &str, keys: &[EntityRef]) -> Result<(), SynqError> {
        for key in keys {
            self.pins.remove_from_pin(name, key)?;
        }
        Ok(())
    }

    pub fn cancel(&self, command_id: u64) -> Result<bool, SynqError> {
        self.scheduler.cancel(command_id)
    }

    pub fn command_count(&self) -> usize {
        self.store.len()
    }

    pub fn pending_commands(&self) -> Result<Vec<Command>, SynqError> {
        Ok(self.store.list_all()?)
    }

    pub fn remove_all_commands(&self) -> Result<(), SynqError> {
        Ok(self.scheduler.remove_all()?)
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.scheduler.subscribe()
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn set_connected(&self, connected: bool) {
        self.scheduler.set_connected(connected);
    }

    pub fn is_connected(&self) -> bool {
        self.scheduler.is_connected()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.scheduler.metrics()
    }

    pub fn pending_entities(&self) -> usize {
        self.chains.pending_entities()
    }

    /// Stops the drain worker. Pending records stay on disk and are
    /// recovered by the next open.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown().await;
    }
}

/// Rebuilds an owned error from a shared chain outcome. Io errors are
/// recreated from kind and message since `std::io::Error` is not Clone.
fn detach_error(err: &SynqError) -> SynqError {
    fn detach_io(err: &std::io::Error) -> std::io::Error {
        std::io::Error::new(err.kind(), err.to_string())
    }
    fn detach_lock(err: &LockError) -> LockError {
        match err {
            LockError::Unavailable { owner } => LockError::Unavailable { owner: *owner },
            LockError::Stale { owner } => LockError::Stale { owner: *owner },
            LockError::Io(io) => LockError::Io(detach_io(io)),
        }
    }
    match err {
        SynqError::Lock(e) => SynqError::Lock(detach_lock(e)),
        SynqError::Store(e) => SynqError::Store(match e {
            StoreError::IoFailure(io) => StoreError::IoFailure(detach_io(io)),
            StoreError::Corrupt { path, detail } => StoreError::Corrupt {
                path: path.clone(),
                detail: detail.clone(),
            },
            StoreError::Encode(msg) => StoreError::Encode(msg.clone()),
            StoreError::Decode(msg) => StoreError::Decode(msg.clone()),
            StoreError::PayloadTooLarge { len, max } => StoreError::PayloadTooLarge {
                len: *len,
                max: *max,
            },
            StoreError::Lock(lock) => StoreError::Lock(detach_lock(lock)),
        }),
        SynqError::Transport(e) => SynqError::Transport(e.clone()),
        SynqError::Chain(e) => SynqError::Chain(e.clone()),
        SynqError::InvalidConfig { message } => SynqError::InvalidConfig {
            message: message.clone(),
        },
        SynqError::CommandNotFound { id } => SynqError::CommandNotFound { id: *id },
        SynqError::CommandInFlight { id } => SynqError::CommandInFlight { id: *id },
        SynqError::Unavailable { message } => SynqError::Unavailable {
            message: message.clone(),
        },
        SynqError::Shutdown => SynqError::Shutdown,
    }
}
