pub mod backoff;
pub mod events;

use crate::chain::{ChainOutcome, EntityChains};
use crate::command::{Command, EntityRef, OperationKind, now_micros};
use crate::config::SynqConfig;
use crate::error::{ChainError, StoreError, SynqError, TransportError};
use crate::pins::LocalPinnedStore;
use crate::store::{DurableStore, Position};
use crate::transport::{CanonicalEntityState, Transport};
use backoff::BackoffPolicy;
use events::{EventBus, EventSubscription, QueueEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Dispatching,
    Waiting,
}

#[derive(Debug, Default)]
struct SchedulerTelemetry {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    transient_failures: AtomicU64,
    terminal_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerMetrics {
    pub dispatched: u64,
    pub succeeded: u64,
    pub transient_failures: u64,
    pub terminal_failures: u64,
}

enum CompletionSlot {
    Pending(Vec<oneshot::Sender<ChainOutcome>>),
    Resolved(ChainOutcome),
}

struct SchedulerInner {
    store: Arc<DurableStore>,
    pins: Arc<LocalPinnedStore>,
    transport: Arc<dyn Transport>,
    chains: EntityChains,
    backoff: BackoffPolicy,
    events: EventBus,
    completions: Mutex<HashMap<u64, CompletionSlot>>,
    attempts_overlay: Mutex<HashMap<u64, u32>>,
    in_flight: Mutex<Option<u64>>,
    state: Mutex<SchedulerState>,
    paused: AtomicBool,
    connected: AtomicBool,
    persist_attempts: bool,
    wake_tx: mpsc::Sender<()>,
    telemetry: SchedulerTelemetry,
}

/// Drains the durable store in global FIFO order through the injected
/// transport, one command in flight at a time.
///
/// State machine: Idle -> Dispatching -> Waiting(backoff) -> Idle. A
/// transient failure keeps the head command at its position and backs
/// off; the queue never skips ahead, so head-of-line blocking is the
/// accepted trade-off for ordering. Terminal failures surface to the
/// submitting future and unblock the queue.
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
    wake_rx: Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<DurableStore>,
        pins: Arc<LocalPinnedStore>,
        transport: Arc<dyn Transport>,
        chains: EntityChains,
        config: &SynqConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                pins,
                transport,
                chains,
                backoff: BackoffPolicy::from_config(config),
                events: EventBus::new(),
                completions: Mutex::new(HashMap::new()),
                attempts_overlay: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(None),
                state: Mutex::new(SchedulerState::Idle),
                paused: AtomicBool::new(false),
                connected: AtomicBool::new(true),
                persist_attempts: config.persist_attempts,
                wake_tx,
                telemetry: SchedulerTelemetry::default(),
            }),
            wake_rx: Mutex::new(Some(wake_rx)),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Spawns the drain worker. Requires a tokio runtime.
    pub fn start(&self) {
        let Some(wake_rx) = self.wake_rx.lock().take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(run_worker(inner, wake_rx, shutdown_rx));
        *self.worker.lock() = Some(handle);
    }

    /// Persists a command at the queue tail and registers its completion
    /// future in one step, so the worker cannot resolve it before the
    /// caller holds the receiver.
    pub fn enqueue(
        &self,
        entity: EntityRef,
        kind: OperationKind,
        payload: Vec<u8>,
        session_token: Option<String>,
    ) -> Result<(Command, oneshot::Receiver<ChainOutcome>), StoreError> {
        let mut completions = self.inner.completions.lock();
        let command = self.inner.store.append(entity, kind, payload, session_token)?;
        let (tx, rx) = oneshot::channel();
        completions.insert(command.id, CompletionSlot::Pending(vec![tx]));
        drop(completions);

        self.inner.events.publish(QueueEvent::CommandEnqueued {
            id: command.id,
            entity: command.entity.clone(),
        });
        self.wake();
        Ok((command, rx))
    }

    /// Completion future for an already-persisted command (recovery path).
    pub fn register_completion(&self, id: u64) -> oneshot::Receiver<ChainOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut completions = self.inner.completions.lock();
        match completions.remove(&id) {
            Some(CompletionSlot::Resolved(outcome)) => {
                let _ = tx.send(outcome);
            }
            Some(CompletionSlot::Pending(mut senders)) => {
                senders.push(tx);
                completions.insert(id, CompletionSlot::Pending(senders));
            }
            None => {
                completions.insert(id, CompletionSlot::Pending(vec![tx]));
            }
        }
        rx
    }

    pub fn wake(&self) {
        let _ = self.inner.wake_tx.try_send(());
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Connectivity gate: while disconnected the worker idles instead of
    /// burning backoff cycles against an unreachable network.
    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.wake();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.lock()
    }

    pub fn in_flight_id(&self) -> Option<u64> {
        *self.inner.in_flight.lock()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        SchedulerMetrics {
            dispatched: self.inner.telemetry.dispatched.load(Ordering::Relaxed),
            succeeded: self.inner.telemetry.succeeded.load(Ordering::Relaxed),
            transient_failures: self
                .inner
                .telemetry
                .transient_failures
                .load(Ordering::Relaxed),
            terminal_failures: self
                .inner
                .telemetry
                .terminal_failures
                .load(Ordering::Relaxed),
        }
    }

    /// Cancels a not-yet-dispatched command. Fails when the command is in
    /// flight (the remote outcome would be ambiguous); returns false when
    /// a dependent chain already captured it as predecessor.
    pub fn cancel(&self, id: u64) -> Result<bool, SynqError> {
        if *self.inner.in_flight.lock() == Some(id) {
            return Err(SynqError::CommandInFlight { id });
        }
        if !self.inner.store.contains(Position::new(id)) {
            return Err(SynqError::CommandNotFound { id });
        }
        if self.inner.chains.has_dependent(id) {
            return Ok(false);
        }
        self.inner.store.remove(Position::new(id))?;
        self.inner.attempts_overlay.lock().remove(&id);
        self.inner.resolve(
            id,
            Err(Arc::new(SynqError::Chain(ChainError::Aborted {
                reason: "cancelled before dispatch".into(),
            }))),
        );
        info!(id, "pending command cancelled");
        Ok(true)
    }

    /// Clears the whole queue, resolving every pending future as aborted.
    pub fn remove_all(&self) -> Result<(), StoreError> {
        self.inner.store.remove_all()?;
        let ids: Vec<u64> = self.inner.completions.lock().keys().copied().collect();
        for id in ids {
            self.inner.resolve(
                id,
                Err(Arc::new(SynqError::Chain(ChainError::Aborted {
                    reason: "queue cleared".into(),
                }))),
            );
        }
        self.inner.attempts_overlay.lock().clear();
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.wake();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl SchedulerInner {
    fn runnable(&self) -> bool {
        !self.paused.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SchedulerState) {
        *self.state.lock() = state;
    }

    fn effective_attempts(&self, command: &Command) -> u32 {
        let overlay = self.attempts_overlay.lock();
        overlay
            .get(&command.id)
            .copied()
            .unwrap_or(0)
            .max(command.attempts)
    }

    fn resolve(&self, id: u64, outcome: ChainOutcome) {
        let mut completions = self.completions.lock();
        match completions.remove(&id) {
            Some(CompletionSlot::Pending(senders)) => {
                for tx in senders {
                    let _ = tx.send(outcome.clone());
                }
            }
            Some(CompletionSlot::Resolved(_)) | None => {
                // Nobody registered yet (command enqueued by a peer
                // process, or recovery not finished): park the outcome.
                completions.insert(id, CompletionSlot::Resolved(outcome));
            }
        }
        drop(completions);
        self.chains.release_command(id);
    }

    fn complete_success(&self, command: &Command, state: CanonicalEntityState) {
        if let Err(err) = self.store.remove(Position::new(command.id)) {
            warn!(id = command.id, error = %err, "failed to remove acknowledged record");
        }
        self.attempts_overlay.lock().remove(&command.id);

        match command.kind {
            OperationKind::Delete => match self.pins.remove_entity(&command.entity) {
                Ok(true) => self.events.publish(QueueEvent::ObjectRemoved {
                    entity: command.entity.clone(),
                }),
                Ok(false) => {}
                Err(err) => {
                    warn!(entity = %command.entity, error = %err, "pinned store eviction failed")
                }
            },
            OperationKind::Create | OperationKind::Update => {
                match self.pins.update_canonical(&state) {
                    Ok(true) => self.events.publish(QueueEvent::ObjectUpdated {
                        entity: state.entity.clone(),
                    }),
                    Ok(false) => {}
                    Err(err) => {
                        warn!(entity = %command.entity, error = %err, "pinned store refresh failed")
                    }
                }
            }
        }

        self.telemetry.succeeded.fetch_add(1, Ordering::Relaxed);
        self.events.publish(QueueEvent::CommandSucceeded {
            id: command.id,
            entity: command.entity.clone(),
            attempts: command.attempts,
        });
        self.resolve(command.id, Ok(Arc::new(state)));
    }

    fn complete_terminal(&self, command: &Command, err: TransportError) {
        if let Err(remove_err) = self.store.remove(Position::new(command.id)) {
            warn!(id = command.id, error = %remove_err, "failed to remove rejected record");
        }
        self.attempts_overlay.lock().remove(&command.id);
        self.telemetry
            .terminal_failures
            .fetch_add(1, Ordering::Relaxed);
        self.events.publish(QueueEvent::CommandFailed {
            id: command.id,
            entity: command.entity.clone(),
            error: err.to_string(),
        });
        self.resolve(
            command.id,
            Err(Arc::new(SynqError::Transport(err))),
        );
    }
}

async fn run_worker(
    inner: Arc<SchedulerInner>,
    mut wake: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("retry scheduler worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !inner.runnable() {
            inner.set_state(SchedulerState::Idle);
            tokio::select! {
                _ = wake.recv() => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        let head = match inner.store.peek_oldest() {
            Ok(head) => head,
            Err(err) => {
                warn!(error = %err, "queue peek failed, retrying shortly");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };
        let Some(mut command) = head else {
            inner.set_state(SchedulerState::Idle);
            tokio::select! {
                _ = wake.recv() => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };

        // A cancellation may have raced the peek.
        if !inner.store.contains(Position::new(command.id)) {
            continue;
        }

        command.attempts = inner.effective_attempts(&command) + 1;
        *inner.in_flight.lock() = Some(command.id);
        inner.set_state(SchedulerState::Dispatching);
        inner.telemetry.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(id = command.id, entity = %command.entity, attempt = command.attempts, "dispatching command");

        let result = inner.transport.send(&command).await;
        *inner.in_flight.lock() = None;

        match result {
            Ok(state) => inner.complete_success(&command, state),
            Err(TransportError::AlreadyApplied) => {
                // Replay of an acknowledged-but-undeleted record: the
                // remote already holds this mutation.
                debug!(id = command.id, "command already applied remotely, treating as success");
                let state = CanonicalEntityState::new(command.entity.clone(), now_micros());
                inner.complete_success(&command, state);
            }
            Err(err @ TransportError::Transient { .. }) => {
                inner
                    .telemetry
                    .transient_failures
                    .fetch_add(1, Ordering::Relaxed);
                inner
                    .attempts_overlay
                    .lock()
                    .insert(command.id, command.attempts);
                if inner.persist_attempts
                    && let Err(persist_err) = inner.store.persist_attempts(&command)
                {
                    warn!(id = command.id, error = %persist_err, "failed to persist attempt counter");
                }
                let delay = inner.backoff.delay_for(command.attempts);
                warn!(
                    id = command.id,
                    attempt = command.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient transport failure, backing off"
                );
                inner.set_state(SchedulerState::Waiting);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.recv() => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err @ TransportError::Terminal { .. }) => {
                warn!(id = command.id, error = %err, "terminal transport failure, dropping command");
                inner.complete_terminal(&command, err);
            }
        }
    }
    inner.set_state(SchedulerState::Idle);
    info!("retry scheduler worker stopped");
}
