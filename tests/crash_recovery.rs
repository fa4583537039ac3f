use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use synq::{
    CanonicalEntityState, Collaborators, Command, EntityRef, MutationSet, OperationKind,
    StaticSessionProvider, SynqConfig, SynqInstance, Transport, TransportError,
};
use tempfile::tempdir;

struct ScriptedTransport {
    log: Mutex<Vec<u64>>,
    offline: std::sync::atomic::AtomicBool,
    replay_as_applied: Mutex<HashMap<u64, bool>>,
}

impl ScriptedTransport {
    fn online() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            offline: std::sync::atomic::AtomicBool::new(false),
            replay_as_applied: Mutex::new(HashMap::new()),
        }
    }

    fn offline() -> Self {
        let transport = Self::online();
        transport
            .offline
            .store(true, std::sync::atomic::Ordering::SeqCst);
        transport
    }

    fn mark_already_applied(&self, id: u64) {
        self.replay_as_applied.lock().insert(id, true);
    }

    fn sent(&self) -> Vec<u64> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, command: &Command) -> Result<CanonicalEntityState, TransportError> {
        if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(TransportError::Transient {
                message: "no route to host".into(),
            });
        }
        self.log.lock().push(command.id);
        if self
            .replay_as_applied
            .lock()
            .get(&command.id)
            .copied()
            .unwrap_or(false)
        {
            return Err(TransportError::AlreadyApplied);
        }
        Ok(CanonicalEntityState::new(command.entity.clone(), command.id))
    }
}

async fn open(dir: &Path, transport: Arc<ScriptedTransport>) -> Arc<SynqInstance> {
    let collaborators = Collaborators::new(
        transport,
        Arc::new(StaticSessionProvider::anonymous()),
    );
    Arc::new(
        SynqInstance::open(SynqConfig::development(), dir, collaborators)
            .await
            .expect("open instance"),
    )
}

/// Persists commands without delivering them, then stops: the state a
/// crashed process leaves behind.
async fn strand_commands(dir: &Path, entities: &[EntityRef]) {
    let transport = Arc::new(ScriptedTransport::offline());
    let instance = open(dir, transport).await;
    for (i, entity) in entities.iter().enumerate() {
        let handle = tokio::spawn({
            let instance = Arc::clone(&instance);
            let entity = entity.clone();
            async move {
                instance
                    .submit(entity, OperationKind::Update, MutationSet::new())
                    .await
            }
        });
        while instance.command_count() < i + 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
    }
    instance.shutdown().await;
}

async fn drain(instance: &SynqInstance) {
    let mut waited = Duration::ZERO;
    while instance.command_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
        assert!(waited < Duration::from_secs(10), "queue failed to drain");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn stranded_records_are_recovered_and_delivered_in_enqueue_order() {
    let dir = tempdir().expect("tempdir");
    strand_commands(
        dir.path(),
        &[
            EntityRef::remote("Score", "a"),
            EntityRef::remote("Score", "b"),
            EntityRef::remote("Player", "c"),
        ],
    )
    .await;

    let transport = Arc::new(ScriptedTransport::online());
    let instance = open(dir.path(), Arc::clone(&transport)).await;
    assert_eq!(instance.command_count(), 3, "records survived the crash");

    drain(&instance).await;
    assert_eq!(transport.sent(), vec![1, 2, 3]);
    instance.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn new_submission_queues_behind_recovered_commands_for_same_entity() {
    let dir = tempdir().expect("tempdir");
    let entity = EntityRef::remote("Score", "x");
    strand_commands(dir.path(), std::slice::from_ref(&entity)).await;

    let transport = Arc::new(ScriptedTransport::online());
    let instance = open(dir.path(), Arc::clone(&transport)).await;

    let result = instance
        .submit(
            entity,
            OperationKind::Update,
            MutationSet::new().set("points", serde_json::json!(1)),
        )
        .await
        .expect("post-recovery submit");
    assert_eq!(result.updated_at_micros, 2);

    drain(&instance).await;
    assert_eq!(transport.sent(), vec![1, 2]);
    instance.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_of_acknowledged_record_is_absorbed_as_success() {
    // A crash between the remote acknowledgement and the local delete
    // leaves the record in the queue; on replay the remote reports the
    // mutation as already applied and the gap closes silently.
    let dir = tempdir().expect("tempdir");
    strand_commands(dir.path(), &[EntityRef::remote("Score", "dup")]).await;

    let transport = Arc::new(ScriptedTransport::online());
    transport.mark_already_applied(1);
    let instance = open(dir.path(), Arc::clone(&transport)).await;

    drain(&instance).await;
    assert_eq!(transport.sent(), vec![1]);
    assert_eq!(instance.metrics().succeeded, 1);
    assert_eq!(instance.metrics().terminal_failures, 0);
    instance.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reopen_is_idempotent_when_queue_is_clean() {
    let dir = tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::online());
    let instance = open(dir.path(), Arc::clone(&transport)).await;
    instance
        .submit(
            EntityRef::remote("Score", "clean"),
            OperationKind::Create,
            MutationSet::new(),
        )
        .await
        .expect("delivered");
    instance.shutdown().await;

    let reopened = open(dir.path(), Arc::new(ScriptedTransport::online())).await;
    assert_eq!(reopened.command_count(), 0);
    reopened.shutdown().await;
}
