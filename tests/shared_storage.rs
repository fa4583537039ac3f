use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use synq::command::{EntityRef, OperationKind};
use synq::config::SynqConfig;
use synq::error::LockError;
use synq::lock::{LockController, ProcessLock};
use synq::pins::LocalPinnedStore;
use synq::store::DurableStore;
use synq::transport::CanonicalEntityState;
use tempfile::tempdir;

fn controller(dir: &Path) -> LockController {
    LockController::new(ProcessLock::new(
        dir.join("synq.lock"),
        Duration::from_secs(5),
        Duration::from_millis(2),
    ))
}

fn open_store(dir: &Path) -> DurableStore {
    DurableStore::open(dir, controller(dir), SynqConfig::development()).expect("open store")
}

#[test]
fn concurrent_appends_from_two_handles_never_corrupt_the_queue() {
    // Two store handles with independent lock controllers model the host
    // app and an extension sharing one storage directory.
    let dir = tempdir().expect("tempdir");
    let writers: Vec<Arc<DurableStore>> = (0..2)
        .map(|_| Arc::new(open_store(dir.path())))
        .collect();

    let per_writer = 30usize;
    let mut handles = Vec::new();
    for (w, store) in writers.iter().enumerate() {
        let store = Arc::clone(store);
        handles.push(std::thread::spawn(move || {
            for i in 0..per_writer {
                store
                    .append(
                        EntityRef::remote("Score", format!("w{w}-{i}")),
                        OperationKind::Update,
                        format!("writer {w} item {i}").into_bytes(),
                        None,
                    )
                    .expect("append");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let verifier = open_store(dir.path());
    let all = verifier.list_all().expect("list");
    assert_eq!(all.len(), per_writer * 2, "no record lost or duplicated");

    let ids: Vec<u64> = all.iter().map(|c| c.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(ids, sorted, "total order with unique positions");
}

#[test]
fn store_open_respects_foreign_lock_holder() {
    let dir = tempdir().expect("tempdir");
    let foreign = ProcessLock::new(
        dir.path().join("synq.lock"),
        Duration::from_millis(50),
        Duration::from_millis(5),
    );
    let _held = foreign.acquire().expect("foreign holder");

    let contended = LockController::new(ProcessLock::new(
        dir.path().join("synq.lock"),
        Duration::from_millis(50),
        Duration::from_millis(5),
    ));
    let err = DurableStore::open(dir.path(), contended, SynqConfig::development())
        .expect_err("open must wait out and fail");
    assert!(matches!(
        err,
        synq::error::StoreError::Lock(LockError::Unavailable { .. })
    ));
}

#[test]
fn pin_table_written_by_one_handle_is_read_by_the_next() {
    let dir = tempdir().expect("tempdir");
    let entity = EntityRef::remote("Score", "shared");
    {
        let pins = LocalPinnedStore::open(
            dir.path(),
            controller(dir.path()),
            SynqConfig::development(),
        )
        .expect("open pins");
        pins.put(
            CanonicalEntityState::new(entity.clone(), 1),
            &["favorites".into()],
        )
        .expect("put");
    }

    let pins = LocalPinnedStore::open(
        dir.path(),
        controller(dir.path()),
        SynqConfig::development(),
    )
    .expect("reopen pins");
    assert!(pins.get(&entity).is_some());
    assert_eq!(pins.membership_count(&entity), 1);
}

#[test]
fn refresh_makes_peer_appends_visible() {
    let dir = tempdir().expect("tempdir");
    let a = open_store(dir.path());
    let b = open_store(dir.path());

    a.append(
        EntityRef::remote("Score", "from-a"),
        OperationKind::Create,
        vec![],
        None,
    )
    .expect("append via a");

    assert_eq!(b.len(), 0, "peer index is stale until refresh");
    b.refresh().expect("refresh");
    assert_eq!(b.len(), 1);
    assert_eq!(
        b.peek_oldest().expect("peek").expect("record").entity,
        EntityRef::remote("Score", "from-a")
    );
}
