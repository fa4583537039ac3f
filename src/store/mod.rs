use crate::command::{Command, EntityRef, OperationKind, now_micros};
use crate::config::SynqConfig;
use crate::error::StoreError;
use crate::lock::LockController;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

pub const RECORD_FILE_SUFFIX: &str = ".synqcmd";

/// Queue position of a persisted command. Positions are the enqueue ids,
/// so a retried command keeps its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct StoreState {
    index: BTreeMap<u64, PathBuf>,
    next_id: u64,
}

/// Append-only, crash-consistent on-disk queue of pending commands.
///
/// One file per record under `commands/`, named by zero-padded enqueue id
/// so directory order is queue order. Every record is fully written to a
/// temp file, fsynced, and atomically renamed before the append returns;
/// removal is a durable unlink. Both paths hold the inter-process lock.
#[derive(Debug)]
pub struct DurableStore {
    dir: PathBuf,
    lock: LockController,
    config: SynqConfig,
    state: Mutex<StoreState>,
}

impl DurableStore {
    /// Opens the store, discarding never-committed temp files and
    /// indexing the surviving records. Corrupt records are skipped with a
    /// warning in permissive mode and fail the open in strict mode.
    pub fn open(
        data_dir: &Path,
        lock: LockController,
        config: SynqConfig,
    ) -> Result<Self, StoreError> {
        let dir = data_dir.join("commands");
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            lock,
            config,
            state: Mutex::new(StoreState {
                index: BTreeMap::new(),
                next_id: 1,
            }),
        };
        store.lock.with_exclusive(|| store.rescan())?;
        Ok(store)
    }

    fn rescan(&self) -> Result<(), StoreError> {
        let mut index = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".tmp") {
                info!(file = %name, "discarding never-committed temp record");
                let _ = fs::remove_file(entry.path());
                continue;
            }
            let Some(id) = parse_record_id(&name) else {
                continue;
            };
            match fs::read(entry.path()).map_err(StoreError::from).and_then(|bytes| {
                Command::decode(&bytes)
            }) {
                Ok(_) => {
                    index.insert(id, entry.path());
                }
                Err(err) if self.config.strict_recovery() => {
                    return Err(StoreError::Corrupt {
                        path: name,
                        detail: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(file = %name, error = %err, "skipping corrupt record");
                }
            }
        }
        let next_id = index.keys().next_back().map_or(1, |max| max + 1);
        let mut state = self.state.lock();
        state.index = index;
        state.next_id = next_id;
        Ok(())
    }

    /// Re-reads the directory so records appended by another process
    /// become visible to this one.
    pub fn refresh(&self) -> Result<(), StoreError> {
        self.lock.with_exclusive(|| self.rescan())
    }

    /// Builds a command at the next queue position and durably persists
    /// it. On return the record survives a crash; on error prior state is
    /// unchanged.
    pub fn append(
        &self,
        entity: EntityRef,
        kind: OperationKind,
        payload: Vec<u8>,
        session_token: Option<String>,
    ) -> Result<Command, StoreError> {
        if payload.len() > self.config.max_command_payload_bytes {
            return Err(StoreError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_command_payload_bytes,
            });
        }
        self.lock.with_exclusive(|| {
            // Cooperating processes allocate ids from the same directory,
            // so the on-disk maximum wins over the cached counter.
            let disk_next = max_record_id(&self.dir)?.map_or(1, |max| max + 1);
            let id = {
                let state = self.state.lock();
                state.next_id.max(disk_next)
            };
            let command = Command {
                id,
                entity,
                kind,
                payload,
                session_token,
                attempts: 0,
                enqueued_at_micros: now_micros(),
            };
            let path = self.record_path(id);
            self.write_record_atomic(&path, &command)?;
            let mut state = self.state.lock();
            state.index.insert(id, path);
            state.next_id = id + 1;
            Ok(command)
        })
    }

    /// Earliest not-yet-removed command, without mutating queue state.
    pub fn peek_oldest(&self) -> Result<Option<Command>, StoreError> {
        loop {
            let front = {
                let state = self.state.lock();
                state.index.iter().next().map(|(id, path)| (*id, path.clone()))
            };
            let Some((id, path)) = front else {
                return Ok(None);
            };
            match fs::read(&path) {
                Ok(bytes) => match Command::decode(&bytes) {
                    Ok(command) => return Ok(Some(command)),
                    Err(err) if self.config.strict_recovery() => {
                        return Err(StoreError::Corrupt {
                            path: path.display().to_string(),
                            detail: err.to_string(),
                        });
                    }
                    Err(err) => {
                        warn!(id, error = %err, "skipping corrupt record at head");
                        self.state.lock().index.remove(&id);
                    }
                },
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    // Removed underneath us by a cooperating process.
                    self.state.lock().index.remove(&id);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Durably deletes the record at `position`. Safe to call twice: a
    /// crash between remote acknowledgement and local delete leaves a
    /// record whose replay the scheduler absorbs as already-applied.
    pub fn remove(&self, position: Position) -> Result<(), StoreError> {
        self.lock.with_exclusive(|| {
            let path = self.record_path(position.id());
            match fs::remove_file(&path) {
                Ok(()) => {
                    if self.config.sync_writes() {
                        fsync_dir(&self.dir)?;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            self.state.lock().index.remove(&position.id());
            Ok(())
        })
    }

    /// Rewrites a record in place (same position) with an updated attempt
    /// counter. A record already removed by an acknowledgement is not
    /// resurrected.
    pub fn persist_attempts(&self, command: &Command) -> Result<(), StoreError> {
        self.lock.with_exclusive(|| {
            let path = self.record_path(command.id);
            if !path.exists() {
                return Ok(());
            }
            self.write_record_atomic(&path, command)
        })
    }

    /// All pending commands in ascending queue order. Used at startup to
    /// rebuild entity chains.
    pub fn list_all(&self) -> Result<Vec<Command>, StoreError> {
        let paths: Vec<(u64, PathBuf)> = {
            let state = self.state.lock();
            state.index.iter().map(|(id, p)| (*id, p.clone())).collect()
        };
        let mut out = Vec::with_capacity(paths.len());
        for (id, path) in paths {
            match fs::read(&path).map_err(StoreError::from).and_then(|b| Command::decode(&b)) {
                Ok(command) => out.push(command),
                Err(err) if self.config.strict_recovery() => {
                    return Err(StoreError::Corrupt {
                        path: path.display().to_string(),
                        detail: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(id, error = %err, "skipping corrupt record during listing");
                }
            }
        }
        Ok(out)
    }

    pub fn remove_all(&self) -> Result<(), StoreError> {
        self.lock.with_exclusive(|| {
            let ids: Vec<u64> = self.state.lock().index.keys().copied().collect();
            for id in ids {
                let _ = fs::remove_file(self.record_path(id));
            }
            if self.config.sync_writes() {
                fsync_dir(&self.dir)?;
            }
            self.state.lock().index.clear();
            Ok(())
        })
    }

    pub fn contains(&self, position: Position) -> bool {
        self.state.lock().index.contains_key(&position.id())
    }

    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().index.is_empty()
    }

    fn record_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("cmd_{id:016}{RECORD_FILE_SUFFIX}"))
    }

    fn write_record_atomic(&self, path: &Path, command: &Command) -> Result<(), StoreError> {
        let bytes = command.encode()?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        if self.config.sync_writes() {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(path).map_err(|e| StoreError::IoFailure(e.error))?;
        if self.config.sync_writes() {
            fsync_dir(&self.dir)?;
        }
        Ok(())
    }
}

fn parse_record_id(name: &str) -> Option<u64> {
    if !name.starts_with("cmd_") || !name.ends_with(RECORD_FILE_SUFFIX) {
        return None;
    }
    name.trim_start_matches("cmd_")
        .trim_end_matches(RECORD_FILE_SUFFIX)
        .parse::<u64>()
        .ok()
}

fn max_record_id(dir: &Path) -> Result<Option<u64>, StoreError> {
    let mut max = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(id) = parse_record_id(&name) {
            max = Some(max.map_or(id, |m: u64| m.max(id)));
        }
    }
    Ok(max)
}

fn fsync_dir(path: &Path) -> Result<(), StoreError> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{DurableStore, Position};
    use crate::command::{EntityRef, OperationKind};
    use crate::config::SynqConfig;
    use crate::lock::{LockController, ProcessLock};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn controller(dir: &Path) -> LockController {
        LockController::new(ProcessLock::new(
            dir.join("synq.lock"),
            Duration::from_secs(1),
            Duration::from_millis(5),
        ))
    }

    fn open(dir: &Path) -> DurableStore {
        DurableStore::open(dir, controller(dir), SynqConfig::development()).expect("open store")
    }

    fn append_n(store: &DurableStore, n: usize) -> Vec<u64> {
        (0..n)
            .map(|i| {
                store
                    .append(
                        EntityRef::remote("Score", format!("s{i}")),
                        OperationKind::Update,
                        format!("payload-{i}").into_bytes(),
                        None,
                    )
                    .expect("append")
                    .id
            })
            .collect()
    }

    #[test]
    fn append_then_peek_then_remove_in_fifo_order() {
        let dir = tempdir().expect("tempdir");
        let store = open(dir.path());
        let ids = append_n(&store, 3);
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(store.len(), 3);

        for expected in ids {
            let head = store.peek_oldest().expect("peek").expect("non-empty");
            assert_eq!(head.id, expected);
            store.remove(Position(expected)).expect("remove");
        }
        assert!(store.peek_oldest().expect("peek").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = open(dir.path());
        append_n(&store, 1);
        store.remove(Position(1)).expect("first remove");
        store.remove(Position(1)).expect("second remove");
        assert!(store.is_empty());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        {
            let store = open(dir.path());
            append_n(&store, 2);
        }
        let store = open(dir.path());
        let all = store.list_all().expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, 1);
        assert_eq!(all[1].id, 2);
        // New appends continue the sequence.
        let next = store
            .append(
                EntityRef::remote("Score", "s9"),
                OperationKind::Create,
                vec![],
                None,
            )
            .expect("append");
        assert_eq!(next.id, 3);
    }

    #[test]
    fn temp_files_are_discarded_on_open() {
        let dir = tempdir().expect("tempdir");
        {
            let store = open(dir.path());
            append_n(&store, 1);
        }
        let orphan = dir.path().join("commands").join(".tmpABCDEF");
        std::fs::write(&orphan, b"half-written").expect("write orphan");
        let store = open(dir.path());
        assert!(!orphan.exists());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn corrupt_record_is_isolated_in_permissive_mode() {
        let dir = tempdir().expect("tempdir");
        {
            let store = open(dir.path());
            append_n(&store, 3);
        }
        let victim = dir
            .path()
            .join("commands")
            .join("cmd_0000000000000002.synqcmd");
        let mut bytes = std::fs::read(&victim).expect("read victim");
        let len = bytes.len();
        bytes[len - 6] ^= 0xFF;
        std::fs::write(&victim, bytes).expect("corrupt victim");

        let store = open(dir.path());
        let all = store.list_all().expect("list");
        let ids: Vec<u64> = all.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn corrupt_record_fails_open_in_strict_mode() {
        let dir = tempdir().expect("tempdir");
        {
            let store = open(dir.path());
            append_n(&store, 1);
        }
        let victim = dir
            .path()
            .join("commands")
            .join("cmd_0000000000000001.synqcmd");
        std::fs::write(&victim, b"garbage").expect("corrupt victim");
        let err = DurableStore::open(
            dir.path(),
            controller(dir.path()),
            SynqConfig::strict(),
        )
        .expect_err("strict open must fail");
        assert!(err.to_string().contains("corrupt record"));
    }

    #[test]
    fn attempts_are_persisted_at_the_same_position() {
        let dir = tempdir().expect("tempdir");
        let store = open(dir.path());
        let mut command = store
            .append(
                EntityRef::remote("Score", "s1"),
                OperationKind::Update,
                b"body".to_vec(),
                Some("token".into()),
            )
            .expect("append");
        command.attempts = 4;
        store.persist_attempts(&command).expect("persist attempts");

        let reopened = open(dir.path());
        let head = reopened.peek_oldest().expect("peek").expect("record");
        assert_eq!(head.id, command.id);
        assert_eq!(head.attempts, 4);
    }

    #[test]
    fn persist_attempts_does_not_resurrect_removed_record() {
        let dir = tempdir().expect("tempdir");
        let store = open(dir.path());
        let command = store
            .append(
                EntityRef::remote("Score", "s1"),
                OperationKind::Update,
                vec![],
                None,
            )
            .expect("append");
        store.remove(Position(command.id)).expect("remove");
        store.persist_attempts(&command).expect("persist after remove");
        assert!(store.peek_oldest().expect("peek").is_none());
    }

    #[test]
    fn oversized_payload_is_rejected_without_touching_disk() {
        let dir = tempdir().expect("tempdir");
        let config = SynqConfig {
            max_command_payload_bytes: 8,
            ..SynqConfig::development()
        };
        let store =
            DurableStore::open(dir.path(), controller(dir.path()), config).expect("open");
        let err = store
            .append(
                EntityRef::remote("Score", "s1"),
                OperationKind::Update,
                vec![0u8; 64],
                None,
            )
            .expect_err("must reject");
        assert!(err.to_string().contains("exceeds cap"));
        assert!(store.is_empty());
    }

    #[test]
    fn two_stores_on_one_directory_interleave_without_id_collisions() {
        let dir = tempdir().expect("tempdir");
        let a = open(dir.path());
        let b = open(dir.path());

        let id_a = append_n(&a, 1)[0];
        let id_b = b
            .append(
                EntityRef::remote("Score", "other"),
                OperationKind::Create,
                vec![],
                None,
            )
            .expect("append b")
            .id;
        assert_ne!(id_a, id_b);

        a.refresh().expect("refresh");
        assert_eq!(a.len(), 2);
        let all = a.list_all().expect("list");
        assert_eq!(all.len(), 2);
        assert!(all[0].id < all[1].id);
    }
}
