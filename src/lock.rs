use crate::error::LockError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Inter-process mutual exclusion over a named lock file.
///
/// The OS advisory lock is the sole source of truth for ownership; the pid
/// and timestamp written into the file are diagnostics only. A lock held
/// by a process that terminated is released by the OS automatically, so a
/// waiting acquirer reclaims it on its next poll; the recorded pid lets us
/// report `Stale` instead of `Unavailable` when the registered owner is
/// known to be dead but the descriptor is still held elsewhere.
#[derive(Debug, Clone)]
pub struct ProcessLock {
    path: PathBuf,
    wait_timeout: Duration,
    poll_interval: Duration,
}

#[derive(Debug)]
pub struct LockHandle {
    file: Option<File>,
    path: PathBuf,
}

impl ProcessLock {
    pub fn new(path: impl Into<PathBuf>, wait_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            wait_timeout,
            poll_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks (bounded) until exclusive ownership is obtained.
    pub fn acquire(&self) -> Result<LockHandle, LockError> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    let mut handle = LockHandle {
                        file: Some(file),
                        path: self.path.clone(),
                    };
                    handle.record_owner()?;
                    debug!(path = %self.path.display(), "process lock acquired");
                    return Ok(handle);
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(self.poll_interval);
                }
                Err(_) => {
                    let owner = read_owner_pid(&self.path);
                    if let Some(pid) = owner
                        && !pid_alive(pid)
                    {
                        warn!(
                            path = %self.path.display(),
                            owner = pid,
                            "lock registered to terminated pid but still held"
                        );
                        return Err(LockError::Stale { owner: pid });
                    }
                    return Err(LockError::Unavailable { owner });
                }
            }
        }
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&self) -> Result<LockHandle, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut handle = LockHandle {
                    file: Some(file),
                    path: self.path.clone(),
                };
                handle.record_owner()?;
                Ok(handle)
            }
            Err(_) => Err(LockError::Unavailable {
                owner: read_owner_pid(&self.path),
            }),
        }
    }
}

impl LockHandle {
    fn record_owner(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        let stamp = format!("{} {}\n", std::process::id(), crate::command::now_micros());
        file.write_all(stamp.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Idempotent: releasing an already-released handle is a no-op.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
            debug!(path = %self.path.display(), "process lock released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Shared gate over one lock file for every subsystem in this process.
///
/// The advisory lock stays authoritative across processes; the local mutex
/// keeps two tasks of the same process from contending on their own flock,
/// which would otherwise burn the bounded wait on self-inflicted conflicts.
#[derive(Debug, Clone)]
pub struct LockController {
    file_lock: ProcessLock,
    local: std::sync::Arc<parking_lot::Mutex<()>>,
}

impl LockController {
    pub fn new(lock: ProcessLock) -> Self {
        Self {
            file_lock: lock,
            local: std::sync::Arc::new(parking_lot::Mutex::new(())),
        }
    }

    pub fn lock_path(&self) -> &Path {
        self.file_lock.path()
    }

    /// Runs `f` while holding both the in-process gate and the
    /// inter-process lock.
    pub fn with_exclusive<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce() -> Result<T, E>,
    {
        let _local = self.local.lock();
        let _handle = self.file_lock.acquire().map_err(E::from)?;
        f()
    }
}

fn read_owner_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    // No cheap liveness probe; assume alive and report Unavailable.
    true
}

#[cfg(test)]
mod tests {
    use super::ProcessLock;
    use crate::error::LockError;
    use std::time::Duration;
    use tempfile::tempdir;

    fn lock_at(dir: &std::path::Path) -> ProcessLock {
        ProcessLock::new(
            dir.join("synq.lock"),
            Duration::from_millis(100),
            Duration::from_millis(5),
        )
    }

    #[test]
    fn acquire_creates_lock_file_and_records_pid() {
        let dir = tempdir().expect("tempdir");
        let lock = lock_at(dir.path());
        let handle = lock.acquire().expect("acquire");
        assert!(handle.is_held());
        let contents = std::fs::read_to_string(dir.path().join("synq.lock")).expect("read");
        let pid: u32 = contents
            .split_whitespace()
            .next()
            .expect("pid field")
            .parse()
            .expect("pid parses");
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn second_handle_is_unavailable_while_first_is_held() {
        let dir = tempdir().expect("tempdir");
        let lock = lock_at(dir.path());
        let _held = lock.acquire().expect("acquire");
        let err = lock.try_acquire().expect_err("must contend");
        match err {
            LockError::Unavailable { owner } => {
                assert_eq!(owner, Some(std::process::id()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn release_is_idempotent_and_unblocks_next_acquirer() {
        let dir = tempdir().expect("tempdir");
        let lock = lock_at(dir.path());
        let mut handle = lock.acquire().expect("acquire");
        handle.release();
        handle.release();
        assert!(!handle.is_held());
        let _second = lock.acquire().expect("reacquire after release");
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempdir().expect("tempdir");
        let lock = lock_at(dir.path());
        {
            let _held = lock.acquire().expect("acquire");
        }
        let _second = lock.try_acquire().expect("reacquire after drop");
    }

    #[test]
    fn controller_serializes_in_process_access() {
        use super::LockController;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempdir().expect("tempdir");
        let controller = LockController::new(lock_at(dir.path()));
        let concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let controller = controller.clone();
            let concurrent = Arc::clone(&concurrent);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    controller
                        .with_exclusive(|| -> Result<(), LockError> {
                            let now = concurrent.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(now, 0, "critical section must be exclusive");
                            std::thread::sleep(Duration::from_micros(200));
                            concurrent.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .expect("guarded section");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread join");
        }
    }

    #[test]
    fn bounded_wait_expires_on_contention() {
        let dir = tempdir().expect("tempdir");
        let lock = ProcessLock::new(
            dir.path().join("synq.lock"),
            Duration::from_millis(30),
            Duration::from_millis(5),
        );
        let _held = lock.acquire().expect("acquire");
        let started = std::time::Instant::now();
        let err = lock.acquire().expect_err("bounded wait must expire");
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(matches!(err, LockError::Unavailable { .. }));
    }
}
