use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    Full,
    OsBuffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMode {
    Strict,
    Permissive,
}

/// Runtime configuration for a synq instance.
#[derive(Debug, Clone)]
pub struct SynqConfig {
    pub durability_mode: DurabilityMode,
    pub recovery_mode: RecoveryMode,
    /// First retry delay after a transient transport failure.
    pub retry_initial_backoff: Duration,
    /// Backoff ceiling. Retries continue indefinitely at this interval;
    /// there is no attempt cap.
    pub retry_max_backoff: Duration,
    /// Bounded wait for the inter-process lock before giving up with
    /// `LockError::Unavailable`.
    pub lock_wait_timeout: Duration,
    /// Poll interval while waiting on a contended lock.
    pub lock_poll_interval: Duration,
    pub max_command_payload_bytes: usize,
    /// Persist the attempt counter on every requeue so attempt history
    /// survives a crash mid-backoff.
    pub persist_attempts: bool,
}

impl Default for SynqConfig {
    fn default() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Permissive,
            retry_initial_backoff: Duration::from_millis(500),
            retry_max_backoff: Duration::from_secs(5 * 60),
            lock_wait_timeout: Duration::from_secs(10),
            lock_poll_interval: Duration::from_millis(50),
            max_command_payload_bytes: 4 * 1024 * 1024,
            persist_attempts: true,
        }
    }
}

impl SynqConfig {
    /// Relaxed profile for local development and tests: buffered writes,
    /// short backoff, short lock waits.
    pub fn development() -> Self {
        Self {
            durability_mode: DurabilityMode::OsBuffered,
            retry_initial_backoff: Duration::from_millis(10),
            retry_max_backoff: Duration::from_millis(200),
            lock_wait_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Strict profile: full fsync durability and hard failure on any
    /// corrupt record during recovery.
    pub fn strict() -> Self {
        Self {
            durability_mode: DurabilityMode::Full,
            recovery_mode: RecoveryMode::Strict,
            ..Self::default()
        }
    }

    pub fn strict_recovery(&self) -> bool {
        matches!(self.recovery_mode, RecoveryMode::Strict)
    }

    pub fn sync_writes(&self) -> bool {
        matches!(self.durability_mode, DurabilityMode::Full)
    }
}
