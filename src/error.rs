use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynqErrorCode {
    Io,
    Encode,
    Decode,
    Corrupt,
    LockUnavailable,
    LockStale,
    InvalidConfig,
    PayloadTooLarge,
    TransportTransient,
    TransportTerminal,
    AlreadyApplied,
    ChainAborted,
    CommandNotFound,
    CommandInFlight,
    Unavailable,
    Shutdown,
}

impl SynqErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SynqErrorCode::Io => "io",
            SynqErrorCode::Encode => "encode",
            SynqErrorCode::Decode => "decode",
            SynqErrorCode::Corrupt => "corrupt",
            SynqErrorCode::LockUnavailable => "lock_unavailable",
            SynqErrorCode::LockStale => "lock_stale",
            SynqErrorCode::InvalidConfig => "invalid_config",
            SynqErrorCode::PayloadTooLarge => "payload_too_large",
            SynqErrorCode::TransportTransient => "transport_transient",
            SynqErrorCode::TransportTerminal => "transport_terminal",
            SynqErrorCode::AlreadyApplied => "already_applied",
            SynqErrorCode::ChainAborted => "chain_aborted",
            SynqErrorCode::CommandNotFound => "command_not_found",
            SynqErrorCode::CommandInFlight => "command_in_flight",
            SynqErrorCode::Unavailable => "unavailable",
            SynqErrorCode::Shutdown => "shutdown",
        }
    }
}

/// Failures of the inter-process advisory lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock unavailable: held by pid {owner:?}")]
    Unavailable { owner: Option<u32> },
    #[error("lock held by terminated pid {owner}")]
    Stale { owner: u32 },
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the durable command store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failure: {0}")]
    IoFailure(#[from] std::io::Error),
    #[error("corrupt record {path}: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("record encode error: {0}")]
    Encode(String),
    #[error("record decode error: {0}")]
    Decode(String),
    #[error("payload of {len} bytes exceeds cap of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Transport outcomes as classified by the injected collaborator.
///
/// `Transient` is retried forever and never surfaced to the submitter.
/// `Terminal` resolves the submitter's future with the error.
/// `AlreadyApplied` is the duplicate-key class: a replayed command the
/// remote has already accepted, treated as success by the scheduler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transient transport failure: {message}")]
    Transient { message: String },
    #[error("terminal transport failure (status {status}): {message}")]
    Terminal { status: u16, message: String },
    #[error("request already applied remotely")]
    AlreadyApplied,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }
}

/// A chained operation aborted by its own factory after observing the
/// prior operation's outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("chained operation aborted: {reason}")]
    Aborted { reason: String },
}

#[derive(Debug, Error)]
pub enum SynqError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("command {id} not found")]
    CommandNotFound { id: u64 },
    #[error("command {id} is already in flight")]
    CommandInFlight { id: u64 },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
    #[error("instance is shut down")]
    Shutdown,
}

impl SynqError {
    pub fn code(&self) -> SynqErrorCode {
        match self {
            SynqError::Lock(LockError::Unavailable { .. }) => SynqErrorCode::LockUnavailable,
            SynqError::Lock(LockError::Stale { .. }) => SynqErrorCode::LockStale,
            SynqError::Lock(LockError::Io(_)) => SynqErrorCode::Io,
            SynqError::Store(StoreError::IoFailure(_)) => SynqErrorCode::Io,
            SynqError::Store(StoreError::Corrupt { .. }) => SynqErrorCode::Corrupt,
            SynqError::Store(StoreError::Encode(_)) => SynqErrorCode::Encode,
            SynqError::Store(StoreError::Decode(_)) => SynqErrorCode::Decode,
            SynqError::Store(StoreError::PayloadTooLarge { .. }) => SynqErrorCode::PayloadTooLarge,
            SynqError::Store(StoreError::Lock(LockError::Stale { .. })) => SynqErrorCode::LockStale,
            SynqError::Store(StoreError::Lock(LockError::Io(_))) => SynqErrorCode::Io,
            SynqError::Store(StoreError::Lock(LockError::Unavailable { .. })) => {
                SynqErrorCode::LockUnavailable
            }
            SynqError::Transport(TransportError::Transient { .. }) => {
                SynqErrorCode::TransportTransient
            }
            SynqError::Transport(TransportError::Terminal { .. }) => {
                SynqErrorCode::TransportTerminal
            }
            SynqError::Transport(TransportError::AlreadyApplied) => SynqErrorCode::AlreadyApplied,
            SynqError::Chain(ChainError::Aborted { .. }) => SynqErrorCode::ChainAborted,
            SynqError::InvalidConfig { .. } => SynqErrorCode::InvalidConfig,
            SynqError::CommandNotFound { .. } => SynqErrorCode::CommandNotFound,
            SynqError::CommandInFlight { .. } => SynqErrorCode::CommandInFlight,
            SynqError::Unavailable { .. } => SynqErrorCode::Unavailable,
            SynqError::Shutdown => SynqErrorCode::Shutdown,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::{LockError, StoreError, SynqError, SynqErrorCode, TransportError};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(SynqErrorCode::LockUnavailable.as_str(), "lock_unavailable");
        assert_eq!(
            SynqErrorCode::TransportTerminal.as_str(),
            "transport_terminal"
        );
        assert_eq!(SynqErrorCode::ChainAborted.as_str(), "chain_aborted");
    }

    #[test]
    fn code_mapping_follows_variant() {
        let err = SynqError::Store(StoreError::Corrupt {
            path: "cmd_0000000000000007.synqcmd".into(),
            detail: "crc mismatch".into(),
        });
        assert_eq!(err.code(), SynqErrorCode::Corrupt);
        assert_eq!(err.code_str(), "corrupt");

        let err = SynqError::Lock(LockError::Unavailable { owner: Some(42) });
        assert_eq!(err.code_str(), "lock_unavailable");
    }

    #[test]
    fn transient_classification() {
        assert!(
            TransportError::Transient {
                message: "connection refused".into()
            }
            .is_transient()
        );
        assert!(!TransportError::AlreadyApplied.is_transient());
    }
}
