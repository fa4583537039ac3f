use crate::error::StoreError;
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const RECORD_MAGIC: u32 = 0x5359_4E51;
pub const RECORD_FORMAT_VERSION: u16 = 1;
pub const RECORD_HEADER_SIZE: usize = 4 + 2 + 2 + 4;

/// Identifier of a logical entity: either a client-local id minted before
/// the entity ever reached the remote service, or the remote id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityId {
    Local(Uuid),
    Remote(String),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Local(id) => write!(f, "local:{id}"),
            EntityId::Remote(id) => write!(f, "remote:{id}"),
        }
    }
}

/// Reference to a logical entity: class tag plus identifier. Used as the
/// chain key, so operations on the same entity serialize while distinct
/// entities proceed concurrently.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub class: String,
    pub id: EntityId,
}

impl EntityRef {
    pub fn local(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            id: EntityId::Local(Uuid::new_v4()),
        }
    }

    pub fn remote(class: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            id: EntityId::Remote(id.into()),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// A persisted, self-contained description of one pending mutation.
///
/// Immutable once enqueued except for `attempts`, which only the retry
/// scheduler touches. Replaying a command must not depend on any other
/// in-memory state: the payload carries the full serialized operation set
/// and the session token is the one captured when the chain admitted the
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    pub entity: EntityRef,
    pub kind: OperationKind,
    pub payload: Vec<u8>,
    pub session_token: Option<String>,
    pub attempts: u32,
    pub enqueued_at_micros: u64,
}

impl Command {
    /// Serializes the command into its on-disk record form:
    /// magic, format version, reserved, payload length, rmp payload,
    /// crc32c trailer over everything preceding it.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let payload = rmp_serde::to_vec(self).map_err(|e| StoreError::Encode(e.to_string()))?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| StoreError::Encode("payload length exceeds u32".into()))?;

        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + 4);
        out.extend_from_slice(&RECORD_MAGIC.to_be_bytes());
        out.extend_from_slice(&RECORD_FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.extend_from_slice(&payload);
        let crc = crc32c(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < RECORD_HEADER_SIZE + 4 {
            return Err(StoreError::Decode("record shorter than header".into()));
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().expect("slice len"));
        if magic != RECORD_MAGIC {
            return Err(StoreError::Decode("bad record magic".into()));
        }
        let version = u16::from_be_bytes(bytes[4..6].try_into().expect("slice len"));
        if version != RECORD_FORMAT_VERSION {
            return Err(StoreError::Decode(format!(
                "unsupported record format version: {version}"
            )));
        }
        let payload_len =
            u32::from_be_bytes(bytes[8..12].try_into().expect("slice len")) as usize;
        let expected_len = RECORD_HEADER_SIZE + payload_len + 4;
        if bytes.len() != expected_len {
            return Err(StoreError::Decode(format!(
                "record length {} does not match framed length {expected_len}",
                bytes.len()
            )));
        }
        let crc_offset = RECORD_HEADER_SIZE + payload_len;
        let stored_crc =
            u32::from_be_bytes(bytes[crc_offset..].try_into().expect("slice len"));
        let computed_crc = crc32c(&bytes[..crc_offset]);
        if stored_crc != computed_crc {
            return Err(StoreError::Decode("crc mismatch".into()));
        }
        rmp_serde::from_slice(&bytes[RECORD_HEADER_SIZE..crc_offset])
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
