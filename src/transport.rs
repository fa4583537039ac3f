use crate::command::{Command, EntityRef};
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The remote service's authoritative view of one entity, as returned by
/// a successful mutation or a delegated query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntityState {
    pub entity: EntityRef,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub updated_at_micros: u64,
}

impl CanonicalEntityState {
    pub fn new(entity: EntityRef, updated_at_micros: u64) -> Self {
        Self {
            entity,
            fields: serde_json::Map::new(),
            updated_at_micros,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }
}

/// One logical REST round-trip. The implementation owns request encoding,
/// authentication headers, and timeout bounding; it reports the outcome
/// already classified into the retry taxonomy.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, command: &Command) -> Result<CanonicalEntityState, TransportError>;
}
