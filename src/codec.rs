use crate::command::EntityRef;
use crate::error::StoreError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// The field-level changes of one mutation, keyed by field name. The set
/// is closed over plain JSON values; diff semantics (increments, array
/// ops) belong to the entity model layer and arrive here already folded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationSet {
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl MutationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Per-entity-class payload capability. A command's payload must be
/// self-contained, so the codec folds everything replay needs into the
/// bytes it returns.
pub trait EntityCodec: Send + Sync {
    fn encode_mutation(
        &self,
        entity: &EntityRef,
        mutation: &MutationSet,
    ) -> Result<Vec<u8>, StoreError>;

    fn decode_mutation(&self, bytes: &[u8]) -> Result<MutationSet, StoreError>;
}

/// JSON codec used for any class without a registered specialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEntityCodec;

impl EntityCodec for JsonEntityCodec {
    fn encode_mutation(
        &self,
        _entity: &EntityRef,
        mutation: &MutationSet,
    ) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(mutation).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode_mutation(&self, bytes: &[u8]) -> Result<MutationSet, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Codec resolution by entity-class tag.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Arc<RwLock<HashMap<String, Arc<dyn EntityCodec>>>>,
    fallback: Arc<dyn EntityCodec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self {
            codecs: Arc::new(RwLock::new(HashMap::new())),
            fallback: Arc::new(JsonEntityCodec),
        }
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class: impl Into<String>, codec: Arc<dyn EntityCodec>) {
        self.codecs.write().insert(class.into(), codec);
    }

    pub fn codec_for(&self, class: &str) -> Arc<dyn EntityCodec> {
        self.codecs
            .read()
            .get(class)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}
