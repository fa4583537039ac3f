use crate::error::TransportError;
use crate::transport::CanonicalEntityState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a query is allowed to look for results.
///
/// `Pinned` predicates are evaluated entirely against the local pinned
/// store (optionally scoped to one pin); `Remote` predicates are handed
/// to the external query collaborator untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuerySource {
    Pinned { pin: Option<String> },
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    Eq(String, Value),
    Ne(String, Value),
    Exists(String),
}

impl Constraint {
    fn matches(&self, state: &CanonicalEntityState) -> bool {
        match self {
            Constraint::Eq(field, value) => state.field(field) == Some(value),
            Constraint::Ne(field, value) => state.field(field) != Some(value),
            Constraint::Exists(field) => state.field(field).is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPredicate {
    pub class: String,
    pub source: QuerySource,
    pub constraints: Vec<Constraint>,
    pub limit: Option<usize>,
}

impl QueryPredicate {
    /// Predicate served from locally pinned snapshots.
    pub fn pinned(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            source: QuerySource::Pinned { pin: None },
            constraints: Vec::new(),
            limit: None,
        }
    }

    /// Predicate delegated to the remote query collaborator.
    pub fn remote(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            source: QuerySource::Remote,
            constraints: Vec::new(),
            limit: None,
        }
    }

    pub fn from_pin(mut self, pin: impl Into<String>) -> Self {
        self.source = QuerySource::Pinned {
            pin: Some(pin.into()),
        };
        self
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.constraints.push(Constraint::Eq(field.into(), value));
        self
    }

    pub fn where_ne(mut self, field: impl Into<String>, value: Value) -> Self {
        self.constraints.push(Constraint::Ne(field.into(), value));
        self
    }

    pub fn where_exists(mut self, field: impl Into<String>) -> Self {
        self.constraints.push(Constraint::Exists(field.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn is_local(&self) -> bool {
        matches!(self.source, QuerySource::Pinned { .. })
    }

    pub fn matches(&self, state: &CanonicalEntityState) -> bool {
        state.entity.class == self.class && self.constraints.iter().all(|c| c.matches(state))
    }
}

/// External collaborator answering remote-source predicates and point
/// reads that miss the pinned store.
#[async_trait]
pub trait QueryDelegate: Send + Sync {
    async fn find(
        &self,
        predicate: &QueryPredicate,
    ) -> Result<Vec<CanonicalEntityState>, TransportError>;

    async fn fetch(
        &self,
        key: &crate::command::EntityRef,
    ) -> Result<Option<CanonicalEntityState>, TransportError>;
}
