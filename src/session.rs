use async_trait::async_trait;

/// Snapshot of auth state. Queried at the causal point where a command's
/// payload is built (after its chain predecessor resolved), so the token
/// persisted with the command is the one valid for that position in the
/// entity's history.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_token(&self) -> Option<String>;
}

/// Fixed-token provider for construction-time injection and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionProvider {
    token: Option<String>,
}

impl StaticSessionProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn current_token(&self) -> Option<String> {
        self.token.clone()
    }
}
