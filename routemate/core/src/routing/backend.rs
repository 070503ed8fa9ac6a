//! Backend Handles
//!
//! The router never talks to a database or socket itself. Whatever sits
//! behind a key (a connection pool, a client, a socket address) implements
//! [`Backend`] so the prober can check it and the topology manager can
//! release it.

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by backend handles
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached or could not open a session
    #[error("connection failed: {0}")]
    Connect(String),

    /// The backend answered but failed the validation check
    #[error("validation failed: {0}")]
    Validation(String),

    /// The handle has already been released
    #[error("backend handle is closed")]
    Closed,
}

/// Opaque resource handle the router hands out
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Generic liveness check
    async fn is_alive(&self) -> Result<(), BackendError>;

    /// Run a caller-supplied validation query. Backends that cannot run
    /// queries fall back to [`Backend::is_alive`].
    async fn run_validation_query(&self, _query: &str) -> Result<(), BackendError> {
        self.is_alive().await
    }

    /// Release the underlying resource
    async fn close(&self);
}
