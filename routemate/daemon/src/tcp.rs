//! TCP Backends
//!
//! The daemon has no database driver; a backend is a `host:port` endpoint
//! and liveness is a successful TCP connect within the timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;

use routemate_core::{Backend, BackendError, BackendFactory, PoolSettings, ReplicaSpec};

/// Invalid endpoint URL
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// Scheme other than `tcp://`
    #[error("unsupported scheme in '{0}', expected tcp://host:port")]
    Scheme(String),

    /// No usable port
    #[error("missing or invalid port in '{0}'")]
    Port(String),

    /// Empty host
    #[error("missing host in '{0}'")]
    Host(String),
}

/// Parse `tcp://host:port` or `host:port` into a connectable address
pub fn parse_endpoint(url: &str) -> Result<String, EndpointError> {
    let trimmed = url.trim();
    let rest = match trimmed.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some(_) => return Err(EndpointError::Scheme(url.to_string())),
        None => trimmed,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| EndpointError::Port(url.to_string()))?;
    if host.is_empty() {
        return Err(EndpointError::Host(url.to_string()));
    }
    port.parse::<u16>()
        .map_err(|_| EndpointError::Port(url.to_string()))?;

    Ok(rest.to_string())
}

/// A TCP endpoint probed by connecting to it
#[derive(Debug)]
pub struct TcpBackend {
    addr: String,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl TcpBackend {
    /// Backend for `addr` (`host:port`)
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Endpoint address
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Backend for TcpBackend {
    async fn is_alive(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(BackendError::Connect(format!("{}: {e}", self.addr))),
            Err(_) => Err(BackendError::Connect(format!(
                "{}: connect timed out after {:?}",
                self.addr, self.connect_timeout
            ))),
        }
    }

    async fn run_validation_query(&self, query: &str) -> Result<(), BackendError> {
        tracing::trace!(addr = %self.addr, query, "TCP backend cannot run queries, using connect check");
        self.is_alive().await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(addr = %self.addr, "TCP backend closed");
        }
    }
}

/// Builds [`TcpBackend`]s from replica specs
#[derive(Debug, Clone, Default)]
pub struct TcpBackendFactory;

#[async_trait]
impl BackendFactory for TcpBackendFactory {
    type Backend = TcpBackend;

    async fn create(&self, spec: &ReplicaSpec) -> Result<TcpBackend, BackendError> {
        let addr = parse_endpoint(&spec.url).map_err(|e| BackendError::Connect(e.to_string()))?;
        let connect_timeout = spec
            .pool
            .as_ref()
            .map(|pool| pool.connection_timeout_ms)
            .unwrap_or_else(|| PoolSettings::default().connection_timeout_ms);
        Ok(TcpBackend::new(addr, Duration::from_millis(connect_timeout)))
    }
}
