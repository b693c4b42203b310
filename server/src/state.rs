//! Shared application state handed to every axum handler.

use crate::pending::PendingRequestTable;
use crate::registry::TunnelRegistry;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct AppState {
    pub registry: TunnelRegistry,
    pub pending: PendingRequestTable,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: TunnelRegistry::new(),
            pending: PendingRequestTable::new(),
            config: Arc::new(config),
        }
    }
}

/// Runtime configuration, assembled from CLI flags and the handful of
/// values left to the implementation (root host label, request timeout,
/// grace window, idle timeout, max body size).
pub struct ServerConfig {
    /// The label an incoming `Host` must match to be routed as the root
    /// operational surface rather than `<subdomain>.<root_host>`.
    pub root_host: String,
    /// How long the tunnel listener waits for an agent to answer a
    /// forwarded request before giving up.
    pub request_timeout: Duration,
    /// How long a disconnected agent's subdomain is held open for
    /// reattachment before being reaped.
    pub grace_window: Duration,
    /// How long a tunnel may go without traffic before the idle monitor
    /// reaps it.
    pub idle_timeout: Duration,
    /// Maximum accepted request body size; larger bodies are rejected
    /// with 413 before ever reaching an agent.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_host: std::env::var("BUNNEL_ROOT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            request_timeout: Duration::from_secs(30),
            grace_window: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(5 * 60),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}
