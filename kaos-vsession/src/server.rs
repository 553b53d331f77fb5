//! Server hub: namespaces over one shared configuration.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::registry::{memory_adapter, AdapterFactory, SessionRegistry};
use crate::session::VirtualSession;
use crate::transport::Connection;

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Name of the namespace [`Server::accept`] admits into.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Session server
pub struct Server {
    config: ServerConfig,
    namespaces: DashMap<String, Arc<SessionRegistry>>,
    adapter: AdapterFactory,
    #[cfg(feature = "metrics")]
    metrics: Option<Metrics>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        ServerBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// The namespace registry for `name`, created on first use. A missing
    /// leading `/` is added.
    pub fn of(&self, name: &str) -> Arc<SessionRegistry> {
        let name = normalize_namespace(name);
        self.namespaces
            .entry(name.clone())
            .or_insert_with(|| {
                trace_debug!("Creating namespace {}", name);
                Arc::new(self.build_registry(&name))
            })
            .value()
            .clone()
    }

    fn build_registry(&self, name: &str) -> SessionRegistry {
        // Config was validated by the builder.
        let registry = SessionRegistry::from_parts(name, self.config.session.clone(), &self.adapter);
        #[cfg(feature = "metrics")]
        let registry = match &self.metrics {
            Some(metrics) => registry.with_metrics(metrics.clone()),
            None => registry,
        };
        registry
    }

    /// The default namespace.
    pub fn sockets(&self) -> Arc<SessionRegistry> {
        self.of(DEFAULT_NAMESPACE)
    }

    /// Register a connection handler on the default namespace.
    pub fn on_connection<F>(&self, handler: F)
    where
        F: Fn(&Arc<VirtualSession>) + Send + Sync + 'static,
    {
        self.sockets().on_connection(handler);
    }

    /// Admit a newly opened connection into the default namespace.
    pub async fn accept(&self, conn: Arc<dyn Connection>) -> Result<Arc<VirtualSession>> {
        self.sockets().admit(conn).await
    }

    /// Admit a newly opened connection into namespace `name`.
    pub async fn accept_in(&self, name: &str, conn: Arc<dyn Connection>) -> Result<Arc<VirtualSession>> {
        self.of(name).admit(conn).await
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Live sessions across all namespaces.
    pub fn session_count(&self) -> usize {
        self.namespaces.iter().map(|entry| entry.value().len()).sum()
    }

    fn registries(&self) -> Vec<Arc<SessionRegistry>> {
        self.namespaces.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Run the ack-timeout sweep once over every namespace.
    pub fn reclaim_expired(&self) -> usize {
        let Some(timeout) = self.config.session.ack_timeout() else {
            return 0;
        };
        self.registries()
            .iter()
            .map(|registry| registry.reclaim_expired(timeout))
            .sum()
    }

    /// Disconnect every session of every namespace.
    pub fn close(&self) {
        for registry in self.registries() {
            registry.disconnect_all();
        }
    }

    /// Sweep expired acks every `reap_interval_ms` until the server is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.config.session.ack_timeout()?;
        let every = self.config.reap_interval();
        let server = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                server.reclaim_expired();
            }
        }))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("namespaces", &self.namespace_names())
            .field("sessions", &self.session_count())
            .finish()
    }
}

fn normalize_namespace(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// Server builder
pub struct ServerBuilder {
    config: ServerConfig,
    adapter: AdapterFactory,
    #[cfg(feature = "metrics")]
    metrics: Option<Metrics>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            adapter: memory_adapter(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_connections_per_session(mut self, max: usize) -> Self {
        self.config.session.max_connections_per_session = max;
        self
    }

    pub fn sequential_recv(mut self, enabled: bool) -> Self {
        self.config.session.sequential_recv = enabled;
        self
    }

    pub fn requeue_on_detach(mut self, enabled: bool) -> Self {
        self.config.session.requeue_on_detach = enabled;
        self
    }

    pub fn ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.session.ack_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.session.handshake_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn reap_interval(mut self, every: Duration) -> Self {
        self.config.reap_interval_ms = every.as_millis() as u64;
        self
    }

    /// Room adapter used by every namespace.
    pub fn adapter(mut self, factory: AdapterFactory) -> Self {
        self.adapter = factory;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        let server = Server {
            config: self.config,
            namespaces: DashMap::new(),
            adapter: self.adapter,
            #[cfg(feature = "metrics")]
            metrics: self.metrics,
        };
        server.of(DEFAULT_NAMESPACE);
        Ok(server)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VSessionError;

    #[test]
    fn test_namespaces_are_normalized() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let chat = server.of("chat");
        assert_eq!(chat.name(), "/chat");
        assert!(Arc::ptr_eq(&chat, &server.of("/chat")));
        assert_eq!(server.namespace_count(), 2);
        assert_eq!(server.sockets().name(), "/");
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_builder() {
        let server = ServerBuilder::new()
            .max_connections_per_session(3)
            .sequential_recv(false)
            .ack_timeout(None)
            .reap_interval(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(server.config().session.max_connections_per_session, 3);
        assert!(!server.config().session.sequential_recv);
        assert_eq!(server.config().reap_interval(), Duration::from_millis(250));
        assert_eq!(server.reclaim_expired(), 0);
    }

    #[test]
    fn test_debug_lists_namespaces() {
        let server = Server::new(ServerConfig::default()).unwrap();
        server.of("chat");
        let text = format!("{:?}", server);
        assert!(text.contains("\"/chat\""), "{}", text);
        assert!(text.contains("sessions: 0"), "{}", text);
    }

    #[test]
    fn test_builder_validates() {
        let err = ServerBuilder::new()
            .max_connections_per_session(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, VSessionError::Config { .. }));
    }
}
