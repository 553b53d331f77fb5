//! Per-namespace session registry and connection admission.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::{Result, VSessionError};
use crate::events::{is_reserved, Listeners, NAMESPACE_RESERVED};
use crate::identity::SessionIdentity;
use crate::room::{BroadcastOperator, BroadcastOptions, MemoryAdapter, RoomAdapter};
use crate::session::{SessionContext, VirtualSession};
use crate::transport::Connection;

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Live sessions of one namespace, keyed by identity.
pub type SessionTable = DashMap<SessionIdentity, Arc<VirtualSession>>;

/// Builds the room adapter of a namespace from its session table.
pub type AdapterFactory = Arc<dyn Fn(Weak<SessionTable>) -> Arc<dyn RoomAdapter> + Send + Sync>;

/// Factory for the in-process [`MemoryAdapter`].
pub fn memory_adapter() -> AdapterFactory {
    Arc::new(|sessions| Arc::new(MemoryAdapter::new(sessions)) as Arc<dyn RoomAdapter>)
}

/// Session registry for one namespace
pub struct SessionRegistry {
    sessions: Arc<SessionTable>,
    ctx: Arc<SessionContext>,
    listeners: Listeners<Arc<VirtualSession>>,
}

impl SessionRegistry {
    pub fn new(name: impl Into<String>, config: SessionConfig) -> Result<Self> {
        Self::with_adapter(name, config, &memory_adapter())
    }

    pub fn with_adapter(name: impl Into<String>, config: SessionConfig, factory: &AdapterFactory) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(name, config, factory))
    }

    /// Build without validating `config`.
    pub(crate) fn from_parts(name: impl Into<String>, config: SessionConfig, factory: &AdapterFactory) -> Self {
        let sessions = Arc::new(SessionTable::new());
        let ctx = SessionContext {
            namespace: name.into(),
            config,
            adapter: factory(Arc::downgrade(&sessions)),
            table: Arc::downgrade(&sessions),
            #[cfg(feature = "metrics")]
            metrics: None,
        };
        Self {
            sessions,
            ctx: Arc::new(ctx),
            listeners: Listeners::new(),
        }
    }

    /// Record into `metrics`. Must be called before any connection is admitted.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.ctx = Arc::new(SessionContext {
            metrics: Some(metrics),
            ..(*self.ctx).clone()
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.ctx.namespace
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn adapter(&self) -> &Arc<dyn RoomAdapter> {
        &self.ctx.adapter
    }

    /// Called once per new session, after its first connection attached.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(&Arc<VirtualSession>) + Send + Sync + 'static,
    {
        self.listeners.on("connect", handler);
    }

    /// Alias of [`on_connect`](Self::on_connect), fired right after it.
    pub fn on_connection<F>(&self, handler: F)
    where
        F: Fn(&Arc<VirtualSession>) + Send + Sync + 'static,
    {
        self.listeners.on("connection", handler);
    }

    pub fn get(&self, identity: &str) -> Option<Arc<VirtualSession>> {
        self.sessions.get(identity).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn identities(&self) -> Vec<SessionIdentity> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<VirtualSession>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Resolve the identity of a newly opened connection and bind it to its
    /// session, creating the session if this identity is new here.
    pub async fn admit(&self, conn: Arc<dyn Connection>) -> Result<Arc<VirtualSession>> {
        let conn_id = conn.id();
        let token = match self.ctx.config.handshake_timeout() {
            Some(limit) => match tokio::time::timeout(limit, conn.request_identity()).await {
                Ok(token) => token,
                Err(_) => {
                    trace_warn!("Handshake timed out for connection {} in {}", conn_id, self.name());
                    record!(self.ctx.metrics, handshakes_abandoned.inc());
                    conn.close();
                    return Err(VSessionError::HandshakeTimeout { connection: conn_id });
                }
            },
            None => conn.request_identity().await,
        };

        let token = match token {
            Some(token) if conn.is_open() => token,
            _ => {
                trace_debug!("Connection {} closed before identifying", conn_id);
                record!(self.ctx.metrics, handshakes_abandoned.inc());
                return Err(VSessionError::HandshakeAbandoned { connection: conn_id });
            }
        };

        let identity = match SessionIdentity::new(token) {
            Ok(identity) => identity,
            Err(e) => {
                trace_warn!("Connection {} presented an invalid identity", conn_id);
                conn.close();
                return Err(e);
            }
        };

        loop {
            let (session, created) = self.get_or_create(&identity);
            if created {
                if let Err(_e) = session.join(identity.as_str()) {
                    trace_warn!("Session {} could not join its own room: {}", identity, _e);
                }
            }

            match session.attach(conn.clone()) {
                Ok(()) if created => {
                    if !session.mark_announced() {
                        // Closed during attach; it already deregistered.
                        return Err(VSessionError::HandshakeAbandoned { connection: conn_id });
                    }
                    self.announce(&session);
                    return Ok(session);
                }
                Ok(()) => {
                    trace_debug!("Connection {} joined existing session {}", conn_id, identity);
                    return Ok(session);
                }
                // Lost a race with the session's last detach; start over.
                Err(VSessionError::SessionClosed { .. }) => {
                    self.sessions
                        .remove_if(&identity, |_, current| Arc::ptr_eq(current, &session));
                }
                Err(e) => {
                    if created {
                        // Never had a connection; nobody may find it.
                        session.discard();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn get_or_create(&self, identity: &SessionIdentity) -> (Arc<VirtualSession>, bool) {
        match self.sessions.entry(identity.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let session = VirtualSession::new(identity.clone(), self.ctx.clone());
                entry.insert(session.clone());
                (session, true)
            }
        }
    }

    fn announce(&self, session: &Arc<VirtualSession>) {
        trace_info!("Session {} connected to {}", session.identity(), self.name());
        record!(self.ctx.metrics, sessions_total.inc());
        self.listeners.fire("connect", session);
        self.listeners.fire("connection", session);
    }

    pub fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        BroadcastOperator::new(self.ctx.adapter.clone(), BroadcastOptions::default(), NAMESPACE_RESERVED).to(room)
    }

    pub fn in_room(&self, room: impl Into<String>) -> BroadcastOperator {
        self.to(room)
    }

    /// Send an event to every session of the namespace.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<usize> {
        if is_reserved(NAMESPACE_RESERVED, event) {
            return Err(VSessionError::reserved(event));
        }
        BroadcastOperator::new(self.ctx.adapter.clone(), BroadcastOptions::default(), NAMESPACE_RESERVED)
            .emit(event, args)
    }

    /// Always fails with [`VSessionError::CallbackOnBroadcast`].
    pub fn emit_with_ack<F>(&self, _event: &str, _args: Vec<Value>, _on_ack: F) -> Result<usize>
    where
        F: FnOnce(&[Value]) + Send + 'static,
    {
        Err(VSessionError::CallbackOnBroadcast)
    }

    pub fn send(&self, args: Vec<Value>) -> Result<usize> {
        self.emit("message", args)
    }

    pub fn write(&self, args: Vec<Value>) -> Result<usize> {
        self.send(args)
    }

    /// Reclaim dispatches waiting longer than `timeout` for an ack, in every
    /// session. Returns how many packets were requeued.
    pub fn reclaim_expired(&self, timeout: Duration) -> usize {
        self.snapshot()
            .iter()
            .map(|session| session.reclaim_expired(timeout))
            .sum()
    }

    /// Disconnect every session of the namespace.
    pub fn disconnect_all(&self) {
        for session in self.snapshot() {
            session.disconnect();
        }
    }

    /// Run the ack-timeout sweep every `every` until the registry is dropped.
    /// Returns `None` when no ack timeout is configured.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        let timeout = self.ctx.config.ack_timeout()?;
        let registry = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let _reclaimed = registry.reclaim_expired(timeout);
                if _reclaimed > 0 {
                    trace_debug!("Reclaimed {} expired dispatches in {}", _reclaimed, registry.name());
                }
            }
        }))
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("name", &self.ctx.namespace)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use crate::transport::{generate_connection_id, AckHandle, ConnectionId, ConnectionLink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Answering {
        id: ConnectionId,
        token: String,
        open: AtomicBool,
    }

    impl Answering {
        fn new(token: &str) -> Arc<Self> {
            Arc::new(Self {
                id: generate_connection_id(),
                token: token.to_string(),
                open: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl Connection for Answering {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn request_identity(&self) -> Option<String> {
            Some(self.token.clone())
        }

        fn bind(&self, _link: ConnectionLink) {}

        fn send(&self, _packet: &Packet, _ack: AckHandle) -> std::io::Result<()> {
            Ok(())
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_constructors_validate_config() {
        let config = SessionConfig {
            max_connections_per_session: 0,
            ..SessionConfig::default()
        };
        let err = SessionRegistry::new("/", config.clone()).unwrap_err();
        assert!(matches!(err, VSessionError::Config { .. }));
        assert!(SessionRegistry::with_adapter("/", config, &memory_adapter()).is_err());
    }

    #[tokio::test]
    async fn test_failed_first_attach_leaves_no_session() {
        let config = SessionConfig {
            max_connections_per_session: 0,
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::from_parts("/", config, &memory_adapter());
        let conn = Answering::new("o");

        let err = registry.admit(conn.clone()).await.unwrap_err();
        assert!(matches!(err, VSessionError::AdmissionRejected { max: 0, .. }));
        assert!(!conn.is_open());
        assert!(registry.is_empty());
        assert!(registry.get("o").is_none());
        assert!(registry.adapter().clients("o").is_empty());
    }

    #[tokio::test]
    async fn test_connect_fires_once_per_session() {
        let registry = SessionRegistry::new("/", SessionConfig::default()).unwrap();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        registry.on_connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let first = registry.admit(Answering::new("a")).await.unwrap();
        let again = registry.admit(Answering::new("a")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_namespace_broadcast_rules() {
        let registry = SessionRegistry::new("/chat", SessionConfig::default()).unwrap();
        assert_eq!(registry.name(), "/chat");
        assert!(matches!(registry.emit("connection", vec![]), Err(VSessionError::ReservedEvent(_))));
        assert!(matches!(
            registry.emit_with_ack("chat", vec![], |_| {}),
            Err(VSessionError::CallbackOnBroadcast)
        ));
        // Nobody connected yet.
        assert_eq!(registry.send(vec![]).unwrap(), 0);
        assert_eq!(registry.to("lobby").emit("chat", vec![]).unwrap(), 0);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = SessionRegistry::new("/", SessionConfig::default()).unwrap();
        let id = SessionIdentity::new("abc").unwrap();
        let (first, created) = registry.get_or_create(&id);
        assert!(created);
        let (second, created) = registry.get_or_create(&id);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.identities(), vec![id]);
    }

    #[tokio::test]
    async fn test_reaper_needs_ack_timeout() {
        let config = SessionConfig {
            ack_timeout_ms: None,
            ..SessionConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new("/", config).unwrap());
        assert!(registry.spawn_reaper(Duration::from_millis(10)).is_none());

        let registry = Arc::new(SessionRegistry::new("/", SessionConfig::default()).unwrap());
        let handle = registry.spawn_reaper(Duration::from_millis(10)).unwrap();
        drop(registry);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
