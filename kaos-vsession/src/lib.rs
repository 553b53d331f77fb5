//! # kaos-vsession
//!
//! Reconnect-resilient virtual sessions multiplexed over many physical connections.
//!
//! A peer identifies itself with a session token. Every physical connection that
//! presents the same token in a namespace is bound to one [`VirtualSession`], which
//! gives the application a single ordered event stream no matter how many
//! connections carry it or how often they are replaced.
//!
//! ## Features
//!
//! - **Identity admission**: new connections attach to an existing session or create one
//! - **Send scheduling**: one unacknowledged packet per connection, load spread across all
//! - **Priority retry**: failed sends are retried before ordinary traffic
//! - **Ordered receive**: sequence ids restore emission order across connections
//! - **Rooms**: pluggable [`RoomAdapter`] with an in-memory default
//!
//! ## Example
//!
//! ```rust,ignore
//! use kaos_vsession::ServerBuilder;
//!
//! let server = ServerBuilder::new()
//!     .max_connections_per_session(8)
//!     .sequential_recv(true)
//!     .build()?;
//!
//! server.on_connection(|session| {
//!     session.on("chat", |args| println!("chat: {args:?}"));
//! });
//!
//! // For each connection the transport layer accepts:
//! let session = server.accept(connection).await?;
//! session.emit("welcome", vec![])?;
//! ```
//!
//! ## Feature flags
//!
//! - `tracing` (default): log through the `tracing` crate
//! - `metrics`: Prometheus counters for sessions, connections and packets
//! - `telemetry`: `tracing-subscriber` setup helpers

// Tracing macros - no-op when feature disabled
#[cfg(feature = "tracing")]
macro_rules! trace_debug { ($($arg:tt)*) => { tracing::debug!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_info { ($($arg:tt)*) => { tracing::info!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_info { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_warn { ($($arg:tt)*) => { tracing::warn!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn { ($($arg:tt)*) => {} }

// Metrics recording - no-op when feature disabled
#[cfg(feature = "metrics")]
macro_rules! record {
    ($metrics:expr, $($call:tt)+) => {
        if let Some(m) = $metrics.as_ref() {
            m.$($call)+;
        }
    };
}
#[cfg(not(feature = "metrics"))]
macro_rules! record { ($($arg:tt)*) => {} }

pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod packet;
pub mod registry;
pub mod reorder;
pub mod room;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(feature = "telemetry")]
pub mod telemetry;

// Re-exports
pub use config::{ServerConfig, SessionConfig};
pub use error::{Result, VSessionError};
pub use events::Listeners;
pub use identity::SessionIdentity;
pub use packet::{Packet, PacketKind, Payload, SeqNum};
pub use registry::{memory_adapter, AdapterFactory, SessionRegistry, SessionTable};
pub use reorder::{Accepted, DeliveryMode, ReorderBuffer};
pub use room::{BroadcastOperator, BroadcastOptions, MemoryAdapter, RoomAdapter};
pub use scheduler::{AckCallback, Dispatch, Removal, Scheduler};
pub use server::{Server, ServerBuilder};
pub use session::{SessionState, SessionStats, VirtualSession};
pub use transport::{generate_connection_id, AckHandle, Connection, ConnectionId, ConnectionLink};

#[cfg(feature = "metrics")]
pub use metrics::Metrics;
#[cfg(feature = "telemetry")]
pub use telemetry::{init_tracing, TracingConfig};
