//! # calsync-stream - Real-time change stream for calendar clients
//!
//! An ordered, durable change log and a resumable push stream that keep
//! many calendar clients consistent with one shared event store.
//!
//! ## Architecture
//!
//! ```text
//!  entity store                                    ┌─────────────┐
//!      │ append                                    │ SyncClient  │
//!      ▼                      WebSocket, JSON      │ cursor      │
//! ┌─────────────┐    ┌─────────────┐  frames       │ backoff     │
//! │ UpdateLog   │───►│ SyncService │ ─────────────►│ DedupGuard  │
//! │ (ids 1,2,3) │    │ backlog +   │  ?since=<id>  └──────┬──────┘
//! └──────┬──────┘    │ live push   │ ◄──────────────      │
//!        │           └─────────────┘                      ▼
//! ┌──────┴──────┐                                  ┌─────────────┐
//! │ LogBackend  │                                  │ EventBus    │
//! │ Rocks / Mem │                                  │ (UI side)   │
//! └─────────────┘                                  └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Record types and the JSON frame format
//! - [`storage`]: Durable and in-memory record backends
//! - [`update_log`]: Totally ordered append/query/prune log
//! - [`broadcast`]: Non-blocking fan-out to live connections
//! - [`server`]: Streaming endpoint with heartbeats and reconnect directives
//! - [`client`]: Resumable stream client with exponential backoff
//! - [`dedup`]: Short-window duplicate suppression
//! - [`pubsub`]: Synchronous typed event bus

pub mod broadcast;
pub mod client;
pub mod dedup;
pub mod protocol;
pub mod pubsub;
pub mod server;
pub mod storage;
pub mod update_log;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ListenerInfo};
pub use client::{ClientConfig, ClientError, ConnectionState, ReconnectPolicy, SyncClient, SyncEvent};
pub use dedup::{DedupGuard, DedupKey, DeliveryChannel};
pub use protocol::{Frame, FrameEvent, ProtocolError, UpdateKind, UpdateRecord};
pub use pubsub::{EventBus, SubscriptionId};
pub use server::{AllowAll, ConnectionGate, ServerConfig, ServerError, ServerStats, SyncService};
pub use storage::{LogBackend, MemoryBackend, RocksBackend, StoreConfig, StoreError};
pub use update_log::{LogError, LogStats, UpdateLog};
