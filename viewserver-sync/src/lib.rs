//! # viewserver-sync — Subscriptions, delivery and transport
//!
//! Connects the grid state in `viewserver-core` to subscribers and to the
//! upstream event stream.
//!
//! ## Architecture
//!
//! ```text
//!  event stream ──► IngestionAdapter ──► DeltaFanout ──► SubscriptionRegistry
//!                        │                   │                   │
//!                        ▼                   ▼                   ▼
//!                   GridRegistry ◄──── GridView           SubscriberHandle
//!                        ▲                                      ▲
//!                        │                                      │
//!  WebSocket ──► ViewServer ──► ViewService::connect ──► SnapshotDelivery
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages and upstream event shapes
//! - [`subscription`] — View ↔ handle registry with fan-out
//! - [`handle`] — Bounded-channel subscriber handle
//! - [`snapshot`] — Chunked full-view transfer
//! - [`fanout`] — Apply, split and broadcast change batches
//! - [`ingest`] — Event stream adapter with processing statistics
//! - [`service`] — Context object wiring the components together
//! - [`server`] — WebSocket transport adapter

pub mod error;
pub mod fanout;
pub mod handle;
pub mod ingest;
pub mod protocol;
pub mod server;
pub mod service;
pub mod snapshot;
pub mod subscription;

pub use error::{TransportError, ViewServerError};
pub use fanout::{ApplyPolicy, DeltaFanout, FanoutReport};
pub use handle::ChannelHandle;
pub use ingest::{IngestConfig, IngestOutcome, IngestionAdapter, ProcessingStats};
pub use protocol::{OutboundMessage, Payload, ProtocolError};
pub use server::{ServerConfig, ServerStats, ViewServer};
pub use service::{SeedPolicy, ServiceConfig, ServiceStats, ViewService};
pub use snapshot::{SnapshotConfig, SnapshotDelivery, SnapshotReport, SnapshotState};
pub use subscription::{
    BroadcastOutcome, HandleId, SessionStats, SubscriberHandle, SubscriptionRegistry,
};
