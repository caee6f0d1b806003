//! # folio-live: Edit path and live-update pipeline for Folio
//!
//! Builds on [`folio_store`] to provide the Snapshot Policy Engine, the
//! Session Tracker, the Access Gate and the change pipeline that turns
//! committed row changes into live updates on every connection of the
//! owning user.
//!
//! ```text
//!   browser ── HTTP ──► api ──► policy / session / gate ──► DocumentStore
//!                                                              │ change rows
//!                                                              ▼
//!   browser ◄── WS ── server ◄── fanout ◄── broker ◄──── relay (signed)
//! ```
//!
//! ## Modules
//!
//! - [`policy`]: Snapshot policy and edit recording
//! - [`session`]: Edit session lifecycle and idle sweeping
//! - [`gate`]: Access checks, revocation and the audit log
//! - [`archival`]: Copying superseded content to the archive
//! - [`relay`]: Change feed → signed broker messages
//! - [`broker`]: Pub/sub hub and its client
//! - [`fanout`]: Broker topic → live connections of the owner
//! - [`server`]: Live WebSocket endpoint
//! - [`api`]: Edit, admin and ingest HTTP routes
//! - [`janitor`]: Periodic maintenance

pub mod api;
pub mod archival;
pub mod broadcast;
pub mod broker;
pub mod config;
pub mod error;
pub mod fanout;
pub mod gate;
pub mod janitor;
pub mod policy;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod services;
pub mod session;

pub use api::{build_app, AppState};
pub use archival::{ArchiveStatus, Archiver, ContentSource};
pub use broker::{Backoff, BrokerConfig, BrokerConnection, BrokerHub, BrokerPublisher};
pub use config::Config;
pub use error::{BrokerError, EditError, RelayError};
pub use fanout::{ConnectionRegistry, LiveFanout};
pub use gate::{AccessGate, CallerMeta, Decision};
pub use janitor::Janitor;
pub use policy::{SnapshotEngine, SnapshotPolicy};
pub use protocol::{ChangeSigner, LiveMessage};
pub use relay::{NotificationRelay, RelayConfig};
pub use server::LiveServer;
pub use services::Services;
pub use session::SessionTracker;
