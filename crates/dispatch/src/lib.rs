//! Crisis-alert dispatch for Lifeline.
//!
//! This crate owns everything between "a crisis signal arrived" and "exactly
//! one therapist owns the session":
//! 1. The alert registry decides claims atomically, per alert
//! 2. Presence tracks which therapists have live connections
//! 3. The broadcast hub fans alerts out and answers claims
//! 4. Each connection buffers outbound frames with bounded backpressure
//!
//! # Architecture
//!
//! ```text
//! Crisis signal
//!      │
//!      ▼
//! ┌─────────────────┐   AlertEvent    ┌─────────────────┐
//! │  AlertRegistry  │ ──────────────► │  BroadcastHub   │ ──► SessionLauncher
//! └─────────────────┘                 └────────┬────────┘
//!          ▲  claim                            │ frames
//!          │                     ┌─────────────┼─────────────┐
//!          │                     ▼             ▼             ▼
//!          └────────────── [Connection]  [Connection]  [Connection]
//!                            therapist     therapist     therapist
//! ```

pub mod config;
pub mod connection;
pub mod hub;
pub mod presence;
pub mod registry;

pub use config::{AlertConfig, ConnectionConfig, DispatchConfig};
pub use connection::{Connection, ConnectionState, OutboundQueue};
pub use hub::{BroadcastHub, HubStats};
pub use presence::{PresenceTracker, TherapistPresence};
pub use registry::{AlertRegistry, RegistryStats};
