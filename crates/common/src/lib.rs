//! Common types shared across Lifeline crates.
//!
//! This crate holds the crisis-signal and alert domain model, the JSON wire
//! protocol spoken with therapist clients, and the collaborator traits the
//! dispatch core calls out to.

pub mod alert;
pub mod error;
pub mod ids;
pub mod message;
pub mod signal;
pub mod traits;

pub use alert::{Alert, AlertEvent, AlertStatus, ClaimResult};
pub use error::{LifelineError, Result};
pub use ids::{now_millis, AlertId, ConnectionId, TherapistId};
pub use message::{ClientMessage, ClientRole, RejectReason, ServerMessage};
pub use signal::{CrisisSignal, SeverityCategory, UrgencyTag, MAX_SEVERITY, MIN_SEVERITY};
pub use traits::{LoggingLauncher, SessionLauncher};
