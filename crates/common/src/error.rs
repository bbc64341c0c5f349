//! Error types for Lifeline.
//!
//! Claim races and unknown alert ids are not errors; they are ordinary
//! [`ClaimResult`](crate::ClaimResult) values.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifelineError {
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Session launcher error: {0}")]
    Launcher(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LifelineError>;
