//! Error types for the yield rebalancing agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Quote error: {0}")]
    Quote(String),

    #[error("Custody error: {0}")]
    Custody(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Rebalance {0} already reached a terminal status")]
    TerminalStatus(String),

    #[error("Cycle already in progress for agent {0}")]
    CycleInProgress(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
