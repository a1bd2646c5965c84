//! Error types for the tunnel relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("BandChain query error: {0}")]
    BandQuery(String),

    #[error("Chain connection error for chain {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("No data source returned a value")]
    NoGasData,

    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    #[error("Signing {signing_id} of tunnel {tunnel_id} sequence {sequence} has fallen")]
    SigningFallen {
        tunnel_id: u64,
        sequence: u64,
        signing_id: u64,
    },

    #[error("Signing {signing_id} of tunnel {tunnel_id} sequence {sequence} has unspecified status")]
    SigningUnspecified {
        tunnel_id: u64,
        sequence: u64,
        signing_id: u64,
    },

    #[error("Packet {sequence} of tunnel {tunnel_id} carries no signing")]
    MissingSigning { tunnel_id: u64, sequence: u64 },

    #[error("Tunnel {tunnel_id} did not advance past sequence {sequence} after relay")]
    SequenceNotAdvanced { tunnel_id: u64, sequence: u64 },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Insufficient balance on chain {chain}: {message}")]
    InsufficientBalance { chain: String, message: String },

    #[error("Relayer panicked: {0}")]
    Panic(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::BandQuery(_)
                | RelayerError::ChainConnection { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::Transaction(_)
                | RelayerError::SequenceNotAdvanced { .. }
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
