//! Error types for the escrow engine
//!
//! One taxonomy for every operation: authorization, state machine,
//! validation, timing, signature, transfer and configuration faults.
//! Every error aborts the enclosing operation entirely; callers retry
//! after resolving the cause.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Caller lacks the role or party relationship the operation requires
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Operation is invalid for the record's current state
    #[error("Invalid state transition: {from} -> {to}: {reason}")]
    StateTransition {
        from: String,
        to: String,
        reason: String,
    },

    /// Malformed input: non-positive amounts, duplicate milestones,
    /// over-distribution, rates above cap
    #[error("Validation error: {0}")]
    Validation(String),

    /// Deadline not yet reached, or already passed
    #[error("Timing error: {0}")]
    Timing(String),

    /// Quorum signature faults: non-committee signer, insufficient distinct
    /// signatures, stale nonce, expired resolution
    #[error("Signature error: {0}")]
    Signature(String),

    /// Value movement failed; the enclosing operation commits nothing
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Settings or committee configuration rejected
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EscrowError {
    /// Create an authorization error
    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from: S, to: S, reason: S) -> Self {
        Self::StateTransition {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a timing error
    pub fn timing<S: Into<String>>(msg: S) -> Self {
        Self::Timing(msg.into())
    }

    /// Create a signature error
    pub fn signature<S: Into<String>>(msg: S) -> Self {
        Self::Signature(msg.into())
    }

    /// Create a transfer error
    pub fn transfer<S: Into<String>>(msg: S) -> Self {
        Self::Transfer(msg.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
}
