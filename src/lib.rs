//! Escrow settlement engine for two-party trades
//!
//! This crate holds value in trust between a buyer and a seller and releases
//! it on mutual consent, milestone completion, or third-party adjudication:
//! - `ledger` owns the escrow state machine and every settlement path
//! - `disputes` runs evidence collection and single-arbiter resolution
//! - `quorum` applies threshold-signed resolutions exactly once
//! - `transfer` is the seam to the value-movement substrate

pub mod access;
pub mod arbiters;
pub mod disputes;
pub mod engine;
pub mod error;
pub mod events;
pub mod fees;
pub mod ledger;
pub mod milestones;
pub mod models;
pub mod quorum;
pub mod settings;
pub mod transfer;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
