//! Layered runtime settings
//!
//! Coded defaults, overlaid by an optional settings file, overlaid by
//! `TRUSTLOCK_*` environment variables. Validation happens once at load
//! so components can trust the values they are constructed with.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::EscrowError;
use crate::fees::MAX_FEE_RATE_BPS;
use crate::EscrowResult;

/// Every tunable the engine exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Accounts holding the admin role
    pub admins: Vec<String>,
    /// Settlement fee in basis points
    pub fee_rate_bps: u16,
    /// Account credited with settlement fees and dispute residuals
    pub fee_recipient: String,
    /// Ceiling on open escrows per creator
    pub max_open_escrows: u32,
    /// Seconds a dispute may sit unresolved before a party may cancel
    pub dispute_timeout_secs: u64,
    /// Standard fee for opening a dispute case
    pub case_fee: u64,
    /// Evidence window in seconds
    pub evidence_window_secs: u64,
    /// Review window in seconds
    pub review_window_secs: u64,
    /// Quorum committee: compressed SEC1 public keys, hex encoded
    pub quorum_committee: Vec<String>,
    /// Distinct committee signatures required per resolution
    pub quorum_threshold: usize,
    /// Account the quorum resolver settles through the ledger as
    pub quorum_authority: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            admins: vec!["admin".to_string()],
            fee_rate_bps: 250,
            fee_recipient: "treasury".to_string(),
            max_open_escrows: 32,
            dispute_timeout_secs: 7 * 24 * 3600,
            case_fee: 10_000,
            evidence_window_secs: 3 * 24 * 3600,
            review_window_secs: 7 * 24 * 3600,
            quorum_committee: vec![],
            quorum_threshold: 1,
            quorum_authority: "quorum".to_string(),
        }
    }
}

impl EngineSettings {
    /// Load settings: defaults, then an optional file, then the environment
    pub fn load(file: Option<&str>) -> EscrowResult<Self> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&Self::default()).map_err(cfg_err)?);
        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings: Self = builder
            .add_source(Environment::with_prefix("TRUSTLOCK"))
            .build()
            .map_err(cfg_err)?
            .try_deserialize()
            .map_err(cfg_err)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values no component would accept
    pub fn validate(&self) -> EscrowResult<()> {
        if self.admins.is_empty() {
            return Err(EscrowError::configuration("at least one admin is required"));
        }
        if self.fee_rate_bps > MAX_FEE_RATE_BPS {
            return Err(EscrowError::configuration(format!(
                "fee rate {} bps above the {} bps cap",
                self.fee_rate_bps, MAX_FEE_RATE_BPS
            )));
        }
        if !self.quorum_committee.is_empty()
            && (self.quorum_threshold == 0 || self.quorum_threshold > self.quorum_committee.len())
        {
            return Err(EscrowError::configuration(format!(
                "quorum threshold {} must satisfy 1 <= t <= committee size {}",
                self.quorum_threshold,
                self.quorum_committee.len()
            )));
        }
        Ok(())
    }
}

fn cfg_err(err: config::ConfigError) -> EscrowError {
    EscrowError::configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let settings = EngineSettings::load(None).unwrap();
        assert_eq!(settings.fee_rate_bps, 250);
        assert_eq!(settings.admins, vec!["admin".to_string()]);
        assert!(settings.quorum_committee.is_empty());
    }

    #[test]
    fn out_of_cap_fee_rate_is_rejected() {
        let settings = EngineSettings {
            fee_rate_bps: 1_500,
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn committee_must_cover_the_threshold() {
        let settings = EngineSettings {
            quorum_committee: vec!["aa".to_string()],
            quorum_threshold: 2,
            ..EngineSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
