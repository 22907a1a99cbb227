//! Role- and party-based authorization checks
//!
//! Composable predicates invoked at operation entry: admin role,
//! arbitrator role, party membership, and the crate-wide pause switch.
//! Each check returns a typed failure rather than panicking or relying
//! on inheritance from a base type.

use std::collections::HashSet;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::EscrowError;
use crate::models::{AccountId, EscrowTerms};
use crate::EscrowResult;

/// Shared authorization policy for every engine component
pub struct AccessControlPolicy {
    admins: RwLock<HashSet<AccountId>>,
    arbitrators: RwLock<HashSet<AccountId>>,
    paused: RwLock<bool>,
}

impl AccessControlPolicy {
    /// Create a policy seeded with the initial admin set
    pub fn new<I: IntoIterator<Item = AccountId>>(admins: I) -> Self {
        Self {
            admins: RwLock::new(admins.into_iter().collect()),
            arbitrators: RwLock::new(HashSet::new()),
            paused: RwLock::new(false),
        }
    }

    /// Check the admin role
    pub async fn is_admin(&self, caller: &str) -> bool {
        self.admins.read().await.contains(caller)
    }

    /// Require the admin role
    pub async fn require_admin(&self, caller: &str) -> EscrowResult<()> {
        if self.is_admin(caller).await {
            Ok(())
        } else {
            Err(EscrowError::authorization(format!(
                "{caller} does not hold the admin role"
            )))
        }
    }

    /// Check the arbitrator role
    pub async fn has_arbitrator_role(&self, caller: &str) -> bool {
        self.arbitrators.read().await.contains(caller)
    }

    /// Grant the arbitrator role (admin only)
    pub async fn grant_arbitrator_role(&self, caller: &str, account: &str) -> EscrowResult<()> {
        self.require_admin(caller).await?;
        self.arbitrators.write().await.insert(account.to_string());
        info!(account, "granted arbitrator role");
        Ok(())
    }

    /// Revoke the arbitrator role (admin only)
    pub async fn revoke_arbitrator_role(&self, caller: &str, account: &str) -> EscrowResult<()> {
        self.require_admin(caller).await?;
        self.arbitrators.write().await.remove(account);
        info!(account, "revoked arbitrator role");
        Ok(())
    }

    /// Require the caller to be the buyer or the seller of the given terms
    pub fn require_party(terms: &EscrowTerms, caller: &str) -> EscrowResult<()> {
        if terms.is_party(caller) {
            Ok(())
        } else {
            Err(EscrowError::authorization(format!(
                "{caller} is not a party to this escrow"
            )))
        }
    }

    /// Whether the pause switch is active
    pub async fn is_paused(&self) -> bool {
        *self.paused.read().await
    }

    /// Gate for state-changing operations: admins pass even while paused
    pub async fn require_unpaused_for(&self, caller: &str) -> EscrowResult<()> {
        if *self.paused.read().await && !self.is_admin(caller).await {
            Err(EscrowError::authorization(
                "engine is paused for non-admin operations",
            ))
        } else {
            Ok(())
        }
    }

    /// Block all non-admin state-changing operations (admin only)
    pub async fn pause(&self, caller: &str) -> EscrowResult<()> {
        self.require_admin(caller).await?;
        *self.paused.write().await = true;
        info!("engine paused");
        Ok(())
    }

    /// Lift the pause (admin only)
    pub async fn unpause(&self, caller: &str) -> EscrowResult<()> {
        self.require_admin(caller).await?;
        *self.paused.write().await = false;
        info!("engine unpaused");
        Ok(())
    }
}
