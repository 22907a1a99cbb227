//! Arbiter directory - registration, ratings and earnings
//!
//! Tracks every arbiter who has ever registered. Profiles accumulate case
//! counters, a truncated running-mean rating and an earnings balance; they
//! are never deleted, only deactivated.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use crate::access::AccessControlPolicy;
use crate::error::EscrowError;
use crate::events::{EscrowEventKind, EventPublisher};
use crate::fees::MAX_FEE_RATE_BPS;
use crate::models::{AccountId, ArbiterProfile, AssetKind};
use crate::transfer::ValueTransferAdapter;
use crate::EscrowResult;

/// Main arbiter directory
pub struct ArbiterDirectory {
    profiles: RwLock<HashMap<AccountId, ArbiterProfile>>,
    /// Accounts that have faced each arbiter, eligible to rate them
    interactions: RwLock<HashMap<AccountId, BTreeSet<AccountId>>>,
    policy: Arc<AccessControlPolicy>,
    adapter: Arc<dyn ValueTransferAdapter>,
    publisher: Arc<EventPublisher>,
}

impl ArbiterDirectory {
    pub fn new(
        policy: Arc<AccessControlPolicy>,
        adapter: Arc<dyn ValueTransferAdapter>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            interactions: RwLock::new(HashMap::new()),
            policy,
            adapter,
            publisher,
        }
    }

    /// Self-register as an arbiter with a declared, capped fee
    pub async fn register(&self, caller: &str, fee_bps: u16) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        if fee_bps > MAX_FEE_RATE_BPS {
            return Err(EscrowError::validation(format!(
                "declared fee {fee_bps} bps above the {MAX_FEE_RATE_BPS} bps cap"
            )));
        }
        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(caller) {
            return Err(EscrowError::validation(format!(
                "{caller} is already registered"
            )));
        }
        profiles.insert(caller.to_string(), ArbiterProfile::new(caller.to_string(), fee_bps));

        let payload = json!({ "arbiter": caller, "fee_bps": fee_bps });
        self.publisher
            .publish(EscrowEventKind::ArbiterRegistered, None, None, Some(caller), payload)
            .await;

        info!(arbiter = caller, fee_bps, "arbiter registered");
        Ok(())
    }

    /// Rate an arbiter 1-5; only parties who faced them, once each
    pub async fn rate(&self, arbiter: &str, rater: &str, rating: u8) -> EscrowResult<()> {
        self.policy.require_unpaused_for(rater).await?;
        if !(1..=5).contains(&rating) {
            return Err(EscrowError::validation("rating must be between 1 and 5"));
        }
        let eligible = self
            .interactions
            .read()
            .await
            .get(arbiter)
            .map(|parties| parties.contains(rater))
            .unwrap_or(false);
        if !eligible {
            return Err(EscrowError::authorization(format!(
                "{rater} has no case history with {arbiter}"
            )));
        }

        let mut profiles = self.profiles.write().await;
        let profile = Self::profile_mut(&mut profiles, arbiter)?;
        if !profile.raters.insert(rater.to_string()) {
            return Err(EscrowError::validation(format!(
                "{rater} already rated {arbiter}"
            )));
        }
        profile.apply_rating(rating);
        profile.updated_at = Utc::now();
        let mean = profile.rating_mean;
        let count = profile.rating_count;

        let payload = json!({
            "arbiter": arbiter,
            "rater": rater,
            "rating": rating,
            "rating_mean": mean,
            "rating_count": count,
        });
        self.publisher
            .publish(EscrowEventKind::ArbiterRated, None, None, Some(rater), payload)
            .await;

        info!(arbiter, rater, rating, mean, "arbiter rated");
        Ok(())
    }

    /// Pay out the accrued earnings balance and zero it
    pub async fn withdraw_earnings(&self, caller: &str) -> EscrowResult<u64> {
        self.policy.require_unpaused_for(caller).await?;
        let mut profiles = self.profiles.write().await;
        let profile = Self::profile_mut(&mut profiles, caller)?;
        if profile.earnings == 0 {
            return Err(EscrowError::validation("no earnings to withdraw"));
        }

        let amount = profile.earnings;
        profile.earnings = 0;
        profile.updated_at = Utc::now();

        // Earnings are denominated in the native unit
        if let Err(err) = self.adapter.transfer(caller, amount, &AssetKind::Native).await {
            Self::profile_mut(&mut profiles, caller)?.earnings = amount;
            return Err(err);
        }

        info!(arbiter = caller, amount, "earnings withdrawn");
        Ok(amount)
    }

    /// Deactivate a profile; the arbiter themselves or an admin
    pub async fn deactivate(&self, caller: &str, arbiter: &str) -> EscrowResult<()> {
        if caller != arbiter {
            self.policy.require_admin(caller).await?;
        }
        let mut profiles = self.profiles.write().await;
        let profile = Self::profile_mut(&mut profiles, arbiter)?;
        profile.active = false;
        profile.updated_at = Utc::now();
        info!(arbiter, "arbiter deactivated");
        Ok(())
    }

    /// Fetch a profile by account
    pub async fn get(&self, arbiter: &str) -> EscrowResult<ArbiterProfile> {
        self.profiles
            .read()
            .await
            .get(arbiter)
            .cloned()
            .ok_or_else(|| EscrowError::validation(format!("arbiter {arbiter} is not registered")))
    }

    /// Record that both parties of a case faced this arbiter
    pub(crate) async fn note_case_assigned(
        &self,
        arbiter: &str,
        parties: &[&str],
    ) -> EscrowResult<()> {
        let mut profiles = self.profiles.write().await;
        let profile = Self::profile_mut(&mut profiles, arbiter)?;
        profile.cases_assigned += 1;
        profile.updated_at = Utc::now();
        drop(profiles);

        let mut interactions = self.interactions.write().await;
        let faced = interactions.entry(arbiter.to_string()).or_default();
        for party in parties {
            faced.insert((*party).to_string());
        }
        Ok(())
    }

    /// Count a resolved case and credit the arbitration fee
    pub(crate) async fn note_case_resolved(&self, arbiter: &str, fee: u64) -> EscrowResult<()> {
        let mut profiles = self.profiles.write().await;
        let profile = Self::profile_mut(&mut profiles, arbiter)?;
        profile.cases_resolved += 1;
        profile.earnings = profile.earnings.saturating_add(fee);
        profile.updated_at = Utc::now();
        Ok(())
    }

    fn profile_mut<'a>(
        profiles: &'a mut HashMap<AccountId, ArbiterProfile>,
        arbiter: &str,
    ) -> EscrowResult<&'a mut ArbiterProfile> {
        profiles
            .get_mut(arbiter)
            .ok_or_else(|| EscrowError::validation(format!("arbiter {arbiter} is not registered")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::InMemoryBank;

    async fn setup() -> (ArbiterDirectory, Arc<InMemoryBank>) {
        let policy = Arc::new(AccessControlPolicy::new(["admin".to_string()]));
        let bank = Arc::new(InMemoryBank::new());
        let publisher = Arc::new(EventPublisher::new());
        (
            ArbiterDirectory::new(policy, bank.clone(), publisher),
            bank,
        )
    }

    #[tokio::test]
    async fn registration_is_capped_and_unique() {
        let (directory, _) = setup().await;
        assert!(directory.register("arb", 1_001).await.is_err());

        directory.register("arb", 150).await.unwrap();
        assert!(directory.register("arb", 150).await.is_err());

        let profile = directory.get("arb").await.unwrap();
        assert!(profile.active);
        assert_eq!(profile.fee_bps, 150);
    }

    #[tokio::test]
    async fn rating_requires_case_history_and_is_single_shot() {
        let (directory, _) = setup().await;
        directory.register("arb", 100).await.unwrap();

        let err = directory.rate("arb", "alice", 5).await;
        assert!(matches!(err, Err(EscrowError::Authorization(_))));

        directory
            .note_case_assigned("arb", &["alice", "bob"])
            .await
            .unwrap();
        assert!(directory.rate("arb", "alice", 0).await.is_err());
        assert!(directory.rate("arb", "alice", 6).await.is_err());

        directory.rate("arb", "alice", 5).await.unwrap();
        let err = directory.rate("arb", "alice", 1).await;
        assert!(matches!(err, Err(EscrowError::Validation(_))));

        directory.rate("arb", "bob", 2).await.unwrap();
        let profile = directory.get("arb").await.unwrap();
        // (5 + 2) / 2 truncates to 3
        assert_eq!(profile.rating_mean, 3);
        assert_eq!(profile.rating_count, 2);
    }

    #[tokio::test]
    async fn earnings_accrue_and_withdraw_once() {
        let (directory, bank) = setup().await;
        directory.register("arb", 100).await.unwrap();
        // Custody must hold the fee before it can be paid out
        bank.seed("payer", &AssetKind::Native, 5_000).await;
        bank.collect("payer", 5_000, &AssetKind::Native).await.unwrap();

        directory.note_case_resolved("arb", 5_000).await.unwrap();
        assert_eq!(directory.get("arb").await.unwrap().earnings, 5_000);

        let paid = directory.withdraw_earnings("arb").await.unwrap();
        assert_eq!(paid, 5_000);
        assert_eq!(bank.balance_of("arb", &AssetKind::Native).await, 5_000);

        let err = directory.withdraw_earnings("arb").await;
        assert!(matches!(err, Err(EscrowError::Validation(_))));
    }

    #[tokio::test]
    async fn deactivation_keeps_the_profile() {
        let (directory, _) = setup().await;
        directory.register("arb", 100).await.unwrap();

        assert!(directory.deactivate("mallory", "arb").await.is_err());
        directory.deactivate("arb", "arb").await.unwrap();

        let profile = directory.get("arb").await.unwrap();
        assert!(!profile.active);

        // Admin may also deactivate
        directory.register("other", 100).await.unwrap();
        directory.deactivate("admin", "other").await.unwrap();
    }
}
