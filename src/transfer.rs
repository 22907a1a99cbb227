//! Value movement seam between the engine and its balance substrate
//!
//! The engine never touches balances directly; every settlement path goes
//! through a `ValueTransferAdapter`. A call that returns an error means no
//! value moved and the enclosing operation must commit nothing.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::EscrowError;
use crate::models::AssetKind;
use crate::EscrowResult;

/// Adapter over the account-balance substrate
#[async_trait]
pub trait ValueTransferAdapter: Send + Sync {
    /// Pull value from a payer into escrow custody
    async fn collect(&self, payer: &str, amount: u64, asset: &AssetKind) -> EscrowResult<()>;

    /// Push custody value out to a recipient
    async fn transfer(&self, recipient: &str, amount: u64, asset: &AssetKind) -> EscrowResult<()>;
}

#[derive(Default)]
struct BankState {
    /// (account, asset key) -> balance
    balances: HashMap<(String, String), u64>,
    /// asset key -> value currently held in custody
    custody: HashMap<String, u64>,
}

/// In-memory balance substrate for tests and local runs
///
/// One lock over both tables keeps collect/transfer atomic.
#[derive(Default)]
pub struct InMemoryBank {
    state: RwLock<BankState>,
}

impl InMemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an account out of thin air
    pub async fn seed(&self, account: &str, asset: &AssetKind, amount: u64) {
        let mut state = self.state.write().await;
        *state
            .balances
            .entry((account.to_string(), asset.key()))
            .or_insert(0) += amount;
    }

    /// Current free balance of an account
    pub async fn balance_of(&self, account: &str, asset: &AssetKind) -> u64 {
        self.state
            .read()
            .await
            .balances
            .get(&(account.to_string(), asset.key()))
            .copied()
            .unwrap_or(0)
    }

    /// Value currently held in custody for an asset
    pub async fn custody_balance(&self, asset: &AssetKind) -> u64 {
        self.state
            .read()
            .await
            .custody
            .get(&asset.key())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ValueTransferAdapter for InMemoryBank {
    async fn collect(&self, payer: &str, amount: u64, asset: &AssetKind) -> EscrowResult<()> {
        let mut state = self.state.write().await;
        let key = (payer.to_string(), asset.key());
        let balance = state.balances.get(&key).copied().unwrap_or(0);
        if balance < amount {
            return Err(EscrowError::transfer(format!(
                "{payer} holds {balance}, cannot supply {amount}"
            )));
        }
        state.balances.insert(key, balance - amount);
        *state.custody.entry(asset.key()).or_insert(0) += amount;
        debug!(payer, amount, asset = %asset.key(), "collected into custody");
        Ok(())
    }

    async fn transfer(&self, recipient: &str, amount: u64, asset: &AssetKind) -> EscrowResult<()> {
        let mut state = self.state.write().await;
        let held = state.custody.get(&asset.key()).copied().unwrap_or(0);
        if held < amount {
            return Err(EscrowError::transfer(format!(
                "custody holds {held}, cannot release {amount}"
            )));
        }
        state.custody.insert(asset.key(), held - amount);
        *state
            .balances
            .entry((recipient.to_string(), asset.key()))
            .or_insert(0) += amount;
        debug!(recipient, amount, asset = %asset.key(), "released from custody");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_then_release_round_trips() {
        let bank = InMemoryBank::new();
        bank.seed("alice", &AssetKind::Native, 1_000).await;

        bank.collect("alice", 400, &AssetKind::Native).await.unwrap();
        assert_eq!(bank.balance_of("alice", &AssetKind::Native).await, 600);
        assert_eq!(bank.custody_balance(&AssetKind::Native).await, 400);

        bank.transfer("bob", 400, &AssetKind::Native).await.unwrap();
        assert_eq!(bank.balance_of("bob", &AssetKind::Native).await, 400);
        assert_eq!(bank.custody_balance(&AssetKind::Native).await, 0);
    }

    #[tokio::test]
    async fn insufficient_balance_moves_nothing() {
        let bank = InMemoryBank::new();
        bank.seed("alice", &AssetKind::Native, 100).await;

        let err = bank.collect("alice", 101, &AssetKind::Native).await;
        assert!(matches!(err, Err(EscrowError::Transfer(_))));
        assert_eq!(bank.balance_of("alice", &AssetKind::Native).await, 100);
        assert_eq!(bank.custody_balance(&AssetKind::Native).await, 0);
    }

    #[tokio::test]
    async fn assets_are_segregated() {
        let bank = InMemoryBank::new();
        let token = AssetKind::Token {
            denom: "usd".to_string(),
        };
        bank.seed("alice", &token, 500).await;

        assert!(bank.collect("alice", 500, &AssetKind::Native).await.is_err());
        bank.collect("alice", 500, &token).await.unwrap();
        assert_eq!(bank.custody_balance(&token).await, 500);
        assert_eq!(bank.custody_balance(&AssetKind::Native).await, 0);
    }
}
