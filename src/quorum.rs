//! Quorum-signed settlement of disputed escrows
//!
//! A fixed committee signs a canonical resolution message off-path; this
//! resolver verifies a threshold of distinct committee signatures and
//! applies the resolution exactly once. Replay is blocked by a per-escrow
//! nonce that increments on every applied resolution. The resolver never
//! moves funds itself: settlement delegates to the ledger's own dispute
//! resolution entry point under the configured authority account.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;

use crate::access::AccessControlPolicy;
use crate::error::EscrowError;
use crate::events::{EscrowEventKind, EventPublisher};
use crate::ledger::EscrowLedger;
use crate::models::{AccountId, QuorumResolution};
use crate::EscrowResult;

/// Domain tag mixed into every resolution digest
const DIGEST_DOMAIN: &[u8] = b"TRUSTLOCK/quorum-v1";

impl QuorumResolution {
    /// Canonical domain-separated digest of the resolution fields
    ///
    /// Fixed-width big-endian integers, length-prefixed winner, unix
    /// seconds for the deadline. Signers hash exactly this.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(DIGEST_DOMAIN);
        hasher.update(self.escrow_id.to_be_bytes());
        hasher.update((self.winner.len() as u64).to_be_bytes());
        hasher.update(self.winner.as_bytes());
        hasher.update(self.buyer_amount.to_be_bytes());
        hasher.update(self.seller_amount.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(self.deadline.timestamp().to_be_bytes());
        hasher.finalize().into()
    }
}

/// Produce a 65-byte recoverable signature (r || s || recovery id) over a
/// resolution, for committee tooling and tests
pub fn sign_resolution(
    secp: &Secp256k1<All>,
    resolution: &QuorumResolution,
    secret: &SecretKey,
) -> Vec<u8> {
    let message = Message::from_digest(resolution.digest());
    let signature = secp.sign_ecdsa_recoverable(&message, secret);
    let (recovery_id, data) = signature.serialize_compact();
    let mut raw = Vec::with_capacity(65);
    raw.extend_from_slice(&data);
    raw.push(recovery_id.to_i32() as u8);
    raw
}

/// Configuration for the quorum resolver
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Compressed SEC1 public keys, hex encoded
    pub committee: Vec<String>,
    /// Distinct committee signatures required per resolution
    pub threshold: usize,
    /// Account the resolver settles through the ledger as
    pub authority: AccountId,
}

struct QuorumState {
    committee: BTreeSet<String>,
    threshold: usize,
    /// Next expected nonce per escrow; absent means zero
    nonces: HashMap<u64, u64>,
    /// Escrows already settled through this path
    resolved: BTreeSet<u64>,
}

/// Main quorum resolver
pub struct QuorumResolver {
    secp: Secp256k1<All>,
    authority: AccountId,
    state: RwLock<QuorumState>,
    ledger: Arc<EscrowLedger>,
    policy: Arc<AccessControlPolicy>,
    publisher: Arc<EventPublisher>,
}

impl QuorumResolver {
    /// Create a resolver; committee keys must parse and satisfy the threshold
    pub fn new(
        config: QuorumConfig,
        ledger: Arc<EscrowLedger>,
        policy: Arc<AccessControlPolicy>,
        publisher: Arc<EventPublisher>,
    ) -> EscrowResult<Self> {
        let committee = Self::parse_committee(&config.committee)?;
        if config.threshold == 0 || config.threshold > committee.len() {
            return Err(EscrowError::configuration(format!(
                "threshold {} must satisfy 1 <= t <= committee size {}",
                config.threshold,
                committee.len()
            )));
        }
        Ok(Self {
            secp: Secp256k1::new(),
            authority: config.authority,
            state: RwLock::new(QuorumState {
                committee,
                threshold: config.threshold,
                nonces: HashMap::new(),
                resolved: BTreeSet::new(),
            }),
            ledger,
            policy,
            publisher,
        })
    }

    /// Apply a committee-signed resolution, exactly once per escrow
    ///
    /// `caller` is whoever relays the bundle; authorization comes from the
    /// signatures, the pause gate still applies to the relayer.
    pub async fn resolve_with_signatures(
        &self,
        caller: &str,
        resolution: &QuorumResolution,
        signatures: &[Vec<u8>],
    ) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let mut state = self.state.write().await;

        if signatures.len() < state.threshold {
            return Err(EscrowError::signature(format!(
                "{} signatures supplied, {} required",
                signatures.len(),
                state.threshold
            )));
        }
        if Utc::now() > resolution.deadline {
            return Err(EscrowError::signature("resolution has expired"));
        }
        if state.resolved.contains(&resolution.escrow_id) {
            return Err(EscrowError::signature(format!(
                "escrow {} already resolved by quorum",
                resolution.escrow_id
            )));
        }
        let expected = state
            .nonces
            .get(&resolution.escrow_id)
            .copied()
            .unwrap_or(0);
        if resolution.nonce != expected {
            return Err(EscrowError::signature(format!(
                "stale nonce {} (expected {})",
                resolution.nonce, expected
            )));
        }

        let message = Message::from_digest(resolution.digest());
        let mut signers: BTreeSet<String> = BTreeSet::new();
        for raw in signatures {
            let signer = self.recover_signer(&message, raw)?;
            if !state.committee.contains(&signer) {
                return Err(EscrowError::signature(format!(
                    "signer {signer} is not a committee member"
                )));
            }
            signers.insert(signer);
        }
        if signers.len() < state.threshold {
            return Err(EscrowError::signature(format!(
                "only {} distinct committee signers, {} required",
                signers.len(),
                state.threshold
            )));
        }

        // Commit the replay guard, then settle through the ledger; a refused
        // settlement rolls the guard back so the operation commits nothing
        state.resolved.insert(resolution.escrow_id);
        state.nonces.insert(resolution.escrow_id, expected + 1);
        let settled = self
            .ledger
            .resolve_dispute(
                resolution.escrow_id,
                &self.authority,
                &resolution.winner,
                resolution.buyer_amount,
                resolution.seller_amount,
            )
            .await;
        if let Err(err) = settled {
            state.resolved.remove(&resolution.escrow_id);
            state.nonces.insert(resolution.escrow_id, expected);
            return Err(err);
        }

        let payload = json!({
            "escrow_id": resolution.escrow_id,
            "winner": resolution.winner,
            "buyer_amount": resolution.buyer_amount,
            "seller_amount": resolution.seller_amount,
            "nonce": resolution.nonce,
            "distinct_signers": signers.len(),
        });
        self.publisher
            .publish(
                EscrowEventKind::QuorumResolutionApplied,
                Some(resolution.escrow_id),
                None,
                Some(caller),
                payload,
            )
            .await;

        info!(
            escrow_id = resolution.escrow_id,
            nonce = resolution.nonce,
            signers = signers.len(),
            "quorum resolution applied"
        );
        Ok(())
    }

    /// Next expected nonce for an escrow
    pub async fn next_nonce(&self, escrow_id: u64) -> u64 {
        self.state
            .read()
            .await
            .nonces
            .get(&escrow_id)
            .copied()
            .unwrap_or(0)
    }

    /// Whether an escrow has been settled through this path
    pub async fn is_resolved(&self, escrow_id: u64) -> bool {
        self.state.read().await.resolved.contains(&escrow_id)
    }

    /// Replace the committee (admin only); must still cover the threshold
    pub async fn set_committee(&self, caller: &str, keys: Vec<String>) -> EscrowResult<()> {
        self.policy.require_admin(caller).await?;
        let committee = Self::parse_committee(&keys)?;
        let mut state = self.state.write().await;
        if committee.len() < state.threshold {
            return Err(EscrowError::validation(format!(
                "committee of {} cannot cover threshold {}",
                committee.len(),
                state.threshold
            )));
        }
        state.committee = committee;
        info!(size = state.committee.len(), "quorum committee replaced");
        Ok(())
    }

    /// Update the signature threshold (admin only)
    pub async fn set_threshold(&self, caller: &str, threshold: usize) -> EscrowResult<()> {
        self.policy.require_admin(caller).await?;
        let mut state = self.state.write().await;
        if threshold == 0 || threshold > state.committee.len() {
            return Err(EscrowError::validation(format!(
                "threshold {} must satisfy 1 <= t <= committee size {}",
                threshold,
                state.committee.len()
            )));
        }
        state.threshold = threshold;
        info!(threshold, "quorum threshold updated");
        Ok(())
    }

    fn recover_signer(&self, message: &Message, raw: &[u8]) -> EscrowResult<String> {
        if raw.len() != 65 {
            return Err(EscrowError::signature(
                "signature must be 65 bytes (r || s || recovery id)",
            ));
        }
        let recovery_id = RecoveryId::from_i32(raw[64] as i32)
            .map_err(|e| EscrowError::signature(format!("invalid recovery id: {e}")))?;
        let signature = RecoverableSignature::from_compact(&raw[..64], recovery_id)
            .map_err(|e| EscrowError::signature(format!("malformed signature: {e}")))?;
        let key = self
            .secp
            .recover_ecdsa(message, &signature)
            .map_err(|_| EscrowError::signature("signature does not recover to a valid key"))?;
        Ok(hex::encode(key.serialize()))
    }

    fn parse_committee(keys: &[String]) -> EscrowResult<BTreeSet<String>> {
        let mut committee = BTreeSet::new();
        for key in keys {
            let bytes = hex::decode(key)
                .map_err(|e| EscrowError::configuration(format!("committee key is not hex: {e}")))?;
            PublicKey::from_slice(&bytes).map_err(|e| {
                EscrowError::configuration(format!("invalid committee key {key}: {e}"))
            })?;
            if !committee.insert(key.to_lowercase()) {
                return Err(EscrowError::configuration(format!(
                    "duplicate committee key {key}"
                )));
            }
        }
        Ok(committee)
    }
}
