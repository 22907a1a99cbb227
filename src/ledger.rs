//! Escrow ledger - the trade settlement state machine
//!
//! Owns every escrow record and drives it through funding, milestone
//! progress, release, dispute resolution and cancellation. Every mutating
//! operation re-validates the caller and the current state on entry, runs
//! under the ledger's write guard end to end, and commits its state change
//! before any value leaves custody. A failed transfer restores the
//! pre-operation snapshot, so an operation either commits fully or not at
//! all; the adapter contract likewise discards value movement of an
//! aborted operation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::access::AccessControlPolicy;
use crate::error::EscrowError;
use crate::events::{EscrowEventKind, EventPublisher};
use crate::fees::{self, MAX_FEE_RATE_BPS};
use crate::models::{AccountId, AssetKind, EscrowRecord, EscrowState, EscrowTerms};
use crate::transfer::ValueTransferAdapter;
use crate::EscrowResult;

/// Configuration for the escrow ledger
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Settlement fee in basis points, at most `MAX_FEE_RATE_BPS`
    pub fee_rate_bps: u16,
    /// Account credited with settlement fees and dispute residuals
    pub fee_recipient: AccountId,
    /// Ceiling on open (non-terminal) escrows per creator
    pub max_open_escrows: u32,
    /// How long a dispute may sit unresolved before a party may cancel
    pub dispute_timeout: Duration,
    /// Account allowed to settle disputes on behalf of the quorum committee
    pub quorum_authority: Option<AccountId>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            fee_rate_bps: 250,
            fee_recipient: "treasury".to_string(),
            max_open_escrows: 32,
            dispute_timeout: Duration::days(7),
            quorum_authority: None,
        }
    }
}

/// Escrow creation request
#[derive(Debug, Clone)]
pub struct CreateEscrowRequest {
    pub seller: AccountId,
    pub arbitrator: Option<AccountId>,
    pub asset: AssetKind,
    pub amount: u64,
    pub deadline: DateTime<Utc>,
    pub description: String,
    pub milestones: Vec<String>,
    /// Value supplied together with creation; exactly `amount` lands the
    /// escrow Funded in the same operation, zero leaves it Created
    pub deposit: u64,
}

/// Main escrow ledger
pub struct EscrowLedger {
    config: RwLock<LedgerConfig>,
    records: RwLock<HashMap<u64, EscrowRecord>>,
    next_id: RwLock<u64>,
    open_counts: RwLock<HashMap<AccountId, u32>>,
    policy: Arc<AccessControlPolicy>,
    adapter: Arc<dyn ValueTransferAdapter>,
    publisher: Arc<EventPublisher>,
}

impl EscrowLedger {
    /// Create a ledger; rejects a fee rate above the cap
    pub fn new(
        config: LedgerConfig,
        policy: Arc<AccessControlPolicy>,
        adapter: Arc<dyn ValueTransferAdapter>,
        publisher: Arc<EventPublisher>,
    ) -> EscrowResult<Self> {
        if config.fee_rate_bps > MAX_FEE_RATE_BPS {
            return Err(EscrowError::configuration(format!(
                "fee rate {} bps above the {} bps cap",
                config.fee_rate_bps, MAX_FEE_RATE_BPS
            )));
        }
        Ok(Self {
            config: RwLock::new(config),
            records: RwLock::new(HashMap::new()),
            next_id: RwLock::new(1),
            open_counts: RwLock::new(HashMap::new()),
            policy,
            adapter,
            publisher,
        })
    }

    /// Create a new escrow; the caller becomes the buyer
    pub async fn create(&self, caller: &str, request: CreateEscrowRequest) -> EscrowResult<u64> {
        self.policy.require_unpaused_for(caller).await?;

        if request.seller == caller {
            return Err(EscrowError::validation("seller must differ from the creator"));
        }
        if request.amount == 0 {
            return Err(EscrowError::validation("amount must be positive"));
        }
        if request.deadline <= Utc::now() {
            return Err(EscrowError::validation("deadline must be in the future"));
        }
        let mut seen = BTreeSet::new();
        for milestone in &request.milestones {
            if !seen.insert(milestone.as_str()) {
                return Err(EscrowError::validation(format!(
                    "duplicate milestone '{milestone}'"
                )));
            }
        }
        if request.deposit != 0 && request.deposit != request.amount {
            return Err(EscrowError::validation(
                "deposit must be zero or exactly the escrow amount",
            ));
        }

        let config = self.config.read().await.clone();
        let mut records = self.records.write().await;
        let mut counts = self.open_counts.write().await;
        let open = counts.get(caller).copied().unwrap_or(0);
        if open >= config.max_open_escrows {
            return Err(EscrowError::validation(format!(
                "open escrow ceiling ({}) reached for {caller}",
                config.max_open_escrows
            )));
        }

        let terms = EscrowTerms {
            buyer: caller.to_string(),
            seller: request.seller,
            arbitrator: request.arbitrator,
            asset: request.asset,
            amount: request.amount,
            deadline: request.deadline,
            description: request.description,
            milestones: request.milestones,
        };

        // Collect first: a refused deposit must not consume an id
        let funded = request.deposit == request.amount;
        if funded {
            self.adapter
                .collect(caller, request.deposit, &terms.asset)
                .await?;
        }

        let mut next = self.next_id.write().await;
        let id = *next;
        *next += 1;
        drop(next);

        let mut record = EscrowRecord::new(id, terms);
        if funded {
            record.state = EscrowState::Funded;
            record.funded_amount = request.deposit;
        }

        let created_payload = json!({
            "escrow_id": id,
            "buyer": record.terms.buyer,
            "seller": record.terms.seller,
            "arbitrator": record.terms.arbitrator,
            "asset": record.terms.asset.key(),
            "amount": record.terms.amount,
            "deadline": record.terms.deadline,
            "milestones": record.terms.milestones,
        });
        let funded_payload = json!({
            "escrow_id": id,
            "buyer": record.terms.buyer,
            "amount": record.funded_amount,
        });

        counts.insert(caller.to_string(), open + 1);
        records.insert(id, record);

        self.publisher
            .publish(
                EscrowEventKind::EscrowCreated,
                Some(id),
                None,
                Some(caller),
                created_payload,
            )
            .await;
        if funded {
            self.publisher
                .publish(
                    EscrowEventKind::EscrowFunded,
                    Some(id),
                    None,
                    Some(caller),
                    funded_payload,
                )
                .await;
        }

        info!(escrow_id = id, buyer = caller, funded, "created escrow");
        Ok(id)
    }

    /// Fund an escrow with exactly the agreed amount
    pub async fn fund(&self, id: u64, caller: &str, supplied: u64) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let mut records = self.records.write().await;
        let record = Self::record_mut(&mut records, id)?;

        if record.terms.buyer != caller {
            return Err(EscrowError::authorization("only the buyer may fund the escrow"));
        }
        if !record.state.can_fund() {
            return Err(EscrowError::state_transition(
                format!("{:?}", record.state),
                format!("{:?}", EscrowState::Funded),
                "only newly created escrows accept funding".to_string(),
            ));
        }
        if supplied != record.terms.amount {
            return Err(EscrowError::validation(format!(
                "supplied value {supplied} must equal the escrow amount {}",
                record.terms.amount
            )));
        }

        self.adapter
            .collect(caller, supplied, &record.terms.asset)
            .await?;
        record.state = EscrowState::Funded;
        record.funded_amount = supplied;
        record.updated_at = Utc::now();

        let payload = json!({
            "escrow_id": id,
            "buyer": record.terms.buyer,
            "seller": record.terms.seller,
            "amount": supplied,
        });
        self.publisher
            .publish(EscrowEventKind::EscrowFunded, Some(id), None, Some(caller), payload)
            .await;

        info!(escrow_id = id, amount = supplied, "escrow funded");
        Ok(())
    }

    /// Mark one milestone complete; the last one advances the escrow
    pub async fn complete_milestone(&self, id: u64, caller: &str, name: &str) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let mut records = self.records.write().await;
        let record = Self::record_mut(&mut records, id)?;

        if record.terms.seller != caller {
            return Err(EscrowError::authorization(
                "only the seller may complete milestones",
            ));
        }
        if record.state != EscrowState::Funded {
            return Err(EscrowError::state_transition(
                format!("{:?}", record.state),
                format!("{:?}", EscrowState::InProgress),
                "milestones are only tracked while the escrow is funded".to_string(),
            ));
        }
        if !record.milestones().contains(name) {
            return Err(EscrowError::validation(format!("unknown milestone '{name}'")));
        }
        if !record.completed_milestones.insert(name.to_string()) {
            return Err(EscrowError::validation(format!(
                "milestone '{name}' already complete"
            )));
        }
        record.updated_at = Utc::now();

        let all_complete = record.milestones().all_complete();
        if all_complete {
            record.state = EscrowState::InProgress;
        }
        let (done, total) = record.milestones().progress();

        let payload = json!({
            "escrow_id": id,
            "seller": record.terms.seller,
            "milestone": name,
            "completed": done,
            "total": total,
            "all_complete": all_complete,
        });
        self.publisher
            .publish(
                EscrowEventKind::MilestoneCompleted,
                Some(id),
                None,
                Some(caller),
                payload,
            )
            .await;

        info!(escrow_id = id, milestone = name, all_complete, "milestone completed");
        Ok(())
    }

    /// Release the escrow: pays the seller net of fee, the fee recipient the fee
    pub async fn complete(&self, id: u64, caller: &str) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let config = self.config.read().await.clone();
        let mut records = self.records.write().await;
        let record = Self::record_mut(&mut records, id)?;

        let is_buyer = record.terms.buyer == caller;
        let is_seller = record.terms.seller == caller;
        if !is_buyer && !is_seller {
            return Err(EscrowError::authorization(
                "only the buyer or seller may release the escrow",
            ));
        }
        if is_seller && !record.milestones().all_complete() {
            return Err(EscrowError::authorization(
                "seller release requires every milestone complete",
            ));
        }
        if !record.state.can_complete() {
            return Err(EscrowError::state_transition(
                format!("{:?}", record.state),
                format!("{:?}", EscrowState::Completed),
                "escrow is not releasable in its current state".to_string(),
            ));
        }

        let amount = record.terms.amount;
        let fee = fees::fee_for(amount, config.fee_rate_bps);
        let seller_amount = amount - fee;
        let buyer = record.terms.buyer.clone();
        let seller = record.terms.seller.clone();
        let asset = record.terms.asset.clone();

        // Commit before paying: a re-entering caller sees the terminal state
        let snapshot = record.clone();
        record.state = EscrowState::Completed;
        record.settled_at = Some(Utc::now());
        record.updated_at = Utc::now();

        let paid = async {
            self.adapter.transfer(&seller, seller_amount, &asset).await?;
            if fee > 0 {
                self.adapter
                    .transfer(&config.fee_recipient, fee, &asset)
                    .await?;
            }
            Ok::<(), EscrowError>(())
        }
        .await;
        if let Err(err) = paid {
            warn!(escrow_id = id, %err, "release aborted, state restored");
            records.insert(id, snapshot);
            return Err(err);
        }

        Self::decrement_open(&mut *self.open_counts.write().await, &buyer);

        let payload = json!({
            "escrow_id": id,
            "buyer": buyer,
            "seller": seller,
            "seller_amount": seller_amount,
            "fee": fee,
            "fee_recipient": config.fee_recipient,
        });
        self.publisher
            .publish(EscrowEventKind::EscrowCompleted, Some(id), None, Some(caller), payload)
            .await;

        info!(escrow_id = id, seller_amount, fee, "escrow completed");
        Ok(())
    }

    /// Open a dispute against a funded escrow with an assigned arbitrator
    pub async fn initiate_dispute(&self, id: u64, caller: &str) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let has_role = self.policy.has_arbitrator_role(caller).await;
        let mut records = self.records.write().await;
        let record = Self::record_mut(&mut records, id)?;

        if !record.terms.is_party(caller) && !has_role {
            return Err(EscrowError::authorization(
                "only a party or an arbitrator may open a dispute",
            ));
        }
        if record.terms.arbitrator.is_none() {
            return Err(EscrowError::validation("escrow has no assigned arbitrator"));
        }
        if !record.state.can_dispute() {
            return Err(EscrowError::state_transition(
                format!("{:?}", record.state),
                format!("{:?}", EscrowState::Disputed),
                "disputes may only be opened against funded escrows".to_string(),
            ));
        }

        record.state = EscrowState::Disputed;
        record.disputed_at = Some(Utc::now());
        record.dispute_initiator = Some(caller.to_string());
        record.updated_at = Utc::now();

        let payload = json!({
            "escrow_id": id,
            "initiator": caller,
            "buyer": record.terms.buyer,
            "seller": record.terms.seller,
            "arbitrator": record.terms.arbitrator,
            "amount": record.terms.amount,
        });
        self.publisher
            .publish(EscrowEventKind::EscrowDisputed, Some(id), None, Some(caller), payload)
            .await;

        info!(escrow_id = id, initiator = caller, "dispute opened");
        Ok(())
    }

    /// Settle a disputed escrow with an explicit split
    ///
    /// Accepts the assigned arbitrator or the configured quorum authority.
    /// Any residual below the escrow amount routes to the fee recipient so
    /// no value stays locked.
    pub async fn resolve_dispute(
        &self,
        id: u64,
        caller: &str,
        winner: &str,
        buyer_amount: u64,
        seller_amount: u64,
    ) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let config = self.config.read().await.clone();
        let mut records = self.records.write().await;
        let record = Self::record_mut(&mut records, id)?;

        let assigned = record.terms.arbitrator.as_deref() == Some(caller);
        let authority = config.quorum_authority.as_deref() == Some(caller);
        if !assigned && !authority {
            return Err(EscrowError::authorization(
                "only the assigned arbitrator or the quorum authority may resolve",
            ));
        }
        if record.state != EscrowState::Disputed {
            return Err(EscrowError::state_transition(
                format!("{:?}", record.state),
                format!("{:?}", EscrowState::Completed),
                "escrow has no open dispute".to_string(),
            ));
        }
        let total = buyer_amount
            .checked_add(seller_amount)
            .ok_or_else(|| EscrowError::validation("distribution overflows"))?;
        if total > record.terms.amount {
            return Err(EscrowError::validation(format!(
                "distribution {total} exceeds the escrow amount {}",
                record.terms.amount
            )));
        }
        if !record.terms.is_party(winner) {
            return Err(EscrowError::validation("winner must be a party to the escrow"));
        }

        let residual = record.terms.amount - total;
        let buyer = record.terms.buyer.clone();
        let seller = record.terms.seller.clone();
        let asset = record.terms.asset.clone();

        let snapshot = record.clone();
        record.state = EscrowState::Completed;
        record.settled_at = Some(Utc::now());
        record.updated_at = Utc::now();

        let paid = async {
            if buyer_amount > 0 {
                self.adapter.transfer(&buyer, buyer_amount, &asset).await?;
            }
            if seller_amount > 0 {
                self.adapter.transfer(&seller, seller_amount, &asset).await?;
            }
            if residual > 0 {
                self.adapter
                    .transfer(&config.fee_recipient, residual, &asset)
                    .await?;
            }
            Ok::<(), EscrowError>(())
        }
        .await;
        if let Err(err) = paid {
            warn!(escrow_id = id, %err, "resolution aborted, state restored");
            records.insert(id, snapshot);
            return Err(err);
        }

        Self::decrement_open(&mut *self.open_counts.write().await, &buyer);

        let payload = json!({
            "escrow_id": id,
            "resolved_by": caller,
            "winner": winner,
            "buyer": buyer,
            "seller": seller,
            "buyer_amount": buyer_amount,
            "seller_amount": seller_amount,
            "residual": residual,
        });
        self.publisher
            .publish(EscrowEventKind::EscrowCompleted, Some(id), None, Some(caller), payload)
            .await;

        info!(escrow_id = id, winner, buyer_amount, seller_amount, "dispute settled");
        Ok(())
    }

    /// Cancel an escrow, refunding the buyer any held value
    ///
    /// Allowed before funding (parties), after the terms deadline (anyone),
    /// or once a dispute has outlived the dispute timeout (parties).
    pub async fn cancel(&self, id: u64, caller: &str) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let config = self.config.read().await.clone();
        let mut records = self.records.write().await;
        let record = Self::record_mut(&mut records, id)?;

        if record.state.is_terminal() {
            return Err(EscrowError::state_transition(
                format!("{:?}", record.state),
                format!("{:?}", EscrowState::Cancelled),
                "escrow is already settled".to_string(),
            ));
        }

        let now = Utc::now();
        let deadline_passed = now > record.terms.deadline;
        let dispute_timed_out = record.state == EscrowState::Disputed
            && record
                .disputed_at
                .map(|at| now > at + config.dispute_timeout)
                .unwrap_or(false);

        let reason = if deadline_passed {
            "deadline_passed"
        } else if record.state == EscrowState::Created {
            AccessControlPolicy::require_party(&record.terms, caller)?;
            "unfunded"
        } else if dispute_timed_out {
            AccessControlPolicy::require_party(&record.terms, caller)?;
            "dispute_timeout"
        } else if record.state == EscrowState::Disputed {
            return Err(EscrowError::timing("dispute timeout has not elapsed"));
        } else {
            return Err(EscrowError::timing("escrow deadline has not passed"));
        };

        let refund = record.funded_amount;
        let buyer = record.terms.buyer.clone();
        let asset = record.terms.asset.clone();

        let snapshot = record.clone();
        record.state = EscrowState::Cancelled;
        record.funded_amount = 0;
        record.settled_at = Some(now);
        record.updated_at = now;

        if refund > 0 {
            if let Err(err) = self.adapter.transfer(&buyer, refund, &asset).await {
                warn!(escrow_id = id, %err, "refund aborted, state restored");
                records.insert(id, snapshot);
                return Err(err);
            }
        }

        Self::decrement_open(&mut *self.open_counts.write().await, &buyer);

        let payload = json!({
            "escrow_id": id,
            "buyer": buyer,
            "refund": refund,
            "reason": reason,
        });
        self.publisher
            .publish(EscrowEventKind::EscrowCancelled, Some(id), None, Some(caller), payload)
            .await;

        info!(escrow_id = id, refund, reason, "escrow cancelled");
        Ok(())
    }

    /// Admin bypass for stuck funds: pays the full held amount to `recipient`
    pub async fn emergency_withdraw(
        &self,
        id: u64,
        caller: &str,
        recipient: &str,
    ) -> EscrowResult<()> {
        self.policy.require_admin(caller).await?;
        let mut records = self.records.write().await;
        let record = Self::record_mut(&mut records, id)?;

        record.validate_transition(EscrowState::Cancelled)?;
        if record.funded_amount == 0 {
            return Err(EscrowError::validation("escrow holds no funds"));
        }

        let amount = record.funded_amount;
        let buyer = record.terms.buyer.clone();
        let asset = record.terms.asset.clone();

        let snapshot = record.clone();
        record.state = EscrowState::Cancelled;
        record.funded_amount = 0;
        record.settled_at = Some(Utc::now());
        record.updated_at = Utc::now();

        if let Err(err) = self.adapter.transfer(recipient, amount, &asset).await {
            warn!(escrow_id = id, %err, "emergency withdrawal aborted, state restored");
            records.insert(id, snapshot);
            return Err(err);
        }

        Self::decrement_open(&mut *self.open_counts.write().await, &buyer);

        let payload = json!({
            "escrow_id": id,
            "recipient": recipient,
            "amount": amount,
        });
        self.publisher
            .publish(
                EscrowEventKind::EmergencyWithdrawal,
                Some(id),
                None,
                Some(caller),
                payload,
            )
            .await;

        warn!(escrow_id = id, recipient, amount, "emergency withdrawal");
        Ok(())
    }

    /// Update the settlement fee rate (admin only, capped)
    pub async fn set_fee_rate(&self, caller: &str, rate_bps: u16) -> EscrowResult<()> {
        self.policy.require_admin(caller).await?;
        if rate_bps > MAX_FEE_RATE_BPS {
            return Err(EscrowError::validation(format!(
                "fee rate {rate_bps} bps above the {MAX_FEE_RATE_BPS} bps cap"
            )));
        }
        self.config.write().await.fee_rate_bps = rate_bps;
        info!(rate_bps, "fee rate updated");
        Ok(())
    }

    /// Update the fee recipient (admin only)
    pub async fn set_fee_recipient(&self, caller: &str, recipient: &str) -> EscrowResult<()> {
        self.policy.require_admin(caller).await?;
        self.config.write().await.fee_recipient = recipient.to_string();
        info!(recipient, "fee recipient updated");
        Ok(())
    }

    /// Register or clear the quorum settlement authority (admin only)
    pub async fn set_quorum_authority(
        &self,
        caller: &str,
        authority: Option<AccountId>,
    ) -> EscrowResult<()> {
        self.policy.require_admin(caller).await?;
        self.config.write().await.quorum_authority = authority;
        Ok(())
    }

    /// Fetch a record by id
    pub async fn get(&self, id: u64) -> EscrowResult<EscrowRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EscrowError::validation(format!("escrow {id} not found")))
    }

    /// Every escrow an account participates in
    pub async fn escrows_for(&self, account: &str) -> Vec<EscrowRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.terms.is_party(account))
            .cloned()
            .collect()
    }

    fn record_mut(
        records: &mut HashMap<u64, EscrowRecord>,
        id: u64,
    ) -> EscrowResult<&mut EscrowRecord> {
        records
            .get_mut(&id)
            .ok_or_else(|| EscrowError::validation(format!("escrow {id} not found")))
    }

    fn decrement_open(counts: &mut HashMap<AccountId, u32>, account: &str) {
        if let Some(open) = counts.get_mut(account) {
            *open = open.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::InMemoryBank;

    fn request(seller: &str, amount: u64) -> CreateEscrowRequest {
        CreateEscrowRequest {
            seller: seller.to_string(),
            arbitrator: Some("arb".to_string()),
            asset: AssetKind::Native,
            amount,
            deadline: Utc::now() + Duration::days(30),
            description: "test escrow".to_string(),
            milestones: vec![],
            deposit: 0,
        }
    }

    async fn setup(config: LedgerConfig) -> (EscrowLedger, Arc<InMemoryBank>, Arc<EventPublisher>) {
        let policy = Arc::new(AccessControlPolicy::new(["admin".to_string()]));
        let bank = Arc::new(InMemoryBank::new());
        bank.seed("alice", &AssetKind::Native, 10_000_000).await;
        let publisher = Arc::new(EventPublisher::new());
        let ledger =
            EscrowLedger::new(config, policy, bank.clone(), publisher.clone()).unwrap();
        (ledger, bank, publisher)
    }

    #[tokio::test]
    async fn ids_are_sequential_and_unique() {
        let (ledger, _, _) = setup(LedgerConfig::default()).await;
        let first = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        let second = ledger.create("alice", request("bob", 2_000)).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn create_rejects_bad_terms() {
        let (ledger, _, _) = setup(LedgerConfig::default()).await;

        let err = ledger.create("alice", request("alice", 1_000)).await;
        assert!(matches!(err, Err(EscrowError::Validation(_))));

        let err = ledger.create("alice", request("bob", 0)).await;
        assert!(matches!(err, Err(EscrowError::Validation(_))));

        let mut past = request("bob", 1_000);
        past.deadline = Utc::now() - Duration::hours(1);
        assert!(ledger.create("alice", past).await.is_err());

        let mut dup = request("bob", 1_000);
        dup.milestones = vec!["a".to_string(), "a".to_string()];
        assert!(ledger.create("alice", dup).await.is_err());

        let mut partial = request("bob", 1_000);
        partial.deposit = 500;
        assert!(ledger.create("alice", partial).await.is_err());
    }

    #[tokio::test]
    async fn deposit_equal_to_amount_funds_immediately() {
        let (ledger, bank, _) = setup(LedgerConfig::default()).await;
        let mut req = request("bob", 1_000);
        req.deposit = 1_000;
        let id = ledger.create("alice", req).await.unwrap();

        let record = ledger.get(id).await.unwrap();
        assert_eq!(record.state, EscrowState::Funded);
        assert_eq!(record.funded_amount, 1_000);
        assert_eq!(bank.custody_balance(&AssetKind::Native).await, 1_000);
    }

    #[tokio::test]
    async fn funding_is_exact_and_single_shot() {
        let (ledger, _, _) = setup(LedgerConfig::default()).await;
        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();

        let err = ledger.fund(id, "bob", 1_000).await;
        assert!(matches!(err, Err(EscrowError::Authorization(_))));

        let err = ledger.fund(id, "alice", 999).await;
        assert!(matches!(err, Err(EscrowError::Validation(_))));

        ledger.fund(id, "alice", 1_000).await.unwrap();
        let err = ledger.fund(id, "alice", 1_000).await;
        assert!(matches!(err, Err(EscrowError::StateTransition { .. })));
    }

    #[tokio::test]
    async fn underfunded_buyer_leaves_state_untouched() {
        let (ledger, bank, _) = setup(LedgerConfig::default()).await;
        let id = ledger
            .create("alice", request("bob", 50_000_000))
            .await
            .unwrap();

        let err = ledger.fund(id, "alice", 50_000_000).await;
        assert!(matches!(err, Err(EscrowError::Transfer(_))));

        let record = ledger.get(id).await.unwrap();
        assert_eq!(record.state, EscrowState::Created);
        assert_eq!(record.funded_amount, 0);
        assert_eq!(bank.custody_balance(&AssetKind::Native).await, 0);
    }

    #[tokio::test]
    async fn milestones_gate_progress() {
        let (ledger, _, _) = setup(LedgerConfig::default()).await;
        let mut req = request("bob", 1_000);
        req.milestones = vec!["design".to_string(), "ship".to_string()];
        let id = ledger.create("alice", req).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();

        let err = ledger.complete_milestone(id, "alice", "design").await;
        assert!(matches!(err, Err(EscrowError::Authorization(_))));

        assert!(ledger.complete_milestone(id, "bob", "other").await.is_err());

        ledger.complete_milestone(id, "bob", "design").await.unwrap();
        let err = ledger.complete_milestone(id, "bob", "design").await;
        assert!(matches!(err, Err(EscrowError::Validation(_))));
        assert_eq!(ledger.get(id).await.unwrap().state, EscrowState::Funded);

        ledger.complete_milestone(id, "bob", "ship").await.unwrap();
        assert_eq!(ledger.get(id).await.unwrap().state, EscrowState::InProgress);

        // InProgress no longer tracks milestones
        let err = ledger.complete_milestone(id, "bob", "ship").await;
        assert!(matches!(err, Err(EscrowError::StateTransition { .. })));
    }

    #[tokio::test]
    async fn completion_splits_amount_between_seller_and_fee() {
        let (ledger, bank, _) = setup(LedgerConfig::default()).await;
        let id = ledger
            .create("alice", request("bob", 1_000_000))
            .await
            .unwrap();
        ledger.fund(id, "alice", 1_000_000).await.unwrap();

        ledger.complete(id, "alice").await.unwrap();
        assert_eq!(bank.balance_of("bob", &AssetKind::Native).await, 975_000);
        assert_eq!(bank.balance_of("treasury", &AssetKind::Native).await, 25_000);
        assert_eq!(bank.custody_balance(&AssetKind::Native).await, 0);

        // Terminal state rejects a second release
        let err = ledger.complete(id, "alice").await;
        assert!(matches!(err, Err(EscrowError::StateTransition { .. })));
    }

    #[tokio::test]
    async fn seller_release_requires_all_milestones() {
        let (ledger, _, _) = setup(LedgerConfig::default()).await;
        let mut req = request("bob", 1_000);
        req.milestones = vec!["ship".to_string()];
        let id = ledger.create("alice", req).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();

        let err = ledger.complete(id, "bob").await;
        assert!(matches!(err, Err(EscrowError::Authorization(_))));

        ledger.complete_milestone(id, "bob", "ship").await.unwrap();
        ledger.complete(id, "bob").await.unwrap();
    }

    #[tokio::test]
    async fn seller_release_on_empty_milestone_set() {
        let (ledger, _, _) = setup(LedgerConfig::default()).await;
        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();
        // No milestones: vacuously complete, seller may release directly
        ledger.complete(id, "bob").await.unwrap();
    }

    #[tokio::test]
    async fn dispute_requires_arbitrator_and_funding() {
        let (ledger, _, _) = setup(LedgerConfig::default()).await;
        let mut req = request("bob", 1_000);
        req.arbitrator = None;
        let id = ledger.create("alice", req).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();
        assert!(matches!(
            ledger.initiate_dispute(id, "alice").await,
            Err(EscrowError::Validation(_))
        ));

        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        assert!(matches!(
            ledger.initiate_dispute(id, "alice").await,
            Err(EscrowError::StateTransition { .. })
        ));

        ledger.fund(id, "alice", 1_000).await.unwrap();
        assert!(matches!(
            ledger.initiate_dispute(id, "mallory").await,
            Err(EscrowError::Authorization(_))
        ));
        ledger.initiate_dispute(id, "alice").await.unwrap();
        assert_eq!(ledger.get(id).await.unwrap().state, EscrowState::Disputed);

        // No second dispute on an already disputed escrow
        assert!(ledger.initiate_dispute(id, "bob").await.is_err());
    }

    #[tokio::test]
    async fn resolution_enforces_distribution_and_caller() {
        let (ledger, bank, _) = setup(LedgerConfig::default()).await;
        let id = ledger
            .create("alice", request("bob", 1_000_000))
            .await
            .unwrap();
        ledger.fund(id, "alice", 1_000_000).await.unwrap();
        ledger.initiate_dispute(id, "alice").await.unwrap();

        let err = ledger.resolve_dispute(id, "mallory", "alice", 0, 0).await;
        assert!(matches!(err, Err(EscrowError::Authorization(_))));

        let err = ledger
            .resolve_dispute(id, "arb", "alice", 600_000, 500_000)
            .await;
        assert!(matches!(err, Err(EscrowError::Validation(_))));

        // Under-allocation pays the split and routes the residual to fees
        ledger
            .resolve_dispute(id, "arb", "alice", 600_000, 300_000)
            .await
            .unwrap();
        assert_eq!(bank.balance_of("alice", &AssetKind::Native).await, 9_600_000);
        assert_eq!(bank.balance_of("bob", &AssetKind::Native).await, 300_000);
        assert_eq!(bank.balance_of("treasury", &AssetKind::Native).await, 100_000);
        assert_eq!(ledger.get(id).await.unwrap().state, EscrowState::Completed);

        let err = ledger.resolve_dispute(id, "arb", "alice", 0, 0).await;
        assert!(matches!(err, Err(EscrowError::StateTransition { .. })));
    }

    #[tokio::test]
    async fn quorum_authority_may_resolve() {
        let config = LedgerConfig {
            quorum_authority: Some("quorum".to_string()),
            ..LedgerConfig::default()
        };
        let (ledger, _, _) = setup(config).await;
        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();
        ledger.initiate_dispute(id, "bob").await.unwrap();

        ledger
            .resolve_dispute(id, "quorum", "bob", 0, 1_000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_before_funding_moves_nothing() {
        let (ledger, bank, _) = setup(LedgerConfig::default()).await;
        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();

        let err = ledger.cancel(id, "mallory").await;
        assert!(matches!(err, Err(EscrowError::Authorization(_))));

        ledger.cancel(id, "alice").await.unwrap();
        assert_eq!(bank.balance_of("alice", &AssetKind::Native).await, 10_000_000);
        assert_eq!(ledger.get(id).await.unwrap().state, EscrowState::Cancelled);

        let err = ledger.cancel(id, "alice").await;
        assert!(matches!(err, Err(EscrowError::StateTransition { .. })));
    }

    #[tokio::test]
    async fn cancel_after_deadline_refunds_buyer() {
        let (ledger, bank, _) = setup(LedgerConfig::default()).await;
        let mut req = request("bob", 1_000);
        req.deadline = Utc::now() + Duration::milliseconds(30);
        let id = ledger.create("alice", req).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();

        let err = ledger.cancel(id, "mallory").await;
        assert!(matches!(err, Err(EscrowError::Timing(_))));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Anyone may cancel once the deadline passed
        ledger.cancel(id, "mallory").await.unwrap();
        assert_eq!(bank.balance_of("alice", &AssetKind::Native).await, 10_000_000);
    }

    #[tokio::test]
    async fn cancel_after_dispute_timeout() {
        let config = LedgerConfig {
            dispute_timeout: Duration::milliseconds(30),
            ..LedgerConfig::default()
        };
        let (ledger, bank, _) = setup(config).await;
        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();
        ledger.initiate_dispute(id, "alice").await.unwrap();

        let err = ledger.cancel(id, "alice").await;
        assert!(matches!(err, Err(EscrowError::Timing(_))));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ledger.cancel(id, "alice").await.unwrap();
        assert_eq!(bank.balance_of("alice", &AssetKind::Native).await, 10_000_000);
    }

    #[tokio::test]
    async fn open_escrow_ceiling_applies_per_creator() {
        let config = LedgerConfig {
            max_open_escrows: 1,
            ..LedgerConfig::default()
        };
        let (ledger, _, _) = setup(config).await;
        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        assert!(ledger.create("alice", request("bob", 1_000)).await.is_err());

        // Settling frees the slot
        ledger.cancel(id, "alice").await.unwrap();
        assert!(ledger.create("alice", request("bob", 1_000)).await.is_ok());
    }

    #[tokio::test]
    async fn pause_blocks_non_admin_operations() {
        let policy = Arc::new(AccessControlPolicy::new(["admin".to_string()]));
        let bank = Arc::new(InMemoryBank::new());
        bank.seed("alice", &AssetKind::Native, 10_000).await;
        let publisher = Arc::new(EventPublisher::new());
        let ledger = EscrowLedger::new(
            LedgerConfig::default(),
            policy.clone(),
            bank,
            publisher,
        )
        .unwrap();

        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        policy.pause("admin").await.unwrap();

        let err = ledger.fund(id, "alice", 1_000).await;
        assert!(matches!(err, Err(EscrowError::Authorization(_))));
        // Admin setters still work while paused
        ledger.set_fee_rate("admin", 100).await.unwrap();

        policy.unpause("admin").await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();
    }

    #[tokio::test]
    async fn fee_rate_updates_are_bounded() {
        let (ledger, _, _) = setup(LedgerConfig::default()).await;
        assert!(ledger.set_fee_rate("alice", 100).await.is_err());
        assert!(ledger.set_fee_rate("admin", 1_001).await.is_err());
        ledger.set_fee_rate("admin", 0).await.unwrap();

        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();
        ledger.complete(id, "alice").await.unwrap();
        // Zero fee: nothing routed to the fee recipient
        let record = ledger.get(id).await.unwrap();
        assert_eq!(record.state, EscrowState::Completed);
    }

    #[tokio::test]
    async fn emergency_withdrawal_is_admin_only() {
        let (ledger, bank, _) = setup(LedgerConfig::default()).await;
        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();

        let err = ledger.emergency_withdraw(id, "admin", "vault").await;
        assert!(matches!(err, Err(EscrowError::Validation(_))));

        ledger.fund(id, "alice", 1_000).await.unwrap();
        assert!(ledger.emergency_withdraw(id, "alice", "vault").await.is_err());

        ledger.emergency_withdraw(id, "admin", "vault").await.unwrap();
        assert_eq!(bank.balance_of("vault", &AssetKind::Native).await, 1_000);
        assert_eq!(ledger.get(id).await.unwrap().state, EscrowState::Cancelled);
    }

    #[tokio::test]
    async fn notifications_carry_reconstruction_fields() {
        let (ledger, _, publisher) = setup(LedgerConfig::default()).await;
        let id = ledger.create("alice", request("bob", 1_000)).await.unwrap();
        ledger.fund(id, "alice", 1_000).await.unwrap();
        ledger.complete(id, "alice").await.unwrap();

        let events = publisher.for_escrow(id).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["escrow.created", "escrow.funded", "escrow.completed"]
        );
        let completed = &events[2];
        assert_eq!(completed.payload["seller"], "bob");
        assert_eq!(completed.payload["seller_amount"], 975);
        assert_eq!(completed.payload["fee"], 25);
    }
}
