//! Dispute case workflow - evidence collection and arbiter resolution
//!
//! A case runs alongside the escrow it references: opening one flips the
//! escrow into its disputed state, and the arbiter's decision settles the
//! escrow through the ledger's own resolution entry point. Deadlines bound
//! each phase; only explicit operations move a case forward.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::AccessControlPolicy;
use crate::arbiters::ArbiterDirectory;
use crate::error::EscrowError;
use crate::events::{EscrowEventKind, EventPublisher};
use crate::fees;
use crate::ledger::EscrowLedger;
use crate::models::{AssetKind, DisputeCase, DisputeOutcome, DisputeStatus, Evidence};
use crate::transfer::ValueTransferAdapter;
use crate::EscrowResult;

/// Configuration for the dispute desk
#[derive(Debug, Clone)]
pub struct DisputeDeskConfig {
    /// Standard fee collected from the complainant when opening a case
    pub case_fee: u64,
    /// Evidence window measured from case creation
    pub evidence_window: Duration,
    /// Review window measured from the moment both sides have filed
    pub review_window: Duration,
}

impl Default for DisputeDeskConfig {
    fn default() -> Self {
        Self {
            case_fee: 10_000,
            evidence_window: Duration::days(3),
            review_window: Duration::days(7),
        }
    }
}

/// Main dispute desk coordinating cases, arbiters and the ledger
pub struct DisputeDesk {
    config: DisputeDeskConfig,
    cases: RwLock<HashMap<Uuid, DisputeCase>>,
    ledger: Arc<EscrowLedger>,
    arbiters: Arc<ArbiterDirectory>,
    policy: Arc<AccessControlPolicy>,
    adapter: Arc<dyn ValueTransferAdapter>,
    publisher: Arc<EventPublisher>,
}

impl DisputeDesk {
    pub fn new(
        config: DisputeDeskConfig,
        ledger: Arc<EscrowLedger>,
        arbiters: Arc<ArbiterDirectory>,
        policy: Arc<AccessControlPolicy>,
        adapter: Arc<dyn ValueTransferAdapter>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            config,
            cases: RwLock::new(HashMap::new()),
            ledger,
            arbiters,
            policy,
            adapter,
            publisher,
        }
    }

    /// Open a case against the escrow's assigned arbiter
    ///
    /// Collects the standard case fee from the complainant and flips the
    /// escrow into its disputed state. The fee returns to the complainant
    /// if the escrow refuses the dispute.
    pub async fn open_case(
        &self,
        escrow_id: u64,
        complainant: &str,
        arbiter: &str,
    ) -> EscrowResult<Uuid> {
        self.policy.require_unpaused_for(complainant).await?;

        let escrow = self.ledger.get(escrow_id).await?;
        AccessControlPolicy::require_party(&escrow.terms, complainant)?;
        if escrow.terms.arbitrator.as_deref() != Some(arbiter) {
            return Err(EscrowError::validation(
                "arbiter does not match the escrow terms",
            ));
        }
        let profile = self.arbiters.get(arbiter).await?;
        if !profile.active {
            return Err(EscrowError::validation(format!(
                "arbiter {arbiter} is not active"
            )));
        }

        let respondent = if escrow.terms.buyer == complainant {
            escrow.terms.seller.clone()
        } else {
            escrow.terms.buyer.clone()
        };

        if self.config.case_fee > 0 {
            self.adapter
                .collect(complainant, self.config.case_fee, &AssetKind::Native)
                .await?;
        }
        if let Err(err) = self.ledger.initiate_dispute(escrow_id, complainant).await {
            // Hand the fee back before surfacing the refusal
            if self.config.case_fee > 0 {
                if let Err(refund_err) = self
                    .adapter
                    .transfer(complainant, self.config.case_fee, &AssetKind::Native)
                    .await
                {
                    warn!(escrow_id, %refund_err, "case fee refund failed");
                }
            }
            return Err(err);
        }

        let mut case = DisputeCase::new(
            escrow_id,
            complainant.to_string(),
            respondent.clone(),
            arbiter.to_string(),
            Utc::now() + self.config.evidence_window,
        );
        case.status = DisputeStatus::EvidenceCollection;
        let case_id = case.id;

        self.arbiters
            .note_case_assigned(arbiter, &[complainant, respondent.as_str()])
            .await?;

        let payload = json!({
            "case_id": case_id,
            "escrow_id": escrow_id,
            "complainant": complainant,
            "respondent": respondent,
            "arbiter": arbiter,
            "case_fee": self.config.case_fee,
            "evidence_deadline": case.evidence_deadline,
        });
        self.cases.write().await.insert(case_id, case);
        self.publisher
            .publish(
                EscrowEventKind::DisputeOpened,
                Some(escrow_id),
                Some(case_id),
                Some(complainant),
                payload,
            )
            .await;

        info!(escrow_id, %case_id, complainant, arbiter, "dispute case opened");
        Ok(case_id)
    }

    /// File evidence; each named party may do so exactly once
    pub async fn submit_evidence(
        &self,
        case_id: Uuid,
        caller: &str,
        body: String,
    ) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let mut cases = self.cases.write().await;
        let case = Self::case_mut(&mut cases, case_id)?;

        if caller != case.complainant && caller != case.respondent {
            return Err(EscrowError::authorization(
                "only the named parties may file evidence",
            ));
        }
        if case.status != DisputeStatus::EvidenceCollection {
            return Err(EscrowError::state_transition(
                format!("{:?}", case.status),
                format!("{:?}", DisputeStatus::EvidenceCollection),
                "evidence is only accepted during evidence collection".to_string(),
            ));
        }
        if Utc::now() > case.evidence_deadline {
            return Err(EscrowError::timing("evidence deadline has passed"));
        }
        if case.has_evidence_from(caller) {
            return Err(EscrowError::validation(format!(
                "{caller} already filed evidence"
            )));
        }

        case.evidence.push(Evidence {
            submitted_by: caller.to_string(),
            body,
            submitted_at: Utc::now(),
        });

        let both_filed = case.both_sides_filed();
        if both_filed {
            case.status = DisputeStatus::UnderReview;
            case.review_deadline = Some(Utc::now() + self.config.review_window);
        }

        let payload = json!({
            "case_id": case_id,
            "escrow_id": case.escrow_id,
            "submitted_by": caller,
            "both_filed": both_filed,
        });
        let escrow_id = case.escrow_id;
        self.publisher
            .publish(
                EscrowEventKind::EvidenceSubmitted,
                Some(escrow_id),
                Some(case_id),
                Some(caller),
                payload,
            )
            .await;

        info!(%case_id, submitted_by = caller, both_filed, "evidence filed");
        Ok(())
    }

    /// Decide the case and settle the referenced escrow
    ///
    /// Only the assigned arbiter, from evidence collection or review. The
    /// arbiter's declared fee (on the escrow amount) accrues to their
    /// earnings balance.
    pub async fn resolve_case(
        &self,
        case_id: Uuid,
        caller: &str,
        outcome: DisputeOutcome,
        resolution: String,
        buyer_amount: u64,
        seller_amount: u64,
    ) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let mut cases = self.cases.write().await;
        let case = Self::case_mut(&mut cases, case_id)?;

        if caller != case.arbiter {
            return Err(EscrowError::authorization(
                "only the assigned arbiter may resolve the case",
            ));
        }
        if !matches!(
            case.status,
            DisputeStatus::EvidenceCollection | DisputeStatus::UnderReview
        ) {
            return Err(EscrowError::state_transition(
                format!("{:?}", case.status),
                format!("{:?}", DisputeStatus::Resolved),
                "case is not open for resolution".to_string(),
            ));
        }

        let escrow = self.ledger.get(case.escrow_id).await?;
        let winner = match outcome {
            DisputeOutcome::BuyerFavor => escrow.terms.buyer.clone(),
            DisputeOutcome::SellerFavor => escrow.terms.seller.clone(),
            DisputeOutcome::Split => {
                if buyer_amount >= seller_amount {
                    escrow.terms.buyer.clone()
                } else {
                    escrow.terms.seller.clone()
                }
            }
        };

        // Settle first: the ledger re-validates caller, state and amounts,
        // and a refused settlement leaves the case untouched
        self.ledger
            .resolve_dispute(case.escrow_id, caller, &winner, buyer_amount, seller_amount)
            .await?;

        case.status = DisputeStatus::Resolved;
        case.outcome = Some(outcome);
        case.resolution = Some(resolution);
        case.resolved_at = Some(Utc::now());

        let profile = self.arbiters.get(caller).await?;
        let arbiter_fee = fees::fee_for(escrow.terms.amount, profile.fee_bps);
        self.arbiters.note_case_resolved(caller, arbiter_fee).await?;

        let payload = json!({
            "case_id": case_id,
            "escrow_id": case.escrow_id,
            "arbiter": caller,
            "outcome": outcome,
            "winner": winner,
            "buyer_amount": buyer_amount,
            "seller_amount": seller_amount,
            "arbiter_fee": arbiter_fee,
        });
        let escrow_id = case.escrow_id;
        self.publisher
            .publish(
                EscrowEventKind::DisputeResolved,
                Some(escrow_id),
                Some(case_id),
                Some(caller),
                payload,
            )
            .await;

        info!(%case_id, arbiter = caller, ?outcome, "dispute case resolved");
        Ok(())
    }

    /// Extend the current phase deadline (assigned arbiter only)
    pub async fn extend_deadline(
        &self,
        case_id: Uuid,
        caller: &str,
        extension: Duration,
    ) -> EscrowResult<()> {
        self.policy.require_unpaused_for(caller).await?;
        let mut cases = self.cases.write().await;
        let case = Self::case_mut(&mut cases, case_id)?;

        if caller != case.arbiter {
            return Err(EscrowError::authorization(
                "only the assigned arbiter may extend deadlines",
            ));
        }
        match case.status {
            DisputeStatus::EvidenceCollection => {
                case.evidence_deadline = case.evidence_deadline + extension;
            }
            DisputeStatus::UnderReview => {
                if let Some(deadline) = case.review_deadline {
                    case.review_deadline = Some(deadline + extension);
                }
            }
            _ => {
                return Err(EscrowError::state_transition(
                    format!("{:?}", case.status),
                    format!("{:?}", DisputeStatus::UnderReview),
                    "deadlines only extend while the case is open".to_string(),
                ));
            }
        }

        info!(%case_id, "case deadline extended");
        Ok(())
    }

    /// Escalate a resolved case for appeal (admin only)
    pub async fn escalate(&self, case_id: Uuid, caller: &str) -> EscrowResult<()> {
        self.policy.require_admin(caller).await?;
        let mut cases = self.cases.write().await;
        let case = Self::case_mut(&mut cases, case_id)?;

        if case.status != DisputeStatus::Resolved {
            return Err(EscrowError::state_transition(
                format!("{:?}", case.status),
                format!("{:?}", DisputeStatus::Appealed),
                "only resolved cases may be appealed".to_string(),
            ));
        }
        case.status = DisputeStatus::Appealed;
        info!(%case_id, "case escalated to appeal");
        Ok(())
    }

    /// Archive a resolved case (admin only)
    pub async fn close(&self, case_id: Uuid, caller: &str) -> EscrowResult<()> {
        self.policy.require_admin(caller).await?;
        let mut cases = self.cases.write().await;
        let case = Self::case_mut(&mut cases, case_id)?;

        if case.status != DisputeStatus::Resolved {
            return Err(EscrowError::state_transition(
                format!("{:?}", case.status),
                format!("{:?}", DisputeStatus::Closed),
                "only resolved cases may be closed".to_string(),
            ));
        }
        case.status = DisputeStatus::Closed;
        info!(%case_id, "case closed");
        Ok(())
    }

    /// Fetch a case by id
    pub async fn get_case(&self, case_id: Uuid) -> EscrowResult<DisputeCase> {
        self.cases
            .read()
            .await
            .get(&case_id)
            .cloned()
            .ok_or_else(|| EscrowError::validation(format!("case {case_id} not found")))
    }

    /// Every case referencing one escrow
    pub async fn cases_for_escrow(&self, escrow_id: u64) -> Vec<DisputeCase> {
        self.cases
            .read()
            .await
            .values()
            .filter(|c| c.escrow_id == escrow_id)
            .cloned()
            .collect()
    }

    fn case_mut(
        cases: &mut HashMap<Uuid, DisputeCase>,
        case_id: Uuid,
    ) -> EscrowResult<&mut DisputeCase> {
        cases
            .get_mut(&case_id)
            .ok_or_else(|| EscrowError::validation(format!("case {case_id} not found")))
    }
}
