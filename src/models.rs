//! Core data models for the escrow engine
//!
//! This module contains the escrow records and state machine, dispute
//! cases, arbiter profiles and the quorum resolution message.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::EscrowResult;

/// Opaque account identifier within the execution environment
pub type AccountId = String;

/// Kind of value held in escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetKind {
    /// Native unit of the execution environment
    Native,
    /// Fungible token identified by its denomination
    Token { denom: String },
}

impl AssetKind {
    /// Stable key used for balance bookkeeping
    pub fn key(&self) -> String {
        match self {
            Self::Native => "native".to_string(),
            Self::Token { denom } => format!("token:{denom}"),
        }
    }
}

/// Escrow state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowState {
    /// Terms agreed, awaiting the buyer's deposit
    Created,
    /// Full amount held in custody
    Funded,
    /// Every milestone complete, awaiting release
    InProgress,
    /// Under arbitration
    Disputed,
    /// Value released
    Completed,
    /// Abandoned or refunded
    Cancelled,
}

impl EscrowState {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Check if this state accepts funding
    pub fn can_fund(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Check if this state allows release to the seller
    pub fn can_complete(&self) -> bool {
        matches!(self, Self::Funded | Self::InProgress)
    }

    /// Check if this state allows opening a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Funded)
    }
}

/// Immutable escrow terms, fixed at creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowTerms {
    pub buyer: AccountId,
    pub seller: AccountId,
    pub arbitrator: Option<AccountId>,
    pub asset: AssetKind,
    /// Amount in the asset's smallest unit
    pub amount: u64,
    pub deadline: DateTime<Utc>,
    pub description: String,
    /// Ordered unique milestone names
    pub milestones: Vec<String>,
}

impl EscrowTerms {
    /// Check whether an account is the buyer or the seller
    pub fn is_party(&self, account: &str) -> bool {
        self.buyer == account || self.seller == account
    }
}

/// One escrow record, owned exclusively by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    /// Ledger-assigned sequential id, never reused
    pub id: u64,
    pub terms: EscrowTerms,
    pub state: EscrowState,
    /// Zero or exactly `terms.amount`; partial funding is not a state
    pub funded_amount: u64,
    pub completed_milestones: BTreeSet<String>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub dispute_initiator: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl EscrowRecord {
    /// Create a fresh record in the initial state
    pub fn new(id: u64, terms: EscrowTerms) -> Self {
        Self {
            id,
            terms,
            state: EscrowState::Created,
            funded_amount: 0,
            completed_milestones: BTreeSet::new(),
            disputed_at: None,
            dispute_initiator: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            settled_at: None,
        }
    }

    /// Validate a transition against the escrow lifecycle graph
    pub fn validate_transition(&self, to: EscrowState) -> EscrowResult<()> {
        use EscrowState::*;

        let valid = matches!(
            (self.state, to),
            (Created, Funded)
                | (Created, Cancelled)
                | (Funded, InProgress)
                | (Funded, Disputed)
                | (Funded, Completed)
                | (Funded, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (Disputed, Completed)
                | (Disputed, Cancelled)
        );

        if valid {
            Ok(())
        } else {
            Err(EscrowError::state_transition(
                format!("{:?}", self.state),
                format!("{to:?}"),
                "transition not allowed by the escrow lifecycle".to_string(),
            ))
        }
    }
}

/// Dispute case state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeStatus {
    /// Case constructed, not yet accepting evidence
    Pending,
    /// Both parties may file evidence, once each
    EvidenceCollection,
    /// Evidence closed, awaiting the arbiter's decision
    UnderReview,
    /// Arbiter decided; escrow settled
    Resolved,
    /// Decision escalated for appeal
    Appealed,
    /// Case archived
    Closed,
}

/// Dispute outcome decided by the arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeOutcome {
    /// Funds return to the buyer
    BuyerFavor,
    /// Funds release to the seller
    SellerFavor,
    /// Funds split between the parties
    Split,
}

/// One party's evidence submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub submitted_by: AccountId,
    pub body: String,
    pub submitted_at: DateTime<Utc>,
}

/// Dispute case for arbitration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeCase {
    pub id: Uuid,
    pub escrow_id: u64,

    // Parties
    pub complainant: AccountId,
    pub respondent: AccountId,
    pub arbiter: AccountId,

    /// At most one entry per party
    pub evidence: Vec<Evidence>,

    // Deadlines
    pub created_at: DateTime<Utc>,
    pub evidence_deadline: DateTime<Utc>,
    pub review_deadline: Option<DateTime<Utc>>,

    // Outcome
    pub status: DisputeStatus,
    pub outcome: Option<DisputeOutcome>,
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DisputeCase {
    /// Create a new case; the desk opens the evidence window
    pub fn new(
        escrow_id: u64,
        complainant: AccountId,
        respondent: AccountId,
        arbiter: AccountId,
        evidence_deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            escrow_id,
            complainant,
            respondent,
            arbiter,
            evidence: Vec::new(),
            created_at: Utc::now(),
            evidence_deadline,
            review_deadline: None,
            status: DisputeStatus::Pending,
            outcome: None,
            resolution: None,
            resolved_at: None,
        }
    }

    /// Check whether a party has already filed evidence
    pub fn has_evidence_from(&self, account: &str) -> bool {
        self.evidence.iter().any(|e| e.submitted_by == account)
    }

    /// Both named parties have filed
    pub fn both_sides_filed(&self) -> bool {
        self.has_evidence_from(&self.complainant) && self.has_evidence_from(&self.respondent)
    }
}

/// Arbiter profile: registration, case counters, rating and earnings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbiterProfile {
    pub id: AccountId,
    /// Declared fee in basis points, capped at registration
    pub fee_bps: u16,
    pub cases_assigned: u32,
    pub cases_resolved: u32,
    /// Running mean rating (1-5), integer truncated; 0 until first rating
    pub rating_mean: u8,
    pub rating_count: u32,
    /// Accounts that have already rated this arbiter
    pub raters: BTreeSet<AccountId>,
    /// Accrued arbitration fees, withdrawable by the arbiter
    pub earnings: u64,
    /// Profiles are never deleted, only deactivated
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArbiterProfile {
    /// Create a new active profile
    pub fn new(id: AccountId, fee_bps: u16) -> Self {
        Self {
            id,
            fee_bps,
            cases_assigned: 0,
            cases_resolved: 0,
            rating_mean: 0,
            rating_count: 0,
            raters: BTreeSet::new(),
            earnings: 0,
            active: true,
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Fold one rating into the running mean with integer truncation
    pub fn apply_rating(&mut self, rating: u8) {
        let total = self.rating_mean as u32 * self.rating_count + rating as u32;
        self.rating_count += 1;
        self.rating_mean = (total / self.rating_count) as u8;
    }
}

/// Resolution message signed off-path by committee members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumResolution {
    pub escrow_id: u64,
    pub winner: AccountId,
    pub buyer_amount: u64,
    pub seller_amount: u64,
    /// Per-escrow counter; must equal the stored value exactly
    pub nonce: u64,
    pub deadline: DateTime<Utc>,
}

/// Notification record for external indexers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEvent {
    /// Publisher-assigned, strictly increasing
    pub sequence: u64,
    pub kind: String,
    pub escrow_id: Option<u64>,
    pub case_id: Option<Uuid>,
    pub actor: Option<AccountId>,
    /// Carries enough fields (parties, amounts) to reconstruct state
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}
