//! Append-only notification log for external observers
//!
//! One record per occurrence, in publish order. Indexers and registries
//! consume this log one-way; core logic never reads it back.

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::models::EscrowEvent;

/// Notification kinds emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowEventKind {
    EscrowCreated,
    EscrowFunded,
    MilestoneCompleted,
    EscrowCompleted,
    EscrowDisputed,
    EscrowCancelled,
    EmergencyWithdrawal,
    DisputeOpened,
    EvidenceSubmitted,
    DisputeResolved,
    ArbiterRegistered,
    ArbiterRated,
    QuorumResolutionApplied,
}

impl EscrowEventKind {
    /// Stable wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EscrowCreated => "escrow.created",
            Self::EscrowFunded => "escrow.funded",
            Self::MilestoneCompleted => "escrow.milestone_completed",
            Self::EscrowCompleted => "escrow.completed",
            Self::EscrowDisputed => "escrow.disputed",
            Self::EscrowCancelled => "escrow.cancelled",
            Self::EmergencyWithdrawal => "escrow.emergency_withdrawal",
            Self::DisputeOpened => "dispute.opened",
            Self::EvidenceSubmitted => "dispute.evidence_submitted",
            Self::DisputeResolved => "dispute.resolved",
            Self::ArbiterRegistered => "arbiter.registered",
            Self::ArbiterRated => "arbiter.rated",
            Self::QuorumResolutionApplied => "quorum.resolution_applied",
        }
    }
}

/// Ordered publisher; sequence numbers strictly increase for its lifetime
#[derive(Default)]
pub struct EventPublisher {
    log: RwLock<Vec<EscrowEvent>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one notification and return its sequence number
    pub async fn publish(
        &self,
        kind: EscrowEventKind,
        escrow_id: Option<u64>,
        case_id: Option<Uuid>,
        actor: Option<&str>,
        payload: Value,
    ) -> u64 {
        let mut log = self.log.write().await;
        let sequence = log.len() as u64 + 1;
        info!(kind = kind.as_str(), sequence, ?escrow_id, "published event");
        log.push(EscrowEvent {
            sequence,
            kind: kind.as_str().to_string(),
            escrow_id,
            case_id,
            actor: actor.map(str::to_string),
            payload,
            recorded_at: Utc::now(),
        });
        sequence
    }

    /// Snapshot of the full log, in publish order
    pub async fn all(&self) -> Vec<EscrowEvent> {
        self.log.read().await.clone()
    }

    /// Snapshot of every notification touching one escrow
    pub async fn for_escrow(&self, escrow_id: u64) -> Vec<EscrowEvent> {
        self.log
            .read()
            .await
            .iter()
            .filter(|e| e.escrow_id == Some(escrow_id))
            .cloned()
            .collect()
    }
}
