//! Main escrow node - wires every component together
//!
//! Builds the authorization policy, event log, arbiter directory, ledger,
//! dispute desk and (when a committee is configured) the quorum resolver
//! in dependency order, sharing one adapter and one publisher throughout.

use std::sync::Arc;

use chrono::Duration;
use tracing::info;

use crate::access::AccessControlPolicy;
use crate::arbiters::ArbiterDirectory;
use crate::disputes::{DisputeDesk, DisputeDeskConfig};
use crate::events::EventPublisher;
use crate::ledger::{EscrowLedger, LedgerConfig};
use crate::quorum::{QuorumConfig, QuorumResolver};
use crate::settings::EngineSettings;
use crate::transfer::ValueTransferAdapter;
use crate::EscrowResult;

/// Fully wired escrow node
pub struct EscrowNode {
    pub policy: Arc<AccessControlPolicy>,
    pub events: Arc<EventPublisher>,
    pub arbiters: Arc<ArbiterDirectory>,
    pub ledger: Arc<EscrowLedger>,
    pub disputes: Arc<DisputeDesk>,
    /// Present when the settings carry a quorum committee
    pub quorum: Option<Arc<QuorumResolver>>,
}

impl EscrowNode {
    /// Create a node from validated settings and a value-transfer adapter
    pub fn new(
        settings: EngineSettings,
        adapter: Arc<dyn ValueTransferAdapter>,
    ) -> EscrowResult<Self> {
        settings.validate()?;

        let policy = Arc::new(AccessControlPolicy::new(settings.admins.clone()));
        let events = Arc::new(EventPublisher::new());
        let arbiters = Arc::new(ArbiterDirectory::new(
            policy.clone(),
            adapter.clone(),
            events.clone(),
        ));

        let quorum_enabled = !settings.quorum_committee.is_empty();
        let ledger = Arc::new(EscrowLedger::new(
            LedgerConfig {
                fee_rate_bps: settings.fee_rate_bps,
                fee_recipient: settings.fee_recipient.clone(),
                max_open_escrows: settings.max_open_escrows,
                dispute_timeout: Duration::seconds(settings.dispute_timeout_secs as i64),
                quorum_authority: quorum_enabled.then(|| settings.quorum_authority.clone()),
            },
            policy.clone(),
            adapter.clone(),
            events.clone(),
        )?);

        let disputes = Arc::new(DisputeDesk::new(
            DisputeDeskConfig {
                case_fee: settings.case_fee,
                evidence_window: Duration::seconds(settings.evidence_window_secs as i64),
                review_window: Duration::seconds(settings.review_window_secs as i64),
            },
            ledger.clone(),
            arbiters.clone(),
            policy.clone(),
            adapter.clone(),
            events.clone(),
        ));

        let quorum = if quorum_enabled {
            Some(Arc::new(QuorumResolver::new(
                QuorumConfig {
                    committee: settings.quorum_committee.clone(),
                    threshold: settings.quorum_threshold,
                    authority: settings.quorum_authority.clone(),
                },
                ledger.clone(),
                policy.clone(),
                events.clone(),
            )?))
        } else {
            None
        };

        info!(quorum_enabled, "escrow node initialized");
        Ok(Self {
            policy,
            events,
            arbiters,
            ledger,
            disputes,
            quorum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::InMemoryBank;
    use secp256k1::rand::thread_rng;
    use secp256k1::Secp256k1;

    #[tokio::test]
    async fn node_builds_from_default_settings() {
        let node = EscrowNode::new(
            EngineSettings::default(),
            Arc::new(InMemoryBank::new()),
        )
        .unwrap();
        assert!(node.quorum.is_none());
        assert!(node.events.all().await.is_empty());
    }

    #[tokio::test]
    async fn node_builds_a_resolver_when_committee_is_set() {
        let secp = Secp256k1::new();
        let mut rng = thread_rng();
        let committee: Vec<String> = (0..3)
            .map(|_| hex::encode(secp.generate_keypair(&mut rng).1.serialize()))
            .collect();

        let settings = EngineSettings {
            quorum_committee: committee,
            quorum_threshold: 2,
            ..EngineSettings::default()
        };
        let node = EscrowNode::new(settings, Arc::new(InMemoryBank::new())).unwrap();
        assert!(node.quorum.is_some());
    }
}
