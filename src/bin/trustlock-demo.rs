//! End-to-end drive of the escrow engine: a milestone-gated release, an
//! arbitrated dispute, and a quorum-signed settlement against one node.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use secp256k1::rand::thread_rng;
use secp256k1::Secp256k1;

use trustlock::engine::EscrowNode;
use trustlock::ledger::CreateEscrowRequest;
use trustlock::models::{AssetKind, DisputeOutcome, QuorumResolution};
use trustlock::quorum::sign_resolution;
use trustlock::settings::EngineSettings;
use trustlock::transfer::InMemoryBank;

fn trade(seller: &str, amount: u64) -> CreateEscrowRequest {
    CreateEscrowRequest {
        seller: seller.to_string(),
        arbitrator: Some("judge".to_string()),
        asset: AssetKind::Native,
        amount,
        deadline: Utc::now() + Duration::days(30),
        description: "demo trade".to_string(),
        milestones: vec![],
        deposit: 0,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let secp = Secp256k1::new();
    let mut rng = thread_rng();
    let committee: Vec<_> = (0..3).map(|_| secp.generate_keypair(&mut rng)).collect();

    let mut settings = EngineSettings::load(None)?;
    settings.quorum_committee = committee
        .iter()
        .map(|(_, pk)| hex::encode(pk.serialize()))
        .collect();
    settings.quorum_threshold = 2;
    settings.validate()?;

    let bank = Arc::new(InMemoryBank::new());
    bank.seed("alice", &AssetKind::Native, 5_000_000).await;
    bank.seed("carol", &AssetKind::Native, 5_000_000).await;
    let node = EscrowNode::new(settings, bank.clone())?;

    // Milestone-gated release: alice buys a site build from bob
    let mut build = trade("bob", 1_000_000);
    build.milestones = vec!["design".to_string(), "launch".to_string()];
    let site = node.ledger.create("alice", build).await?;
    node.ledger.fund(site, "alice", 1_000_000).await?;
    node.ledger.complete_milestone(site, "bob", "design").await?;
    node.ledger.complete_milestone(site, "bob", "launch").await?;
    node.ledger.complete(site, "bob").await?;
    println!(
        "release: bob received {}, treasury {}",
        bank.balance_of("bob", &AssetKind::Native).await,
        bank.balance_of("treasury", &AssetKind::Native).await,
    );

    // Arbitrated dispute: carol contests a delivery from dan
    node.arbiters.register("judge", 100).await?;
    let order = node.ledger.create("carol", trade("dan", 800_000)).await?;
    node.ledger.fund(order, "carol", 800_000).await?;
    let case = node.disputes.open_case(order, "carol", "judge").await?;
    node.disputes
        .submit_evidence(case, "carol", "parcel never arrived".to_string())
        .await?;
    node.disputes
        .submit_evidence(case, "dan", "tracking shows delivery".to_string())
        .await?;
    node.disputes
        .resolve_case(
            case,
            "judge",
            DisputeOutcome::Split,
            "carrier lost the parcel in transit".to_string(),
            500_000,
            300_000,
        )
        .await?;
    node.arbiters.rate("judge", "carol", 5).await?;
    println!(
        "dispute: carol {}, dan {}, judge earned {}",
        bank.balance_of("carol", &AssetKind::Native).await,
        bank.balance_of("dan", &AssetKind::Native).await,
        node.arbiters.get("judge").await?.earnings,
    );

    // Quorum settlement: two of three committee members sign the outcome
    let contested = node.ledger.create("alice", trade("erin", 500_000)).await?;
    node.ledger.fund(contested, "alice", 500_000).await?;
    node.ledger.initiate_dispute(contested, "alice").await?;

    let resolution = QuorumResolution {
        escrow_id: contested,
        winner: "erin".to_string(),
        buyer_amount: 100_000,
        seller_amount: 400_000,
        nonce: 0,
        deadline: Utc::now() + Duration::hours(1),
    };
    let signatures: Vec<_> = committee[..2]
        .iter()
        .map(|(sk, _)| sign_resolution(&secp, &resolution, sk))
        .collect();
    let quorum = node
        .quorum
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("quorum resolver not configured"))?;
    quorum
        .resolve_with_signatures("relayer", &resolution, &signatures)
        .await?;
    println!(
        "quorum: erin received {}, next nonce {}",
        bank.balance_of("erin", &AssetKind::Native).await,
        quorum.next_nonce(contested).await,
    );

    println!("events published: {}", node.events.all().await.len());
    Ok(())
}
