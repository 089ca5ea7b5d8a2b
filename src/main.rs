//! Duel Coordinator Server
//!
//! `duel-coordinator [serve]` runs the WebSocket server on an in-memory
//! ledger. `duel-coordinator demo` registers one match (through a stale
//! sequence) and plays one committed round, logging each step.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use duel_coordinator::{
    config::CoordinatorConfig,
    core::ids::{Address, MatchId},
    ledger::{DevEnvelopeSigner, DevWallet, InMemoryLedger, Wallet},
    network::{AuthConfig, BroadcastNotifier, CoordinatorServer, ServerConfig},
    proof::{
        compute_move_commitment, CommitRequest, MovePlan, MoveType, PublicInputs, ResolveOutcome, Reveal,
        RoundCommitmentLedger, StubProofVerifier,
    },
    registration::{sign_as_client, CoordinatorDeps, RegistrationCoordinator, RegistrationStatus},
    store::{InMemoryMatchStore, InMemoryPendingStore, MatchRecord, MatchStore},
    VERSION,
};

struct Services {
    ledger: Arc<InMemoryLedger>,
    matches: Arc<InMemoryMatchStore>,
    notifier: Arc<BroadcastNotifier>,
    coordinator: Arc<RegistrationCoordinator>,
    rounds: Arc<RoundCommitmentLedger>,
}

fn services(config: CoordinatorConfig) -> Services {
    let ledger = Arc::new(InMemoryLedger::new());
    let matches = Arc::new(InMemoryMatchStore::new());
    let notifier = Arc::new(BroadcastNotifier::new());
    let rounds = Arc::new(RoundCommitmentLedger::new(
        Arc::new(StubProofVerifier),
        notifier.clone(),
        config.verify_on_commit,
    ));
    let coordinator = Arc::new(RegistrationCoordinator::new(config.clone(), CoordinatorDeps {
        ledger: ledger.clone(),
        matches: matches.clone(),
        pending: Arc::new(InMemoryPendingStore::new()),
        notifier: notifier.clone(),
        envelope_signer: Arc::new(DevEnvelopeSigner::new(config.service_address.clone())),
    }));
    Services { ledger, matches, notifier, coordinator, rounds }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Duel Coordinator v{}", VERSION);

    let config = CoordinatorConfig::from_env();
    info!(mode = ?config.mode, service = %config.service_address, "Coordinator config loaded");

    match std::env::args().nth(1).as_deref() {
        None | Some("serve") => serve(config).await,
        Some("demo") => demo(config).await,
        Some(other) => bail!("unknown command '{}', expected 'serve' or 'demo'", other),
    }
}

async fn serve(config: CoordinatorConfig) -> anyhow::Result<()> {
    let mut server_config = ServerConfig::default();
    if let Ok(bind) = std::env::var("BIND_ADDR") {
        server_config.bind_addr = bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid BIND_ADDR '{}'", bind))?;
    }

    let auth = AuthConfig::from_env();
    if !auth.is_configured() && !auth.insecure_dev {
        bail!("no JWT key configured: set AUTH_SECRET or AUTH_PUBLIC_KEY_PEM (or AUTH_INSECURE_DEV=1 locally)");
    }

    let s = services(config);
    let server = Arc::new(CoordinatorServer::new(server_config, auth, s.coordinator, s.rounds, s.notifier));
    server.run().await?;
    Ok(())
}

/// End-to-end walkthrough on the in-memory ledger.
async fn demo(config: CoordinatorConfig) -> anyhow::Result<()> {
    info!("=== Starting Demo Match ===");
    let s = services(config);

    let alice = DevWallet::new(Address::new("GALICE"));
    let bob = DevWallet::new(Address::new("GBOB"));
    let record = MatchRecord::new(MatchId::new_v4(), Address::new("GALICE"), Address::new("GBOB")).with_stake(100);
    let match_id = record.match_id;
    s.matches.insert(record).await?;
    s.matches.confirm_stake(&match_id, &Address::new("GALICE")).await?;
    s.matches.confirm_stake(&match_id, &Address::new("GBOB")).await?;
    info!(match_id = %match_id, "Match created with 100 points staked");

    let mut events = s.notifier.subscribe(match_id);

    // The first submission hits a stale sequence and is rebuilt.
    s.ledger.inject_stale_sequences(1).await;

    let first = sign_as_client(&s.coordinator, &match_id, &alice).await;
    info!(status = ?first.status(), "Alice signed");
    let second = sign_as_client(&s.coordinator, &match_id, &bob).await;
    info!(status = ?second.status(), "Bob signed");
    if second.status() != RegistrationStatus::Complete {
        bail!("registration did not complete: {:?}", second.error);
    }

    let registered = s.matches.get(&match_id).await?.context("match record vanished")?;
    info!(
        session_id = ?registered.session_id,
        tx_id = ?registered.registration_tx,
        submit_attempts = s.ledger.submit_attempts().await,
        landed = s.ledger.landed().await.len(),
        "Registration complete"
    );

    // One round, one turn.
    info!("=== Round 1 ===");
    s.rounds.register_match(match_id, alice.address().clone(), bob.address().clone()).await;
    let plans = [
        (alice.address().clone(), MovePlan::new(vec![MoveType::Special, MoveType::Kick], [7; 32])),
        (bob.address().clone(), MovePlan::new(vec![MoveType::Block], [11; 32])),
    ];

    for (player, plan) in &plans {
        let commitment = compute_move_commitment(&match_id, 1, 1, player, plan);
        let outcome = s
            .rounds
            .commit(&match_id, player, CommitRequest {
                round: 1,
                turn: 1,
                commitment,
                proof: commitment.to_vec(),
                public_inputs: PublicInputs::for_commitment(commitment),
                transcript_hash: [0; 32],
            })
            .await?;
        info!(player = %player.short(), commitment = %hex::encode(&commitment[..4]), outcome = ?outcome, "Committed");
    }

    // Special breaks block.
    let winner = Some(alice.address().clone());
    let mut resolution = None;
    for (player, plan) in &plans {
        let reveal = Reveal {
            move_type: plan.move_for_turn(1).context("empty plan")?,
            plan: plan.clone(),
            expected_winner: winner.clone(),
        };
        if let ResolveOutcome::Resolved(r) = s.rounds.resolve(&match_id, 1, 1, player, reveal).await? {
            resolution = Some(r);
        }
    }
    let resolution = resolution.context("round did not resolve")?;
    info!(moves = ?resolution.moves, winner = ?resolution.winner, "Round resolved");

    info!("=== Events ===");
    while let Ok(event) = events.try_recv() {
        info!(event = event.name(), "{:?}", event);
    }
    Ok(())
}
