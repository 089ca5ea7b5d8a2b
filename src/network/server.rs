//! WebSocket Coordinator Server
//!
//! Async WebSocket front end for registration and round play.
//! Handles authentication, request routing to the coordinator and round
//! ledger, notification forwarding, and the periodic cleanup sweep.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::core::ids::{Address, MatchId};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::network::auth::{authenticate, AuthConfig, AuthError};
use crate::network::notify::BroadcastNotifier;
use crate::network::protocol::{
    AuthRequest, AuthResult, CancelResult, CancelState, ClientMessage, CommitMoveRequest, ErrorCode,
    RegistrationUpdate, RevealMoveRequest, RoundUpdate, ServerError, ServerMessage, SubmitAuthRequest,
};
use crate::proof::rounds::{CommitRequest, Reveal, RoundCommitmentLedger};
use crate::registration::coordinator::RegistrationCoordinator;
use crate::store::{MatchRecord, MatchStatus};

/// Reason used when a client cancels without giving one.
const DEFAULT_CANCEL_REASON: &str = "player_cancelled";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for longer than this are dropped.
    pub idle_timeout: Duration,
    /// How often the cleanup sweep runs.
    pub cleanup_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(15),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

fn pong(timestamp: u64) -> ServerMessage {
    ServerMessage::Pong {
        timestamp,
        server_time: Utc::now().timestamp_millis().max(0) as u64,
    }
}

/// Connected client state.
struct ConnectedClient {
    /// Wallet address (after auth).
    address: Option<Address>,
    /// Last activity.
    last_activity: Instant,
    /// Wakes the connection task when the client is dropped.
    kick: Arc<Notify>,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// Per-connection state owned by the connection task.
struct Connection {
    addr: SocketAddr,
    address: Option<Address>,
    subscriptions: BTreeMap<MatchId, JoinHandle<()>>,
}

impl Connection {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            address: None,
            subscriptions: BTreeMap::new(),
        }
    }

    fn close(&mut self) {
        for (_, forwarder) in std::mem::take(&mut self.subscriptions) {
            forwarder.abort();
        }
    }
}

/// The coordinator server.
pub struct CoordinatorServer {
    config: ServerConfig,
    auth: AuthConfig,
    coordinator: Arc<RegistrationCoordinator>,
    rounds: Arc<RoundCommitmentLedger>,
    notifier: Arc<BroadcastNotifier>,
    clients: Clients,
    shutdown_tx: broadcast::Sender<()>,
}

impl CoordinatorServer {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        coordinator: Arc<RegistrationCoordinator>,
        rounds: Arc<RoundCommitmentLedger>,
        notifier: Arc<BroadcastNotifier>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            auth,
            coordinator,
            rounds,
            notifier,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind and run until shutdown.
    #[instrument(skip(self), fields(bind_addr = %self.config.bind_addr))]
    pub async fn run(self: Arc<Self>) -> Result<(), CoordinatorServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Coordinator server listening on {}", self.config.bind_addr);
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections on `listener` until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let cleanup = {
            let server = self.clone();
            tokio::spawn(async move { server.run_cleanup_loop().await })
        };
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            info!("New connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move { server.handle_connection(stream, addr).await });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup.abort();
    }

    /// Handle one WebSocket connection until it closes.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);
        let kick = Arc::new(Notify::new());
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.clients.write().await.insert(addr, ConnectedClient {
            address: None,
            last_activity: Instant::now(),
            kick: kick.clone(),
        });

        let sender_task = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let mut connection = Connection::new(addr);
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.touch(&addr).await;
                            let client_msg = match ClientMessage::from_json(&text) {
                                Ok(m) => m,
                                Err(e) => {
                                    debug!("Invalid message from {}: {}", addr, e);
                                    let _ = msg_tx.send(ServerMessage::Error(ServerError::new(
                                        ErrorCode::InvalidInput,
                                        "Invalid message format",
                                    ))).await;
                                    continue;
                                }
                            };
                            let reply = self.handle_client_message(&mut connection, client_msg, &msg_tx).await;
                            if msg_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(_))) => {
                            self.touch(&addr).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error for {}: {}", addr, e);
                            break;
                        }
                        _ => {}
                    }
                }
                _ = kick.notified() => {
                    debug!("Client {} dropped by cleanup", addr);
                    break;
                }
                _ = shutdown_rx.recv() => {
                    let _ = msg_tx.send(ServerMessage::Shutdown {
                        reason: "Server shutting down".to_string(),
                    }).await;
                    break;
                }
            }
        }

        connection.close();
        drop(msg_tx);
        // Let queued replies flush before the socket goes away.
        let _ = tokio::time::timeout(Duration::from_secs(1), sender_task).await;
        self.clients.write().await.remove(&addr);
        info!("Client {} cleaned up", addr);
    }

    async fn touch(&self, addr: &SocketAddr) {
        if let Some(client) = self.clients.write().await.get_mut(addr) {
            client.last_activity = Instant::now();
        }
    }

    /// Route one client message and build the reply.
    async fn handle_client_message(
        &self,
        connection: &mut Connection,
        msg: ClientMessage,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> ServerMessage {
        let Some(address) = connection.address.clone() else {
            return match msg {
                ClientMessage::Auth(auth) => self.handle_auth(connection, &auth).await,
                ClientMessage::Ping { timestamp } => pong(timestamp),
                _ => ServerMessage::Error(ServerError::new(ErrorCode::NotAuthenticated, "Must authenticate first")),
            };
        };

        let result = match msg {
            ClientMessage::Auth(auth) => return self.handle_auth(connection, &auth).await,
            ClientMessage::Ping { timestamp } => return pong(timestamp),
            ClientMessage::PrepareRegistration { match_id } => self.handle_prepare(&address, match_id).await,
            ClientMessage::SubmitAuth(request) => self.handle_submit_auth(&address, request).await,
            ClientMessage::CancelMatch { match_id, reason } => self.handle_cancel(&address, match_id, reason).await,
            ClientMessage::CommitMove(request) => self.handle_commit(&address, request).await,
            ClientMessage::RevealMove(request) => self.handle_reveal(&address, request).await,
            ClientMessage::Subscribe { match_id } => self.handle_subscribe(connection, &address, match_id, sender).await,
        };

        result.unwrap_or_else(|err| {
            if err.is_integrity_violation() {
                warn!(client = %connection.addr, address = %address.short(), error = %err, "integrity violation");
            } else {
                debug!(client = %connection.addr, error = %err, "request failed");
            }
            ServerMessage::Error(ServerError::from(&err))
        })
    }

    async fn handle_auth(&self, connection: &mut Connection, auth: &AuthRequest) -> ServerMessage {
        match authenticate(&auth.token, &self.auth) {
            Ok(address) => {
                if let Some(client) = self.clients.write().await.get_mut(&connection.addr) {
                    client.address = Some(address.clone());
                }
                debug!(client = %connection.addr, address = %address.short(), "authenticated");
                connection.address = Some(address.clone());
                ServerMessage::AuthResult(AuthResult {
                    success: true,
                    address: Some(address),
                    error: None,
                    server_version: self.config.version.clone(),
                })
            }
            Err(e) => {
                let code = match e {
                    AuthError::Expired => ErrorCode::TokenExpired,
                    AuthError::NotConfigured => ErrorCode::AuthFailed,
                    _ => ErrorCode::InvalidToken,
                };
                debug!(client = %connection.addr, error = %e, "authentication failed");
                ServerMessage::Error(ServerError::new(code, e.to_string()))
            }
        }
    }

    async fn handle_prepare(&self, address: &Address, match_id: MatchId) -> CoordinatorResult<ServerMessage> {
        self.participant_record(address, &match_id).await?;
        let outcome = self.coordinator.prepare(&match_id).await?;
        Ok(ServerMessage::Registration(RegistrationUpdate::from_prepare(match_id, address, &outcome)))
    }

    async fn handle_submit_auth(
        &self,
        address: &Address,
        request: SubmitAuthRequest,
    ) -> CoordinatorResult<ServerMessage> {
        let progress = self
            .coordinator
            .submit_auth(&request.match_id, address, request.entry, request.payload.as_deref())
            .await?;
        Ok(ServerMessage::Registration(RegistrationUpdate::from_progress(request.match_id, &progress)))
    }

    async fn handle_cancel(
        &self,
        address: &Address,
        match_id: MatchId,
        reason: Option<String>,
    ) -> CoordinatorResult<ServerMessage> {
        self.participant_record(address, &match_id).await?;
        let reason = reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        let outcome = self.coordinator.cancel(&match_id, &reason).await?;
        if matches!(CancelState::from(&outcome), CancelState::Cancelled) {
            self.rounds.forget_match(&match_id).await;
        }
        Ok(ServerMessage::Cancel(CancelResult { match_id, state: CancelState::from(&outcome) }))
    }

    async fn handle_commit(&self, address: &Address, request: CommitMoveRequest) -> CoordinatorResult<ServerMessage> {
        self.ensure_rounds(&request.match_id).await?;
        let (match_id, round, turn) = (request.match_id, request.round, request.turn);
        let outcome = self
            .rounds
            .commit(&match_id, address, CommitRequest {
                round,
                turn,
                commitment: request.commitment,
                proof: request.proof,
                public_inputs: request.public_inputs,
                transcript_hash: request.transcript_hash,
            })
            .await?;
        Ok(ServerMessage::Round(RoundUpdate::committed(match_id, round, turn, &outcome)))
    }

    async fn handle_reveal(&self, address: &Address, request: RevealMoveRequest) -> CoordinatorResult<ServerMessage> {
        self.ensure_rounds(&request.match_id).await?;
        let (match_id, round, turn) = (request.match_id, request.round, request.turn);
        let outcome = self
            .rounds
            .resolve(&match_id, round, turn, address, Reveal {
                move_type: request.move_type,
                plan: request.plan,
                expected_winner: request.expected_winner,
            })
            .await?;
        Ok(ServerMessage::Round(RoundUpdate::revealed(match_id, round, turn, &outcome)))
    }

    async fn handle_subscribe(
        &self,
        connection: &mut Connection,
        address: &Address,
        match_id: MatchId,
        sender: &mpsc::Sender<ServerMessage>,
    ) -> CoordinatorResult<ServerMessage> {
        self.participant_record(address, &match_id).await?;
        if !connection.subscriptions.contains_key(&match_id) {
            let mut events = self.notifier.subscribe(match_id);
            let sender = sender.clone();
            let client = connection.addr;
            let forwarder = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(notification) => {
                            let msg = ServerMessage::Notification { match_id, notification };
                            if sender.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(client = %client, match_id = %match_id, missed, "subscriber lagging");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            connection.subscriptions.insert(match_id, forwarder);
            debug!(client = %connection.addr, match_id = %match_id, "subscribed");
        }
        Ok(ServerMessage::Subscribed { match_id })
    }

    /// Match record, if `address` plays in it.
    async fn participant_record(&self, address: &Address, match_id: &MatchId) -> CoordinatorResult<MatchRecord> {
        let record = self
            .coordinator
            .matches()
            .get(match_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("match {}", match_id)))?;
        if !record.is_participant(address) {
            return Err(CoordinatorError::Forbidden { match_id: *match_id, address: address.clone() });
        }
        Ok(record)
    }

    /// Start tracking rounds once the match is registered.
    async fn ensure_rounds(&self, match_id: &MatchId) -> CoordinatorResult<()> {
        if self.rounds.is_registered(match_id).await {
            return Ok(());
        }
        let record = self
            .coordinator
            .matches()
            .get(match_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("match {}", match_id)))?;
        if record.status != MatchStatus::InProgress {
            return Err(CoordinatorError::RoundNotReady(format!(
                "match {} is {:?}, not in progress",
                match_id, record.status
            )));
        }
        self.rounds.register_match(*match_id, record.player1, record.player2).await;
        Ok(())
    }

    /// Periodic sweep: idle connections, expired registrations, dead channels.
    async fn run_cleanup_loop(&self) {
        let mut ticker = interval(self.config.cleanup_interval);
        loop {
            ticker.tick().await;
            self.cleanup_once().await;
        }
    }

    async fn cleanup_once(&self) {
        let now = Instant::now();
        let idle: Vec<_> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, c)| now.duration_since(c.last_activity) > self.config.idle_timeout)
                .map(|(addr, c)| (*addr, c.kick.clone(), c.address.clone()))
                .collect()
        };
        for (addr, kick, address) in idle {
            info!(client = %addr, address = ?address, "Dropping idle client");
            kick.notify_one();
        }

        match self.coordinator.sweep_expired(Utc::now()).await {
            Ok(cancelled) => {
                for match_id in &cancelled {
                    self.rounds.forget_match(match_id).await;
                }
                if !cancelled.is_empty() {
                    info!(count = cancelled.len(), "Cancelled registrations past signature timeout");
                }
            }
            Err(e) => error!(error = %e, "Signature timeout sweep failed"),
        }

        self.notifier.prune();
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, RetryConfig};
    use crate::ledger::{DevEnvelopeSigner, DevWallet, InMemoryLedger, Wallet};
    use crate::network::protocol::{RegistrationUpdate, ServerError};
    use crate::proof::commitment::{compute_move_commitment, MovePlan, MoveType};
    use crate::proof::rounds::RoundState;
    use crate::proof::verify::{PublicInputs, StubProofVerifier};
    use crate::registration::coordinator::CoordinatorDeps;
    use crate::registration::RegistrationStatus;
    use crate::store::{InMemoryMatchStore, InMemoryPendingStore, MatchStore};
    use tokio_tungstenite::connect_async;

    struct Fixture {
        server: Arc<CoordinatorServer>,
        matches: Arc<InMemoryMatchStore>,
        match_id: MatchId,
    }

    async fn fixture() -> Fixture {
        fixture_with(ServerConfig::default()).await
    }

    async fn fixture_with(server_config: ServerConfig) -> Fixture {
        let matches = Arc::new(InMemoryMatchStore::new());
        let record = MatchRecord::new(MatchId::new_v4(), Address::new("GALICE"), Address::new("GBOB"));
        let match_id = record.match_id;
        matches.insert(record).await.unwrap();

        let notifier = Arc::new(BroadcastNotifier::new());
        let config = CoordinatorConfig { retry: RetryConfig::immediate(4), ..CoordinatorConfig::default() };
        let coordinator = Arc::new(RegistrationCoordinator::new(config.clone(), CoordinatorDeps {
            ledger: Arc::new(InMemoryLedger::new()),
            matches: matches.clone(),
            pending: Arc::new(InMemoryPendingStore::new()),
            notifier: notifier.clone(),
            envelope_signer: Arc::new(DevEnvelopeSigner::new(config.service_address.clone())),
        }));
        let rounds = Arc::new(RoundCommitmentLedger::new(Arc::new(StubProofVerifier), notifier.clone(), true));
        let auth = AuthConfig { insecure_dev: true, ..AuthConfig::default() };
        let server = Arc::new(CoordinatorServer::new(server_config, auth, coordinator, rounds, notifier));
        Fixture { server, matches, match_id }
    }

    async fn login(server: &CoordinatorServer, who: &str) -> Connection {
        let mut connection = Connection::new(SocketAddr::from(([127, 0, 0, 1], 1)));
        let (tx, _rx) = mpsc::channel(8);
        let reply = server
            .handle_client_message(
                &mut connection,
                ClientMessage::Auth(AuthRequest { token: who.into(), client_version: "test".into() }),
                &tx,
            )
            .await;
        assert!(matches!(reply, ServerMessage::AuthResult(AuthResult { success: true, .. })));
        connection
    }

    fn registration(reply: ServerMessage) -> RegistrationUpdate {
        match reply {
            ServerMessage::Registration(update) => update,
            other => panic!("expected registration update, got {:?}", other),
        }
    }

    fn error(reply: ServerMessage) -> ServerError {
        match reply {
            ServerMessage::Error(err) => err,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[tokio::test]
    async fn test_requires_auth() {
        let f = fixture().await;
        let mut connection = Connection::new(SocketAddr::from(([127, 0, 0, 1], 1)));
        let (tx, _rx) = mpsc::channel(8);

        let reply = f
            .server
            .handle_client_message(&mut connection, ClientMessage::PrepareRegistration { match_id: f.match_id }, &tx)
            .await;
        assert_eq!(error(reply).code, "not_authenticated");

        let pong = f.server.handle_client_message(&mut connection, ClientMessage::Ping { timestamp: 7 }, &tx).await;
        assert!(matches!(pong, ServerMessage::Pong { timestamp: 7, .. }));
    }

    #[tokio::test]
    async fn test_registration_over_messages() {
        let f = fixture().await;
        let (tx, mut rx) = mpsc::channel(16);
        let mut alice = login(&f.server, "GALICE").await;
        let mut bob = login(&f.server, "GBOB").await;

        let sub = f.server.handle_client_message(&mut alice, ClientMessage::Subscribe { match_id: f.match_id }, &tx).await;
        assert_eq!(sub, ServerMessage::Subscribed { match_id: f.match_id });

        let prepared = registration(
            f.server.handle_client_message(&mut alice, ClientMessage::PrepareRegistration { match_id: f.match_id }, &tx).await,
        );
        assert_eq!(prepared.status, RegistrationStatus::Signing);
        let payload = prepared.payload.clone();

        for (connection, who) in [(&mut alice, "GALICE"), (&mut bob, "GBOB")] {
            let wallet = DevWallet::new(Address::new(who));
            let view = registration(
                f.server
                    .handle_client_message(connection, ClientMessage::PrepareRegistration { match_id: f.match_id }, &tx)
                    .await,
            );
            let entry = view.auth_entry.unwrap();
            let signed = wallet.sign_auth(&entry, view.auth_valid_until.unwrap()).await.unwrap();
            let request = SubmitAuthRequest { match_id: f.match_id, entry: signed, payload: payload.clone() };
            let update = registration(f.server.handle_client_message(connection, ClientMessage::SubmitAuth(request), &tx).await);
            let expected = if who == "GALICE" { RegistrationStatus::WaitingForOpponent } else { RegistrationStatus::Complete };
            assert_eq!(update.status, expected);
        }

        let record = f.matches.get(&f.match_id).await.unwrap().unwrap();
        assert_eq!(record.status, MatchStatus::InProgress);

        // Alice's forwarder pushed the auth events and the completion.
        let mut names = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            if let ServerMessage::Notification { notification, .. } = msg {
                names.push(notification.name());
            }
        }
        assert!(names.contains(&"registration_complete"));
    }

    #[tokio::test]
    async fn test_non_participant_forbidden() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut eve = login(&f.server, "GEVE").await;

        let reply = f.server.handle_client_message(&mut eve, ClientMessage::PrepareRegistration { match_id: f.match_id }, &tx).await;
        assert_eq!(error(reply).code, "forbidden");

        let reply = f
            .server
            .handle_client_message(&mut eve, ClientMessage::CancelMatch { match_id: f.match_id, reason: None }, &tx)
            .await;
        assert_eq!(error(reply).code, "forbidden");

        let reply = f.server.handle_client_message(&mut eve, ClientMessage::Subscribe { match_id: f.match_id }, &tx).await;
        assert_eq!(error(reply).code, "forbidden");
        assert!(eve.subscriptions.is_empty());

        let unknown = MatchId::new_v4();
        let reply = f.server.handle_client_message(&mut eve, ClientMessage::Subscribe { match_id: unknown }, &tx).await;
        assert_eq!(error(reply).code, "not_found");
    }

    #[tokio::test]
    async fn test_commit_requires_registered_match() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut alice = login(&f.server, "GALICE").await;
        let plan = MovePlan::new(vec![MoveType::Kick], [1; 32]);
        let commitment = compute_move_commitment(&f.match_id, 1, 1, &Address::new("GALICE"), &plan);
        let commit = |match_id| {
            ClientMessage::CommitMove(CommitMoveRequest {
                match_id,
                round: 1,
                turn: 1,
                commitment,
                proof: vec![1],
                public_inputs: PublicInputs::for_commitment(commitment),
                transcript_hash: [0; 32],
            })
        };

        let reply = f.server.handle_client_message(&mut alice, commit(f.match_id), &tx).await;
        assert_eq!(error(reply).code, "round_not_ready");

        f.matches.set_status(&f.match_id, MatchStatus::InProgress).await.unwrap();
        let reply = f.server.handle_client_message(&mut alice, commit(f.match_id), &tx).await;
        match reply {
            ServerMessage::Round(update) => assert_eq!(update.state, RoundState::Player1Committed),
            other => panic!("unexpected reply {:?}", other),
        }

        // A changed commitment for the same slot is an integrity error.
        let mut changed = commit(f.match_id);
        if let ClientMessage::CommitMove(request) = &mut changed {
            request.commitment = [9; 32];
            request.public_inputs = PublicInputs::for_commitment([9; 32]);
        }
        let reply = f.server.handle_client_message(&mut alice, changed, &tx).await;
        assert_eq!(error(reply).code, "already_committed");
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_clients() {
        let f = fixture_with(ServerConfig { idle_timeout: Duration::from_millis(5), ..ServerConfig::default() }).await;
        let kick = Arc::new(Notify::new());
        let addr = SocketAddr::from(([127, 0, 0, 1], 9));
        f.server.clients.write().await.insert(addr, ConnectedClient {
            address: None,
            last_activity: Instant::now(),
            kick: kick.clone(),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.server.cleanup_once().await;
        tokio::time::timeout(Duration::from_secs(1), kick.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_roundtrip() {
        let f = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = f.server.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let auth = ClientMessage::Auth(AuthRequest { token: "GALICE".into(), client_version: "test".into() });
        ws.send(Message::Text(auth.to_json().unwrap())).await.unwrap();
        ws.send(Message::Text(ClientMessage::Ping { timestamp: 42 }.to_json().unwrap())).await.unwrap();

        let mut replies = Vec::new();
        while replies.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
                Some(Ok(Message::Text(text))) => replies.push(ServerMessage::from_json(&text).unwrap()),
                Some(Ok(_)) => {}
                other => panic!("connection ended early: {:?}", other),
            }
        }
        assert!(matches!(replies[0], ServerMessage::AuthResult(AuthResult { success: true, .. })));
        assert!(matches!(replies[1], ServerMessage::Pong { timestamp: 42, .. }));
        assert_eq!(f.server.connection_count().await, 1);

        f.server.shutdown();
    }
}
