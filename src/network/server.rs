//! TCP Game Server
//!
//! The supervisor and dispatcher: accept loop, one reader task plus
//! one writer task per connection, command dispatch with a declared
//! precondition per command, matchmaking delivery, the game-end
//! resolver, and the idle-session reaper.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::game::battle::{Battle, DrawReply, GameId, PlacementOutcome, Side};
use crate::game::board::{Coord, ShipSpec, ShotOutcome};
use crate::network::matchmaker::{Matchmaker, PairExpiry, ReadyOutcome, Ticket};
use crate::network::protocol::{ClientCommand, LeaderboardRow, ServerEvent, ShotResult};
use crate::network::session::{issue_token, PlayerStatus, Registry, Session, SessionId};
use crate::store::accounts::{AccountStore, StoreError};
use crate::store::history::{HistoryStore, MatchResult};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum concurrent battles.
    pub max_games: usize,
    /// Matchmaking rating window (inclusive).
    pub match_window: i32,
    /// Rating swing per decisive game.
    pub rating_delta: i32,
    /// How often the reaper and matchmaker sweeps run.
    pub reaper_period: Duration,
    /// Idle time before the reaper kicks a session.
    pub idle_grace: Duration,
    /// How long a MATCH_FOUND pair may sit unconfirmed.
    pub ready_timeout: Duration,
    /// Accounts file path.
    pub accounts_file: PathBuf,
    /// Match history directory.
    pub history_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static address"),
            max_connections: 1000,
            max_games: 512,
            match_window: 100,
            rating_delta: 10,
            reaper_period: Duration::from_secs(5),
            idle_grace: Duration::from_secs(300),
            ready_timeout: Duration::from_secs(30),
            accounts_file: PathBuf::from("users.dat"),
            history_dir: PathBuf::from("history"),
        }
    }
}

impl ServerConfig {
    /// Build a config from `BROADSIDE_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn parse<T: std::str::FromStr>(var: &str, default: T) -> T {
            match std::env::var(var) {
                Ok(raw) => raw.parse().unwrap_or_else(|_| {
                    warn!(var, %raw, "unparseable value, using default");
                    default
                }),
                Err(_) => default,
            }
        }

        let secs = |var: &str, default: Duration| {
            Duration::from_secs(parse(var, default.as_secs()))
        };

        Self {
            bind_addr: parse("BROADSIDE_ADDR", defaults.bind_addr),
            max_connections: parse("BROADSIDE_MAX_CONNECTIONS", defaults.max_connections),
            max_games: parse("BROADSIDE_MAX_GAMES", defaults.max_games),
            match_window: parse("BROADSIDE_MATCH_WINDOW", defaults.match_window),
            rating_delta: parse("BROADSIDE_RATING_DELTA", defaults.rating_delta),
            reaper_period: secs("BROADSIDE_REAPER_PERIOD_SECS", defaults.reaper_period),
            idle_grace: secs("BROADSIDE_IDLE_GRACE_SECS", defaults.idle_grace),
            ready_timeout: secs("BROADSIDE_READY_TIMEOUT_SECS", defaults.ready_timeout),
            accounts_file: parse("BROADSIDE_ACCOUNTS_FILE", defaults.accounts_file),
            history_dir: parse("BROADSIDE_HISTORY_DIR", defaults.history_dir),
        }
    }
}

/// Server startup errors. Everything after startup is reported to the
/// offending session instead of propagating.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the listen address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Failed to open a persistent store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What a command requires of the session before its handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// Always allowed.
    None,
    /// Session must be logged in (401 otherwise).
    LoggedIn,
    /// Session must be in an active battle (401 when not logged in,
    /// 400 when logged in but not in a game).
    InGame,
}

/// The precondition matrix: every command's declared requirement.
pub fn required_state(cmd: &ClientCommand) -> Requirement {
    use ClientCommand::*;
    match cmd {
        Register { .. } | Login { .. } | Ping {} => Requirement::None,

        Logout {}
        | PlayerList {}
        | Leaderboard {}
        | MatchHistory {}
        | StartMatching {}
        | CancelMatching {}
        | MatchReady {}
        | MatchDecline {}
        | Challenge { .. }
        | ChallengeReply { .. }
        | UpdatePing { .. } => Requirement::LoggedIn,

        PlaceShips { .. }
        | Move { .. }
        | Chat { .. }
        | Surrender {}
        | DrawOffer {}
        | DrawReply { .. } => Requirement::InGame,
    }
}

/// The game server.
pub struct Server {
    config: ServerConfig,
    registry: Registry,
    matchmaker: Mutex<Matchmaker>,
    games: RwLock<BTreeMap<GameId, Arc<Mutex<Battle>>>>,
    next_game_id: AtomicU64,
    accounts: AccountStore,
    history: HistoryStore,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Open the stores and build a server.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        let accounts = AccountStore::open(&config.accounts_file)?;
        let history = HistoryStore::open(&config.history_dir)?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            matchmaker: Mutex::new(Matchmaker::new(config.match_window)),
            config,
            registry: Registry::new(),
            games: RwLock::new(BTreeMap::new()),
            next_game_id: AtomicU64::new(1),
            accounts,
            history,
            shutdown_tx,
        }))
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let sweeper = {
            let server = Arc::clone(&self);
            tokio::spawn(async move { server.run_sweep_loop().await })
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.registry.len().await >= self.config.max_connections {
                                warn!(%addr, "connection limit reached, rejecting");
                                continue;
                            }
                            debug!(%addr, "new connection");
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, addr).await;
                            });
                        }
                        Err(e) => error!("accept error: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    /// Signal every task to wind down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Periodic background work: the matchmaker pairing pass, expiry
    /// of stale MATCH_FOUND handshakes, and the idle-session reaper.
    async fn run_sweep_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.reaper_period);

        loop {
            ticker.tick().await;

            let (pairs, expired) = {
                let mut mm = self.matchmaker.lock().await;
                (mm.pair_pass(), mm.sweep_expired(self.config.ready_timeout))
            };
            self.deliver_pairs(pairs).await;
            for pair in expired {
                self.dissolve_pair(pair, "Match ready timeout").await;
            }

            for id in self.registry.idle_sessions(self.config.idle_grace).await {
                warn!(session = id.0, "reaping idle session");
                if let Some(kick) = self.registry.with(id, |s| Arc::clone(&s.kick)).await {
                    kick.notify_one();
                }
            }
        }
    }

    // =========================================================================
    // CONNECTION LIFECYCLE
    // =========================================================================

    /// Drive one connection: a writer task drains the session's
    /// outbound channel, the reader loop dispatches inbound frames
    /// until EOF, a reaper kick, or server shutdown, then the
    /// disconnect path unwinds whatever the session was doing.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let kick = Arc::new(Notify::new());

        let id = self.registry.insert(tx, Arc::clone(&kick)).await;

        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let frame = match event.to_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("failed to serialize frame: {e}");
                        continue;
                    }
                };
                if write_half.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        self.registry
            .send(id, ServerEvent::Welcome { message: "Welcome to Broadside".into() })
            .await;

        let mut lines = BufReader::new(read_half).lines();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            self.registry.touch(id).await;
                            match ClientCommand::from_line(&line) {
                                Ok(cmd) => self.dispatch(id, cmd).await,
                                Err(e) => {
                                    debug!(session = id.0, "unparseable frame: {e}");
                                    self.registry
                                        .send(id, ServerEvent::bad_request("Malformed frame"))
                                        .await;
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(session = id.0, %addr, "connection closed by peer");
                            break;
                        }
                        Err(e) => {
                            debug!(session = id.0, %addr, "read error: {e}");
                            break;
                        }
                    }
                }
                _ = kick.notified() => break,
                _ = shutdown_rx.recv() => break,
            }
        }

        self.disconnect(id).await;
        // Dropping the session dropped its sender; the writer exits
        // once it has drained the final frames (GAME_END and friends
        // may still be in flight for the peer).
        let _ = writer.await;
        info!(session = id.0, %addr, "connection cleaned up");
    }

    /// Unwind a closed session: dissolve any matchmaking engagement,
    /// credit an abandoned game to the opponent, release the session.
    async fn disconnect(&self, id: SessionId) {
        let Some(session) = self.registry.remove(id).await else {
            return;
        };

        let dissolved = self.matchmaker.lock().await.remove_session(id);
        if let Some(pair) = dissolved {
            let peer = pair.peer_of(id);
            self.registry.with_mut(peer, Session::reset_to_online).await;
            self.registry
                .send(peer, ServerEvent::MatchDeclined { message: "Opponent disconnected".into() })
                .await;
        }

        // Withdraw any challenge involving this session.
        if let Some(target) = session.challenge_out {
            self.registry
                .with_mut(target, |s| {
                    if s.challenge_in == Some(id) {
                        s.challenge_in = None;
                    }
                })
                .await;
        }
        if let Some(challenger) = session.challenge_in {
            self.registry
                .with_mut(challenger, |s| {
                    if s.challenge_out == Some(id) {
                        s.challenge_out = None;
                    }
                })
                .await;
        }

        if let Some(gid) = session.game {
            let winner = self.opponent_in(gid, id).await;
            self.end_game(gid, winner, "OPPONENT_DISCONNECTED").await;
        }

        if !session.username.is_empty() {
            info!(session = id.0, username = %session.username, "player disconnected");
        }
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Check the command's precondition, then run its handler.
    async fn dispatch(&self, id: SessionId, cmd: ClientCommand) {
        let (authed, in_game) = self
            .registry
            .with(id, |s| (s.is_authenticated(), s.game.is_some()))
            .await
            .unwrap_or((false, false));

        match required_state(&cmd) {
            Requirement::None => {}
            Requirement::LoggedIn => {
                if !authed {
                    self.registry.send(id, ServerEvent::unauthenticated("Login first")).await;
                    return;
                }
            }
            Requirement::InGame => {
                if !authed {
                    self.registry.send(id, ServerEvent::unauthenticated("Login first")).await;
                    return;
                }
                if !in_game {
                    self.registry.send(id, ServerEvent::bad_request("Not in a game")).await;
                    return;
                }
            }
        }

        match cmd {
            ClientCommand::Register { username, password } => {
                self.handle_register(id, &username, &password).await;
            }
            ClientCommand::Login { username, password } => {
                self.handle_login(id, &username, &password).await;
            }
            ClientCommand::Logout {} => self.handle_logout(id).await,
            ClientCommand::PlayerList {} => {
                let players = self.registry.player_list(id).await;
                self.registry.send(id, ServerEvent::PlayerList { players }).await;
            }
            ClientCommand::Leaderboard {} => self.handle_leaderboard(id).await,
            ClientCommand::MatchHistory {} => self.handle_match_history(id).await,
            ClientCommand::StartMatching {} => self.handle_start_matching(id).await,
            ClientCommand::CancelMatching {} => self.handle_cancel_matching(id).await,
            ClientCommand::MatchReady {} => self.handle_match_ready(id).await,
            ClientCommand::MatchDecline {} => self.handle_match_decline(id).await,
            ClientCommand::Challenge { target_username } => {
                self.handle_challenge(id, &target_username).await;
            }
            ClientCommand::ChallengeReply { challenger_username, status } => {
                self.handle_challenge_reply(id, &challenger_username, &status).await;
            }
            ClientCommand::PlaceShips { ships } => self.handle_place_ships(id, &ships).await,
            ClientCommand::Move { coord } => self.handle_move(id, &coord).await,
            ClientCommand::Chat { message } => self.handle_chat(id, message).await,
            ClientCommand::Surrender {} => self.handle_surrender(id).await,
            ClientCommand::DrawOffer {} => self.handle_draw_offer(id).await,
            ClientCommand::DrawReply { status } => self.handle_draw_reply(id, &status).await,
            ClientCommand::Ping {} => {
                self.registry
                    .send(id, ServerEvent::Pong { timestamp: Utc::now().timestamp_millis() })
                    .await;
            }
            ClientCommand::UpdatePing { ping } => self.handle_update_ping(id, ping).await,
        }
    }

    // =========================================================================
    // ACCOUNTS & LOBBY
    // =========================================================================

    async fn handle_register(&self, id: SessionId, username: &str, password: &str) {
        let event = match self.accounts.register(username, password) {
            Ok(()) => {
                info!(username, "account registered");
                ServerEvent::RegisterSuccess { message: "Registration successful".into() }
            }
            Err(StoreError::UsernameTaken(_)) => {
                ServerEvent::bad_request("Username already exists")
            }
            Err(StoreError::InvalidUsername) => ServerEvent::bad_request(
                "Username must be 1-49 characters of letters, digits, or underscore",
            ),
            Err(e) => {
                error!("register failed: {e}");
                ServerEvent::internal("Registration failed")
            }
        };
        self.registry.send(id, event).await;
    }

    async fn handle_login(&self, id: SessionId, username: &str, password: &str) {
        let already = self.registry.with(id, Session::is_authenticated).await.unwrap_or(false);
        if already {
            self.registry.send(id, ServerEvent::bad_request("Already logged in")).await;
            return;
        }

        if !self.accounts.authenticate(username, password) {
            self.registry.send(id, ServerEvent::unauthenticated("Invalid credentials")).await;
            return;
        }

        let rating = self.accounts.rating(username).unwrap_or(crate::DEFAULT_RATING);
        let token = issue_token();
        if !self.registry.try_login(id, username, rating, &token).await {
            self.registry
                .send(id, ServerEvent::unauthenticated("Account is already logged in"))
                .await;
            return;
        }

        info!(session = id.0, username, rating, "login");
        self.registry
            .send(
                id,
                ServerEvent::LoginSuccess {
                    username: username.to_string(),
                    rating,
                    session_token: token,
                },
            )
            .await;
    }

    async fn handle_logout(&self, id: SessionId) {
        // An in-game logout is an abandonment: the opponent wins.
        let gid = self.registry.with(id, |s| s.game).await.flatten();
        if let Some(gid) = gid {
            let winner = self.opponent_in(gid, id).await;
            self.end_game(gid, winner, "OPPONENT_DISCONNECTED").await;
        }

        let dissolved = self.matchmaker.lock().await.remove_session(id);
        if let Some(pair) = dissolved {
            let peer = pair.peer_of(id);
            self.registry.with_mut(peer, Session::reset_to_online).await;
            self.registry
                .send(peer, ServerEvent::MatchDeclined { message: "Opponent left".into() })
                .await;
        }

        self.registry
            .with_mut(id, |s| {
                info!(session = id.0, username = %s.username, "logout");
                s.reset_to_online();
                s.status = PlayerStatus::Offline;
                s.username.clear();
                s.token.clear();
            })
            .await;
        self.registry.send(id, ServerEvent::LogoutSuccess {}).await;
    }

    async fn handle_leaderboard(&self, id: SessionId) {
        let players = self
            .accounts
            .leaderboard(crate::LEADERBOARD_LIMIT)
            .into_iter()
            .enumerate()
            .map(|(i, account)| LeaderboardRow {
                rank: i as u32 + 1,
                winrate: account.winrate(),
                username: account.username,
                rating: account.rating,
                games: account.games_played,
                wins: account.games_won,
            })
            .collect();
        self.registry.send(id, ServerEvent::Leaderboard { players }).await;
    }

    async fn handle_match_history(&self, id: SessionId) {
        let Some(username) = self.registry.with(id, |s| s.username.clone()).await else {
            return;
        };
        let event = match self.history.read(&username, crate::HISTORY_LIMIT) {
            Ok(matches) => ServerEvent::MatchHistory { matches },
            Err(e) => {
                error!(username, "history read failed: {e}");
                ServerEvent::internal("History unavailable")
            }
        };
        self.registry.send(id, event).await;
    }

    // =========================================================================
    // MATCHMAKING
    // =========================================================================

    async fn handle_start_matching(&self, id: SessionId) {
        let Some((engaged, username, rating)) = self
            .registry
            .with(id, |s| (s.is_engaged(), s.username.clone(), s.rating))
            .await
        else {
            return;
        };
        if engaged {
            self.registry
                .send(id, ServerEvent::bad_request("Already in a game, queue, or challenge"))
                .await;
            return;
        }

        let pairs = {
            let mut mm = self.matchmaker.lock().await;
            if !mm.enqueue(Ticket::new(id, username, rating)) {
                drop(mm);
                self.registry.send(id, ServerEvent::bad_request("Already searching")).await;
                return;
            }
            mm.pair_pass()
        };

        self.registry.with_mut(id, |s| s.status = PlayerStatus::InLobby).await;
        self.registry
            .send(id, ServerEvent::MatchingStarted { message: "Searching for an opponent".into() })
            .await;

        self.deliver_pairs(pairs).await;
    }

    async fn handle_cancel_matching(&self, id: SessionId) {
        if self.matchmaker.lock().await.cancel(id) {
            self.registry.with_mut(id, |s| s.status = PlayerStatus::Online).await;
            self.registry
                .send(id, ServerEvent::MatchingCancelled { message: "Search cancelled".into() })
                .await;
        } else {
            self.registry.send(id, ServerEvent::bad_request("Not searching")).await;
        }
    }

    /// Announce MATCH_FOUND to both sides of each fresh pairing.
    async fn deliver_pairs(&self, pairs: Vec<(Ticket, Ticket)>) {
        for (a, b) in pairs {
            info!(p1 = %a.username, p2 = %b.username, "paired");
            self.registry
                .send(
                    a.session,
                    ServerEvent::MatchFound { opponent: b.username.clone(), rating: b.rating },
                )
                .await;
            self.registry
                .send(
                    b.session,
                    ServerEvent::MatchFound { opponent: a.username.clone(), rating: a.rating },
                )
                .await;
        }
    }

    async fn handle_match_ready(&self, id: SessionId) {
        let outcome = self.matchmaker.lock().await.mark_ready(id);
        match outcome {
            None => {
                self.registry.send(id, ServerEvent::bad_request("No pending match")).await;
            }
            Some(ReadyOutcome::Waiting { peer }) => {
                if let Some(username) = self.registry.with(id, |s| s.username.clone()).await {
                    self.registry.send(peer, ServerEvent::OpponentReady { username }).await;
                }
            }
            Some(ReadyOutcome::BothReady { p1, p2 }) => {
                self.start_battle(p1, p2).await;
            }
        }
    }

    async fn handle_match_decline(&self, id: SessionId) {
        let Some(pair) = self.matchmaker.lock().await.decline(id) else {
            self.registry.send(id, ServerEvent::bad_request("No pending match")).await;
            return;
        };
        self.registry.with_mut(id, |s| s.status = PlayerStatus::Online).await;

        let peer = pair.peer_of(id);
        self.registry.with_mut(peer, Session::reset_to_online).await;
        self.registry
            .send(peer, ServerEvent::MatchDeclined { message: "Opponent declined".into() })
            .await;
    }

    /// Dissolve an expired handshake as a mutual decline.
    async fn dissolve_pair(&self, pair: PairExpiry, message: &str) {
        for id in [pair.a, pair.b] {
            self.registry.with_mut(id, Session::reset_to_online).await;
            self.registry
                .send(id, ServerEvent::MatchDeclined { message: message.into() })
                .await;
        }
    }

    // =========================================================================
    // CHALLENGES
    // =========================================================================

    async fn handle_challenge(&self, id: SessionId, target_username: &str) {
        let Some((engaged, username)) =
            self.registry.with(id, |s| (s.is_engaged(), s.username.clone())).await
        else {
            return;
        };
        if engaged {
            self.registry
                .send(id, ServerEvent::bad_request("Already in a game, queue, or challenge"))
                .await;
            return;
        }
        if username == target_username {
            self.registry.send(id, ServerEvent::bad_request("Cannot challenge yourself")).await;
            return;
        }

        let Some(target) = self.registry.by_username(target_username).await else {
            self.registry
                .send(id, ServerEvent::not_found("Player not found or offline"))
                .await;
            return;
        };

        // A challenge is deliverable while the target is idle or
        // merely queued, but not once they are playing, mid ready-
        // handshake, or tied up in another challenge. The matchmaker
        // lock is held across the reservation so a pairing pass cannot
        // move the target into a handshake between check and claim,
        // and the reservation itself is one registry write, so two
        // racing challengers cannot both claim the target.
        let reserved = {
            let mm = self.matchmaker.lock().await;
            !mm.is_pending(target) && self.registry.reserve_challenge(id, target).await
        };
        if !reserved {
            self.registry.send(id, ServerEvent::bad_request("Player is busy")).await;
            return;
        }

        self.registry.send(target, ServerEvent::Challenge { challenger: username }).await;
        self.registry
            .send(id, ServerEvent::system(200, format!("Challenge sent to {target_username}")))
            .await;
    }

    async fn handle_challenge_reply(&self, id: SessionId, challenger_username: &str, status: &str) {
        let Some(challenger) = self.registry.with(id, |s| s.challenge_in).await.flatten() else {
            self.registry.send(id, ServerEvent::bad_request("No pending challenge")).await;
            return;
        };

        let challenger_name = self.registry.with(challenger, |s| s.username.clone()).await;
        if challenger_name.as_deref() != Some(challenger_username) {
            self.registry.send(id, ServerEvent::not_found("Challenger not found")).await;
            return;
        }

        match status {
            "ACCEPT" => {
                // A target mid-handshake must resolve that pairing
                // first; a merely queued target just leaves the queue.
                let mut mm = self.matchmaker.lock().await;
                if mm.is_pending(id) {
                    drop(mm);
                    self.registry
                        .send(id, ServerEvent::bad_request("Resolve your pending match first"))
                        .await;
                    return;
                }
                mm.cancel(id);
                drop(mm);

                self.clear_challenge(challenger, id).await;
                self.start_battle(challenger, id).await;
            }
            "REJECT" => {
                self.clear_challenge(challenger, id).await;
                let username = self
                    .registry
                    .with(id, |s| s.username.clone())
                    .await
                    .unwrap_or_default();
                self.registry
                    .send(
                        challenger,
                        ServerEvent::ChallengeReply {
                            target_username: username,
                            status: "REJECT".into(),
                        },
                    )
                    .await;
            }
            _ => {
                self.registry
                    .send(id, ServerEvent::bad_request("Status must be ACCEPT or REJECT"))
                    .await;
            }
        }
    }

    async fn clear_challenge(&self, challenger: SessionId, target: SessionId) {
        self.registry.with_mut(challenger, |s| s.challenge_out = None).await;
        self.registry.with_mut(target, |s| s.challenge_in = None).await;
    }

    // =========================================================================
    // BATTLE LIFECYCLE
    // =========================================================================

    /// Create a battle between two sessions and notify both. `p1`
    /// (earlier queue entry or challenger) takes the first turn.
    async fn start_battle(&self, p1: SessionId, p2: SessionId) {
        if self.games.read().await.len() >= self.config.max_games {
            for id in [p1, p2] {
                self.registry.with_mut(id, Session::reset_to_online).await;
                self.registry.send(id, ServerEvent::internal("Server full")).await;
            }
            return;
        }

        let p1_name = self.registry.with(p1, |s| s.username.clone()).await;
        let p2_name = self.registry.with(p2, |s| s.username.clone()).await;
        let (Some(p1_name), Some(p2_name)) = (p1_name, p2_name) else {
            // One side vanished between pairing and start.
            for id in [p1, p2] {
                self.registry.with_mut(id, Session::reset_to_online).await;
                self.registry
                    .send(id, ServerEvent::MatchDeclined { message: "Opponent disconnected".into() })
                    .await;
            }
            return;
        };

        // A queued seat may still be the target of a live challenge;
        // that challenge dies with the pairing and its issuer is told
        // no, so nobody is left pointing at an in-game player.
        for id in [p1, p2] {
            if let Some((challenger, username)) = self.registry.sever_challenges(id).await {
                self.registry
                    .send(
                        challenger,
                        ServerEvent::ChallengeReply {
                            target_username: username,
                            status: "REJECT".into(),
                        },
                    )
                    .await;
            }
        }

        let gid = GameId(self.next_game_id.fetch_add(1, Ordering::Relaxed));
        let battle = Battle::new(gid, (p1, p1_name.clone()), (p2, p2_name.clone()));
        let log_id = battle.log_id.clone();
        self.games.write().await.insert(gid, Arc::new(Mutex::new(battle)));

        for id in [p1, p2] {
            self.registry
                .with_mut(id, |s| {
                    s.status = PlayerStatus::InGame;
                    s.game = Some(gid);
                })
                .await;
        }

        info!(%log_id, p1 = %p1_name, p2 = %p2_name, "battle started");
        self.registry
            .send(p1, ServerEvent::GameStart { opponent: p2_name, your_turn: true })
            .await;
        self.registry
            .send(p2, ServerEvent::GameStart { opponent: p1_name, your_turn: false })
            .await;
    }

    /// The session's battle, if it still exists.
    async fn battle_of(&self, id: SessionId) -> Option<(GameId, Arc<Mutex<Battle>>)> {
        let gid = self.registry.with(id, |s| s.game).await.flatten()?;
        let battle = self.games.read().await.get(&gid).cloned()?;
        Some((gid, battle))
    }

    /// The peer session of `id` inside game `gid`.
    async fn opponent_in(&self, gid: GameId, id: SessionId) -> Option<SessionId> {
        let battle = self.games.read().await.get(&gid).cloned()?;
        let battle = battle.lock().await;
        let side = battle.side_of(id)?;
        Some(battle.opponent(side).session)
    }

    async fn handle_place_ships(&self, id: SessionId, ships: &[ShipSpec]) {
        let Some((_gid, battle)) = self.battle_of(id).await else {
            self.registry.send(id, ServerEvent::bad_request("Game is over")).await;
            return;
        };

        let mut battle = battle.lock().await;
        let Some(side) = battle.side_of(id) else {
            self.registry.send(id, ServerEvent::internal("Seat not found")).await;
            return;
        };

        match battle.place_ships(side, ships) {
            Ok(PlacementOutcome::WaitingOpponent) => {
                self.registry
                    .send(id, ServerEvent::PlaceShipAck { message: "Fleet accepted".into() })
                    .await;
                self.registry
                    .send(
                        id,
                        ServerEvent::WaitingOpponent { message: "Waiting for opponent".into() },
                    )
                    .await;
            }
            Ok(PlacementOutcome::BattleStarted) => {
                self.registry
                    .send(id, ServerEvent::PlaceShipAck { message: "Fleet accepted".into() })
                    .await;
                let turn = battle.turn();
                for side in [Side::P1, Side::P2] {
                    self.registry
                        .send(
                            battle.seat(side).session,
                            ServerEvent::GameReady { your_turn: side == turn },
                        )
                        .await;
                }
            }
            Err(e) => {
                self.registry.send(id, ServerEvent::bad_request(e.to_string())).await;
            }
        }
    }

    async fn handle_move(&self, id: SessionId, coord: &str) {
        let Some(at) = Coord::parse(coord) else {
            self.registry.send(id, ServerEvent::bad_request("Invalid coordinate")).await;
            return;
        };
        let Some((gid, battle)) = self.battle_of(id).await else {
            self.registry.send(id, ServerEvent::bad_request("Game is over")).await;
            return;
        };

        // Everything from turn check to frame emission happens under
        // the battle lock so both players observe shots in one order.
        let winner = {
            let mut battle = battle.lock().await;
            let Some(side) = battle.side_of(id) else {
                self.registry.send(id, ServerEvent::internal("Seat not found")).await;
                return;
            };

            let report = match battle.fire(side, at) {
                Ok(report) => report,
                Err(e) => {
                    self.registry.send(id, ServerEvent::bad_request(e.to_string())).await;
                    return;
                }
            };

            let opponent = battle.opponent(side).session;
            let (result, ship_sunk, game_over) = match &report.outcome {
                ShotOutcome::Miss => (ShotResult::Miss, String::new(), None),
                ShotOutcome::Hit { sunk, all_sunk } => (
                    ShotResult::Hit,
                    sunk.clone().unwrap_or_default(),
                    all_sunk.then_some(true),
                ),
                ShotOutcome::AlreadyTried => {
                    // No-op re-shot: only the shooter hears about it,
                    // and the turn stays put.
                    self.registry
                        .send(
                            id,
                            ServerEvent::MoveResult {
                                coord: at.to_string(),
                                result: ShotResult::AlreadyHit,
                                ship_sunk: String::new(),
                                is_your_shot: true,
                                game_over: None,
                            },
                        )
                        .await;
                    return;
                }
            };

            for (to, is_your_shot) in [(id, true), (opponent, false)] {
                self.registry
                    .send(
                        to,
                        ServerEvent::MoveResult {
                            coord: at.to_string(),
                            result,
                            ship_sunk: ship_sunk.clone(),
                            is_your_shot,
                            game_over,
                        },
                    )
                    .await;
            }

            if report.turn_passed {
                self.registry.send(id, ServerEvent::TurnChange { your_turn: false }).await;
                self.registry.send(opponent, ServerEvent::TurnChange { your_turn: true }).await;
            }

            report.winner.map(|side| battle.seat(side).session)
        };

        if let Some(winner) = winner {
            self.end_game(gid, Some(winner), "ALL_SHIPS_SUNK").await;
        }
    }

    async fn handle_chat(&self, id: SessionId, message: String) {
        let Some((gid, _)) = self.battle_of(id).await else {
            return;
        };
        let Some(opponent) = self.opponent_in(gid, id).await else {
            return;
        };
        let from = self.registry.with(id, |s| s.username.clone()).await.unwrap_or_default();
        self.registry.send(opponent, ServerEvent::Chat { from, message }).await;
    }

    async fn handle_surrender(&self, id: SessionId) {
        let Some((gid, battle)) = self.battle_of(id).await else {
            self.registry.send(id, ServerEvent::bad_request("Game is over")).await;
            return;
        };

        let winner = {
            let mut battle = battle.lock().await;
            let Some(side) = battle.side_of(id) else {
                return;
            };
            match battle.surrender(side) {
                Ok(winner) => battle.seat(winner).session,
                Err(e) => {
                    self.registry.send(id, ServerEvent::bad_request(e.to_string())).await;
                    return;
                }
            }
        };

        self.end_game(gid, Some(winner), "SURRENDER").await;
    }

    async fn handle_draw_offer(&self, id: SessionId) {
        let Some((_gid, battle)) = self.battle_of(id).await else {
            self.registry.send(id, ServerEvent::bad_request("Game is over")).await;
            return;
        };

        let mut battle = battle.lock().await;
        let Some(side) = battle.side_of(id) else {
            return;
        };
        match battle.offer_draw(side) {
            Ok(()) => {
                let opponent = battle.opponent(side).session;
                let from = battle.seat(side).username.clone();
                self.registry.send(opponent, ServerEvent::DrawOffer { from }).await;
            }
            Err(e) => {
                self.registry.send(id, ServerEvent::bad_request(e.to_string())).await;
            }
        }
    }

    async fn handle_draw_reply(&self, id: SessionId, status: &str) {
        let accept = match status {
            "accept" => true,
            "reject" => false,
            _ => {
                self.registry
                    .send(id, ServerEvent::bad_request("Status must be accept or reject"))
                    .await;
                return;
            }
        };

        let Some((gid, battle)) = self.battle_of(id).await else {
            self.registry.send(id, ServerEvent::bad_request("Game is over")).await;
            return;
        };

        let reply = {
            let mut battle = battle.lock().await;
            let Some(side) = battle.side_of(id) else {
                return;
            };
            match battle.reply_draw(side, accept) {
                Ok(reply) => (reply, battle.opponent(side).session),
                Err(e) => {
                    self.registry.send(id, ServerEvent::bad_request(e.to_string())).await;
                    return;
                }
            }
        };

        match reply {
            (DrawReply::Accepted, _) => self.end_game(gid, None, "DRAW_ACCEPTED").await,
            (DrawReply::Rejected, offerer) => {
                self.registry.send(offerer, ServerEvent::DrawRejected {}).await;
            }
        }
    }

    async fn handle_update_ping(&self, id: SessionId, ping: u32) {
        self.registry.with_mut(id, |s| s.ping_ms = Some(ping)).await;
        let gid = self.registry.with(id, |s| s.game).await.flatten();
        if let Some(gid) = gid {
            if let Some(opponent) = self.opponent_in(gid, id).await {
                self.registry
                    .send(opponent, ServerEvent::PingUpdate { opponent_ping: ping })
                    .await;
            }
        }
    }

    // =========================================================================
    // GAME-END RESOLVER
    // =========================================================================

    /// Resolve a finished (or abandoned) battle: ratings, history,
    /// GAME_END frames, session resets, teardown. `winner` is `None`
    /// for a draw. Idempotent: the first caller removes the battle
    /// from the table, later callers find nothing.
    async fn end_game(&self, gid: GameId, winner: Option<SessionId>, reason: &str) {
        let Some(battle) = self.games.write().await.remove(&gid) else {
            return;
        };

        let (log_id, players) = {
            let mut battle = battle.lock().await;
            battle.finish();
            let players: Vec<(SessionId, String)> = [Side::P1, Side::P2]
                .iter()
                .map(|&side| {
                    let seat = battle.seat(side);
                    (seat.session, seat.username.clone())
                })
                .collect();
            (battle.log_id.clone(), players)
        };

        info!(%log_id, reason, "battle ended");

        let timestamp = Utc::now().timestamp();
        for (session, username) in &players {
            let (result, opponent) = match winner {
                None => (MatchResult::Draw, other_player(&players, *session)),
                Some(w) if w == *session => (MatchResult::Win, other_player(&players, *session)),
                Some(_) => (MatchResult::Lose, other_player(&players, *session)),
            };

            // Draws leave ratings and game counts untouched.
            let rating = if result == MatchResult::Draw {
                self.accounts.rating(username).unwrap_or(crate::DEFAULT_RATING)
            } else {
                let won = result == MatchResult::Win;
                let delta = if won { self.config.rating_delta } else { -self.config.rating_delta };
                match self.accounts.update_stats(username, delta, won) {
                    Ok(rating) => rating,
                    Err(e) => {
                        error!(username, "stats update failed: {e}");
                        self.accounts.rating(username).unwrap_or(crate::DEFAULT_RATING)
                    }
                }
            };

            if let Err(e) = self.history.append(username, &opponent, result, timestamp) {
                error!(username, "history append failed: {e}");
            }

            // Reset the session if it is still attached to this game
            // (a disconnected loser is already gone).
            self.registry
                .with_mut(*session, |s| {
                    if s.game == Some(gid) {
                        s.reset_to_online();
                        s.rating = rating;
                    }
                })
                .await;
            self.registry
                .send(
                    *session,
                    ServerEvent::GameEnd { result, reason: reason.to_string(), rating },
                )
                .await;
        }
    }
}

/// The username of the other participant.
fn other_player(players: &[(SessionId, String)], session: SessionId) -> String {
    players
        .iter()
        .find(|(id, _)| *id != session)
        .map(|(_, name)| name.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::Lines;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(5);

    fn test_config(dir: &TempDir) -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            accounts_file: dir.path().join("users.dat"),
            history_dir: dir.path().join("history"),
            ..Default::default()
        }
    }

    async fn spawn_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let server = Server::new(config).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = handle.serve(listener).await;
        });
        (server, addr)
    }

    struct TestClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        /// Connect and consume the WELCOME frame.
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, writer) = stream.into_split();
            let mut client = Self { lines: BufReader::new(read).lines(), writer };
            assert!(matches!(client.recv().await, ServerEvent::Welcome { .. }));
            client
        }

        async fn send(&mut self, cmd: ClientCommand) {
            let frame = cmd.to_frame().unwrap();
            self.writer.write_all(frame.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> ServerEvent {
            let line = timeout(TICK, self.lines.next_line())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .expect("connection closed");
            serde_json::from_str(&line).expect("unparseable server frame")
        }

        async fn register_and_login(&mut self, username: &str) {
            self.send(ClientCommand::Register {
                username: username.into(),
                password: "pw".into(),
            })
            .await;
            assert!(matches!(self.recv().await, ServerEvent::RegisterSuccess { .. }));
            self.send(ClientCommand::Login { username: username.into(), password: "pw".into() })
                .await;
            assert!(matches!(self.recv().await, ServerEvent::LoginSuccess { .. }));
        }

        async fn place_standard_fleet(&mut self) {
            let ships = [("Carrier", 5u8), ("Battleship", 4), ("Cruiser", 3), ("Submarine", 3), ("Destroyer", 2)]
                .iter()
                .enumerate()
                .map(|(row, (name, size))| ShipSpec {
                    name: (*name).into(),
                    size: *size,
                    row: row as u8,
                    col: 0,
                    horizontal: true,
                })
                .collect();
            self.send(ClientCommand::PlaceShips { ships }).await;
        }
    }

    /// Pair two fresh logged-in clients through the queue and bring
    /// them to the PLAYING phase. Returns (p1, p2) with p1 on turn.
    async fn start_duel(addr: SocketAddr) -> (TestClient, TestClient) {
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice.register_and_login("alice").await;
        bob.register_and_login("bob").await;

        alice.send(ClientCommand::StartMatching {}).await;
        assert!(matches!(alice.recv().await, ServerEvent::MatchingStarted { .. }));
        bob.send(ClientCommand::StartMatching {}).await;
        assert!(matches!(bob.recv().await, ServerEvent::MatchingStarted { .. }));

        assert!(matches!(alice.recv().await, ServerEvent::MatchFound { .. }));
        assert!(matches!(bob.recv().await, ServerEvent::MatchFound { .. }));

        alice.send(ClientCommand::MatchReady {}).await;
        assert!(matches!(bob.recv().await, ServerEvent::OpponentReady { .. }));
        bob.send(ClientCommand::MatchReady {}).await;

        match alice.recv().await {
            ServerEvent::GameStart { opponent, your_turn } => {
                assert_eq!(opponent, "bob");
                assert!(your_turn);
            }
            other => panic!("expected GAME_START, got {other:?}"),
        }
        match bob.recv().await {
            ServerEvent::GameStart { opponent, your_turn } => {
                assert_eq!(opponent, "alice");
                assert!(!your_turn);
            }
            other => panic!("expected GAME_START, got {other:?}"),
        }

        alice.place_standard_fleet().await;
        assert!(matches!(alice.recv().await, ServerEvent::PlaceShipAck { .. }));
        assert!(matches!(alice.recv().await, ServerEvent::WaitingOpponent { .. }));
        bob.place_standard_fleet().await;
        assert!(matches!(bob.recv().await, ServerEvent::PlaceShipAck { .. }));

        match (alice.recv().await, bob.recv().await) {
            (
                ServerEvent::GameReady { your_turn: alice_turn },
                ServerEvent::GameReady { your_turn: bob_turn },
            ) => {
                assert!(alice_turn);
                assert!(!bob_turn);
            }
            other => panic!("expected GAME_READY pair, got {other:?}"),
        }

        (alice, bob)
    }

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.match_window, 100);
        assert_eq!(config.rating_delta, 10);
        assert_eq!(config.reaper_period, Duration::from_secs(5));
    }

    #[test]
    fn test_required_state_matrix() {
        use ClientCommand::*;
        let login_free = [
            Register { username: "a".into(), password: "b".into() },
            Login { username: "a".into(), password: "b".into() },
            Ping {},
        ];
        for cmd in &login_free {
            assert_eq!(required_state(cmd), Requirement::None, "{cmd:?}");
        }

        let lobby = [
            Logout {},
            PlayerList {},
            Leaderboard {},
            MatchHistory {},
            StartMatching {},
            CancelMatching {},
            MatchReady {},
            MatchDecline {},
            Challenge { target_username: "a".into() },
            ChallengeReply { challenger_username: "a".into(), status: "ACCEPT".into() },
            UpdatePing { ping: 12 },
        ];
        for cmd in &lobby {
            assert_eq!(required_state(cmd), Requirement::LoggedIn, "{cmd:?}");
        }

        let in_game = [
            PlaceShips { ships: vec![] },
            Move { coord: "A0".into() },
            Chat { message: "hi".into() },
            Surrender {},
            DrawOffer {},
            DrawReply { status: "accept".into() },
        ];
        for cmd in &in_game {
            assert_eq!(required_state(cmd), Requirement::InGame, "{cmd:?}");
        }
    }

    #[tokio::test]
    async fn test_register_login_and_duplicates() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let mut client = TestClient::connect(addr).await;

        client
            .send(ClientCommand::Register { username: "alice".into(), password: "pw".into() })
            .await;
        assert!(matches!(client.recv().await, ServerEvent::RegisterSuccess { .. }));

        // Second registration of the same name fails cleanly.
        client
            .send(ClientCommand::Register { username: "alice".into(), password: "other".into() })
            .await;
        assert!(matches!(client.recv().await, ServerEvent::SystemMsg { code: 400, .. }));

        // Wrong password.
        client
            .send(ClientCommand::Login { username: "alice".into(), password: "nope".into() })
            .await;
        assert!(matches!(client.recv().await, ServerEvent::SystemMsg { code: 401, .. }));

        client
            .send(ClientCommand::Login { username: "alice".into(), password: "pw".into() })
            .await;
        match client.recv().await {
            ServerEvent::LoginSuccess { username, rating, session_token } => {
                assert_eq!(username, "alice");
                assert_eq!(rating, crate::DEFAULT_RATING);
                assert_eq!(session_token.len(), 32);
            }
            other => panic!("expected LOGIN_SUCCESS, got {other:?}"),
        }

        // The same account cannot log in twice concurrently.
        let mut other = TestClient::connect(addr).await;
        other
            .send(ClientCommand::Login { username: "alice".into(), password: "pw".into() })
            .await;
        assert!(matches!(other.recv().await, ServerEvent::SystemMsg { code: 401, .. }));
    }

    #[tokio::test]
    async fn test_malformed_and_unauthenticated_frames() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let mut client = TestClient::connect(addr).await;

        client.send_raw("this is not json\n").await;
        assert!(matches!(client.recv().await, ServerEvent::SystemMsg { code: 400, .. }));

        client.send_raw("{\"cmd\":\"NO_SUCH\",\"payload\":{}}\n").await;
        assert!(matches!(client.recv().await, ServerEvent::SystemMsg { code: 400, .. }));

        // Lobby commands before login are 401s; the session survives.
        client.send(ClientCommand::PlayerList {}).await;
        assert!(matches!(client.recv().await, ServerEvent::SystemMsg { code: 401, .. }));
        client.send(ClientCommand::Move { coord: "A0".into() }).await;
        assert!(matches!(client.recv().await, ServerEvent::SystemMsg { code: 401, .. }));

        client.send(ClientCommand::Ping {}).await;
        assert!(matches!(client.recv().await, ServerEvent::Pong { .. }));
    }

    #[tokio::test]
    async fn test_player_list_and_leaderboard() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice.register_and_login("alice").await;
        bob.register_and_login("bob").await;

        alice.send(ClientCommand::PlayerList {}).await;
        match alice.recv().await {
            ServerEvent::PlayerList { players } => {
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].username, "bob");
                assert_eq!(players[0].rating, crate::DEFAULT_RATING);
            }
            other => panic!("expected PLAYER_LIST, got {other:?}"),
        }

        alice.send(ClientCommand::Leaderboard {}).await;
        match alice.recv().await {
            ServerEvent::Leaderboard { players } => {
                assert_eq!(players.len(), 2);
                assert_eq!(players[0].rank, 1);
                assert_eq!(players[0].username, "alice");
            }
            other => panic!("expected LEADERBOARD, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queued_pairing_and_first_shot() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let (mut alice, mut bob) = start_duel(addr).await;

        // Out-of-turn shot is refused without disturbing the game.
        bob.send(ClientCommand::Move { coord: "A0".into() }).await;
        assert!(matches!(bob.recv().await, ServerEvent::SystemMsg { code: 400, .. }));

        alice.send(ClientCommand::Move { coord: "A0".into() }).await;
        match alice.recv().await {
            ServerEvent::MoveResult { coord, result, ship_sunk, is_your_shot, game_over } => {
                assert_eq!(coord, "A0");
                assert_eq!(result, ShotResult::Hit);
                assert_eq!(ship_sunk, "");
                assert!(is_your_shot);
                assert_eq!(game_over, None);
            }
            other => panic!("expected MOVE_RESULT, got {other:?}"),
        }
        match bob.recv().await {
            ServerEvent::MoveResult { is_your_shot, result, .. } => {
                assert!(!is_your_shot);
                assert_eq!(result, ShotResult::Hit);
            }
            other => panic!("expected MOVE_RESULT, got {other:?}"),
        }

        assert!(matches!(alice.recv().await, ServerEvent::TurnChange { your_turn: false }));
        assert!(matches!(bob.recv().await, ServerEvent::TurnChange { your_turn: true }));

        // Bob misses; turn returns to alice.
        bob.send(ClientCommand::Move { coord: "J9".into() }).await;
        assert!(matches!(
            bob.recv().await,
            ServerEvent::MoveResult { result: ShotResult::Miss, .. }
        ));
        assert!(matches!(alice.recv().await, ServerEvent::MoveResult { .. }));
        assert!(matches!(bob.recv().await, ServerEvent::TurnChange { your_turn: false }));
        assert!(matches!(alice.recv().await, ServerEvent::TurnChange { your_turn: true }));

        // Re-shooting a resolved cell answers only the shooter and
        // keeps the turn.
        alice.send(ClientCommand::Move { coord: "A0".into() }).await;
        assert!(matches!(
            alice.recv().await,
            ServerEvent::MoveResult { result: ShotResult::AlreadyHit, is_your_shot: true, .. }
        ));
        alice.send(ClientCommand::Move { coord: "A1".into() }).await;
        assert!(matches!(
            alice.recv().await,
            ServerEvent::MoveResult { result: ShotResult::Hit, .. }
        ));

        // Bad coordinates never consume the turn.
        bob.recv().await; // bob's view of A1
        bob.recv().await; // turn change
        alice.recv().await; // turn change
        bob.send(ClientCommand::Move { coord: "K0".into() }).await;
        assert!(matches!(bob.recv().await, ServerEvent::SystemMsg { code: 400, .. }));
        bob.send(ClientCommand::Move { coord: "A10".into() }).await;
        assert!(matches!(bob.recv().await, ServerEvent::SystemMsg { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_sinking_the_fleet_ends_the_game_with_ratings() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let (mut alice, mut bob) = start_duel(addr).await;

        let targets: Vec<String> = (0..5u8)
            .flat_map(|row| {
                let len = [5u8, 4, 3, 3, 2][row as usize];
                (0..len).map(move |col| format!("{}{col}", (b'A' + row) as char))
            })
            .collect();

        for (i, coord) in targets.iter().enumerate() {
            let last = i == targets.len() - 1;
            alice.send(ClientCommand::Move { coord: coord.clone() }).await;

            match (alice.recv().await, bob.recv().await) {
                (
                    ServerEvent::MoveResult { result: ShotResult::Hit, ship_sunk, game_over, .. },
                    ServerEvent::MoveResult { .. },
                ) => {
                    if last {
                        assert_eq!(ship_sunk, "Destroyer");
                        assert_eq!(game_over, Some(true));
                    } else {
                        assert_eq!(game_over, None);
                    }
                }
                other => panic!("expected MOVE_RESULT pair, got {other:?}"),
            }

            if last {
                break;
            }

            assert!(matches!(alice.recv().await, ServerEvent::TurnChange { your_turn: false }));
            assert!(matches!(bob.recv().await, ServerEvent::TurnChange { your_turn: true }));

            // Bob burns his turn in empty water on the far side.
            let water = format!("{}{}", (b'A' + (i / 4) as u8) as char, 5 + (i % 4));
            bob.send(ClientCommand::Move { coord: water }).await;
            bob.recv().await;
            alice.recv().await;
            assert!(matches!(bob.recv().await, ServerEvent::TurnChange { your_turn: false }));
            assert!(matches!(alice.recv().await, ServerEvent::TurnChange { your_turn: true }));
        }

        match alice.recv().await {
            ServerEvent::GameEnd { result, reason, rating } => {
                assert_eq!(result, MatchResult::Win);
                assert_eq!(reason, "ALL_SHIPS_SUNK");
                assert_eq!(rating, 810);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
        match bob.recv().await {
            ServerEvent::GameEnd { result, rating, .. } => {
                assert_eq!(result, MatchResult::Lose);
                assert_eq!(rating, 790);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }

        // Both are back in the lobby with history written.
        alice.send(ClientCommand::MatchHistory {}).await;
        match alice.recv().await {
            ServerEvent::MatchHistory { matches } => {
                assert_eq!(matches.len(), 1);
                assert_eq!(matches[0].opponent, "bob");
                assert_eq!(matches[0].result, MatchResult::Win);
            }
            other => panic!("expected MATCH_HISTORY, got {other:?}"),
        }
        alice.send(ClientCommand::Move { coord: "A0".into() }).await;
        assert!(matches!(alice.recv().await, ServerEvent::SystemMsg { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_challenge_flow_and_chat_and_draw() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice.register_and_login("alice").await;
        bob.register_and_login("bob").await;

        // Challenging a ghost.
        alice.send(ClientCommand::Challenge { target_username: "ghost".into() }).await;
        assert!(matches!(alice.recv().await, ServerEvent::SystemMsg { code: 404, .. }));

        alice.send(ClientCommand::Challenge { target_username: "bob".into() }).await;
        assert!(matches!(alice.recv().await, ServerEvent::SystemMsg { code: 200, .. }));
        match bob.recv().await {
            ServerEvent::Challenge { challenger } => assert_eq!(challenger, "alice"),
            other => panic!("expected CHALLENGE, got {other:?}"),
        }

        bob.send(ClientCommand::ChallengeReply {
            challenger_username: "alice".into(),
            status: "ACCEPT".into(),
        })
        .await;

        // Direct challenges skip the ready handshake entirely; the
        // challenger moves first.
        assert!(matches!(
            alice.recv().await,
            ServerEvent::GameStart { your_turn: true, .. }
        ));
        assert!(matches!(bob.recv().await, ServerEvent::GameStart { your_turn: false, .. }));

        // Chat relays to the opponent only.
        alice.send(ClientCommand::Chat { message: "gl hf".into() }).await;
        match bob.recv().await {
            ServerEvent::Chat { from, message } => {
                assert_eq!(from, "alice");
                assert_eq!(message, "gl hf");
            }
            other => panic!("expected CHAT, got {other:?}"),
        }

        alice.place_standard_fleet().await;
        alice.recv().await;
        alice.recv().await;
        bob.place_standard_fleet().await;
        bob.recv().await;
        alice.recv().await;
        bob.recv().await;

        // Draw offer: reject first, then accept.
        alice.send(ClientCommand::DrawOffer {}).await;
        match bob.recv().await {
            ServerEvent::DrawOffer { from } => assert_eq!(from, "alice"),
            other => panic!("expected DRAW_OFFER, got {other:?}"),
        }
        bob.send(ClientCommand::DrawReply { status: "reject".into() }).await;
        assert!(matches!(alice.recv().await, ServerEvent::DrawRejected {}));

        // Accepting with no live offer is a state error.
        alice.send(ClientCommand::DrawReply { status: "accept".into() }).await;
        assert!(matches!(alice.recv().await, ServerEvent::SystemMsg { code: 400, .. }));

        alice.send(ClientCommand::DrawOffer {}).await;
        assert!(matches!(bob.recv().await, ServerEvent::DrawOffer { .. }));
        bob.send(ClientCommand::DrawReply { status: "accept".into() }).await;

        for client in [&mut alice, &mut bob] {
            match client.recv().await {
                ServerEvent::GameEnd { result, reason, rating } => {
                    assert_eq!(result, MatchResult::Draw);
                    assert_eq!(reason, "DRAW_ACCEPTED");
                    assert_eq!(rating, crate::DEFAULT_RATING);
                }
                other => panic!("expected GAME_END, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_surrender() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let (mut alice, mut bob) = start_duel(addr).await;

        bob.send(ClientCommand::Surrender {}).await;
        match bob.recv().await {
            ServerEvent::GameEnd { result, reason, rating } => {
                assert_eq!(result, MatchResult::Lose);
                assert_eq!(reason, "SURRENDER");
                assert_eq!(rating, 790);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
        match alice.recv().await {
            ServerEvent::GameEnd { result, rating, .. } => {
                assert_eq!(result, MatchResult::Win);
                assert_eq!(rating, 810);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_mid_game_credits_the_opponent() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let (mut alice, bob) = start_duel(addr).await;

        drop(bob);

        match alice.recv().await {
            ServerEvent::GameEnd { result, reason, rating } => {
                assert_eq!(result, MatchResult::Win);
                assert_eq!(reason, "OPPONENT_DISCONNECTED");
                assert_eq!(rating, 810);
            }
            other => panic!("expected GAME_END, got {other:?}"),
        }

        // Bob's loss is on the books for his next login.
        let mut bob = TestClient::connect(addr).await;
        bob.send(ClientCommand::Login { username: "bob".into(), password: "pw".into() }).await;
        match bob.recv().await {
            ServerEvent::LoginSuccess { rating, .. } => assert_eq!(rating, 790),
            other => panic!("expected LOGIN_SUCCESS, got {other:?}"),
        }
        bob.send(ClientCommand::MatchHistory {}).await;
        match bob.recv().await {
            ServerEvent::MatchHistory { matches } => {
                assert_eq!(matches[0].result, MatchResult::Lose);
                assert_eq!(matches[0].opponent, "alice");
            }
            other => panic!("expected MATCH_HISTORY, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_match_decline_returns_peer_to_lobby() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice.register_and_login("alice").await;
        bob.register_and_login("bob").await;

        alice.send(ClientCommand::StartMatching {}).await;
        alice.recv().await;
        bob.send(ClientCommand::StartMatching {}).await;
        bob.recv().await;
        alice.recv().await;
        bob.recv().await;

        bob.send(ClientCommand::MatchDecline {}).await;
        assert!(matches!(alice.recv().await, ServerEvent::MatchDeclined { .. }));

        // Both are free again and can re-queue.
        alice.send(ClientCommand::StartMatching {}).await;
        assert!(matches!(alice.recv().await, ServerEvent::MatchingStarted { .. }));
        bob.send(ClientCommand::StartMatching {}).await;
        assert!(matches!(bob.recv().await, ServerEvent::MatchingStarted { .. }));
        assert!(matches!(alice.recv().await, ServerEvent::MatchFound { .. }));
        assert!(matches!(bob.recv().await, ServerEvent::MatchFound { .. }));
    }

    #[tokio::test]
    async fn test_matchmaking_respects_the_window() {
        let dir = TempDir::new().unwrap();
        let (server, addr) = spawn_server(test_config(&dir)).await;

        // Pre-bake ratings 800 and 901: outside the window.
        server.accounts.register("alice", "pw").unwrap();
        server.accounts.register("bob", "pw").unwrap();
        for _ in 0..10 {
            server.accounts.update_stats("bob", 10, true).unwrap();
        }
        server.accounts.update_stats("bob", 1, true).unwrap();
        assert_eq!(server.accounts.rating("bob"), Some(901));

        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice
            .send(ClientCommand::Login { username: "alice".into(), password: "pw".into() })
            .await;
        alice.recv().await;
        bob.send(ClientCommand::Login { username: "bob".into(), password: "pw".into() }).await;
        bob.recv().await;

        alice.send(ClientCommand::StartMatching {}).await;
        alice.recv().await;
        bob.send(ClientCommand::StartMatching {}).await;
        bob.recv().await;

        // 101 apart: no pairing. CANCEL still works, proving the
        // queue held both.
        alice.send(ClientCommand::CancelMatching {}).await;
        assert!(matches!(alice.recv().await, ServerEvent::MatchingCancelled { .. }));
        bob.send(ClientCommand::CancelMatching {}).await;
        assert!(matches!(bob.recv().await, ServerEvent::MatchingCancelled { .. }));
    }

    #[tokio::test]
    async fn test_challenge_blocked_during_ready_handshake() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        let mut carol = TestClient::connect(addr).await;
        alice.register_and_login("alice").await;
        bob.register_and_login("bob").await;
        carol.register_and_login("carol").await;

        // Pair alice and bob and leave them mid ready-handshake.
        alice.send(ClientCommand::StartMatching {}).await;
        alice.recv().await;
        bob.send(ClientCommand::StartMatching {}).await;
        bob.recv().await;
        assert!(matches!(alice.recv().await, ServerEvent::MatchFound { .. }));
        assert!(matches!(bob.recv().await, ServerEvent::MatchFound { .. }));

        carol.send(ClientCommand::Challenge { target_username: "bob".into() }).await;
        assert!(matches!(carol.recv().await, ServerEvent::SystemMsg { code: 400, .. }));

        // The refused reservation left no pointers behind: carol is
        // still free to queue.
        carol.send(ClientCommand::StartMatching {}).await;
        assert!(matches!(carol.recv().await, ServerEvent::MatchingStarted { .. }));
    }

    #[tokio::test]
    async fn test_pairing_severs_a_challenge_on_a_queued_target() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        let mut carol = TestClient::connect(addr).await;
        alice.register_and_login("alice").await;
        bob.register_and_login("bob").await;
        carol.register_and_login("carol").await;

        // Bob queues alone, then carol challenges him.
        bob.send(ClientCommand::StartMatching {}).await;
        assert!(matches!(bob.recv().await, ServerEvent::MatchingStarted { .. }));
        carol.send(ClientCommand::Challenge { target_username: "bob".into() }).await;
        assert!(matches!(carol.recv().await, ServerEvent::SystemMsg { code: 200, .. }));
        assert!(matches!(bob.recv().await, ServerEvent::Challenge { .. }));

        // Alice queues, pairs with bob, and both confirm.
        alice.send(ClientCommand::StartMatching {}).await;
        assert!(matches!(alice.recv().await, ServerEvent::MatchingStarted { .. }));
        assert!(matches!(bob.recv().await, ServerEvent::MatchFound { .. }));
        assert!(matches!(alice.recv().await, ServerEvent::MatchFound { .. }));
        bob.send(ClientCommand::MatchReady {}).await;
        assert!(matches!(alice.recv().await, ServerEvent::OpponentReady { .. }));
        alice.send(ClientCommand::MatchReady {}).await;
        assert!(matches!(bob.recv().await, ServerEvent::GameStart { .. }));
        assert!(matches!(alice.recv().await, ServerEvent::GameStart { .. }));

        // The battle killed carol's challenge and told her so.
        match carol.recv().await {
            ServerEvent::ChallengeReply { target_username, status } => {
                assert_eq!(target_username, "bob");
                assert_eq!(status, "REJECT");
            }
            other => panic!("expected CHALLENGE_REPLY, got {other:?}"),
        }

        // Carol is not wedged: she can queue afterwards.
        carol.send(ClientCommand::StartMatching {}).await;
        assert!(matches!(carol.recv().await, ServerEvent::MatchingStarted { .. }));
    }

    #[tokio::test]
    async fn test_ping_update_forwards_to_opponent() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let (mut alice, mut bob) = start_duel(addr).await;

        alice.send(ClientCommand::UpdatePing { ping: 42 }).await;
        match bob.recv().await {
            ServerEvent::PingUpdate { opponent_ping } => assert_eq!(opponent_ping, 42),
            other => panic!("expected PING_UPDATE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_placement_is_rejected_and_retryable() {
        let dir = TempDir::new().unwrap();
        let (_server, addr) = spawn_server(test_config(&dir)).await;
        let mut alice = TestClient::connect(addr).await;
        let mut bob = TestClient::connect(addr).await;
        alice.register_and_login("alice").await;
        bob.register_and_login("bob").await;

        alice.send(ClientCommand::Challenge { target_username: "bob".into() }).await;
        alice.recv().await;
        bob.recv().await;
        bob.send(ClientCommand::ChallengeReply {
            challenger_username: "alice".into(),
            status: "ACCEPT".into(),
        })
        .await;
        alice.recv().await;
        bob.recv().await;

        // Off-board carrier: whole submission rejected.
        let bad = vec![
            ShipSpec { name: "Carrier".into(), size: 5, row: 0, col: 6, horizontal: true },
            ShipSpec { name: "Battleship".into(), size: 4, row: 1, col: 0, horizontal: true },
            ShipSpec { name: "Cruiser".into(), size: 3, row: 2, col: 0, horizontal: true },
            ShipSpec { name: "Submarine".into(), size: 3, row: 3, col: 0, horizontal: true },
            ShipSpec { name: "Destroyer".into(), size: 2, row: 4, col: 0, horizontal: true },
        ];
        alice.send(ClientCommand::PlaceShips { ships: bad }).await;
        assert!(matches!(alice.recv().await, ServerEvent::SystemMsg { code: 400, .. }));

        // The seat is still open for a corrected fleet.
        alice.place_standard_fleet().await;
        assert!(matches!(alice.recv().await, ServerEvent::PlaceShipAck { .. }));
    }
}
