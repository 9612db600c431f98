use crate::auth::{Authorizer, PlayerIdentity};
use crate::config::TargetConfig;
use crate::error::Result;
use crate::healthcheck::HealthSnapshot;
use crate::lifecycle::{LifecycleOrchestrator, LifecycleState, StateKind};
use crate::protocol::{
    self, Handshake, LoginStart, NextState, Packet, StatusResponse, MAX_CLIENT_FRAME,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Message shown to a rejected player
pub const REJECTED_MESSAGE: &str = "You're not authorized to join this server.";
/// Message shown to a player whose login boots the backend
pub const BOOTING_MESSAGE: &str = "Booting the server now. Please reconnect once it's up.";

/// How an inbound connection is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward bytes to the backend untouched
    Splice,
    /// Answer the client ourselves
    Intercept,
}

/// Result of a login attempt against a down backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Rejected(String),
    Booting(String),
}

impl LoginOutcome {
    pub fn message(&self) -> &str {
        match self {
            LoginOutcome::Rejected(msg) | LoginOutcome::Booting(msg) => msg,
        }
    }
}

/// State captured once per connection; every decision for that connection
/// uses the same view.
#[derive(Debug, Clone)]
pub struct RouterView {
    pub state: LifecycleState,
    pub health: Arc<HealthSnapshot>,
}

/// Build the status response a client sees for `view` at `now`
pub fn status_for(view: &RouterView, now: Instant) -> StatusResponse {
    if view.state.kind == StateKind::Active {
        if let Some(metadata) = &view.health.metadata {
            return StatusResponse::clone(metadata);
        }
    }

    let elapsed = view.state.elapsed_at(now).as_secs_f64().round() as u64;
    let (version, text) = match view.state.kind {
        StateKind::Starting => (
            "Booting up",
            format!("Please wait while the server starts ({}s)...", elapsed),
        ),
        StateKind::Stopping => (
            "Shutting down",
            format!("Please wait while the server shuts down ({}s)...", elapsed),
        ),
        StateKind::Inactive => (
            "Inactive",
            "Server inactive; connect to boot it up.".to_string(),
        ),
        StateKind::Unknown | StateKind::Unauthorized | StateKind::Active => {
            ("Unknown", "Unknown status. Please wait...".to_string())
        }
    };

    let mut response = StatusResponse::synthetic(version, &text);
    response.favicon = view.health.favicon().map(str::to_string);
    response
}

/// Per-connection routing and interception
pub struct ConnectionRouter {
    target: TargetConfig,
    health_rx: watch::Receiver<Arc<HealthSnapshot>>,
    orchestrator: Arc<LifecycleOrchestrator>,
    authorizer: Authorizer,
    client_timeout: Duration,
}

impl ConnectionRouter {
    pub fn new(
        target: TargetConfig,
        health_rx: watch::Receiver<Arc<HealthSnapshot>>,
        orchestrator: Arc<LifecycleOrchestrator>,
        authorizer: Authorizer,
        client_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            target,
            health_rx,
            orchestrator,
            authorizer,
            client_timeout,
        })
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Splice when the freshest probe reached the backend
    pub fn on_connection(&self) -> RouteDecision {
        if self.health_rx.borrow().reachable {
            RouteDecision::Splice
        } else {
            RouteDecision::Intercept
        }
    }

    /// State and health are read from separate channels. A skew between
    /// them only shapes one synthetic response and the next connection
    /// sees the settled pair.
    pub fn view(&self) -> RouterView {
        RouterView {
            state: self.orchestrator.state(),
            health: self.health_rx.borrow().clone(),
        }
    }

    pub fn on_status_query(&self, view: &RouterView, now: Instant) -> StatusResponse {
        status_for(view, now)
    }

    /// Authorize the player and tell the orchestrator about the attempt
    pub async fn on_login_attempt(&self, identity: &PlayerIdentity) -> LoginOutcome {
        let authorized = self.authorizer.authorize(identity).await;
        let state = self.orchestrator.on_login(authorized);

        if authorized {
            info!(player = %identity, state = %state.kind, "Login while backend is down, booting");
            LoginOutcome::Booting(BOOTING_MESSAGE.to_string())
        } else {
            warn!(player = %identity, "Unauthorized login attempt");
            LoginOutcome::Rejected(REJECTED_MESSAGE.to_string())
        }
    }

    /// Serve one inbound connection to completion
    pub async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, conn_id: &str) {
        match self.on_connection() {
            RouteDecision::Splice => self.splice(stream, addr, conn_id).await,
            RouteDecision::Intercept => {
                let view = self.view();
                if let Err(e) = self.intercept(stream, &view, conn_id).await {
                    debug!(addr = %addr, conn_id, error = %e, "Intercepted connection closed");
                }
            }
        }
    }

    async fn splice(&self, mut client: TcpStream, addr: SocketAddr, conn_id: &str) {
        let connect = TcpStream::connect(self.target.addr());
        let mut backend = match tokio::time::timeout(self.client_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(
                    addr = %addr,
                    conn_id,
                    backend = %self.target.addr(),
                    error = %e,
                    "Failed to connect to backend"
                );
                return;
            }
            Err(_) => {
                warn!(
                    addr = %addr,
                    conn_id,
                    backend = %self.target.addr(),
                    timeout_secs = self.client_timeout.as_secs(),
                    "Timed out connecting to backend"
                );
                return;
            }
        };

        debug!(addr = %addr, conn_id, "Splicing connection to backend");
        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok((client_to_backend, backend_to_client)) => {
                debug!(
                    addr = %addr,
                    conn_id,
                    client_to_backend,
                    backend_to_client,
                    "Spliced connection closed"
                );
            }
            Err(e) => {
                debug!(addr = %addr, conn_id, error = %e, "Spliced connection closed with error");
            }
        }
    }

    /// Speak just enough protocol to answer a status query or a login
    pub async fn intercept<S>(&self, mut stream: S, view: &RouterView, conn_id: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let packet = self.read_client_packet(&mut stream).await?;
        let handshake = Handshake::decode(&packet)?;
        debug!(
            conn_id,
            protocol_version = handshake.protocol_version,
            next_state = ?handshake.next_state,
            "Intercepted handshake"
        );

        match handshake.next_state {
            NextState::Status => {
                let packet = self.read_client_packet(&mut stream).await?;
                protocol::expect_status_request(&packet)?;

                let response = self.on_status_query(view, Instant::now());
                protocol::write_status_response(&mut stream, &response).await?;

                // Clients may close without pinging
                if let Ok(packet) = self.read_client_packet(&mut stream).await {
                    let payload = protocol::decode_ping(&packet)?;
                    protocol::write_pong(&mut stream, payload).await?;
                }
            }
            NextState::Login | NextState::Transfer => {
                let packet = self.read_client_packet(&mut stream).await?;
                let login = LoginStart::decode(&packet, handshake.protocol_version)?;
                let identity = PlayerIdentity::new(&login.name, login.uuid);

                let outcome = self.on_login_attempt(&identity).await;
                protocol::write_login_disconnect(&mut stream, outcome.message()).await?;
            }
        }

        Ok(())
    }

    async fn read_client_packet<S>(&self, stream: &mut S) -> Result<Packet>
    where
        S: AsyncRead + Unpin,
    {
        match tokio::time::timeout(
            self.client_timeout,
            protocol::read_packet(stream, MAX_CLIENT_FRAME),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "client went silent",
            )
            .into()),
        }
    }
}

/// The front door listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<ConnectionRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<ConnectionRouter>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            backend = %self.router.target().addr(),
            "Proxy server listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                let conn_id = Uuid::new_v4().to_string();
                                debug!(addr = %addr, conn_id = %conn_id, "Accepted connection");
                                router.handle_connection(stream, addr, &conn_id).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Whitelist;
    use crate::lifecycle::{LifecycleEvent, LifecyclePolicy};
    use crate::protocol::{read_packet, MAX_STATUS_FRAME};
    use std::io::Write;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    struct Harness {
        router: Arc<ConnectionRouter>,
        orchestrator: Arc<LifecycleOrchestrator>,
        health_tx: watch::Sender<Arc<HealthSnapshot>>,
        events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    }

    fn harness(authorizer: Authorizer) -> Harness {
        let (health_tx, health_rx) = watch::channel(Arc::new(HealthSnapshot::initial()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let orchestrator =
            LifecycleOrchestrator::new(LifecyclePolicy::default(), health_rx.clone(), events_tx);
        let router = ConnectionRouter::new(
            TargetConfig::new("127.0.0.1", 1),
            health_rx,
            Arc::clone(&orchestrator),
            authorizer,
            Duration::from_millis(500),
        );
        Harness {
            router,
            orchestrator,
            health_tx,
            events_rx,
        }
    }

    fn live_status() -> StatusResponse {
        let mut status = StatusResponse::synthetic("Paper 1.21", "Hello");
        status.version.protocol = 767;
        status.players.max = 20;
        status.players.online = 2;
        status.favicon = Some("data:image/png;base64,AA".to_string());
        status
            .extra
            .insert("enforcesSecureChat".to_string(), serde_json::json!(true));
        status
    }

    fn view(kind: StateKind, entered_at: Instant, health: HealthSnapshot) -> RouterView {
        RouterView {
            state: LifecycleState::new(kind, entered_at),
            health: Arc::new(health),
        }
    }

    fn down_with_icon() -> HealthSnapshot {
        let live = HealthSnapshot::reachable(live_status(), Instant::now());
        HealthSnapshot::missed(&live, Instant::now())
    }

    #[test]
    fn test_status_active_returns_metadata_verbatim() {
        let now = Instant::now();
        let v = view(
            StateKind::Active,
            now,
            HealthSnapshot::reachable(live_status(), now),
        );
        assert_eq!(status_for(&v, now), live_status());
    }

    #[test]
    fn test_status_starting_counts_seconds() {
        let t0 = Instant::now();
        let v = view(StateKind::Starting, t0, down_with_icon());
        let status = status_for(&v, t0 + Duration::from_millis(42_400));

        assert_eq!(
            status.description_text(),
            "Please wait while the server starts (42s)..."
        );
        assert_eq!(status.version.name, "Booting up");
        assert_eq!(status.version.protocol, 1);
        assert_eq!(status.players.max, 0);
        assert_eq!(status.players.online, 0);
        assert_eq!(status.favicon.as_deref(), Some("data:image/png;base64,AA"));
    }

    #[test]
    fn test_status_stopping_rounds_seconds() {
        let t0 = Instant::now();
        let v = view(StateKind::Stopping, t0, HealthSnapshot::initial());
        let status = status_for(&v, t0 + Duration::from_millis(9_600));
        assert_eq!(
            status.description_text(),
            "Please wait while the server shuts down (10s)..."
        );
        assert_eq!(status.version.name, "Shutting down");
        assert!(status.favicon.is_none());
    }

    #[test]
    fn test_status_inactive_and_unknown() {
        let now = Instant::now();
        let inactive = status_for(&view(StateKind::Inactive, now, down_with_icon()), now);
        assert_eq!(
            inactive.description_text(),
            "Server inactive; connect to boot it up."
        );
        assert_eq!(inactive.version.name, "Inactive");

        for kind in [StateKind::Unknown, StateKind::Unauthorized] {
            let status = status_for(&view(kind, now, down_with_icon()), now);
            assert_eq!(status.description_text(), "Unknown status. Please wait...");
            assert_eq!(status.version.name, "Unknown");
            assert_eq!(status.players.max, 0);
        }
    }

    #[test]
    fn test_status_active_without_metadata_is_unknown() {
        let now = Instant::now();
        let health = HealthSnapshot {
            reachable: true,
            metadata: None,
            observed_at: now,
        };
        let status = status_for(&view(StateKind::Active, now, health), now);
        assert_eq!(status.version.name, "Unknown");
    }

    #[tokio::test]
    async fn test_splice_gives_up_on_unresponsive_backend() {
        let (health_tx, health_rx) = watch::channel(Arc::new(HealthSnapshot::reachable(
            live_status(),
            Instant::now(),
        )));
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let orchestrator =
            LifecycleOrchestrator::new(LifecyclePolicy::default(), health_rx.clone(), events_tx);
        // Non-routable: the connect either hangs or fails outright
        let router = ConnectionRouter::new(
            TargetConfig::new("10.255.255.1", 25565),
            health_rx,
            orchestrator,
            Authorizer::open(),
            Duration::from_millis(200),
        );
        assert_eq!(router.on_connection(), RouteDecision::Splice);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(3),
            router.handle_connection(stream, peer, "test"),
        )
        .await
        .expect("splice should stop waiting for the backend");
        drop(health_tx);
    }

    #[tokio::test]
    async fn test_route_decision_follows_snapshot() {
        let h = harness(Authorizer::open());
        assert_eq!(h.router.on_connection(), RouteDecision::Intercept);

        h.health_tx
            .send_replace(Arc::new(HealthSnapshot::reachable(live_status(), Instant::now())));
        assert_eq!(h.router.on_connection(), RouteDecision::Splice);
    }

    #[tokio::test]
    async fn test_login_attempt_open_whitelist_boots() {
        let mut h = harness(Authorizer::open());
        h.orchestrator.tick();

        let outcome = h.router.on_login_attempt(&PlayerIdentity::new("Steve", None)).await;
        assert_eq!(outcome, LoginOutcome::Booting(BOOTING_MESSAGE.to_string()));
        assert_eq!(h.orchestrator.state().kind, StateKind::Starting);
        assert_eq!(h.events_rx.try_recv().unwrap(), LifecycleEvent::RequestStart);
    }

    #[tokio::test]
    async fn test_login_attempt_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"[{"uuid": "069a79f4-44e9-4726-a5be-fca90e38aaf5", "name": "Notch"}]"#)
            .unwrap();
        let mut h = harness(Authorizer::with_whitelist(Whitelist::new(file.path())));
        h.orchestrator.tick();

        let outcome = h.router.on_login_attempt(&PlayerIdentity::new("Steve", None)).await;
        assert_eq!(outcome, LoginOutcome::Rejected(REJECTED_MESSAGE.to_string()));
        assert_eq!(h.orchestrator.state().kind, StateKind::Unauthorized);
        assert!(h.events_rx.try_recv().is_err());

        let outcome = h.router.on_login_attempt(&PlayerIdentity::new("notch", None)).await;
        assert!(matches!(outcome, LoginOutcome::Booting(_)));
        assert_eq!(h.orchestrator.state().kind, StateKind::Starting);
    }

    async fn run_intercept(router: Arc<ConnectionRouter>) -> DuplexStream {
        let (client, server) = duplex(64 * 1024);
        let view = router.view();
        tokio::spawn(async move {
            let _ = router.intercept(server, &view, "test").await;
        });
        client
    }

    #[tokio::test]
    async fn test_intercept_status_and_ping() {
        let h = harness(Authorizer::open());
        h.orchestrator.tick();
        let mut client = run_intercept(Arc::clone(&h.router)).await;

        let handshake = Handshake {
            protocol_version: 767,
            server_address: "play.example.com".to_string(),
            server_port: 25565,
            next_state: NextState::Status,
        };
        client.write_all(&handshake.encode()).await.unwrap();
        client
            .write_all(&protocol::encode_status_request())
            .await
            .unwrap();

        let packet = read_packet(&mut client, MAX_STATUS_FRAME).await.unwrap();
        let status = protocol::decode_status_response(&packet).unwrap();
        assert_eq!(status.version.name, "Inactive");

        client.write_all(&protocol::encode_ping(987654321)).await.unwrap();
        let pong = read_packet(&mut client, MAX_CLIENT_FRAME).await.unwrap();
        assert_eq!(protocol::decode_ping(&pong).unwrap(), 987654321);
    }

    #[tokio::test]
    async fn test_intercept_login_sends_disconnect() {
        let h = harness(Authorizer::open());
        h.orchestrator.tick();
        let mut client = run_intercept(Arc::clone(&h.router)).await;

        let handshake = Handshake {
            protocol_version: 767,
            server_address: "play.example.com".to_string(),
            server_port: 25565,
            next_state: NextState::Login,
        };
        let login = LoginStart {
            name: "Steve".to_string(),
            uuid: Some(Uuid::new_v4()),
        };
        client.write_all(&handshake.encode()).await.unwrap();
        client.write_all(&login.encode()).await.unwrap();

        let packet = read_packet(&mut client, MAX_CLIENT_FRAME).await.unwrap();
        assert_eq!(
            protocol::decode_login_disconnect(&packet).unwrap(),
            BOOTING_MESSAGE
        );
        assert_eq!(h.orchestrator.state().kind, StateKind::Starting);
    }

    #[tokio::test]
    async fn test_intercept_rejects_garbage() {
        let h = harness(Authorizer::open());
        let (mut client, server) = duplex(1024);
        client.write_all(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]).await.unwrap();

        let view = h.router.view();
        let result = h.router.intercept(server, &view, "test").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_intercept_times_out_silent_client() {
        let h = harness(Authorizer::open());
        let (_client, server) = duplex(1024);

        let view = h.router.view();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            h.router.intercept(server, &view, "test"),
        )
        .await
        .expect("intercept should give up on its own");
        assert!(result.is_err());
    }
}
