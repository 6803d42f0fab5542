//! Websocket server that gives every client its own pty session.
//!
//! Each accepted connection runs on its own thread:
//! - the handshake validates path, origin and (optionally) basic auth,
//! - the pty is started inside the handshake so a spawn failure answers the
//!   upgrade with 500 instead of opening a dead socket,
//! - a forwarder thread streams pty output to the client while the
//!   connection thread dispatches client frames into the pty,
//! - whichever side finishes first tears down the other.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use time::OffsetDateTime;
use tracing::{debug, error, info, info_span, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;
use tungstenite::http::header::{AUTHORIZATION, HeaderValue, ORIGIN, WWW_AUTHENTICATE};
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{WebSocket, accept_hdr_with_config};

use crate::activity::ActivityTracker;
use crate::channel::{MessageSink, WsChannel};
use crate::dispatcher::run_dispatcher;
use crate::error::{BridgeError, Result};
use crate::forwarder::{ForwarderExit, RuneSafeForwarder};
use crate::pty_session::{PtySession, SessionConfig};

pub const DEFAULT_REALM: &str = "Restricted";

/// Looks up the password of a user for basic authentication.
pub trait SecretLookup: Send + Sync {
    fn secret(&self, user: &str, realm: &str) -> Option<String>;
}

/// Runtime configuration for the terminal server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the websocket server to.
    pub bind_addr: SocketAddr,
    /// The only path that upgrades to a terminal session.
    pub path: String,
    /// Process started for every connection.
    pub session: SessionConfig,
    /// Realm announced in `WWW-Authenticate`.
    pub realm: String,
    /// Allowlist for `Origin` headers. Empty means allow all.
    pub allowed_origins: Vec<String>,
    /// Max websocket message/frame size.
    pub max_message_bytes: usize,
    /// Sleep between polls of an idle websocket.
    pub poll_interval: Duration,
    /// Stop after one session if true.
    pub accept_once: bool,
    /// How long teardown waits for the pty reader once the child is reaped.
    pub forwarder_join_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            path: "/pty".to_string(),
            session: SessionConfig::default(),
            realm: DEFAULT_REALM.to_string(),
            allowed_origins: Vec::new(),
            max_message_bytes: 256 * 1024,
            poll_interval: Duration::from_millis(5),
            accept_once: false,
            forwarder_join_timeout: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    /// Resolve `addr` (`host:port`) into the bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not resolve.
    pub fn bind(mut self, addr: &str) -> io::Result<Self> {
        self.bind_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address {addr:?} did not resolve"),
            )
        })?;
        Ok(self)
    }
}

/// What one connection did, logged when it ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub ws_in_frames: u64,
    pub ws_out_frames: u64,
    pub pty_in_bytes: u64,
    pub pty_out_bytes: u64,
    pub resize_events: u64,
    pub decode_errors: u64,
    pub exit_code: Option<u32>,
}

/// Serve terminal sessions until the listener fails.
///
/// If `accept_once` is true, this serves a single client and returns.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or stops accepting.
pub fn run_server(
    config: ServerConfig,
    activity: Arc<ActivityTracker>,
    secrets: Option<Arc<dyn SecretLookup>>,
) -> io::Result<()> {
    let listener = TcpListener::bind(config.bind_addr)?;
    info!(addr = %listener.local_addr()?, path = %config.path, "terminal server listening");
    serve(listener, config, activity, secrets)
}

/// [`run_server`] on an already bound listener.
///
/// # Errors
///
/// Returns an error if accepting a connection fails.
pub fn serve(
    listener: TcpListener,
    config: ServerConfig,
    activity: Arc<ActivityTracker>,
    secrets: Option<Arc<dyn SecretLookup>>,
) -> io::Result<()> {
    let config = Arc::new(config);
    loop {
        let (stream, peer_addr) = listener.accept()?;
        let session_id = make_session_id();

        if config.accept_once {
            handle_connection(stream, peer_addr, &config, &activity, secrets.as_deref(), session_id);
            return Ok(());
        }

        let config = Arc::clone(&config);
        let activity = Arc::clone(&activity);
        let secrets = secrets.clone();
        let spawned = thread::Builder::new()
            .name(format!("wsterm-conn-{peer_addr}"))
            .spawn(move || {
                handle_connection(
                    stream,
                    peer_addr,
                    &config,
                    &activity,
                    secrets.as_deref(),
                    session_id,
                );
            });
        if let Err(error) = spawned {
            error!(%peer_addr, %error, "failed to spawn connection thread");
        }
    }
}

fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: &ServerConfig,
    activity: &ActivityTracker,
    secrets: Option<&dyn SecretLookup>,
    session_id: String,
) {
    let span = info_span!("session", session_id = %session_id, peer = %peer_addr);
    let _entered = span.enter();
    match run_single_session(stream, config, activity, secrets, session_id) {
        Ok(summary) => info!(
            ws_in_frames = summary.ws_in_frames,
            ws_out_frames = summary.ws_out_frames,
            pty_in_bytes = summary.pty_in_bytes,
            pty_out_bytes = summary.pty_out_bytes,
            resize_events = summary.resize_events,
            decode_errors = summary.decode_errors,
            exit_code = ?summary.exit_code,
            "terminal session ended"
        ),
        Err(error) => warn!(%error, "terminal session failed"),
    }
}

fn run_single_session(
    stream: TcpStream,
    config: &ServerConfig,
    activity: &ActivityTracker,
    secrets: Option<&dyn SecretLookup>,
    session_id: String,
) -> Result<SessionSummary> {
    stream.set_nodelay(true).map_err(BridgeError::transport)?;
    let (websocket, mut session) = accept_session(stream, config, secrets)?;
    info!(pid = ?session.pid(), command = %config.session.command, "terminal session started");

    let reader = session.take_reader()?;
    let channel = WsChannel::new(websocket, config.poll_interval).map_err(BridgeError::transport)?;
    let forwarder_sink = channel.clone();
    let forwarder = thread::Builder::new()
        .name("wsterm-pty-reader".to_string())
        .spawn(move || RuneSafeForwarder::new(reader, forwarder_sink).run())
        .map_err(BridgeError::transport)?;

    // The forwarder closes the channel when it exits, which also ends this loop.
    let mut source = channel;
    let dispatch = run_dispatcher(&mut source, &mut session, activity);
    match &dispatch.outcome {
        Ok(()) => debug!("client closed the connection"),
        Err(error) => debug!(%error, "dispatcher finished"),
    }

    let exit_code = match session.stop() {
        Ok(status) => Some(status.exit_code()),
        Err(error) => {
            warn!(%error, "failed to reap pty process");
            None
        }
    };
    // A process that outlived the child can keep the pty slave open, and
    // then the reader never returns.
    let (ws_out_frames, pty_out_bytes) =
        match join_forwarder(forwarder, config.forwarder_join_timeout, config.poll_interval)? {
            Some(forwarded) => {
                debug!(reason = %forwarded.reason, "pty forwarder joined");
                (forwarded.frames_sent, forwarded.pty_out_bytes)
            }
            None => {
                warn!(
                    timeout = ?config.forwarder_join_timeout,
                    "pty reader still blocked after teardown; detaching it"
                );
                source.close();
                (0, 0)
            }
        };

    Ok(SessionSummary {
        session_id,
        ws_in_frames: dispatch.stats.frames,
        ws_out_frames,
        pty_in_bytes: dispatch.stats.pty_in_bytes,
        pty_out_bytes,
        resize_events: dispatch.stats.resize_events,
        decode_errors: dispatch.stats.decode_errors,
        exit_code,
    })
}

/// Wait for the forwarder thread, giving up after `timeout`. `None` means the
/// thread is still running and has been left detached.
fn join_forwarder(
    handle: thread::JoinHandle<ForwarderExit>,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<ForwarderExit>> {
    let deadline = Instant::now().checked_add(timeout);
    while !handle.is_finished() {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(None);
        }
        thread::sleep(poll_interval);
    }
    handle
        .join()
        .map(Some)
        .map_err(|_| BridgeError::transport("pty reader thread panicked"))
}

#[allow(clippy::result_large_err)] // ErrorResponse size is dictated by tungstenite's API
fn accept_session(
    stream: TcpStream,
    config: &ServerConfig,
    secrets: Option<&dyn SecretLookup>,
) -> Result<(WebSocket<TcpStream>, PtySession)> {
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_bytes))
        .max_frame_size(Some(config.max_message_bytes));

    let mut started: Option<PtySession> = None;
    let mut spawn_error: Option<BridgeError> = None;
    let callback = |request: &Request,
                    response: Response|
     -> std::result::Result<Response, ErrorResponse> {
        validate_upgrade_request(request, config, secrets).map_err(HandshakeRejection::into_response)?;
        match PtySession::start(&config.session) {
            Ok(session) => {
                started = Some(session);
                Ok(response)
            }
            Err(error) => {
                let rejection = HandshakeRejection {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: "Failed to start terminal".to_string(),
                    challenge: None,
                };
                spawn_error = Some(error);
                Err(rejection.into_response())
            }
        }
    };

    let accepted = accept_hdr_with_config(stream, callback, Some(ws_config))
        .map_err(|error| BridgeError::transport(format!("websocket handshake failed: {error}")));

    match (accepted, started) {
        (Ok(websocket), Some(session)) => Ok((websocket, session)),
        (Ok(_), None) => Err(BridgeError::transport("handshake completed without a session")),
        (Err(error), started) => {
            if let Some(session) = started {
                let _ = session.stop();
            }
            Err(spawn_error.unwrap_or(error))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HandshakeRejection {
    status: StatusCode,
    body: String,
    challenge: Option<String>,
}

impl HandshakeRejection {
    fn new(status: StatusCode, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            challenge: None,
        }
    }

    fn unauthorized(realm: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: "Unauthorized".to_string(),
            challenge: Some(format!("Basic realm=\"{realm}\"")),
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.body));
        *response.status_mut() = self.status;
        if let Some(challenge) = self.challenge
            && let Ok(value) = HeaderValue::from_str(&challenge)
        {
            response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
        response
    }
}

fn validate_upgrade_request(
    request: &Request,
    config: &ServerConfig,
    secrets: Option<&dyn SecretLookup>,
) -> std::result::Result<(), HandshakeRejection> {
    if request.uri().path() != config.path {
        return Err(HandshakeRejection::new(StatusCode::NOT_FOUND, "Not Found"));
    }

    if !config.allowed_origins.is_empty() {
        let origin = request
            .headers()
            .get(ORIGIN)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| HandshakeRejection::new(StatusCode::FORBIDDEN, "Origin header missing"))?;
        if !config.allowed_origins.iter().any(|allowed| allowed == origin) {
            return Err(HandshakeRejection::new(StatusCode::FORBIDDEN, "Origin not allowed"));
        }
    }

    if let Some(secrets) = secrets {
        let (user, password) = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_basic_credentials)
            .ok_or_else(|| HandshakeRejection::unauthorized(&config.realm))?;
        let expected = secrets
            .secret(&user, &config.realm)
            .filter(|secret| !secret.is_empty());
        if expected.as_deref() != Some(password.as_str()) {
            debug!(user = %user, "basic auth rejected");
            return Err(HandshakeRejection::unauthorized(&config.realm));
        }
    }

    Ok(())
}

/// `Basic <base64(user:password)>` → `(user, password)`.
fn parse_basic_credentials(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn make_session_id() -> String {
    let ts = OffsetDateTime::now_utc().unix_timestamp_nanos();
    format!("wsterm-{}-{ts}", std::process::id())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct StaticSecrets(HashMap<String, String>);

    impl SecretLookup for StaticSecrets {
        fn secret(&self, user: &str, _realm: &str) -> Option<String> {
            self.0.get(user).cloned()
        }
    }

    fn secrets() -> StaticSecrets {
        StaticSecrets(HashMap::from([
            ("alice".to_string(), "wonderland".to_string()),
            ("nopass".to_string(), String::new()),
        ]))
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).expect("request build")
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
    }

    #[test]
    fn config_default_fields() {
        let c = ServerConfig::default();
        assert_eq!(c.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
        assert_eq!(c.path, "/pty");
        assert_eq!(c.realm, "Restricted");
        assert!(c.allowed_origins.is_empty());
        assert_eq!(c.max_message_bytes, 256 * 1024);
        assert!(!c.accept_once);
        assert_eq!(c.forwarder_join_timeout, Duration::from_secs(2));
        assert_eq!(c.session.rows, 60);
        assert_eq!(c.session.cols, 200);
    }

    #[test]
    fn bind_resolves_host_and_port() {
        let c = ServerConfig::default().bind("127.0.0.1:9123").expect("resolve");
        assert_eq!(c.bind_addr, SocketAddr::from(([127, 0, 0, 1], 9123)));
        assert!(ServerConfig::default().bind("no-port").is_err());
    }

    #[test]
    fn parse_basic_credentials_decodes_user_and_password() {
        assert_eq!(
            parse_basic_credentials(&basic("alice", "a:b")),
            Some(("alice".to_string(), "a:b".to_string()))
        );
        assert_eq!(parse_basic_credentials("Bearer abc"), None);
        assert_eq!(parse_basic_credentials("Basic !!!"), None);
        assert_eq!(parse_basic_credentials("Basic"), None);
    }

    #[test]
    fn validate_rejects_other_paths() {
        let rejection = validate_upgrade_request(&request("/ws", &[]), &ServerConfig::default(), None)
            .expect_err("wrong path");
        assert_eq!(rejection.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn validate_without_secrets_accepts_anyone() {
        let result = validate_upgrade_request(&request("/pty", &[]), &ServerConfig::default(), None);
        assert!(result.is_ok());
    }

    #[test]
    fn validate_accepts_matching_credentials() {
        let auth = basic("alice", "wonderland");
        let req = request("/pty", &[("Authorization", auth.as_str())]);
        let secrets = secrets();
        assert!(validate_upgrade_request(&req, &ServerConfig::default(), Some(&secrets)).is_ok());
    }

    #[test]
    fn validate_challenges_missing_or_wrong_credentials() {
        let secrets = secrets();
        let config = ServerConfig::default();
        let wrong = basic("alice", "nope");
        let unknown = basic("bob", "");
        let empty_secret = basic("nopass", "");
        for headers in [
            vec![],
            vec![("Authorization", wrong.as_str())],
            vec![("Authorization", unknown.as_str())],
            vec![("Authorization", empty_secret.as_str())],
        ] {
            let rejection = validate_upgrade_request(&request("/pty", &headers), &config, Some(&secrets))
                .expect_err("must reject");
            assert_eq!(rejection.status, StatusCode::UNAUTHORIZED);
            assert_eq!(rejection.challenge.as_deref(), Some("Basic realm=\"Restricted\""));
        }
    }

    #[test]
    fn validate_enforces_origin_allowlist() {
        let config = ServerConfig {
            allowed_origins: vec!["https://ide.example".to_string()],
            ..ServerConfig::default()
        };
        assert!(
            validate_upgrade_request(&request("/pty", &[("Origin", "https://ide.example")]), &config, None)
                .is_ok()
        );
        let denied = validate_upgrade_request(&request("/pty", &[("Origin", "https://evil.example")]), &config, None)
            .expect_err("denied");
        assert_eq!(denied.status, StatusCode::FORBIDDEN);
        let missing = validate_upgrade_request(&request("/pty", &[]), &config, None).expect_err("missing");
        assert_eq!(missing.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn rejection_response_carries_challenge_header() {
        let response = HandshakeRejection::unauthorized("Restricted").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).and_then(|v| v.to_str().ok()),
            Some("Basic realm=\"Restricted\"")
        );
        let plain = HandshakeRejection::new(StatusCode::NOT_FOUND, "Not Found").into_response();
        assert!(plain.headers().get(WWW_AUTHENTICATE).is_none());
    }

    fn finished_after(delay: Duration) -> thread::JoinHandle<ForwarderExit> {
        thread::spawn(move || {
            thread::sleep(delay);
            ForwarderExit {
                pty_out_bytes: 5,
                frames_sent: 1,
                reason: BridgeError::PtyClosed,
            }
        })
    }

    #[test]
    fn join_forwarder_returns_exit_of_finished_thread() {
        let handle = finished_after(Duration::from_millis(10));
        let exit = join_forwarder(handle, Duration::from_secs(5), Duration::from_millis(1))
            .expect("join")
            .expect("forwarder finished");
        assert_eq!(exit.frames_sent, 1);
        assert_eq!(exit.pty_out_bytes, 5);
    }

    #[test]
    fn join_forwarder_gives_up_on_blocked_thread() {
        let handle = finished_after(Duration::from_secs(3));
        let started = Instant::now();
        let exit = join_forwarder(handle, Duration::from_millis(50), Duration::from_millis(1))
            .expect("join");
        assert!(exit.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn join_forwarder_reports_panicked_thread() {
        let handle = thread::spawn(|| -> ForwarderExit { panic!("reader blew up") });
        let error = join_forwarder(handle, Duration::from_secs(5), Duration::from_millis(1))
            .expect_err("panic surfaces as error");
        assert!(matches!(error, BridgeError::Transport(_)));
    }

    #[test]
    fn make_session_id_format() {
        let id = make_session_id();
        assert!(id.starts_with("wsterm-"));
        assert!(id.len() > 10);
    }
}
