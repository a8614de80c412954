//! WebSocket listener and per-connection lifecycle.
//!
//! Each accepted socket goes through the handshake (challenge → response →
//! verdict) and then enters a select loop that owns both halves of the
//! connection: inbound frames feed the relay, outbound frames arrive on the
//! session's mpsc channel. One loop per socket means one writer per socket,
//! which keeps delivery FIFO from any sender to any receiver.

use crate::config::GatewayConfig;
use crate::handshake;
use crate::registry::{DeviceRegistry, Outbound, PairingWaiter, PairingWaiters, SessionHandle};
use crate::relay;
use crate::state::StateStore;
use futures_util::{SinkExt, StreamExt};
use phb_core::protocol::{
    self, AuthOk, HandshakeFrame, Role, CLOSE_AUTH_FAILED, CLOSE_MISSING_DEVICE_ID,
    CLOSE_SUPERSEDED, MAX_FRAME_BYTES,
};
use phb_core::{GatewayError, GwResult};
use rand::RngCore;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<TcpStream>;

/// Outbound queue depth per session.
const OUTBOUND_QUEUE: usize = 64;

/// How long sessions get to drain after the close-1001 broadcast.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The gateway server: listener plus the shared state every connection sees.
pub struct Gateway {
    config: GatewayConfig,
    state: Arc<StateStore>,
    registry: Arc<DeviceRegistry>,
    pairing: Arc<PairingWaiters>,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
    conn_count: Arc<AtomicUsize>,
}

/// Per-connection context threaded into the socket task.
#[derive(Clone)]
struct ConnCtx {
    config: GatewayConfig,
    state: Arc<StateStore>,
    registry: Arc<DeviceRegistry>,
    pairing: Arc<PairingWaiters>,
    shutdown_tx: broadcast::Sender<()>,
    conn_count: Arc<AtomicUsize>,
}

impl Gateway {
    /// Bind the listener. Fails fast so main can exit 1 on a busy port.
    pub async fn bind(config: GatewayConfig, state: Arc<StateStore>) -> GwResult<Self> {
        let listener = TcpListener::bind(config.bind_addr())
            .await
            .map_err(|e| GatewayError::Transport(format!("bind {}: {e}", config.bind_addr())))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            state,
            registry: Arc::new(DeviceRegistry::new()),
            pairing: Arc::new(PairingWaiters::new()),
            listener,
            shutdown_tx,
            conn_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes, then drain gracefully:
    /// every session gets close 1001 and up to two seconds to finish before
    /// the process force-closes the rest.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> GwResult<()> {
        info!(addr = %self.local_addr()?, "gateway listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(remote = %addr, "connection accepted");
                            let ctx = ConnCtx {
                                config: self.config.clone(),
                                state: self.state.clone(),
                                registry: self.registry.clone(),
                                pairing: self.pairing.clone(),
                                shutdown_tx: self.shutdown_tx.clone(),
                                conn_count: self.conn_count.clone(),
                            };
                            tokio::spawn(handle_connection(stream, addr, ctx));
                        }
                        Err(e) => warn!(error = %e, "TCP accept failed"),
                    }
                }
            }
        }

        let remaining_devices = self.registry.device_ids().await;
        info!(devices = ?remaining_devices, "shutting down, draining sessions");
        let _ = self.shutdown_tx.send(());

        let registry = self.registry.clone();
        let drained = timeout(SHUTDOWN_GRACE, async move {
            while registry.count().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            let remaining = self.registry.count().await;
            warn!(
                remaining,
                "grace period elapsed, force-closing remaining sessions"
            );
        }
        Ok(())
    }
}

/// Drive one accepted TCP stream through upgrade, handshake, and relay.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: ConnCtx) {
    let _guard = ConnGuard::new(&ctx.conn_count);

    // One auth window from socket accept to authenticated: the WebSocket
    // upgrade, the challenge send, and the response wait all share it.
    let deadline = tokio::time::sleep(ctx.config.handshake_timeout);
    tokio::pin!(deadline);

    let mut query: Option<String> = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_string);
        Ok(response)
    };
    let mut ws = tokio::select! {
        _ = &mut deadline => {
            debug!(remote = %addr, "handshake timed out during upgrade");
            return;
        }
        upgraded = tokio_tungstenite::accept_hdr_async(stream, callback) => match upgraded {
            Ok(ws) => ws,
            Err(e) => {
                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                return;
            }
        }
    };

    if let Some(limit) = ctx.config.max_connections {
        if ctx.conn_count.load(Ordering::Relaxed) > limit {
            debug!(remote = %addr, limit, "connection limit reached");
            close_socket(&mut ws, 1013, "connection limit reached").await;
            return;
        }
    }

    let Some(device_id) = parse_device_id(query.as_deref()) else {
        warn!(remote = %addr, "connection rejected: missing device_id query param");
        close_socket(&mut ws, CLOSE_MISSING_DEVICE_ID, "missing_device_id").await;
        return;
    };

    let (nonce, challenge) = handshake::issue_challenge(&ctx.state).await;
    tokio::select! {
        _ = &mut deadline => {
            // The peer is stalling our writes; nothing useful can be sent.
            debug!(remote = %addr, device_id = %device_id, "handshake timed out sending challenge");
            return;
        }
        sent = ws.send(Message::Text(challenge)) => {
            if sent.is_err() {
                return;
            }
        }
    }

    let first = tokio::select! {
        _ = &mut deadline => {
            warn!(remote = %addr, device_id = %device_id, "handshake timed out");
            close_socket(&mut ws, CLOSE_AUTH_FAILED, "auth_timeout").await;
            return;
        }
        inbound = recv_text(&mut ws) => match inbound {
            Inbound::Text(text) => text,
            Inbound::TooLarge => {
                close_socket(&mut ws, 1009, "frame too large").await;
                return;
            }
            _ => return,
        }
    };

    match protocol::classify_handshake_frame(&first) {
        Some(HandshakeFrame::AuthResponse(response)) => {
            match handshake::verify_auth_response(&ctx.state, &device_id, &nonce, &response).await {
                Ok(role) => run_session(ws, ctx, device_id, role).await,
                Err(reject) => {
                    warn!(
                        remote = %addr,
                        device_id = %device_id,
                        reason = reject.reason,
                        "authentication failed"
                    );
                    close_socket(&mut ws, reject.code, reject.reason).await;
                }
            }
        }
        Some(HandshakeFrame::PairingRequest(request)) => {
            run_pairing(ws, ctx, device_id, request).await;
        }
        None => {
            warn!(remote = %addr, device_id = %device_id, "malformed handshake frame");
            close_socket(&mut ws, CLOSE_AUTH_FAILED, "auth_failed").await;
        }
    }
}

/// Post-auth lifecycle: register (displacing any incumbent), relay frames
/// until the socket or the gateway goes away, then unregister.
async fn run_session(mut ws: WsStream, ctx: ConnCtx, device_id: String, role: Role) {
    if ws
        .send(Message::Text(AuthOk::new(role, device_id.as_str()).to_json()))
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
    let session = SessionHandle {
        session_id: new_session_id(),
        device_id,
        role,
        tx,
    };
    if let Some(displaced) = ctx.registry.register(session.clone()).await {
        let _ = displaced.send(Outbound::Close(CLOSE_SUPERSEDED, "superseded"));
    }
    info!(device_id = %session.device_id, role = ?session.role, "session authenticated");

    session_loop(&mut ws, &ctx, &session, &mut rx).await;

    ctx.registry.unregister(&session.device_id, &session.session_id).await;
    debug!(device_id = %session.device_id, "connection closed");
}

async fn session_loop(
    ws: &mut WsStream,
    ctx: &ConnCtx,
    session: &SessionHandle,
    rx: &mut mpsc::Receiver<Outbound>,
) {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                close_socket(ws, 1001, "going away").await;
                break;
            }

            out = rx.recv() => {
                match out {
                    Some(Outbound::Frame(text)) => {
                        if ws.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(code, reason)) => {
                        close_socket(ws, code, reason).await;
                        break;
                    }
                    None => break,
                }
            }

            inbound = recv_with_idle(ws, ctx.config.idle_timeout) => {
                match inbound {
                    Inbound::Text(text) => {
                        if protocol::is_auth_response(&text) {
                            // The per-connection nonce is single-use.
                            close_socket(ws, CLOSE_AUTH_FAILED, "duplicate_auth").await;
                            break;
                        }
                        relay::dispatch(&ctx.registry, &ctx.pairing, session, &text).await;
                    }
                    Inbound::TooLarge => {
                        close_socket(ws, 1009, "frame too large").await;
                        break;
                    }
                    Inbound::Idle => {
                        close_socket(ws, 1000, "idle").await;
                        break;
                    }
                    Inbound::Closed => break,
                }
            }
        }
    }
}

/// Pairing conduit for a device that does not yet hold an attestation.
///
/// The socket is parked in the pairing-waiter table, never in the
/// authenticated registry, so it cannot displace or shadow a real session.
/// Only the desktop's verdict can reach it, and the gateway never inspects
/// the pairing payload.
async fn run_pairing(mut ws: WsStream, ctx: ConnCtx, device_id: String, request: Value) {
    let Some(desktop) = ctx.registry.desktop().await else {
        info!(device_id = %device_id, "pairing request with no desktop connected");
        let _ = ws
            .send(Message::Text(protocol::pairing_rejected("desktop_offline")))
            .await;
        close_socket(&mut ws, 1000, "desktop offline").await;
        return;
    };

    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
    let waiter = PairingWaiter {
        session_id: new_session_id(),
        device_id,
        tx,
    };
    if let Some(displaced) = ctx.pairing.register(waiter.clone()).await {
        let _ = displaced.send(Outbound::Close(CLOSE_SUPERSEDED, "superseded"));
    }

    // Forwarded with the sender stamped, like any relay frame.
    let mut request = request;
    if let Some(obj) = request.as_object_mut() {
        obj.insert(
            "sender_device_id".to_string(),
            Value::String(waiter.device_id.clone()),
        );
    }
    if desktop.send(Outbound::Frame(request.to_string())) {
        info!(device_id = %waiter.device_id, "pairing request forwarded to desktop");
    } else {
        warn!(device_id = %waiter.device_id, "could not forward pairing request to desktop");
    }

    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    let deadline = tokio::time::sleep(ctx.config.pairing_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                close_socket(&mut ws, CLOSE_AUTH_FAILED, "pairing_timeout").await;
                break;
            }

            _ = shutdown_rx.recv() => {
                close_socket(&mut ws, 1001, "going away").await;
                break;
            }

            out = rx.recv() => {
                match out {
                    Some(Outbound::Frame(text)) => {
                        if ws.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(code, reason)) => {
                        close_socket(&mut ws, code, reason).await;
                        break;
                    }
                    None => break,
                }
            }

            inbound = recv_text(&mut ws) => {
                match inbound {
                    Inbound::Text(_) => {
                        debug!(device_id = %waiter.device_id, "ignoring frame from unauthenticated pairing socket");
                    }
                    Inbound::TooLarge => {
                        close_socket(&mut ws, 1009, "frame too large").await;
                        break;
                    }
                    _ => break,
                }
            }
        }
    }

    ctx.pairing.unregister(&waiter.device_id, &waiter.session_id).await;
}

/// What the receive path produced.
enum Inbound {
    Text(String),
    TooLarge,
    Idle,
    Closed,
}

/// Receive the next text frame. Pings are answered inline; binary frames are
/// ignored (the wire protocol is text-only) but still count against the size
/// cap.
async fn recv_text(ws: &mut WsStream) -> Inbound {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > MAX_FRAME_BYTES {
                    return Inbound::TooLarge;
                }
                return Inbound::Text(text);
            }
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_FRAME_BYTES {
                    return Inbound::TooLarge;
                }
                debug!("ignoring binary frame");
            }
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(_))) | None => return Inbound::Closed,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket receive failed");
                return Inbound::Closed;
            }
        }
    }
}

async fn recv_with_idle(ws: &mut WsStream, idle: Option<Duration>) -> Inbound {
    match idle {
        Some(limit) => match timeout(limit, recv_text(ws)).await {
            Ok(inbound) => inbound,
            Err(_) => Inbound::Idle,
        },
        None => recv_text(ws).await,
    }
}

async fn close_socket(ws: &mut WsStream, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(error = %e, "error closing socket");
    }
}

fn parse_device_id(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "device_id")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Holds the connection count up for the lifetime of one connection task.
struct ConnGuard(Arc<AtomicUsize>);

impl ConnGuard {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self(count.clone())
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
