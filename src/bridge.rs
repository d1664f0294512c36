//! In-sandbox bridge process (`outpost bridge`). The reasoning engine can
//! only reach loopback, and the orchestrator can't accept inbound traffic
//! from the sandbox's network, so the bridge inverts the direction: it
//! serves standard MCP over HTTP to the engine, accepts one WebSocket
//! uplink *from* the orchestrator, and shuttles JSON-RPC requests across
//! that uplink as `{requestId, request}` / `{requestId, response}` frames.
//!
//! The bridge holds no MCP state; session headers pass through untouched.

use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tiny_http::{Header, Method, Response, Server};
use tungstenite::Message;

use crate::{error_response, new_id, UplinkFrame, SESSION_HEADER};

const UPLINK_CLOSED: &str = "DO connection closed";
const WS_POLL_MS: u64 = 50;

// ── Pending requests ─────────────────────────────────────────────────────

/// Requests in flight over the uplink, keyed by requestId. Each waiter
/// parks on its own channel until the matching response frame (or a
/// disconnect) arrives.
pub(crate) struct PendingMap {
    inner: Mutex<HashMap<String, mpsc::Sender<UplinkFrame>>>,
}

impl PendingMap {
    pub(crate) fn new() -> PendingMap {
        PendingMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, request_id: &str) -> mpsc::Receiver<UplinkFrame> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(request_id.to_string(), tx);
        }
        rx
    }

    pub(crate) fn forget(&self, request_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(request_id);
        }
    }

    /// Deliver a response frame to its waiter. False when nobody waits
    /// (timed out or never registered).
    pub(crate) fn resolve(&self, frame: UplinkFrame) -> bool {
        let waiter = self
            .inner
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&frame.request_id));
        match waiter {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Reject every in-flight request, e.g. when the uplink drops.
    pub(crate) fn fail_all(&self, reason: &str) {
        let drained: Vec<(String, mpsc::Sender<UplinkFrame>)> = match self.inner.lock() {
            Ok(mut map) => map.drain().collect(),
            Err(_) => return,
        };
        for (request_id, tx) in drained {
            let _ = tx.send(UplinkFrame::error(request_id, reason));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }
}

// ── Shared bridge state ──────────────────────────────────────────────────

struct BridgeState {
    pending: PendingMap,
    /// Writer queue of the current uplink pump, if any.
    out_tx: Mutex<Option<mpsc::Sender<UplinkFrame>>>,
    connected: AtomicBool,
    /// Bumps on every accepted uplink so a dying pump can tell whether it
    /// was replaced before tearing state down.
    generation: AtomicU64,
}

impl BridgeState {
    fn send_frame(&self, frame: UplinkFrame) -> Result<(), String> {
        let guard = self.out_tx.lock().map_err(|_| "uplink lock poisoned")?;
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| "uplink writer gone".to_string()),
            None => Err("uplink not connected".to_string()),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

// ── HTTP response shaping ────────────────────────────────────────────────

/// Map a resolved uplink frame to (status, body, session header value).
/// Error frames become JSON-RPC -32000 bodies echoing the request id.
pub(crate) fn response_parts(
    frame: &UplinkFrame,
    request_id_echo: serde_json::Value,
) -> (u16, Option<String>, Option<String>) {
    if let Some(error) = &frame.error {
        let body = error_response(request_id_echo, -32000, error);
        return (200, Some(body.to_string()), None);
    }
    let session = frame.headers.get(SESSION_HEADER).cloned().or_else(|| {
        frame
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(SESSION_HEADER))
            .map(|(_, v)| v.clone())
    });
    let status = frame.status.unwrap_or(200);
    if status == 202 || status == 204 {
        return (status, None, session);
    }
    let body = frame.response.as_ref().map(|v| v.to_string());
    (status, body, session)
}

/// The JSON-RPC id to echo in transport-level error bodies: the request's
/// own id for single requests, null for batches and unparseable bodies.
pub(crate) fn echo_id(request: &serde_json::Value) -> serde_json::Value {
    match request.as_object() {
        Some(obj) => obj.get("id").cloned().unwrap_or(serde_json::Value::Null),
        None => serde_json::Value::Null,
    }
}

fn json_response(status: u16, body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body).with_status_code(status);
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response.add_header(header);
    }
    response
}

// ── WS uplink acceptor ───────────────────────────────────────────────────

fn run_uplink_acceptor(state: Arc<BridgeState>, ws_port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", ws_port)) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("[bridge] cannot bind ws port {ws_port}: {err}");
            return;
        }
    };
    eprintln!("[bridge] uplink listener on :{ws_port}");

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                eprintln!("[bridge] uplink accept error: {err}");
                continue;
            }
        };
        let state = state.clone();
        thread::spawn(move || run_uplink_pump(state, stream));
    }
}

/// One uplink connection: forwards queued request frames to the
/// orchestrator and resolves the response frames coming back. A newer
/// connection replaces this one; the firewall allows only the single
/// orchestrator-initiated socket anyway.
fn run_uplink_pump(state: Arc<BridgeState>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    let mut socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(err) => {
            eprintln!("[bridge] ws handshake with {peer} failed: {err}");
            return;
        }
    };
    // short read timeout only after the handshake; the pump interleaves
    // outbound frames with reads on one socket
    if socket
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(WS_POLL_MS)))
        .is_err()
    {
        return;
    }

    let my_generation = state.generation.fetch_add(1, Ordering::AcqRel) + 1;
    let (out_tx, out_rx) = mpsc::channel::<UplinkFrame>();
    if let Ok(mut guard) = state.out_tx.lock() {
        *guard = Some(out_tx);
    }
    state.connected.store(true, Ordering::Release);
    eprintln!("[bridge] uplink connected from {peer}");

    loop {
        // flush outbound request frames first
        while let Ok(frame) = out_rx.try_recv() {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("[bridge] frame encode error: {err}");
                    continue;
                }
            };
            if let Err(err) = socket.send(Message::Text(text.into())) {
                eprintln!("[bridge] uplink send error: {err}");
                break;
            }
        }

        match socket.read() {
            Ok(Message::Text(text)) => match serde_json::from_str::<UplinkFrame>(&text) {
                Ok(frame) => {
                    if !state.pending.resolve(frame) {
                        eprintln!("[bridge] response for unknown request id dropped");
                    }
                }
                Err(err) => eprintln!("[bridge] uplink frame parse error: {err}"),
            },
            Ok(Message::Ping(payload)) => {
                let _ = socket.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => {
                eprintln!("[bridge] uplink read error: {err}");
                break;
            }
        }
    }

    // only the latest pump owns the shared state
    if state.generation.load(Ordering::Acquire) == my_generation {
        state.connected.store(false, Ordering::Release);
        if let Ok(mut guard) = state.out_tx.lock() {
            *guard = None;
        }
        state.pending.fail_all(UPLINK_CLOSED);
        eprintln!("[bridge] uplink from {peer} closed; serving 503 until reconnect");
    }
}

// ── HTTP-MCP surface ─────────────────────────────────────────────────────

pub(crate) fn run_bridge(
    http_port: u16,
    ws_port: u16,
    request_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(BridgeState {
        pending: PendingMap::new(),
        out_tx: Mutex::new(None),
        connected: AtomicBool::new(false),
        generation: AtomicU64::new(0),
    });

    {
        let state = state.clone();
        thread::spawn(move || run_uplink_acceptor(state, ws_port));
    }

    let addr = format!("0.0.0.0:{http_port}");
    let server = Server::http(&addr)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("server: {e}")))?;
    eprintln!("[bridge] MCP surface on http://{addr}");

    for mut request in server.incoming_requests() {
        let url = request.url().to_string();
        let method = request.method().clone();
        let session_header = request
            .headers()
            .iter()
            .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(SESSION_HEADER))
            .map(|h| h.value.as_str().to_string());

        match method {
            Method::Get if url.starts_with("/health") => {
                let body = serde_json::json!({
                    "status": "ok",
                    "doConnected": state.is_connected(),
                })
                .to_string();
                let _ = request.respond(json_response(200, body));
            }
            Method::Get => {
                let _ = request.respond(Response::from_string("method not allowed").with_status_code(405));
            }
            Method::Delete => {
                // best-effort session terminate; 204 regardless
                if state.is_connected() {
                    let request_id = new_id();
                    let mut headers = HashMap::new();
                    if let Some(session) = &session_header {
                        headers.insert(SESSION_HEADER.to_string(), session.clone());
                    }
                    let frame = UplinkFrame::request(
                        request_id.clone(),
                        serde_json::Value::Null,
                        headers,
                        "DELETE",
                    );
                    let rx = state.pending.register(&request_id);
                    if state.send_frame(frame).is_ok() {
                        let _ = rx.recv_timeout(request_timeout);
                    }
                    state.pending.forget(&request_id);
                }
                let _ = request.respond(Response::empty(204));
            }
            Method::Post => {
                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(json_response(
                        400,
                        error_response(serde_json::Value::Null, -32700, "unreadable body")
                            .to_string(),
                    ));
                    continue;
                }
                let payload: serde_json::Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(err) => {
                        let _ = request.respond(json_response(
                            200,
                            error_response(
                                serde_json::Value::Null,
                                -32700,
                                &format!("parse error: {err}"),
                            )
                            .to_string(),
                        ));
                        continue;
                    }
                };

                if !state.is_connected() {
                    let _ = request.respond(json_response(
                        503,
                        serde_json::json!({"error": "uplink not connected"}).to_string(),
                    ));
                    continue;
                }

                let request_id = new_id();
                let mut headers = HashMap::new();
                if let Some(session) = &session_header {
                    headers.insert(SESSION_HEADER.to_string(), session.clone());
                }
                let id_echo = echo_id(&payload);
                let frame = UplinkFrame::request(request_id.clone(), payload, headers, "POST");
                let rx = state.pending.register(&request_id);
                if let Err(err) = state.send_frame(frame) {
                    state.pending.forget(&request_id);
                    let _ = request.respond(json_response(
                        503,
                        serde_json::json!({ "error": err }).to_string(),
                    ));
                    continue;
                }

                match rx.recv_timeout(request_timeout) {
                    Ok(response_frame) => {
                        let (status, body, session) = response_parts(&response_frame, id_echo);
                        let mut response = match body {
                            Some(body) => json_response(status, body),
                            None => json_response(status, String::new()),
                        };
                        if let Some(session) = session {
                            if let Ok(header) = Header::from_bytes(SESSION_HEADER, session) {
                                response.add_header(header);
                            }
                        }
                        let _ = request.respond(response);
                    }
                    Err(_) => {
                        state.pending.forget(&request_id);
                        let _ = request.respond(json_response(
                            200,
                            error_response(id_echo, -32000, "Request timeout").to_string(),
                        ));
                    }
                }
            }
            _ => {
                let _ = request.respond(Response::from_string("method not allowed").with_status_code(405));
            }
        }
    }
    Ok(())
}
