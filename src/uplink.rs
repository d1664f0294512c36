//! Orchestrator side of the inverted-WebSocket bridge: dial into the
//! sandbox's uplink port, then serve MCP request frames as they arrive.
//! Tool handlers run right here on the uplink thread with their own store
//! connection; the coordinator is only consulted via reschedule notices.
//!
//! Exactly one live uplink per sandbox: dialing again (after a drop)
//! replaces the previous connection on the bridge side.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tungstenite::{connect, Message};

use crate::{
    AllowedUrls, Config, Embedder, Event, McpService, Outbound, Store, ToolCtx, UplinkFrame,
    SESSION_HEADER,
};

const RECONNECT_MIN_SECS: u64 = 1;
const RECONNECT_MAX_SECS: u64 = 30;

/// Serve one MCP request frame. Split out of the socket loop so the frame
/// semantics are testable without a connection.
pub(crate) fn serve_frame(
    frame: UplinkFrame,
    service: &mut McpService,
    ctx: &mut ToolCtx,
) -> UplinkFrame {
    let request_id = frame.request_id.clone();
    let session_header = frame
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(SESSION_HEADER))
        .map(|(_, v)| v.clone());

    if frame.http_method.as_deref() == Some("DELETE") {
        service.end_session(session_header.as_deref());
        let mut reply = UplinkFrame::response(request_id, serde_json::Value::Null);
        reply.status = Some(204);
        return reply;
    }

    let Some(payload) = frame.request else {
        return UplinkFrame::error(request_id, "frame carried no request");
    };

    let mcp_reply = service.handle_payload(&payload, ctx);
    let mut reply = UplinkFrame::response(
        request_id,
        mcp_reply.body.unwrap_or(serde_json::Value::Null),
    );
    reply.status = Some(mcp_reply.status);
    let mut headers = HashMap::new();
    if let Some(session_id) = mcp_reply.session_id {
        headers.insert(SESSION_HEADER.to_string(), session_id);
    } else if let Some(session) = session_header {
        // pass the caller's session back so the bridge can echo it
        headers.insert(SESSION_HEADER.to_string(), session);
    }
    reply.headers = headers;
    reply
}

/// Long-lived uplink thread: connect, serve frames, reconnect with backoff
/// when the socket drops. Never returns.
pub(crate) fn run_uplink(
    config: Arc<Config>,
    allowed_urls: AllowedUrls,
    events: mpsc::Sender<Event>,
) {
    let outbound = Outbound::from_config(&config);
    let embedder = Embedder::from_config(&config);
    let mut service = McpService::new();
    let mut reconnect = Duration::from_secs(RECONNECT_MIN_SECS);

    loop {
        let ws_url = config.uplink_ws_url();
        let mut socket = match connect(ws_url.as_str()) {
            Ok((socket, _)) => {
                eprintln!("[uplink] connected to {ws_url}");
                reconnect = Duration::from_secs(RECONNECT_MIN_SECS);
                socket
            }
            Err(err) => {
                eprintln!("[uplink] connect to {ws_url} failed: {err}");
                thread::sleep(reconnect);
                reconnect = (reconnect * 2).min(Duration::from_secs(RECONNECT_MAX_SECS));
                continue;
            }
        };

        // fresh store connection per uplink; tool writes share the SQLite
        // file with the coordinator through WAL
        let mut store = match Store::open(&config.db_path) {
            Ok(store) => store,
            Err(err) => {
                eprintln!("[uplink] store open failed: {err}");
                thread::sleep(Duration::from_secs(5));
                continue;
            }
        };

        loop {
            let message = match socket.read() {
                Ok(message) => message,
                Err(err) => {
                    eprintln!("[uplink] read error: {err}");
                    break;
                }
            };
            match message {
                Message::Text(text) => {
                    let frame = match serde_json::from_str::<UplinkFrame>(&text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            eprintln!("[uplink] frame parse error: {err}");
                            continue;
                        }
                    };
                    let mut ctx = ToolCtx {
                        store: &mut store,
                        config: &config,
                        embedder: embedder.as_ref(),
                        outbound: &outbound,
                        allowed_urls: &allowed_urls,
                        events: Some(&events),
                    };
                    let reply = serve_frame(frame, &mut service, &mut ctx);
                    match serde_json::to_string(&reply) {
                        Ok(text) => {
                            if let Err(err) = socket.send(Message::Text(text.into())) {
                                eprintln!("[uplink] send error: {err}");
                                break;
                            }
                        }
                        Err(err) => eprintln!("[uplink] reply encode error: {err}"),
                    }
                }
                Message::Ping(payload) => {
                    let _ = socket.send(Message::Pong(payload));
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        eprintln!("[uplink] disconnected; retrying in {}s", reconnect.as_secs());
        thread::sleep(reconnect);
        reconnect = (reconnect * 2).min(Duration::from_secs(RECONNECT_MAX_SECS));
    }
}
