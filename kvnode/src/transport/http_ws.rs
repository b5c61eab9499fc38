//! One listener serving two protocols: the JSON WebSocket protocol used by
//! the browser dashboard, and a small HTTP REST surface for key listing and
//! per-node stats. Which protocol a connection speaks is decided by peeking
//! its request head for an `Upgrade: websocket` header before consuming it.
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::spawn;

use logger::Logger;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tungstenite::protocol::WebSocket;
use tungstenite::Message;

use crate::command_core::CommandCore;
use crate::hub::Hub;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

pub fn serve(listener: TcpListener, core: Arc<CommandCore>, hub: Hub, logger: Logger) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                logger.error(&format!("error accepting connection: {e}"), "http_ws");
                continue;
            }
        };
        let core = core.clone();
        let hub = hub.clone();
        let logger = logger.clone();
        spawn(move || handle_connection(stream, core, hub, logger));
    }
}

fn handle_connection(stream: TcpStream, core: Arc<CommandCore>, hub: Hub, logger: Logger) {
    let mut peek_buf = [0u8; 2048];
    let peeked = match stream.peek(&mut peek_buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let head = String::from_utf8_lossy(&peek_buf[..peeked]);
    let is_upgrade = head
        .lines()
        .any(|line| line.to_ascii_lowercase().starts_with("upgrade:") && line.to_ascii_lowercase().contains("websocket"));

    if is_upgrade {
        handle_websocket(stream, core, hub, logger);
    } else {
        handle_http(stream, core, logger);
    }
}

// ---- WebSocket JSON protocol ----

#[derive(Deserialize)]
struct ClientMessage {
    action: String,
    key: Option<String>,
    value: Option<String>,
}

fn handle_websocket(stream: TcpStream, core: Arc<CommandCore>, hub: Hub, logger: Logger) {
    let mut ws = match tungstenite::server::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            logger.error(&format!("WebSocket handshake failed: {e}"), "http_ws");
            return;
        }
    };

    let subscriber_id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
    let feed = hub.register(subscriber_id);

    send_sync_snapshot(&mut ws, &core);

    loop {
        // Drain any pending broadcast messages without blocking on a read.
        while let Ok(msg) = feed.try_recv() {
            if ws.write_message(Message::Text(msg)).is_err() {
                hub.unregister(subscriber_id);
                return;
            }
        }

        match ws.read_message() {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_client_message(&mut ws, &core, &text) {
                    logger.warn(&format!("WebSocket request failed: {e}"), "http_ws");
                }
            }
            Ok(Message::Close(_)) | Err(tungstenite::Error::ConnectionClosed) => break,
            Ok(_) => continue,
            Err(e) => {
                logger.debug("WebSocket connection ended", "http_ws", e);
                break;
            }
        }
    }
    hub.unregister(subscriber_id);
}

fn send_sync_snapshot(ws: &mut WebSocket<TcpStream>, core: &CommandCore) {
    let data = stringify_snapshot(core);
    let payload = json!({ "action": "sync", "data": data }).to_string();
    let _ = ws.write_message(Message::Text(payload));
}

fn stringify_snapshot(core: &CommandCore) -> std::collections::BTreeMap<String, String> {
    core.store()
        .snapshot()
        .into_iter()
        .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
        .collect()
}

fn handle_client_message(
    ws: &mut WebSocket<TcpStream>,
    core: &CommandCore,
    text: &str,
) -> Result<(), String> {
    let msg: ClientMessage = serde_json::from_str(text).map_err(|e| e.to_string())?;

    let reply = match msg.action.as_str() {
        "set" => {
            let (key, value) = (msg.key.unwrap_or_default(), msg.value.unwrap_or_default());
            match core.set(&key, value.as_bytes().to_vec()) {
                Ok(()) => Some(json!({"action": "set", "key": key, "value": value})),
                Err(_) => None,
            }
        }
        "del" => {
            let key = msg.key.unwrap_or_default();
            match core.del(&key) {
                Ok(_) => Some(json!({"action": "del", "key": key})),
                Err(_) => None,
            }
        }
        "get" => {
            let key = msg.key.unwrap_or_default();
            let value = match core.get(&key) {
                Ok(v) => String::from_utf8_lossy(&v).into_owned(),
                Err(_) => "(nil)".to_string(),
            };
            Some(json!({
                "action": "get_resp",
                "key": key,
                "value": value,
            }))
        }
        "get_all" => Some(json!({"action": "sync", "data": stringify_snapshot(core)})),
        "cluster_info" => {
            let nodes = core.cluster().snapshot();
            Some(json!({
                "action": "cluster_info",
                "nodes": nodes,
                "currentNodeId": core.cluster().self_id().as_str(),
                "totalSlots": crate::slot::SLOT_COUNT,
                "clusterSize": core.cluster().node_count(),
            }))
        }
        other => return Err(format!("unknown action '{other}'")),
    };

    if let Some(reply) = reply {
        let _ = ws.write_message(Message::Text(reply.to_string()));
    }
    Ok(())
}

// ---- HTTP REST ----

#[derive(Serialize)]
struct KeysPage {
    keys: Vec<String>,
    next_cursor: String,
    has_more: bool,
}

fn handle_http(stream: TcpStream, core: Arc<CommandCore>, logger: Logger) {
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    // Drain the rest of the header block; this server has no request body routes.
    loop {
        let mut header_line = String::new();
        match reader.read_line(&mut header_line) {
            Ok(0) => break,
            Ok(_) if header_line.trim().is_empty() => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    let (status, body) = route(&request_line, &core);
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if writer.write_all(response.as_bytes()).is_err() {
        logger.debug("failed writing HTTP response", "http_ws", &request_line);
    }
}

fn route(request_line: &str, core: &CommandCore) -> (&'static str, String) {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    if method != "GET" {
        return ("405 Method Not Allowed", String::new());
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    match path {
        "/api/v1/keys" => {
            let params = parse_query(query);
            let limit = params
                .get("limit")
                .and_then(|v| v.parse::<usize>().ok())
                .map(|n| n.clamp(1, 100))
                .unwrap_or(20);
            let cursor = params.get("cursor").cloned().unwrap_or_default();

            let all_keys = core.store().keys_sorted();
            let start = match &cursor[..] {
                "" => 0,
                cursor => all_keys.iter().position(|k| k.as_str() > cursor).unwrap_or(all_keys.len()),
            };
            let page: Vec<String> = all_keys[start..].iter().take(limit).cloned().collect();
            let has_more = start + page.len() < all_keys.len();
            let next_cursor = page.last().cloned().unwrap_or_default();

            let body = serde_json::to_string(&KeysPage {
                keys: page,
                next_cursor,
                has_more,
            })
            .unwrap_or_else(|_| "{}".to_string());
            ("200 OK", body)
        }
        "/keycount" => ("200 OK", core.cluster().with_self(|n| n.key_count()).to_string()),
        "/bytesize" => ("200 OK", core.cluster().with_self(|n| n.byte_size()).to_string()),
        _ => ("404 Not Found", String::new()),
    }
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
