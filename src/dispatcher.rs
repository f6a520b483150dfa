//! Request dispatcher (component F): a TCP listener speaking the
//! length-prefixed JSON protocol (component E), one request/reply pair per
//! connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::controller::Controller;
use crate::datagram::{read_datagram, write_datagram};
use crate::model::DisplayContent;

/// Reads `enable`/`stop_indicator` either as a literal bool or the string
/// `"toggle"`, which flips `current`.
fn resolve_toggle(value: &Value, current: bool) -> Option<bool> {
    if let Some(s) = value.as_str() {
        if s == "toggle" {
            return Some(!current);
        }
        return None;
    }
    value.as_bool()
}

async fn handle_enable(controller: &Arc<Mutex<Controller>>, request: &Value) -> Value {
    let address = match request.get("address").and_then(Value::as_i64) {
        Some(a) => a as i32,
        None => return json!({"success": false}),
    };
    let mut guard = controller.lock().await;
    let current = guard.get_enabled(address);
    let value = match resolve_toggle(&request["enable"], current) {
        Some(v) => v,
        None => return json!({"success": false}),
    };
    match guard.set_enabled(address, value).await {
        Ok(success) => json!({"success": success}),
        Err(e) => {
            warn!(error = %e, "set-enabled failed");
            json!({"success": false})
        }
    }
}

async fn handle_stop_indicator(controller: &Arc<Mutex<Controller>>, request: &Value) -> Value {
    let address = match request.get("address").and_then(Value::as_i64) {
        Some(a) => a as i32,
        None => return json!({"success": false}),
    };
    let mut guard = controller.lock().await;
    let current = guard.get_stop_indicator(address);
    let value = match resolve_toggle(&request["stop_indicator"], current) {
        Some(v) => v,
        None => return json!({"success": false}),
    };
    match guard.set_stop_indicator(address, value).await {
        Ok(success) => json!({"success": success}),
        Err(e) => {
            warn!(error = %e, "set-stop-indicator failed");
            json!({"success": false})
        }
    }
}

async fn handle_query(controller: &Arc<Mutex<Controller>>, request: &Value) -> Option<Value> {
    let query = request.get("query").and_then(Value::as_str)?;
    let guard = controller.lock().await;
    let value = match query {
        "current_text" => json!(guard.current_text_snapshot()),
        "buffer" => json!(guard.buffer_snapshot()),
        "enabled" => json!(guard.enabled_snapshot()),
        "stop_indicators" => json!(guard.stop_indicator_snapshot()),
        "all" => json!({
            "buffer": guard.buffer_snapshot(),
            "current_text": guard.current_text_snapshot(),
            "enabled": guard.enabled_snapshot(),
            "stop_indicators": guard.stop_indicator_snapshot(),
        }),
        _ => return None,
    };
    Some(value)
}

async fn handle_set_message(controller: &Arc<Mutex<Controller>>, request: &Value, peer_ip: &str) -> Value {
    let address = match request.get("address").and_then(Value::as_i64) {
        Some(a) => a as i32,
        None => return json!({"success": false}),
    };
    let content: DisplayContent = match request.get("message").cloned() {
        Some(raw) => match serde_json::from_value(raw) {
            Ok(c) => c,
            Err(_) => return json!({"success": false}),
        },
        None => return json!({"success": false}),
    };
    let priority = request.get("priority").and_then(Value::as_i64).unwrap_or(0) as i32;
    let client = request
        .get("client")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| peer_ip.to_string());

    let mut guard = controller.lock().await;
    match guard.set_message(address, content, priority, Some(client)).await {
        Ok(success) => json!({"success": success}),
        Err(e) => {
            warn!(error = %e, "set-message failed");
            json!({"success": false})
        }
    }
}

/// Handles one connection: reads exactly one datagram, dispatches by key
/// precedence (enable > query > stop_indicator > set-message), writes
/// exactly one reply for mutating commands (queries that don't match a
/// known key are silently dropped), then returns so the caller can close
/// the socket.
pub async fn serve_connection(mut stream: TcpStream, controller: Arc<Mutex<Controller>>, peer_ip: String) {
    let request: Value = match read_datagram(&mut stream).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "invalid datagram, dropping connection");
            return;
        }
    };

    if !request.is_object() {
        warn!("datagram body is not a JSON object, dropping connection");
        return;
    }

    if request.get("enable").is_some() {
        let reply = handle_enable(&controller, &request).await;
        let _ = write_datagram(&mut stream, &reply).await;
    } else if request.get("query").is_some() {
        if let Some(reply) = handle_query(&controller, &request).await {
            let _ = write_datagram(&mut stream, &reply).await;
        }
    } else if request.get("stop_indicator").is_some() {
        let reply = handle_stop_indicator(&controller, &request).await;
        let _ = write_datagram(&mut stream, &reply).await;
    } else {
        let reply = handle_set_message(&controller, &request, &peer_ip).await;
        let _ = write_datagram(&mut stream, &reply).await;
    }
}

/// Accepts one connection at a time (connection concurrency is 1) on
/// `port`, handling each fully before accepting the next, until `shutdown`
/// is set.
pub async fn run_listener(
    port: u16,
    controller: Arc<Mutex<Controller>>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for control connections");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let accept = tokio::select! {
            result = listener.accept() => result,
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
        };

        let (stream, addr) = match accept {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        info!(peer = %addr, "accepted connection");
        serve_connection(stream, controller.clone(), addr.ip().to_string()).await;
    }

    Ok(())
}
