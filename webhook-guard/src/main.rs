mod alerts;
mod config;
mod error;
mod http_server;
mod payload;
mod processor;
mod rate_limit;
mod replay;
mod store;
mod types;
mod verification;

use alerts::{AlertFilter, AlertType, SecurityAlertSink, Severity};
use config::{GuardConfig, StoreBackend};
use http_server::ServerState;
use processor::{ChannelProcessor, EventQueue};
use replay::ReplayGuard;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use store::{EventStore, FileEventStore, MemoryEventStore};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use types::{EventStatus, PendingEvent};

const DEFAULT_QUERY_LIMIT: usize = 50;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

fn raw_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
        id,
    }
}

fn ok_response(id: Value, data: Value) -> JsonRpcResponse {
    raw_response(
        id,
        serde_json::json!({
            "success": true,
            "data": data,
            "message": null
        }),
    )
}

fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

// ─── Shared app state ────────────────────────────────────────────────────────

#[derive(Default)]
struct AppState {
    server: Option<ServerState>,
    port: Option<u16>,
    base_url: String,
    /// Verified events from the HTTP server, not yet published to host.
    pending_rx: Option<EventQueue>,
    server_task: Option<JoinHandle<()>>,
    purge_task: Option<JoinHandle<()>>,
}

impl AppState {
    fn server(&self) -> Result<&ServerState, String> {
        self.server.as_ref().ok_or_else(|| "server not initialized".to_string())
    }

    fn stop_tasks(&mut self) {
        for task in [self.server_task.take(), self.purge_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

fn init_tracing() {
    // stdout carries JSON-RPC, so logs go to stderr.
    let filter =
        EnvFilter::try_from_env("WEBHOOK_GUARD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let state: Arc<RwLock<AppState>> = Arc::new(RwLock::new(AppState::default()));

    let state_clone = state.clone();
    let handle = tokio::runtime::Handle::current();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    let stdin_loop = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let resp =
                        err_response(Value::Number(0.into()), -32700, format!("Parse error: {e}"));
                    emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";

            let response = handle.block_on(handle_request(&request, &state_clone, &mut out));
            emit_line(&mut out, &response);

            if is_shutdown {
                break;
            }
        }
    });

    if let Err(e) = stdin_loop.await {
        tracing::error!(error = %e, "stdin loop terminated abnormally");
    }
}

fn emit_line(out: &mut impl Write, resp: &JsonRpcResponse) {
    match serde_json::to_string(resp) {
        Ok(line) => {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize JSON-RPC response"),
    }
}

// ─── Request dispatch ─────────────────────────────────────────────────────────

async fn handle_request(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    out: &mut dyn Write,
) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => handle_initialize(req, state).await,
        "shutdown" => handle_shutdown(req, state).await,
        "execute" => handle_execute(req, state, out).await,
        m if m.starts_with("resources.") => handle_resources(req, state, out).await,
        _ => err_response(req.id.clone(), -32601, format!("Unknown method: {}", req.method)),
    }
}

async fn handle_initialize(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
) -> JsonRpcResponse {
    match initialize(&req.params, state).await {
        Ok(port) => raw_response(
            req.id.clone(),
            serde_json::json!({ "ready": true, "port": port }),
        ),
        Err(e) => err_response(req.id.clone(), -32603, e),
    }
}

async fn initialize(params: &Value, state: &Arc<RwLock<AppState>>) -> Result<u16, String> {
    let mut config = GuardConfig::from_env().map_err(|e| e.to_string())?;
    config.apply_params(params).map_err(|e| e.to_string())?;
    if config.webhook_secret.is_empty() {
        tracing::warn!("RAZORPAY_WEBHOOK_SECRET is empty; every delivery will be rejected");
    }

    let store: Arc<dyn EventStore> = match config.store_backend {
        StoreBackend::File => {
            let store = FileEventStore::open(&config.data_dir)
                .map_err(|e| format!("failed to open event store: {e}"))?;
            tracing::info!(path = %store.path().display(), "using file event store");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory event store; dedup state is lost on restart");
            Arc::new(MemoryEventStore::new())
        }
    };
    let replay = ReplayGuard::new(store, chrono::Duration::days(config.retention_days))
        .with_claim_lease(chrono::Duration::seconds(config.claim_lease_secs));
    let alerts = Arc::new(SecurityAlertSink::new(config.alert_capacity));
    let (processor, pending_rx) = ChannelProcessor::channel();
    let purge_every = Duration::from_secs(config.purge_interval_secs);

    let server = ServerState::new(config, replay.clone(), alerts, Arc::new(processor));
    let (port, server_task) = http_server::start(server.clone())
        .await
        .map_err(|e| format!("HTTP server failed: {e}"))?;

    let mut st = state.write().await;
    // A re-initialize replaces the queue, so the old listener must go with it.
    st.stop_tasks();
    st.server_task = Some(server_task);
    st.purge_task = Some(http_server::spawn_purge_task(replay, purge_every));
    st.base_url = format!("http://127.0.0.1:{port}");
    st.port = Some(port);
    st.server = Some(server);
    st.pending_rx = Some(pending_rx);

    tracing::info!(port, "webhook guard initialized");
    Ok(port)
}

async fn handle_shutdown(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
) -> JsonRpcResponse {
    state.write().await.stop_tasks();
    raw_response(req.id.clone(), serde_json::json!({}))
}

// ─── Execute handler ──────────────────────────────────────────────────────────

async fn handle_execute(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    out: &mut dyn Write,
) -> JsonRpcResponse {
    drain_pending_events(state, out).await;

    let operation = req
        .params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = req
        .params
        .get("input")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    let st = state.read().await;
    let result = match operation {
        "get_server_info" => op_get_server_info(&st),
        "list_security_alerts" => op_list_security_alerts(&input, &st),
        "get_security_stats" => op_get_security_stats(&st),
        "clear_security_alerts" => op_clear_security_alerts(&input, &st),
        "get_processed_event" => op_get_processed_event(&input, &st),
        "list_processed_events" => op_list_processed_events(&input, &st),
        "purge_expired_events" => op_purge_expired_events(&st),
        "get_recent_deliveries" => op_get_recent_deliveries(&input, &st),
        _ => Err(format!("Unknown operation: {operation}")),
    };

    match result {
        Ok(data) => ok_response(req.id.clone(), data),
        Err(msg) => err_response(req.id.clone(), -32000, msg),
    }
}

// ─── Resources handler ────────────────────────────────────────────────────────

async fn handle_resources(
    req: &JsonRpcRequest,
    state: &Arc<RwLock<AppState>>,
    out: &mut dyn Write,
) -> JsonRpcResponse {
    drain_pending_events(state, out).await;

    let resource_method = req.method.strip_prefix("resources.").unwrap_or("");
    let resource_type = req
        .params
        .get("resource_type")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    if resource_type != "processed_events" {
        return err_response(
            req.id.clone(),
            -32602,
            format!("Unknown resource type: {resource_type}"),
        );
    }

    let st = state.read().await;
    let result = match resource_method {
        "list" => resource_list(&st),
        "get" => {
            let id = req.params.get("id").and_then(|v| v.as_str()).unwrap_or("");
            resource_get(id, &st)
        }
        _ => Err(format!("Unsupported resource method: {resource_method}")),
    };

    match result {
        Ok(data) => raw_response(req.id.clone(), data),
        Err(msg) => err_response(req.id.clone(), -32000, msg),
    }
}

// ─── Pending event draining ───────────────────────────────────────────────────

/// Drain verified webhooks queued by the HTTP server and publish them as IPC events.
/// Must be called while the host is in its read loop (i.e., during any execute/resources call).
async fn drain_pending_events(state: &Arc<RwLock<AppState>>, out: &mut dyn Write) {
    let (pending, alerts) = {
        let mut st = state.write().await;
        let alerts = st.server.as_ref().map(|s| s.alerts.clone());
        let mut pending: Vec<PendingEvent> = Vec::new();
        if let Some(rx) = &mut st.pending_rx {
            while let Ok(item) = rx.try_recv() {
                pending.push(item);
            }
        }
        (pending, alerts)
    };

    if pending.is_empty() {
        return;
    }

    let mut published = 0;
    for event in &pending {
        match publish_event(out, event) {
            Ok(()) => published += 1,
            Err(e) => {
                // The record already says success, so this event is gone.
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "failed to publish webhook event to host"
                );
                if let Some(alerts) = &alerts {
                    alerts.unexpected_error(
                        Some(&event.event_id),
                        &format!("Host publish failed: {e}"),
                    );
                }
            }
        }
    }
    tracing::debug!(
        published,
        failed = pending.len() - published,
        "drained webhook events to host"
    );
}

fn publish_event(out: &mut dyn Write, event: &PendingEvent) -> Result<(), String> {
    static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(20000);

    let call_id = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let req = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "event.publish",
        "params": {
            "type": event.event_type,
            "subject": event.subject,
            "data": event.data,
        },
        "id": call_id,
    });
    writeln!(out, "{req}")
        .and_then(|()| out.flush())
        .map_err(|e| format!("write failed: {e}"))?;

    // Read back the host's response to keep the protocol in sync
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) => return Err("host closed stdin before acknowledging".into()),
        Err(e) => return Err(format!("read failed: {e}")),
        Ok(_) => {}
    }
    if let Ok(reply) = serde_json::from_str::<Value>(line.trim()) {
        if let Some(err) = reply.get("error") {
            return Err(format!("host rejected event: {err}"));
        }
    }
    Ok(())
}

// ─── Operations ───────────────────────────────────────────────────────────────

fn limit_param(input: &Value) -> usize {
    input
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_QUERY_LIMIT)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn op_get_server_info(st: &AppState) -> Result<Value, String> {
    let port = st.port.ok_or("server not initialized")?;
    let server = st.server()?;
    Ok(serde_json::json!({
        "port": port,
        "base_url": st.base_url,
        "webhook_url": format!("{}{}", st.base_url, http_server::WEBHOOK_PATH),
        "processed_event_count": server.replay.len(),
        "alert_count": server.alerts.len(),
        "alert_capacity": server.alerts.capacity(),
        "retention_days": server.replay.retention().num_days(),
    }))
}

fn op_list_security_alerts(input: &Value, st: &AppState) -> Result<Value, String> {
    let server = st.server()?;
    let mut filter = AlertFilter::default();
    if let Some(t) = input.get("type").and_then(|v| v.as_str()) {
        let alert_type = AlertType::parse(t).ok_or_else(|| format!("unknown alert type: {t}"))?;
        filter.alert_type = Some(alert_type);
    }
    if let Some(s) = input.get("severity").and_then(|v| v.as_str()) {
        let severity = Severity::parse(s).ok_or_else(|| format!("unknown severity: {s}"))?;
        filter.severity = Some(severity);
    }
    let alerts = server.alerts.query(&filter, limit_param(input));
    Ok(serde_json::json!({ "alerts": to_json(&alerts)?, "count": alerts.len() }))
}

fn op_get_security_stats(st: &AppState) -> Result<Value, String> {
    to_json(&st.server()?.alerts.stats())
}

fn op_clear_security_alerts(input: &Value, st: &AppState) -> Result<Value, String> {
    let server = st.server()?;
    let cleared = match input.get("older_than_hours").and_then(|v| v.as_i64()) {
        Some(hours) if hours < 0 => return Err("older_than_hours must not be negative".into()),
        Some(hours) => {
            let max_age = chrono::Duration::try_hours(hours)
                .ok_or_else(|| format!("older_than_hours out of range: {hours}"))?;
            server.alerts.clear_older_than(max_age)
        }
        None => server.alerts.clear(),
    };
    Ok(serde_json::json!({ "cleared": cleared }))
}

fn op_get_processed_event(input: &Value, st: &AppState) -> Result<Value, String> {
    let event_id = input
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("missing required field: event_id")?;
    let server = st.server()?;
    let record = server
        .replay
        .lookup(event_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("processed event not found: {event_id}"))?;
    Ok(serde_json::json!({
        "event": to_json(&record)?,
        // Whether a redelivery right now would be skipped.
        "blocks_redelivery": server.replay.is_processed(event_id).map_err(|e| e.to_string())?,
    }))
}

fn op_list_processed_events(input: &Value, st: &AppState) -> Result<Value, String> {
    let server = st.server()?;
    let status = match input.get("status").and_then(|v| v.as_str()) {
        Some(s) => Some(EventStatus::parse(s).ok_or_else(|| format!("unknown status: {s}"))?),
        None => None,
    };
    let events = server
        .replay
        .list(status, limit_param(input))
        .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "events": to_json(&events)?, "count": events.len() }))
}

fn op_purge_expired_events(st: &AppState) -> Result<Value, String> {
    let purged = st.server()?.replay.purge_expired().map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "purged": purged }))
}

fn op_get_recent_deliveries(input: &Value, st: &AppState) -> Result<Value, String> {
    let deliveries = st.server()?.deliveries.recent(limit_param(input));
    Ok(serde_json::json!({ "deliveries": to_json(&deliveries)? }))
}

// ─── Resource reads ───────────────────────────────────────────────────────────

fn resource_list(st: &AppState) -> Result<Value, String> {
    let items = st
        .server()?
        .replay
        .list(None, usize::MAX)
        .map_err(|e| e.to_string())?;
    let total = items.len();
    Ok(serde_json::json!({ "items": to_json(&items)?, "total": total }))
}

fn resource_get(id: &str, st: &AppState) -> Result<Value, String> {
    match st.server()?.replay.lookup(id).map_err(|e| e.to_string())? {
        Some(event) => to_json(&event),
        None => Err(format!("processed event not found: {id}")),
    }
}
