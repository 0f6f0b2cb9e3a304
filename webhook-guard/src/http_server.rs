use crate::alerts::SecurityAlertSink;
use crate::config::{FailurePolicy, GuardConfig};
use crate::error::GuardError;
use crate::payload::ParsedWebhook;
use crate::processor::WebhookProcessor;
use crate::rate_limit::RateLimiter;
use crate::replay::{DeliveryContext, ReplayGuard};
use crate::types::Delivery;
use crate::verification::SignatureVerifier;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const WEBHOOK_PATH: &str = "/webhooks/razorpay";

const MAX_DELIVERIES: usize = 50;

/// Bounded log of recent deliveries and their outcome.
#[derive(Debug, Default)]
pub struct DeliveryLog {
    entries: Mutex<VecDeque<Delivery>>,
}

impl DeliveryLog {
    pub fn record(&self, delivery: Delivery) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= MAX_DELIVERIES {
            entries.pop_front();
        }
        entries.push_back(delivery);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<Delivery> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }
}

/// Everything the dispatcher needs, built once at startup.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<GuardConfig>,
    pub verifier: SignatureVerifier,
    pub replay: ReplayGuard,
    pub alerts: Arc<SecurityAlertSink>,
    pub limiter: Arc<RateLimiter>,
    pub processor: Arc<dyn WebhookProcessor>,
    pub deliveries: Arc<DeliveryLog>,
}

impl ServerState {
    pub fn new(
        config: GuardConfig,
        replay: ReplayGuard,
        alerts: Arc<SecurityAlertSink>,
        processor: Arc<dyn WebhookProcessor>,
    ) -> Self {
        let verifier =
            SignatureVerifier::new(config.webhook_secret.clone(), config.signature_encoding);
        let limiter = Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute));
        Self {
            config: Arc::new(config),
            verifier,
            replay,
            alerts,
            limiter,
            processor,
            deliveries: Arc::new(DeliveryLog::default()),
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(handle_webhook))
        .with_state(state)
}

/// Bind the configured address and serve in the background.
///
/// Returns the bound port and the serving task; aborting the task closes the
/// listener.
pub async fn start(state: ServerState) -> Result<(u16, JoinHandle<()>), String> {
    let addr = state.config.bind_addr;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind HTTP server on {addr}: {e}"))?;

    let port = listener
        .local_addr()
        .map_err(|e| format!("failed to read bound address: {e}"))?
        .port();
    tracing::info!(port, path = WEBHOOK_PATH, "webhook guard HTTP server bound");

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "webhook guard HTTP server error");
        }
    });

    Ok((port, task))
}

/// Periodically drop event records past their retention window.
pub fn spawn_purge_task(replay: ReplayGuard, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = replay.purge_expired() {
                tracing::warn!(error = %e, "failed to purge expired webhook events");
            }
        }
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

/// Address of the sender as seen by the closest trusted hop.
///
/// Forwarding headers are only read when the socket peer is a trusted proxy.
/// `x-forwarded-for` is walked from the right, skipping trusted proxies, and
/// the first other address wins. Entries further left were written by the
/// sender and are never believed.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted: &[IpAddr]) -> String {
    let Some(peer) = peer.map(|p| p.ip()) else {
        return "unknown".to_string();
    };
    if !trusted.contains(&peer) {
        return peer.to_string();
    }

    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        let mut nearest = peer;
        for hop in forwarded.rsplit(',') {
            match parse_ip(hop) {
                Some(ip) if trusted.contains(&ip) => nearest = ip,
                Some(ip) => return ip.to_string(),
                // Garbage in the chain; stop at the last hop we could vouch for.
                None => break,
            }
        }
        return nearest.to_string();
    }
    if let Some(real) = header_str(headers, "x-real-ip").and_then(parse_ip) {
        return real.to_string();
    }
    peer.to_string()
}

fn ip_allowed(allowed: &[IpAddr], ip: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    ip.parse::<IpAddr>().is_ok_and(|ip| allowed.contains(&ip))
}

type WebhookResponse = (StatusCode, Json<Value>);

fn reply(status: StatusCode, message: &str, extra: Value) -> WebhookResponse {
    let mut body = json!({
        "success": status.is_success(),
        "message": message,
    });
    if let (Some(obj), Value::Object(extra)) = (body.as_object_mut(), extra) {
        obj.extend(extra);
    }
    (status, Json(body))
}

fn log_delivery(
    state: &ServerState,
    event_id: Option<&str>,
    ip: &str,
    response: WebhookResponse,
    outcome: &str,
) -> WebhookResponse {
    state.deliveries.record(Delivery {
        id: uuid::Uuid::new_v4().to_string(),
        event_id: event_id.map(str::to_string),
        received_at: Utc::now(),
        ip: ip.to_string(),
        status: response.0.as_u16(),
        outcome: outcome.to_string(),
    });
    response
}

pub async fn handle_webhook(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResponse {
    let started = Instant::now();
    let ip = client_ip(&headers, Some(peer), &state.config.trusted_proxies);

    if let Err(limited) = state.limiter.check_and_record(&ip) {
        state.alerts.rate_limited(&ip, state.limiter.limit());
        let resp = reply(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many webhook requests",
            json!({ "retry_after_secs": limited.retry_after.as_secs() }),
        );
        return log_delivery(&state, None, &ip, resp, "rate_limited");
    }

    if !ip_allowed(&state.config.allowed_ips, &ip) {
        state.alerts.ip_blocked(&ip);
        let resp = reply(StatusCode::FORBIDDEN, "Forbidden", Value::Null);
        return log_delivery(&state, None, &ip, resp, "ip_blocked");
    }

    let Some(signature) = header_str(&headers, &state.config.signature_header) else {
        state.alerts.invalid_payload(None, &ip, "Missing webhook signature");
        let resp = reply(StatusCode::BAD_REQUEST, "Missing webhook signature", Value::Null);
        return log_delivery(&state, None, &ip, resp, "missing_signature");
    };

    // An empty secret would let anyone compute a valid HMAC.
    let secret_configured = state.verifier.has_secret();
    if !secret_configured {
        tracing::warn!("webhook secret is not configured; rejecting delivery");
    }
    if !secret_configured || !state.verifier.verify(&body, signature) {
        state
            .alerts
            .signature_failure(None, &ip, "Signature verification failed");
        let resp = reply(StatusCode::UNAUTHORIZED, "Invalid webhook signature", Value::Null);
        return log_delivery(&state, None, &ip, resp, "signature_failed");
    }

    let webhook = match ParsedWebhook::parse(&body) {
        Ok(w) => w,
        Err(e) => {
            state.alerts.invalid_payload(None, &ip, &e.to_string());
            let resp = reply(
                StatusCode::BAD_REQUEST,
                "Invalid webhook payload",
                json!({ "error": e.to_string() }),
            );
            return log_delivery(&state, None, &ip, resp, "invalid_payload");
        }
    };
    let event_id = webhook.id.as_str();
    let event_type = webhook.event_type();
    tracing::info!(
        event_id,
        %event_type,
        ip = %ip,
        payment_id = webhook.event.payment().map(|p| p.id.as_str()),
        "webhook signature verified"
    );

    let existing = match state.replay.lookup(event_id) {
        Ok(existing) => existing,
        Err(e) => return storage_unavailable(&state, event_id, &ip, &e),
    };
    // A failed record or a stale claim means the vendor is retrying an event
    // we already accepted once.
    let is_retry = match &existing {
        Some(record) if state.replay.blocks_redelivery(record) => {
            return duplicate(&state, event_id, &ip);
        }
        Some(_) => true,
        None => false,
    };

    // Vendor retries may arrive well after the freshness window.
    if !is_retry {
        let age = Utc::now().timestamp().saturating_sub(webhook.created_at);
        let max_age = state.config.max_event_age_secs;
        if age > max_age || age < -max_age {
            state
                .alerts
                .replay_attack(event_id, &ip, &format!("Webhook timestamp outside window: {age}s"));
            let resp = reply(
                StatusCode::BAD_REQUEST,
                "Webhook expired or too old",
                json!({ "event_id": event_id }),
            );
            return log_delivery(&state, Some(event_id), &ip, resp, "stale");
        }
    }

    let ctx = DeliveryContext {
        subscription_id: webhook.event.subscription_id().map(str::to_string),
        signature: signature.to_string(),
        ip: Some(ip.clone()),
        user_agent: header_str(&headers, "user-agent").map(str::to_string),
    };
    let record = match state.replay.record_event(event_id, event_type, ctx) {
        Ok(record) => record,
        Err(e) if e.is_duplicate() => return duplicate(&state, event_id, &ip),
        Err(e) => return storage_unavailable(&state, event_id, &ip, &e),
    };

    let processing_started = Instant::now();
    match state.processor.process(&webhook, &record) {
        Ok(()) => {
            if let Err(e) = state.replay.mark_succeeded(event_id) {
                // The row stays pending until its claim lease runs out.
                tracing::error!(event_id, error = %e, "failed to mark webhook event succeeded");
                state
                    .alerts
                    .storage_unavailable(Some(event_id), &format!("Failed to mark success: {e}"));
            }
            let processing_time_ms = processing_started.elapsed().as_millis() as u64;
            tracing::info!(
                event_id,
                %event_type,
                processing_time_ms,
                total_time_ms = started.elapsed().as_millis() as u64,
                "webhook processed"
            );
            let resp = reply(
                StatusCode::OK,
                "Webhook processed successfully",
                json!({ "event_id": event_id, "processing_time_ms": processing_time_ms }),
            );
            log_delivery(&state, Some(event_id), &ip, resp, "processed")
        }
        Err(message) => {
            tracing::error!(event_id, %event_type, error = %message, "webhook processing failed");
            state.alerts.processing_failure(event_id, &ip, &message);
            if let Err(e) = state.replay.mark_failed(event_id, &message) {
                tracing::error!(event_id, error = %e, "failed to record webhook failure");
                state
                    .alerts
                    .unexpected_error(Some(event_id), &format!("Failed to mark failure: {e}"));
            }
            let resp = match state.config.failure_policy {
                FailurePolicy::Retry => reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process webhook",
                    json!({ "event_id": event_id, "error": message }),
                ),
                FailurePolicy::Acknowledge => reply(
                    StatusCode::OK,
                    "Webhook accepted; processing failed",
                    json!({ "event_id": event_id }),
                ),
            };
            log_delivery(&state, Some(event_id), &ip, resp, "processing_failed")
        }
    }
}

fn duplicate(state: &ServerState, event_id: &str, ip: &str) -> WebhookResponse {
    state.alerts.duplicate_event(event_id, ip);
    let resp = reply(
        StatusCode::OK,
        "Webhook already processed",
        json!({ "event_id": event_id }),
    );
    log_delivery(state, Some(event_id), ip, resp, "duplicate")
}

/// Never fail open: without the dedup store the delivery is deferred.
fn storage_unavailable(
    state: &ServerState,
    event_id: &str,
    ip: &str,
    err: &GuardError,
) -> WebhookResponse {
    tracing::error!(event_id, error = %err, "event store unavailable; deferring webhook");
    state
        .alerts
        .storage_unavailable(Some(event_id), &err.to_string());
    let resp = reply(
        StatusCode::SERVICE_UNAVAILABLE,
        "Webhook deferred; try again later",
        json!({ "event_id": event_id }),
    );
    log_delivery(state, Some(event_id), ip, resp, "storage_unavailable")
}
