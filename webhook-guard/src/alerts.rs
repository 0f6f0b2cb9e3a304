//! Bounded, process-local log of webhook security alerts.
//!
//! Each process keeps its own buffer, so counts from [`SecurityAlertSink::stats`]
//! describe this instance only. Nothing survives a restart.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

pub const DEFAULT_ALERT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    SignatureFailure,
    StorageUnavailable,
    UnexpectedError,
    ReplayAttack,
    ProcessingFailure,
    IpNotAllowed,
    DuplicateEvent,
    InvalidPayload,
    RateLimitExceeded,
}

impl AlertType {
    /// Fixed per category; never derived from alert content.
    pub fn severity(self) -> Severity {
        match self {
            Self::SignatureFailure | Self::StorageUnavailable | Self::UnexpectedError => {
                Severity::Critical
            }
            Self::ReplayAttack | Self::ProcessingFailure | Self::IpNotAllowed => Severity::High,
            Self::DuplicateEvent | Self::InvalidPayload | Self::RateLimitExceeded => {
                Severity::Medium
            }
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

/// Caller-supplied part of an alert; the sink adds id, severity and time.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub event_id: Option<String>,
    pub ip: Option<String>,
    pub reason: String,
    pub details: Option<serde_json::Value>,
}

impl NewAlert {
    pub fn new(alert_type: AlertType, reason: impl Into<String>) -> Self {
        Self {
            alert_type,
            event_id: None,
            ip: None,
            reason: reason.into(),
            details: None,
        }
    }

    pub fn event_id(mut self, event_id: Option<&str>) -> Self {
        self.event_id = event_id.map(str::to_string);
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub alert_type: Option<AlertType>,
    pub severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
}

impl AlertFilter {
    fn matches(&self, alert: &SecurityAlert) -> bool {
        self.alert_type.map_or(true, |t| alert.alert_type == t)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.since.map_or(true, |t| alert.timestamp >= t)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertStats {
    pub total: usize,
    pub capacity: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<AlertType, usize>,
    pub last_24h: usize,
}

pub struct SecurityAlertSink {
    alerts: Mutex<VecDeque<SecurityAlert>>,
    capacity: usize,
}

impl SecurityAlertSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_ALERT_CAPACITY))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SecurityAlert>> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn record(&self, alert: NewAlert) -> SecurityAlert {
        let severity = alert.alert_type.severity();
        let stored = SecurityAlert {
            id: Uuid::new_v4(),
            alert_type: alert.alert_type,
            severity,
            event_id: alert.event_id,
            ip: alert.ip,
            reason: alert.reason,
            details: alert.details,
            timestamp: Utc::now(),
        };

        let event_id = stored.event_id.as_deref().unwrap_or("");
        let ip = stored.ip.as_deref().unwrap_or("");
        match severity {
            Severity::Critical | Severity::High => tracing::error!(
                alert_type = ?stored.alert_type,
                severity = severity.as_str(),
                event_id,
                ip,
                reason = %stored.reason,
                "webhook security alert"
            ),
            Severity::Medium | Severity::Low => tracing::warn!(
                alert_type = ?stored.alert_type,
                severity = severity.as_str(),
                event_id,
                ip,
                reason = %stored.reason,
                "webhook security alert"
            ),
        }

        let mut alerts = self.lock();
        alerts.push_back(stored.clone());
        while alerts.len() > self.capacity {
            alerts.pop_front();
        }
        stored
    }

    pub fn signature_failure(&self, event_id: Option<&str>, ip: &str, reason: &str) {
        self.record(
            NewAlert::new(AlertType::SignatureFailure, reason)
                .event_id(event_id)
                .ip(ip),
        );
    }

    pub fn duplicate_event(&self, event_id: &str, ip: &str) {
        self.record(
            NewAlert::new(AlertType::DuplicateEvent, "Duplicate webhook event received")
                .event_id(Some(event_id))
                .ip(ip),
        );
    }

    pub fn replay_attack(&self, event_id: &str, ip: &str, reason: &str) {
        self.record(
            NewAlert::new(AlertType::ReplayAttack, reason)
                .event_id(Some(event_id))
                .ip(ip),
        );
    }

    pub fn invalid_payload(&self, event_id: Option<&str>, ip: &str, reason: &str) {
        self.record(
            NewAlert::new(AlertType::InvalidPayload, reason)
                .event_id(event_id)
                .ip(ip),
        );
    }

    pub fn processing_failure(&self, event_id: &str, ip: &str, reason: &str) {
        self.record(
            NewAlert::new(AlertType::ProcessingFailure, reason)
                .event_id(Some(event_id))
                .ip(ip),
        );
    }

    pub fn rate_limited(&self, ip: &str, limit: u32) {
        self.record(
            NewAlert::new(AlertType::RateLimitExceeded, "Webhook rate limit exceeded")
                .ip(ip)
                .details(serde_json::json!({ "limit_per_minute": limit })),
        );
    }

    pub fn ip_blocked(&self, ip: &str) {
        self.record(
            NewAlert::new(AlertType::IpNotAllowed, "Request from non-allowlisted IP").ip(ip),
        );
    }

    pub fn storage_unavailable(&self, event_id: Option<&str>, reason: &str) {
        self.record(NewAlert::new(AlertType::StorageUnavailable, reason).event_id(event_id));
    }

    /// Failures outside the verification pipeline, such as a lost host publish.
    pub fn unexpected_error(&self, event_id: Option<&str>, reason: &str) {
        self.record(NewAlert::new(AlertType::UnexpectedError, reason).event_id(event_id));
    }

    /// Most recent matches first.
    pub fn query(&self, filter: &AlertFilter, limit: usize) -> Vec<SecurityAlert> {
        self.lock()
            .iter()
            .rev()
            .filter(|a| filter.matches(a))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AlertStats {
        let alerts = self.lock();
        let cutoff = Utc::now() - Duration::hours(24);
        let mut by_severity = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        let mut last_24h = 0;
        for alert in alerts.iter() {
            *by_severity.entry(alert.severity).or_insert(0) += 1;
            *by_type.entry(alert.alert_type).or_insert(0) += 1;
            if alert.timestamp >= cutoff {
                last_24h += 1;
            }
        }
        AlertStats {
            total: alerts.len(),
            capacity: self.capacity,
            by_severity,
            by_type,
            last_24h,
        }
    }

    /// Drop alerts older than `max_age`. Filters on each timestamp rather
    /// than trimming the front, so a clock step backwards cannot strand
    /// stale entries behind a newer one.
    pub fn clear_older_than(&self, max_age: Duration) -> usize {
        // Nothing can be older than a cutoff before the representable range.
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };
        let mut alerts = self.lock();
        let before = alerts.len();
        alerts.retain(|a| a.timestamp >= cutoff);
        before - alerts.len()
    }

    pub fn clear(&self) -> usize {
        let mut alerts = self.lock();
        let n = alerts.len();
        alerts.clear();
        n
    }

    #[cfg(test)]
    fn push_at(&self, alert_type: AlertType, timestamp: DateTime<Utc>) {
        let mut stored = self.record(NewAlert::new(alert_type, "test"));
        stored.timestamp = timestamp;
        let mut alerts = self.lock();
        if let Some(last) = alerts.back_mut() {
            *last = stored;
        }
    }
}

impl Default for SecurityAlertSink {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}

impl std::fmt::Debug for SecurityAlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityAlertSink")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
