use crate::alerts::DEFAULT_ALERT_CAPACITY;
use crate::error::{GuardError, Result};
use crate::rate_limit::DEFAULT_LIMIT_PER_MINUTE;
use crate::replay::{DEFAULT_CLAIM_LEASE_SECS, DEFAULT_RETENTION_DAYS};
use crate::verification::SignatureEncoding;
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

pub const MAX_RETENTION_DAYS: i64 = 3650;
const MAX_PURGE_INTERVAL_SECS: u64 = 7 * 86_400;
const SECS_PER_DAY: i64 = 86_400;

/// What to tell the vendor when business processing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Respond 500 so the vendor redelivers.
    #[default]
    Retry,
    /// Respond 200 and keep the failure in the event record only.
    Acknowledge,
}

impl FailurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "retry" => Some(Self::Retry),
            "acknowledge" | "ack" => Some(Self::Acknowledge),
            _ => None,
        }
    }
}

/// Where processed-event records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// `processed_events.json` under `data_dir`.
    #[default]
    File,
    /// Process memory only; dedup state is lost on restart.
    Memory,
}

impl StoreBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub webhook_secret: String,
    pub signature_header: String,
    pub signature_encoding: SignatureEncoding,
    pub bind_addr: SocketAddr,
    pub max_event_age_secs: i64,
    pub retention_days: i64,
    pub claim_lease_secs: i64,
    pub alert_capacity: usize,
    pub rate_limit_per_minute: u32,
    pub allowed_ips: Vec<IpAddr>,
    /// Peers whose `x-forwarded-for` and `x-real-ip` headers are believed.
    pub trusted_proxies: Vec<IpAddr>,
    pub failure_policy: FailurePolicy,
    pub purge_interval_secs: u64,
    pub store_backend: StoreBackend,
    pub data_dir: PathBuf,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            signature_header: "x-razorpay-signature".to_string(),
            signature_encoding: SignatureEncoding::Hex,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_event_age_secs: 300,
            retention_days: DEFAULT_RETENTION_DAYS,
            claim_lease_secs: DEFAULT_CLAIM_LEASE_SECS,
            alert_capacity: DEFAULT_ALERT_CAPACITY,
            rate_limit_per_minute: DEFAULT_LIMIT_PER_MINUTE,
            allowed_ips: Vec::new(),
            trusted_proxies: Vec::new(),
            failure_policy: FailurePolicy::Retry,
            purge_interval_secs: 3600,
            store_backend: StoreBackend::File,
            data_dir: PathBuf::from("."),
        }
    }
}

fn parse_num<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| GuardError::Config(format!("{key}: expected a number, got {raw:?}")))
}

fn parse_ips(key: &str, raw: &str) -> Result<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| GuardError::Config(format!("{key}: invalid IP address {s:?}")))
        })
        .collect()
}

impl GuardConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("RAZORPAY_WEBHOOK_SECRET") {
            cfg.webhook_secret = v;
        }
        if let Some(v) = lookup("WEBHOOK_SIGNATURE_HEADER") {
            cfg.signature_header = v.to_ascii_lowercase();
        }
        if let Some(v) = lookup("WEBHOOK_SIGNATURE_ENCODING") {
            cfg.signature_encoding = SignatureEncoding::parse(&v).ok_or_else(|| {
                GuardError::Config(format!("WEBHOOK_SIGNATURE_ENCODING: unknown encoding {v:?}"))
            })?;
        }
        if let Some(v) = lookup("WEBHOOK_BIND_ADDR") {
            cfg.bind_addr = v.parse().map_err(|_| {
                GuardError::Config(format!("WEBHOOK_BIND_ADDR: invalid socket address {v:?}"))
            })?;
        }
        if let Some(v) = lookup("WEBHOOK_MAX_AGE_SECS") {
            cfg.max_event_age_secs = parse_num("WEBHOOK_MAX_AGE_SECS", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_RETENTION_DAYS") {
            cfg.retention_days = parse_num("WEBHOOK_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_CLAIM_LEASE_SECS") {
            cfg.claim_lease_secs = parse_num("WEBHOOK_CLAIM_LEASE_SECS", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_ALERT_CAPACITY") {
            cfg.alert_capacity = parse_num("WEBHOOK_ALERT_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_RATE_LIMIT_PER_MINUTE") {
            cfg.rate_limit_per_minute = parse_num("WEBHOOK_RATE_LIMIT_PER_MINUTE", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_ALLOWED_IPS") {
            cfg.allowed_ips = parse_ips("WEBHOOK_ALLOWED_IPS", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_TRUSTED_PROXIES") {
            cfg.trusted_proxies = parse_ips("WEBHOOK_TRUSTED_PROXIES", &v)?;
        }
        if let Some(v) = lookup("WEBHOOK_STORE") {
            cfg.store_backend = StoreBackend::parse(&v).ok_or_else(|| {
                GuardError::Config(format!("WEBHOOK_STORE: unknown store {v:?}"))
            })?;
        }
        if let Some(v) = lookup("WEBHOOK_FAILURE_POLICY") {
            cfg.failure_policy = FailurePolicy::parse(&v).ok_or_else(|| {
                GuardError::Config(format!("WEBHOOK_FAILURE_POLICY: unknown policy {v:?}"))
            })?;
        }
        if let Some(v) = lookup("WEBHOOK_PURGE_INTERVAL_SECS") {
            cfg.purge_interval_secs = parse_num("WEBHOOK_PURGE_INTERVAL_SECS", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay `initialize` params sent by the host.
    pub fn apply_params(&mut self, params: &Value) -> Result<()> {
        if let Some(dir) = params.get("data_dir").and_then(|v| v.as_str()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(secret) = params.get("webhook_secret").and_then(|v| v.as_str()) {
            self.webhook_secret = secret.to_string();
        }
        if let Some(policy) = params.get("failure_policy").and_then(|v| v.as_str()) {
            self.failure_policy = FailurePolicy::parse(policy).ok_or_else(|| {
                GuardError::Config(format!("failure_policy: unknown policy {policy:?}"))
            })?;
        }
        if let Some(store) = params.get("store").and_then(|v| v.as_str()) {
            self.store_backend = StoreBackend::parse(store)
                .ok_or_else(|| GuardError::Config(format!("store: unknown store {store:?}")))?;
        }
        if let Some(secs) = params.get("max_event_age_secs").and_then(|v| v.as_i64()) {
            self.max_event_age_secs = secs;
        }
        if let Some(ips) = params.get("allowed_ips").and_then(|v| v.as_array()) {
            let joined: Vec<&str> = ips.iter().filter_map(|v| v.as_str()).collect();
            self.allowed_ips = parse_ips("allowed_ips", &joined.join(","))?;
        }
        if let Some(ips) = params.get("trusted_proxies").and_then(|v| v.as_array()) {
            let joined: Vec<&str> = ips.iter().filter_map(|v| v.as_str()).collect();
            self.trusted_proxies = parse_ips("trusted_proxies", &joined.join(","))?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.max_event_age_secs <= 0 {
            return Err(GuardError::Config("max event age must be positive".into()));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            return Err(GuardError::Config(format!(
                "retention must be between 1 and {MAX_RETENTION_DAYS} days"
            )));
        }
        let retention_secs = self
            .retention_days
            .checked_mul(SECS_PER_DAY)
            .ok_or_else(|| GuardError::Config("retention window overflows".into()))?;
        // Freshness must be far shorter than retention or replays slip past once
        // the dedup record expires.
        if self.max_event_age_secs >= retention_secs {
            return Err(GuardError::Config(
                "max event age must be shorter than the retention window".into(),
            ));
        }
        if self.claim_lease_secs <= 0 || self.claim_lease_secs >= retention_secs {
            return Err(GuardError::Config(
                "claim lease must be positive and shorter than the retention window".into(),
            ));
        }
        if self.alert_capacity == 0 {
            return Err(GuardError::Config("alert capacity must be positive".into()));
        }
        if self.purge_interval_secs == 0 || self.purge_interval_secs > MAX_PURGE_INTERVAL_SECS {
            return Err(GuardError::Config(format!(
                "purge interval must be between 1 and {MAX_PURGE_INTERVAL_SECS} seconds"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = GuardConfig::from_lookup(|_| None).unwrap();
        assert!(cfg.webhook_secret.is_empty());
        assert_eq!(cfg.signature_header, "x-razorpay-signature");
        assert_eq!(cfg.max_event_age_secs, 300);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.alert_capacity, 1000);
        assert_eq!(cfg.rate_limit_per_minute, 100);
        assert_eq!(cfg.failure_policy, FailurePolicy::Retry);
        assert_eq!(cfg.bind_addr.port(), 0);
        assert_eq!(cfg.claim_lease_secs, 900);
        assert_eq!(cfg.store_backend, StoreBackend::File);
        assert!(cfg.trusted_proxies.is_empty());
    }

    #[test]
    fn reads_env_values() {
        let cfg = GuardConfig::from_lookup(lookup(&[
            ("RAZORPAY_WEBHOOK_SECRET", "whsec_test"),
            ("WEBHOOK_SIGNATURE_HEADER", "X-Signature"),
            ("WEBHOOK_ALLOWED_IPS", "52.66.135.170, 52.66.135.171"),
            ("WEBHOOK_FAILURE_POLICY", "acknowledge"),
            ("WEBHOOK_RATE_LIMIT_PER_MINUTE", "5"),
            ("WEBHOOK_TRUSTED_PROXIES", "10.0.0.2"),
            ("WEBHOOK_CLAIM_LEASE_SECS", "60"),
            ("WEBHOOK_STORE", "memory"),
        ]))
        .unwrap();
        assert_eq!(cfg.webhook_secret, "whsec_test");
        assert_eq!(cfg.signature_header, "x-signature");
        assert_eq!(cfg.allowed_ips.len(), 2);
        assert_eq!(cfg.failure_policy, FailurePolicy::Acknowledge);
        assert_eq!(cfg.rate_limit_per_minute, 5);
        assert_eq!(cfg.trusted_proxies, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
        assert_eq!(cfg.claim_lease_secs, 60);
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
    }

    #[test]
    fn oversized_values_are_rejected_without_overflow() {
        for days in ["100000000", "9223372036854775807", "3651", "0"] {
            assert!(
                GuardConfig::from_lookup(lookup(&[("WEBHOOK_RETENTION_DAYS", days)])).is_err(),
                "retention {days} accepted"
            );
        }
        assert!(GuardConfig::from_lookup(lookup(&[("WEBHOOK_RETENTION_DAYS", "3650")])).is_ok());
        assert!(GuardConfig::from_lookup(lookup(&[(
            "WEBHOOK_PURGE_INTERVAL_SECS",
            "18446744073709551615"
        )]))
        .is_err());
        assert!(GuardConfig::from_lookup(lookup(&[("WEBHOOK_CLAIM_LEASE_SECS", "0")])).is_err());
        assert!(GuardConfig::from_lookup(lookup(&[("WEBHOOK_ALERT_CAPACITY", "0")])).is_err());

        let mut cfg = GuardConfig::default();
        assert!(cfg
            .apply_params(&serde_json::json!({ "max_event_age_secs": i64::MAX }))
            .is_err());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            GuardConfig::from_lookup(lookup(&[("WEBHOOK_MAX_AGE_SECS", "soon")])),
            Err(GuardError::Config(_))
        ));
        assert!(GuardConfig::from_lookup(lookup(&[("WEBHOOK_ALLOWED_IPS", "not-an-ip")])).is_err());
        assert!(GuardConfig::from_lookup(lookup(&[("WEBHOOK_FAILURE_POLICY", "maybe")])).is_err());
        assert!(GuardConfig::from_lookup(lookup(&[
            ("WEBHOOK_RETENTION_DAYS", "1"),
            ("WEBHOOK_MAX_AGE_SECS", "90000"),
        ]))
        .is_err());
    }

    #[test]
    fn params_override_env() {
        let mut cfg = GuardConfig::default();
        cfg.apply_params(&serde_json::json!({
            "data_dir": "/tmp/guard",
            "webhook_secret": "from-host",
            "failure_policy": "ack",
            "allowed_ips": ["10.0.0.1"],
            "trusted_proxies": ["127.0.0.1"],
            "store": "memory",
        }))
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/guard"));
        assert_eq!(cfg.webhook_secret, "from-host");
        assert_eq!(cfg.failure_policy, FailurePolicy::Acknowledge);
        assert_eq!(cfg.allowed_ips, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(cfg.trusted_proxies, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
    }
}
