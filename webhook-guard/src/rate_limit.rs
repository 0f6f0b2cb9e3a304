use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_LIMIT_PER_MINUTE: u32 = 100;

/// Sweep idle clients once the map grows past this.
const MAX_TRACKED_CLIENTS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimited {
    pub client: String,
    pub retry_after: Duration,
}

/// Sliding-window limiter keyed by client address.
#[derive(Debug)]
pub struct RateLimiter {
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_per_window: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
            max_per_window,
            window,
        }
    }

    pub fn per_minute(max: u32) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u32 {
        self.max_per_window
    }

    /// A limit of zero disables limiting.
    pub fn check_and_record(&self, client: &str) -> Result<(), RateLimited> {
        if self.max_per_window == 0 {
            return Ok(());
        }
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> Result<(), RateLimited> {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);

        if hits.len() > MAX_TRACKED_CLIENTS {
            let window = self.window;
            hits.retain(|_, q| q.back().is_some_and(|t| now.duration_since(*t) < window));
        }

        let queue = hits.entry(client.to_string()).or_default();
        while queue
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            queue.pop_front();
        }

        if queue.len() >= self.max_per_window as usize {
            let retry_after = queue
                .front()
                .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                .unwrap_or(self.window);
            return Err(RateLimited {
                client: client.to_string(),
                retry_after,
            });
        }

        queue.push_back(now);
        Ok(())
    }
}
