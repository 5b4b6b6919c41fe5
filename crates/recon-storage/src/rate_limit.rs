//! Sliding-window request throttles, one per provider.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use recon_core::Provider;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Published per-provider ceilings, used when `providers.yaml` sets none.
pub mod defaults {
    use std::time::Duration;

    /// HubSpot private apps: 100 requests / 10 s.
    pub const HUBSPOT: (u32, Duration) = (100, Duration::from_secs(10));
    /// monday.com complexity budget, approximated as requests/minute.
    pub const MONDAY: (u32, Duration) = (60, Duration::from_secs(60));
    /// QuickBooks Online: 500 requests / minute per realm.
    pub const QUICKBOOKS: (u32, Duration) = (500, Duration::from_secs(60));
    /// Google Sheets read quota: 60 / minute / user.
    pub const SHEETS: (u32, Duration) = (60, Duration::from_secs(60));
    /// Slack tier 3 methods.
    pub const SLACK: (u32, Duration) = (50, Duration::from_secs(60));
    pub const CALENDAR: (u32, Duration) = (100, Duration::from_secs(60));
    pub const GMAIL: (u32, Duration) = (250, Duration::from_secs(60));
}

/// At most `max_requests` acquisitions in any window of length `window`.
///
/// Waiters are served in request order: the state lock is a fair tokio mutex
/// and is held while the head of the queue sleeps.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            issued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn acquire(&self) {
        let mut issued = self.issued.lock().await;
        loop {
            let now = Instant::now();
            while issued
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                issued.pop_front();
            }

            if issued.len() < self.max_requests as usize {
                issued.push_back(now);
                return;
            }

            if let Some(oldest) = issued.front().copied() {
                let until = oldest + self.window;
                debug!(wait_ms = until.duration_since(now).as_millis() as u64, "rate limit reached");
                tokio::time::sleep_until(until).await;
            }
        }
    }
}

/// Limiter instances keyed by provider, built once and injected into adapters.
#[derive(Debug, Clone, Default)]
pub struct RateLimiters {
    by_provider: HashMap<Provider, Arc<RateLimiter>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut limiters = Self::new();
        for provider in Provider::ALL {
            let (max, window) = default_limit(provider);
            limiters.insert(provider, RateLimiter::new(max, window));
        }
        limiters
    }

    pub fn insert(&mut self, provider: Provider, limiter: RateLimiter) {
        self.by_provider.insert(provider, Arc::new(limiter));
    }

    /// The configured limiter, or a fresh one at the provider's default ceiling.
    pub fn get(&self, provider: Provider) -> Arc<RateLimiter> {
        self.by_provider.get(&provider).cloned().unwrap_or_else(|| {
            let (max, window) = default_limit(provider);
            Arc::new(RateLimiter::new(max, window))
        })
    }
}

pub fn default_limit(provider: Provider) -> (u32, Duration) {
    match provider {
        Provider::Hubspot => defaults::HUBSPOT,
        Provider::Monday => defaults::MONDAY,
        Provider::Quickbooks => defaults::QUICKBOOKS,
        Provider::Sheets => defaults::SHEETS,
        Provider::Slack => defaults::SLACK,
        Provider::Calendar => defaults::CALENDAR,
        Provider::Gmail => defaults::GMAIL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquisitions_under_limit_do_not_wait() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_acquisition_waits_for_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_ceiling_in_any_window_under_concurrency() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_millis(500)));
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for _ in 0..23 {
            let limiter = Arc::clone(&limiter);
            let stamps = Arc::clone(&stamps);
            tasks.push(tokio::spawn(async move {
                limiter.acquire().await;
                stamps.lock().await.push(Instant::now());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut stamps = stamps.lock().await.clone();
        stamps.sort();
        assert_eq!(stamps.len(), 23);
        for (i, start) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_millis(500))
                .count();
            assert!(in_window <= 5, "window starting at #{i} saw {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn providers_are_throttled_independently() {
        let mut limiters = RateLimiters::new();
        limiters.insert(Provider::Slack, RateLimiter::new(1, Duration::from_secs(60)));
        limiters.insert(Provider::Gmail, RateLimiter::new(1, Duration::from_secs(60)));
        let start = Instant::now();
        limiters.get(Provider::Slack).acquire().await;
        limiters.get(Provider::Gmail).acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn registry_falls_back_to_provider_default() {
        let limiters = RateLimiters::new();
        let hubspot = limiters.get(Provider::Hubspot);
        assert_eq!(hubspot.max_requests(), 100);
        assert_eq!(hubspot.window(), Duration::from_secs(10));
    }
}
