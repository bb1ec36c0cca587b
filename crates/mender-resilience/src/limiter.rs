//! Per-service rate limiting over a per-minute and an optional per-day window.
//!
//! Windows roll over lazily: every call that touches a service first checks
//! whether its windows have expired. There is no background timer. Callers
//! parked in the FIFO queue wake themselves at the minute boundary, and that
//! wake-up is the access that rolls the window and drains the queue.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use mender_types::{MenderError, Result};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);
/// Longest single sleep while waiting for the day window to reset.
const MAX_DAY_WAIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What `acquire` does when a window is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStrategy {
    /// Wait in a FIFO queue for the next minute window.
    #[default]
    Queue,
    /// Return `RateLimitExceeded` immediately.
    Fail,
    /// Sleep until the window resets, then try again.
    Delay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    #[serde(default)]
    pub requests_per_day: Option<u32>,
    #[serde(default)]
    pub strategy: LimitStrategy,
}

impl RateLimitConfig {
    pub fn per_minute(requests_per_minute: u32, strategy: LimitStrategy) -> Self {
        Self {
            requests_per_minute,
            requests_per_day: None,
            strategy,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct ServiceLimiter {
    config: RateLimitConfig,
    minute_requests: u32,
    minute_reset: Instant,
    day_requests: u32,
    day_reset: Instant,
    queue: VecDeque<oneshot::Sender<()>>,
}

impl ServiceLimiter {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            minute_requests: 0,
            minute_reset: now + MINUTE,
            day_requests: 0,
            day_reset: now + DAY,
            queue: VecDeque::new(),
        }
    }

    fn roll(&mut self, now: Instant) {
        if now >= self.day_reset {
            self.day_requests = 0;
            self.day_reset = now + DAY;
        }
        if now >= self.minute_reset {
            self.minute_requests = 0;
            self.minute_reset = now + MINUTE;
        }
    }

    fn day_exhausted(&self) -> bool {
        self.config
            .requests_per_day
            .is_some_and(|limit| self.day_requests >= limit)
    }

    fn minute_exhausted(&self) -> bool {
        self.minute_requests >= self.config.requests_per_minute
    }

    fn take(&mut self) {
        self.minute_requests += 1;
        self.day_requests += 1;
    }

    /// Release queued callers in arrival order while capacity remains.
    fn drain_queue(&mut self) {
        while !self.queue.is_empty() && !self.minute_exhausted() && !self.day_exhausted() {
            if let Some(waiter) = self.queue.pop_front() {
                // A dropped receiver gave up waiting and does not use a slot.
                if waiter.send(()).is_ok() {
                    self.take();
                }
            }
        }
    }

    fn touch(&mut self, now: Instant) {
        self.roll(now);
        self.drain_queue();
    }
}

/// Point-in-time view of one service's limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub service: String,
    pub minute_requests: u32,
    pub requests_per_minute: u32,
    pub day_requests: u32,
    pub requests_per_day: Option<u32>,
    pub queued: usize,
    pub minute_resets_in_ms: u64,
    pub strategy: LimitStrategy,
}

enum Admission {
    Granted,
    Sleep(Duration),
    Queued(oneshot::Receiver<()>),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Rate limiters for every configured service. Unconfigured services are unlimited.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<String, ServiceLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ServiceLimiter>> {
        self.limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set or replace the limits for `service`. Current counters are kept.
    ///
    /// Zero-sized windows are rejected: queued and delayed callers would wait forever.
    pub fn configure(&self, service: &str, config: RateLimitConfig) -> Result<()> {
        if config.requests_per_minute == 0 {
            return Err(MenderError::Config(format!(
                "rate limit for {service}: requests_per_minute must be > 0"
            )));
        }
        if config.requests_per_day == Some(0) {
            return Err(MenderError::Config(format!(
                "rate limit for {service}: requests_per_day must be > 0"
            )));
        }
        let now = Instant::now();
        let mut limiters = self.lock();
        match limiters.get_mut(service) {
            Some(limiter) => {
                limiter.config = config;
                limiter.touch(now);
            }
            None => {
                limiters.insert(service.to_string(), ServiceLimiter::new(config, now));
            }
        }
        Ok(())
    }

    /// Wait for permission to call `service`, according to its strategy.
    pub async fn acquire(&self, service: &str) -> Result<()> {
        loop {
            match self.admit(service)? {
                Admission::Granted => return Ok(()),
                Admission::Sleep(wait) => {
                    tracing::debug!(service, wait_ms = %wait.as_millis(), "Rate limited, delaying");
                    tokio::time::sleep(wait).await;
                }
                Admission::Queued(rx) => {
                    tracing::debug!(service, "Rate limited, queued");
                    return self.wait_in_queue(service, rx).await;
                }
            }
        }
    }

    fn admit(&self, service: &str) -> Result<Admission> {
        let now = Instant::now();
        let mut limiters = self.lock();
        let Some(limiter) = limiters.get_mut(service) else {
            return Ok(Admission::Granted);
        };
        limiter.touch(now);

        if limiter.day_exhausted() {
            return match limiter.config.strategy {
                LimitStrategy::Fail => Err(exceeded(service, "day")),
                _ => Ok(Admission::Sleep(
                    limiter
                        .day_reset
                        .saturating_duration_since(now)
                        .min(MAX_DAY_WAIT),
                )),
            };
        }

        if limiter.queue.is_empty() && !limiter.minute_exhausted() {
            limiter.take();
            return Ok(Admission::Granted);
        }

        match limiter.config.strategy {
            LimitStrategy::Fail => Err(exceeded(service, "minute")),
            LimitStrategy::Delay => Ok(Admission::Sleep(
                limiter.minute_reset.saturating_duration_since(now),
            )),
            LimitStrategy::Queue => {
                let (tx, rx) = oneshot::channel();
                limiter.queue.push_back(tx);
                Ok(Admission::Queued(rx))
            }
        }
    }

    async fn wait_in_queue(&self, service: &str, mut rx: oneshot::Receiver<()>) -> Result<()> {
        loop {
            let wake_at = match self.lock().get(service) {
                Some(limiter) => limiter.minute_reset,
                None => return Ok(()),
            };
            tokio::select! {
                granted = &mut rx => {
                    return granted.map_err(|_| {
                        MenderError::Other(format!("rate limiter queue for {service} was dropped"))
                    });
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    if let Some(limiter) = self.lock().get_mut(service) {
                        limiter.touch(Instant::now());
                    }
                }
            }
        }
    }

    /// Acquire a slot for `service`, then run `f`.
    pub async fn with_rate_limit<T, F, Fut>(&self, service: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(service).await?;
        f().await
    }

    pub fn status(&self, service: &str) -> Option<RateLimitStatus> {
        let now = Instant::now();
        let mut limiters = self.lock();
        limiters.get_mut(service).map(|l| {
            l.touch(now);
            snapshot(service, l, now)
        })
    }

    pub fn all_status(&self) -> Vec<RateLimitStatus> {
        let now = Instant::now();
        let mut limiters = self.lock();
        let mut all: Vec<RateLimitStatus> = limiters
            .iter_mut()
            .map(|(name, l)| {
                l.touch(now);
                snapshot(name, l, now)
            })
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    /// Zero the counters for `service` and release any queued callers that now fit.
    pub fn reset_limits(&self, service: &str) {
        let now = Instant::now();
        if let Some(limiter) = self.lock().get_mut(service) {
            limiter.minute_requests = 0;
            limiter.day_requests = 0;
            limiter.minute_reset = now + MINUTE;
            limiter.day_reset = now + DAY;
            limiter.drain_queue();
        }
    }
}

fn exceeded(service: &str, window: &str) -> MenderError {
    MenderError::RateLimitExceeded {
        service: service.to_string(),
        window: window.to_string(),
    }
}

fn snapshot(service: &str, l: &ServiceLimiter, now: Instant) -> RateLimitStatus {
    RateLimitStatus {
        service: service.to_string(),
        minute_requests: l.minute_requests,
        requests_per_minute: l.config.requests_per_minute,
        day_requests: l.day_requests,
        requests_per_day: l.config.requests_per_day,
        queued: l.queue.len(),
        minute_resets_in_ms: l.minute_reset.saturating_duration_since(now).as_millis() as u64,
        strategy: l.config.strategy,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn unconfigured_service_is_unlimited() {
        let limiter = RateLimiterRegistry::new();
        for _ in 0..100 {
            limiter.acquire("anything").await.unwrap();
        }
        assert!(limiter.status("anything").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_strategy_rejects_within_minute_and_recovers_after() {
        let limiter = RateLimiterRegistry::new();
        limiter.configure("search", RateLimitConfig::per_minute(1, LimitStrategy::Fail)).unwrap();

        limiter.acquire("search").await.unwrap();
        match limiter.acquire("search").await {
            Err(MenderError::RateLimitExceeded { service, window }) => {
                assert_eq!(service, "search");
                assert_eq!(window, "minute");
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(60)).await;
        limiter.acquire("search").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delay_strategy_waits_for_next_minute() {
        let limiter = RateLimiterRegistry::new();
        limiter.configure("docs", RateLimitConfig::per_minute(1, LimitStrategy::Delay)).unwrap();
        let start = Instant::now();

        limiter.acquire("docs").await.unwrap();
        limiter.acquire("docs").await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(limiter.status("docs").unwrap().minute_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_strategy_drains_in_arrival_order() {
        let limiter = Arc::new(RateLimiterRegistry::new());
        limiter.configure("chat", RateLimitConfig::per_minute(1, LimitStrategy::Queue)).unwrap();
        limiter.acquire("chat").await.unwrap();

        let start = Instant::now();
        let granted = Arc::new(Mutex::new(Vec::new()));
        let waiter = |label: &'static str| {
            let limiter = limiter.clone();
            let granted = granted.clone();
            async move {
                limiter.acquire("chat").await.unwrap();
                granted.lock().unwrap().push((label, start.elapsed()));
            }
        };

        // join! polls in order on the first pass, so a, b, c enqueue in that order.
        tokio::join!(waiter("a"), waiter("b"), waiter("c"));

        let mut granted = granted.lock().unwrap().clone();
        granted.sort();
        assert_eq!(
            granted,
            vec![
                ("a", Duration::from_secs(60)),
                ("b", Duration::from_secs(120)),
                ("c", Duration::from_secs(180)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn day_window_fails_before_minute_window() {
        let limiter = RateLimiterRegistry::new();
        limiter.configure(
            "scraper",
            RateLimitConfig {
                requests_per_minute: 10,
                requests_per_day: Some(2),
                strategy: LimitStrategy::Fail,
            },
        )
        .unwrap();
        limiter.acquire("scraper").await.unwrap();
        limiter.acquire("scraper").await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;

        match limiter.acquire("scraper").await {
            Err(MenderError::RateLimitExceeded { window, .. }) => assert_eq!(window, "day"),
            other => panic!("expected day limit, got {other:?}"),
        }
        let status = limiter.status("scraper").unwrap();
        assert_eq!(status.day_requests, 2);
        assert_eq!(status.minute_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_limits_releases_queued_callers() {
        let limiter = Arc::new(RateLimiterRegistry::new());
        limiter.configure("mail", RateLimitConfig::per_minute(1, LimitStrategy::Queue)).unwrap();
        limiter.acquire("mail").await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire("mail").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.status("mail").unwrap().queued, 1);

        limiter.reset_limits("mail");
        waiting.await.unwrap().unwrap();
        assert_eq!(limiter.status("mail").unwrap().minute_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_rate_limit_runs_closure_after_acquire() {
        let limiter = RateLimiterRegistry::new();
        limiter.configure("api", RateLimitConfig::per_minute(1, LimitStrategy::Fail)).unwrap();
        let value = limiter.with_rate_limit("api", || async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);

        let blocked: Result<u32> = limiter.with_rate_limit("api", || async { Ok(7) }).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_sized_windows_are_rejected() {
        let limiter = RateLimiterRegistry::new();
        let err = limiter
            .configure("q", RateLimitConfig::per_minute(0, LimitStrategy::Queue))
            .unwrap_err();
        assert!(matches!(err, MenderError::Config(_)));

        let err = limiter
            .configure(
                "d",
                RateLimitConfig {
                    requests_per_minute: 5,
                    requests_per_day: Some(0),
                    strategy: LimitStrategy::Delay,
                },
            )
            .unwrap_err();
        assert!(matches!(err, MenderError::Config(_)));

        // rejected services stay unlimited
        assert!(limiter.status("q").is_none());
        limiter.acquire("q").await.unwrap();
    }
}
