//! Lock-free admission primitives.
//!
//! `QpsRateLimiter` counts requests in fixed one-second windows aligned to wall
//! clock seconds; it is not a rolling window, so up to `2 * max` requests can pass
//! around a second boundary. `ConnectionRateLimiter` is a bounded counter of held
//! connections. Both use plain atomics with compare-and-swap loops.
//!
//! The `-1` "unlimited" sentinel is never handed to a limiter: the tier wrappers
//! below hold `None` for unlimited fields and callers skip the check.
use std::{
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;

use crate::config::{ClientLimitSettings, RateLimitConfig};

const WINDOW_MS: u64 = 1000;

static MONOTONIC_BASE: Lazy<Instant> = Lazy::new(Instant::now);

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn monotonic_ms() -> u64 {
    MONOTONIC_BASE.elapsed().as_millis() as u64
}

/// Fixed one-second window request counter.
///
/// Window and count share one atomic word (`window << 32 | count`), so adopting a
/// new window and counting the first request in it is a single CAS.
#[derive(Debug)]
pub struct QpsRateLimiter {
    max: i64,
    state: AtomicU64,
}

impl QpsRateLimiter {
    /// `max` must not be the unlimited sentinel; `0` rejects every request.
    pub fn new(max: i64) -> Self {
        Self {
            max: max.clamp(0, u32::MAX as i64),
            state: AtomicU64::new(0),
        }
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(wall_clock_ms())
    }

    /// Acquire against an explicit clock reading in milliseconds.
    pub fn try_acquire_at(&self, now_ms: u64) -> bool {
        const COUNT_MASK: u64 = u32::MAX as u64;
        let current = (now_ms / WINDOW_MS) & COUNT_MASK;
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            // A stale clock reading counts against the live window.
            let base = if current > state >> 32 {
                current << 32
            } else {
                state
            };
            if (base & COUNT_MASK) as i64 >= self.max {
                return false;
            }
            let next = base + 1;
            match self.state.compare_exchange_weak(
                state,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }
}

/// Bounded counter of held connections.
#[derive(Debug)]
pub struct ConnectionRateLimiter {
    max: i64,
    current: AtomicI64,
}

impl ConnectionRateLimiter {
    pub fn new(max: i64) -> Self {
        Self {
            max: max.max(0),
            current: AtomicI64::new(0),
        }
    }

    /// A counter that only tracks, never refuses.
    pub fn unbounded() -> Self {
        Self {
            max: i64::MAX,
            current: AtomicI64::new(0),
        }
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn try_acquire(&self) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release one permit. An unmatched release is logged and ignored.
    pub fn release(&self) {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                tracing::warn!(current, "connection release without matching acquire");
                if current < 0 {
                    self.current.store(0, Ordering::Release);
                }
                return;
            }
            match self.current.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn current_connections(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }
}

fn qps_limiter(max: i64) -> Option<QpsRateLimiter> {
    (max >= 0).then(|| QpsRateLimiter::new(max))
}

fn connection_limiter(max: i64) -> Option<ConnectionRateLimiter> {
    (max >= 0).then(|| ConnectionRateLimiter::new(max))
}

/// Server-wide tier. `-1` fields are unlimited, `0` rejects everything.
#[derive(Debug)]
pub struct GlobalRateLimiter {
    config: RateLimitConfig,
    qps: Option<QpsRateLimiter>,
    connections: Option<ConnectionRateLimiter>,
}

impl GlobalRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            qps: qps_limiter(config.max_qps),
            connections: connection_limiter(config.max_connections),
            config,
        }
    }

    /// Server-level settings, including the per-client defaults.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn qps(&self) -> Option<&QpsRateLimiter> {
        self.qps.as_ref()
    }

    pub fn connections(&self) -> Option<&ConnectionRateLimiter> {
        self.connections.as_ref()
    }
}

/// Per-backend tier. Here `0` means "not set" and, like `-1`, skips the check.
#[derive(Debug)]
pub struct BackendRateLimiter {
    config: RateLimitConfig,
    qps: Option<QpsRateLimiter>,
    connections: Option<ConnectionRateLimiter>,
}

impl BackendRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let set = |v: i64| if v == 0 { -1 } else { v };
        Self {
            qps: qps_limiter(set(config.max_qps)),
            connections: connection_limiter(set(config.max_connections)),
            config,
        }
    }

    /// The backend override block; its per-client fields feed client settings.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn qps(&self) -> Option<&QpsRateLimiter> {
        self.qps.as_ref()
    }

    pub fn connections(&self) -> Option<&ConnectionRateLimiter> {
        self.connections.as_ref()
    }
}

/// Per-client tier.
///
/// Connections are always counted, even without a limit, so the manager knows
/// when an entry no longer holds anything and can be dropped.
#[derive(Debug)]
pub struct ClientRateLimiter {
    settings: ClientLimitSettings,
    qps: Option<QpsRateLimiter>,
    connections: ConnectionRateLimiter,
    last_seen_ms: AtomicU64,
}

impl ClientRateLimiter {
    pub fn new(settings: ClientLimitSettings) -> Self {
        Self {
            qps: qps_limiter(settings.max_qps),
            connections: connection_limiter(settings.max_connections)
                .unwrap_or_else(ConnectionRateLimiter::unbounded),
            settings,
            last_seen_ms: AtomicU64::new(monotonic_ms()),
        }
    }

    pub fn settings(&self) -> ClientLimitSettings {
        self.settings
    }

    pub fn qps(&self) -> Option<&QpsRateLimiter> {
        self.qps.as_ref()
    }

    pub fn connections(&self) -> &ConnectionRateLimiter {
        &self.connections
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(monotonic_ms(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(monotonic_ms().saturating_sub(last))
    }

    /// No held connections.
    pub fn is_vacant(&self) -> bool {
        self.connections.current_connections() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_qps_caps_each_window() {
        let limiter = QpsRateLimiter::new(3);
        let base = 10_000;
        let passed = (0..10)
            .filter(|i| limiter.try_acquire_at(base + i * 50))
            .count();
        assert_eq!(passed, 3);
    }

    #[test]
    fn test_qps_resets_on_second_boundary() {
        let limiter = QpsRateLimiter::new(2);
        // Burst at the end of one second and the start of the next: 2 * max pass.
        assert!(limiter.try_acquire_at(5_998));
        assert!(limiter.try_acquire_at(5_999));
        assert!(!limiter.try_acquire_at(5_999));
        assert!(limiter.try_acquire_at(6_000));
        assert!(limiter.try_acquire_at(6_001));
        assert!(!limiter.try_acquire_at(6_002));
    }

    #[test]
    fn test_qps_zero_rejects_all() {
        let limiter = QpsRateLimiter::new(0);
        assert!(!limiter.try_acquire());
        assert!(!limiter.try_acquire_at(123_456));
    }

    #[test]
    fn test_qps_stale_clock_reading_counts_in_live_window() {
        let limiter = QpsRateLimiter::new(1);
        assert!(limiter.try_acquire_at(7_100));
        assert!(!limiter.try_acquire_at(6_900));
    }

    #[test]
    fn test_qps_concurrent_window_never_exceeds_max() {
        let limiter = Arc::new(QpsRateLimiter::new(50));
        let now = 42_000;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..100).filter(|_| limiter.try_acquire_at(now)).count()
                })
            })
            .collect();
        let passed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(passed, 50);
    }

    #[test]
    fn test_connection_limiter_bounds_and_release() {
        let limiter = ConnectionRateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.current_connections(), 2);

        limiter.release();
        limiter.release();
        assert_eq!(limiter.current_connections(), 0);

        // Extra release is absorbed.
        limiter.release();
        assert_eq!(limiter.current_connections(), 0);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_connection_limiter_concurrent_bound() {
        let limiter = Arc::new(ConnectionRateLimiter::new(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.try_acquire()).count())
            })
            .collect();
        let acquired: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(acquired, 10);
        assert_eq!(limiter.current_connections(), 10);
    }

    #[test]
    fn test_backend_zero_means_unset() {
        let limiter = BackendRateLimiter::new(RateLimitConfig {
            max_qps: 0,
            max_connections: 5,
            ..RateLimitConfig::default()
        });
        assert!(limiter.qps().is_none());
        assert_eq!(limiter.connections().unwrap().max(), 5);
    }

    #[test]
    fn test_global_sentinels() {
        let limiter = GlobalRateLimiter::new(RateLimitConfig {
            max_qps: -1,
            max_connections: 0,
            ..RateLimitConfig::unlimited()
        });
        assert!(limiter.qps().is_none());
        assert!(!limiter.connections().unwrap().try_acquire());
    }

    #[test]
    fn test_client_tracks_connections_when_unlimited() {
        let client = ClientRateLimiter::new(ClientLimitSettings {
            max_qps: -1,
            max_connections: -1,
        });
        assert!(client.qps().is_none());
        assert!(client.connections().try_acquire());
        assert!(!client.is_vacant());
        client.connections().release();
        assert!(client.is_vacant());
    }
}
