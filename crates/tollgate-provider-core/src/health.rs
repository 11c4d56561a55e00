//! Per-provider circuit breaker.
//!
//! State lives in atomics so request tasks can read it without blocking each
//! other. Updates from concurrent requests may interleave; the breaker only
//! promises eventual consistency, except that at most one half-open probe is in
//! flight per provider at any time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock advanced by hand, for tests.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    pub enabled: bool,
    /// Consecutive retryable failures that open the circuit.
    pub failure_threshold: u32,
    /// A failure streak older than this starts over.
    pub window: Duration,
    /// Time an open circuit waits before allowing a probe.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

const NOT_OPEN: u64 = u64::MAX;

#[derive(Debug)]
struct ProviderHealth {
    streak: AtomicU32,
    streak_started_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    probe_in_flight: AtomicBool,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            streak: AtomicU32::new(0),
            streak_started_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(NOT_OPEN),
            probe_in_flight: AtomicBool::new(false),
        }
    }
}

struct Shared {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    epoch: Instant,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.epoch)
            .as_millis() as u64
    }

    fn state(&self, health: &ProviderHealth) -> CircuitState {
        let opened = health.opened_at_ms.load(Ordering::Acquire);
        if opened == NOT_OPEN {
            return CircuitState::Closed;
        }
        let elapsed = self.now_ms().saturating_sub(opened);
        if elapsed < self.config.cooldown.as_millis() as u64 {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }

    fn note_failure(&self, provider: &str, health: &ProviderHealth) {
        let now = self.now_ms();
        let started = health.streak_started_ms.load(Ordering::Acquire);
        let window = self.config.window.as_millis() as u64;
        let streak = if health.streak.load(Ordering::Acquire) == 0
            || now.saturating_sub(started) > window
        {
            health.streak_started_ms.store(now, Ordering::Release);
            health.streak.store(1, Ordering::Release);
            1
        } else {
            health.streak.fetch_add(1, Ordering::AcqRel) + 1
        };

        if streak >= self.config.failure_threshold
            && health
                .opened_at_ms
                .compare_exchange(NOT_OPEN, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            warn!(provider = %provider, failures = streak, "circuit opened");
        }
    }

    fn note_success(&self, provider: &str, health: &ProviderHealth) {
        health.streak.store(0, Ordering::Release);
        if health.opened_at_ms.swap(NOT_OPEN, Ordering::AcqRel) != NOT_OPEN {
            info!(provider = %provider, "circuit closed");
        }
    }
}

/// Shared health state for every configured provider.
pub struct HealthTracker {
    shared: Arc<Shared>,
    providers: HashMap<String, Arc<ProviderHealth>>,
}

impl HealthTracker {
    pub fn new<I, S>(config: CircuitConfig, clock: Arc<dyn Clock>, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let epoch = clock.now();
        Self {
            shared: Arc::new(Shared {
                config,
                clock,
                epoch,
            }),
            providers: providers
                .into_iter()
                .map(|name| (name.into(), Arc::new(ProviderHealth::new())))
                .collect(),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.shared.config
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        match self.providers.get(provider) {
            Some(health) if self.shared.config.enabled => self.shared.state(health),
            _ => CircuitState::Closed,
        }
    }

    /// Reserves an attempt. Returns `None` while the circuit is open or another
    /// request already holds the half-open probe.
    pub fn try_begin(&self, provider: &str) -> Option<AttemptPermit> {
        let health = self.providers.get(provider).cloned();
        let probe = match (&health, self.state(provider)) {
            (None, _) | (_, CircuitState::Closed) => false,
            (Some(_), CircuitState::Open) => return None,
            (Some(health), CircuitState::HalfOpen) => {
                health
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .ok()?;
                info!(provider = %provider, "circuit half-open, sending probe");
                true
            }
        };
        Some(AttemptPermit {
            shared: self.shared.clone(),
            health,
            provider: provider.to_string(),
            probe,
            settled: false,
        })
    }

    /// Records a retryable failure observed outside an attempt permit, e.g. a
    /// stream that broke after it was established.
    pub fn record_failure(&self, provider: &str) {
        if let Some(health) = self.providers.get(provider) {
            self.shared.note_failure(provider, health);
        }
    }

    pub fn consecutive_failures(&self, provider: &str) -> u32 {
        self.providers
            .get(provider)
            .map(|health| health.streak.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Outcome slot for one attempt. Exactly one of `success`, `failure` or
/// `release` should be called; dropping it unsettled behaves like `release`.
pub struct AttemptPermit {
    shared: Arc<Shared>,
    health: Option<Arc<ProviderHealth>>,
    provider: String,
    probe: bool,
    settled: bool,
}

impl AttemptPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        if let Some(health) = &self.health {
            self.shared.note_success(&self.provider, health);
            if self.probe {
                health.probe_in_flight.store(false, Ordering::Release);
            }
        }
    }

    /// Retryable failure: counts toward opening, or reopens after a failed probe.
    pub fn failure(mut self) {
        self.settled = true;
        let Some(health) = &self.health else {
            return;
        };
        if !self.shared.config.enabled {
            return;
        }
        if self.probe {
            health
                .opened_at_ms
                .store(self.shared.now_ms(), Ordering::Release);
            health.probe_in_flight.store(false, Ordering::Release);
            warn!(provider = %self.provider, "probe failed, circuit reopened");
        } else {
            self.shared.note_failure(&self.provider, health);
        }
    }

    /// Neutral outcome (caller error, unsupported model): state is unchanged.
    pub fn release(mut self) {
        self.settled = true;
        self.free_probe();
    }

    fn free_probe(&self) {
        if self.probe
            && let Some(health) = &self.health
        {
            health.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

impl Drop for AttemptPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.free_probe();
        }
    }
}
