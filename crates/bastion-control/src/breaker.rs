//! Circuit breakers.
//!
//! # State Transitions
//!
//! ```text
//!            failures >= failure_threshold
//!   ┌────────┐ ───────────────────────────▶ ┌──────┐
//!   │ Closed │                              │ Open │
//!   └────────┘ ◀─────────┐                  └──────┘
//!                        │                     │ now - last_failure >= timeout
//!   successes >= success_threshold             ▼
//!                        │               ┌──────────┐
//!                        └────────────── │ HalfOpen │ ── failure ──▶ Open
//!                                        └──────────┘
//! ```
//!
//! | State | Admit? | On success | On failure |
//! |---|---|---|---|
//! | Closed | yes | reset failures | failures++, open at threshold |
//! | Open | after `timeout` | no-op | refresh `last_failure_time` |
//! | HalfOpen | yes | successes++, close at threshold | reopen |
//!
//! In the Closed state the failure count rolls over once `timeout_window`
//! has elapsed since the last state change. Every transition resets both
//! counters.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Callback invoked after every state transition with `(name, from, to)`.
///
/// It runs synchronously on the request path after the breaker lock has
/// been released, so it must be fast.
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected.
    Open,
    /// Requests are admitted to probe recovery.
    HalfOpen,
}

impl CircuitState {
    /// Returns the snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds and timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures in the Closed state that open the circuit.
    pub failure_threshold: u32,
    /// Successes in the HalfOpen state that close the circuit.
    pub success_threshold: u32,
    /// Time after the last failure before an open circuit admits a probe.
    pub timeout: Duration,
    /// Period after which Closed-state failure counts roll over.
    pub timeout_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            timeout_window: Duration::from_secs(60),
        }
    }
}

/// Rejection returned while the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitOpen {
    /// Breaker name.
    pub name: String,
    /// Time until a probe will be admitted.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

impl BreakerInner {
    /// Starts a fresh Closed-state failure window once `window` has elapsed.
    fn roll_window(&mut self, now: Instant, window: Duration) {
        if self.state == CircuitState::Closed
            && now.saturating_duration_since(self.last_state_change) >= window
        {
            self.failures = 0;
            self.last_state_change = now;
        }
    }

    /// Moves to `to`, returning the transition if the state changed.
    fn set_state(&mut self, to: CircuitState, now: Instant) -> Option<(CircuitState, CircuitState)> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.failures = 0;
        self.successes = 0;
        Some((from, to))
    }
}

/// A circuit breaker guarding one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    on_state_change: Option<StateChangeCallback>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::new_at(name, config, Instant::now())
    }

    /// Creates a closed breaker whose clock starts at `now`.
    #[must_use]
    pub fn new_at(name: impl Into<String>, config: BreakerConfig, now: Instant) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
                last_state_change: now,
            }),
            on_state_change: None,
        }
    }

    /// Registers a transition callback.
    #[must_use]
    pub fn with_state_change(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Returns the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns the Closed-state failure count.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Returns the HalfOpen-state success count.
    #[must_use]
    pub fn successes(&self) -> u32 {
        self.inner.lock().successes
    }

    /// Checks whether a call may proceed now.
    pub fn allow(&self) -> Result<(), CircuitOpen> {
        self.allow_at(Instant::now())
    }

    /// Checks whether a call may proceed at `now`.
    ///
    /// An open circuit whose timeout has elapsed moves to HalfOpen and
    /// admits the call as a probe.
    pub fn allow_at(&self, now: Instant) -> Result<(), CircuitOpen> {
        let (result, transition) = {
            let mut inner = self.inner.lock();
            inner.roll_window(now, self.config.timeout_window);

            match inner.state {
                CircuitState::Closed | CircuitState::HalfOpen => (Ok(()), None),
                CircuitState::Open => {
                    let since_failure = inner
                        .last_failure
                        .map_or(Duration::MAX, |at| now.saturating_duration_since(at));
                    if since_failure >= self.config.timeout {
                        (Ok(()), inner.set_state(CircuitState::HalfOpen, now))
                    } else {
                        let retry_after = self.config.timeout.saturating_sub(since_failure);
                        (
                            Err(CircuitOpen {
                                name: self.name.clone(),
                                retry_after,
                            }),
                            None,
                        )
                    }
                }
            }
        };

        self.notify(transition);
        result
    }

    /// Records a successful call now.
    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    /// Records a successful call at `now`.
    pub fn record_success_at(&self, now: Instant) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.roll_window(now, self.config.timeout_window);
            match inner.state {
                CircuitState::Closed => {
                    inner.failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.config.success_threshold {
                        inner.set_state(CircuitState::Closed, now)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Records a failed call now.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Records a failed call at `now`.
    pub fn record_failure_at(&self, now: Instant) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.roll_window(now, self.config.timeout_window);
            inner.last_failure = Some(now);
            match inner.state {
                CircuitState::Closed => {
                    inner.failures += 1;
                    if inner.failures >= self.config.failure_threshold {
                        inner.set_state(CircuitState::Open, now)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => inner.set_state(CircuitState::Open, now),
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    /// Records the outcome of a call from its HTTP status.
    ///
    /// Statuses below 500 count as success, including 4xx.
    pub fn record_status(&self, status: u16) {
        if status < 500 {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    /// Forces the breaker back to Closed.
    pub fn reset(&self) {
        let transition = self.inner.lock().set_state(CircuitState::Closed, Instant::now());
        self.notify(transition);
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, from = %from, to = %to, "circuit breaker opened");
            }
            _ => {
                tracing::info!(breaker = %self.name, from = %from, to = %to, "circuit breaker state changed");
            }
        }
        metrics::counter!(
            "bastion_circuit_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);

        if let Some(callback) = &self.on_state_change {
            callback(&self.name, from, to);
        }
    }
}

/// The breaker table: one breaker per named dependency.
///
/// Breakers are created on first use with the table's default config, or
/// registered explicitly with [`BreakerRegistry::insert`].
pub struct BreakerRegistry {
    config: BreakerConfig,
    on_state_change: Option<StateChangeCallback>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl BreakerRegistry {
    /// Creates an empty table.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            on_state_change: None,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Sets the callback given to breakers created by this table.
    #[must_use]
    pub fn with_state_change(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Returns the default breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Returns the breaker for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            let breaker = CircuitBreaker::new(name, self.config);
            Arc::new(match &self.on_state_change {
                Some(callback) => breaker.with_state_change(Arc::clone(callback)),
                None => breaker,
            })
        }))
    }

    /// Registers a preconfigured breaker, replacing any with the same name.
    pub fn insert(&self, breaker: CircuitBreaker) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(breaker);
        self.breakers
            .write()
            .insert(breaker.name().to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Returns `(name, state)` for every breaker, ordered by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Number of breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}
