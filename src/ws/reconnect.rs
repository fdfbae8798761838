//! Backoff-scheduled reconnection.
//!
//! The [`ReconnectionManager`] turns "connection lost" signals into spaced, budget-limited calls to
//! an injected reconnect action. A failed attempt immediately schedules the next one, so the manager
//! drives its own retry loop until it succeeds or the attempt budget runs out.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::FutureExt as _;
use futures::future::BoxFuture;

use super::config::ReconnectConfig;
use super::events::Logger;
use super::stats::{NextAttempt, ReconnectionStats};
use super::timer::Timer;
use crate::Result;
use crate::error::Error;

type ReconnectFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
type AttemptCallback = Arc<dyn Fn(u32) + Send + Sync>;
type SuccessCallback = Arc<dyn Fn() + Send + Sync>;
type FailureCallback = Arc<dyn Fn(u32, &Error) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_attempt: Option<AttemptCallback>,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    on_max_attempts: Option<AttemptCallback>,
}

struct Runtime {
    reconnecting: bool,
    attempts: u32,
    current_delay: Duration,
    backoff: ExponentialBackoff,
    timer: Timer,
}

struct Inner {
    config: ReconnectConfig,
    action: ReconnectFn,
    logger: Logger,
    callbacks: RwLock<Callbacks>,
    state: Mutex<Runtime>,
}

/// Reconnection state machine with exponential backoff and jitter.
///
/// Timers run as tokio tasks, so [`ReconnectionManager::start_reconnection`] must be called from
/// within a tokio runtime.
#[derive(Clone)]
pub struct ReconnectionManager {
    inner: Arc<Inner>,
}

/// Exponential backoff that jitters the uncapped nominal delay. `max_backoff` is applied after
/// jitter by `next_delay`, so a nominal delay past the cap yields exactly the cap.
fn nominal_backoff(config: &ReconnectConfig) -> ExponentialBackoff {
    let mut backoff: ExponentialBackoff = config.clone().into();
    backoff.max_interval = Duration::MAX;
    backoff
}

impl ReconnectionManager {
    /// Create a manager that calls `action` for every attempt.
    pub fn new<F, Fut>(config: ReconnectConfig, logger: Logger, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let runtime = Runtime {
            reconnecting: false,
            attempts: 0,
            current_delay: config.initial_backoff,
            backoff: nominal_backoff(&config),
            timer: Timer::default(),
        };

        Self {
            inner: Arc::new(Inner {
                config,
                action: Arc::new(move || action().boxed()),
                logger,
                callbacks: RwLock::new(Callbacks::default()),
                state: Mutex::new(runtime),
            }),
        }
    }

    /// Fired with the attempt number right before the reconnect action runs.
    pub fn on_reconnect_attempt<F: Fn(u32) + Send + Sync + 'static>(&self, callback: F) {
        self.inner.callbacks_mut().on_attempt = Some(Arc::new(callback));
    }

    pub fn on_reconnect_success<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.inner.callbacks_mut().on_success = Some(Arc::new(callback));
    }

    /// Fired with the attempt number and error when the reconnect action fails.
    pub fn on_reconnect_failure<F: Fn(u32, &Error) + Send + Sync + 'static>(&self, callback: F) {
        self.inner.callbacks_mut().on_failure = Some(Arc::new(callback));
    }

    /// Fired with the attempt count when no attempts are left.
    pub fn on_max_attempts_reached<F: Fn(u32) + Send + Sync + 'static>(&self, callback: F) {
        self.inner.callbacks_mut().on_max_attempts = Some(Arc::new(callback));
    }

    /// Schedule the next attempt. No-op when disabled or already in progress.
    pub fn start_reconnection(&self) {
        self.inner.start_reconnection();
    }

    /// Cancel the pending attempt, keeping the attempt counter.
    pub fn stop_reconnection(&self) {
        let was_reconnecting = {
            let mut state = self.inner.lock();
            let was_reconnecting = state.reconnecting;
            state.reconnecting = false;
            state.timer.cancel();
            was_reconnecting
        };

        if was_reconnecting {
            self.inner.logger.info("Reconnection stopped");
        }
    }

    /// Clear the attempt counter and restore the base delay.
    pub fn reset(&self) {
        self.inner.reset();
    }

    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.inner.lock().reconnecting
    }

    #[must_use]
    pub fn stats(&self) -> ReconnectionStats {
        let state = self.inner.lock();
        ReconnectionStats {
            is_reconnecting: state.reconnecting,
            reconnect_attempts: state.attempts,
            max_reconnect_attempts: self.inner.config.max_attempts,
            current_delay: state.current_delay.as_secs_f64(),
            next_attempt_in: match (state.timer.is_armed(), state.reconnecting) {
                (true, _) => NextAttempt::Scheduled,
                // Claimed timer, action still running
                (false, true) => NextAttempt::InProgress,
                (false, false) => NextAttempt::NotScheduled,
            },
        }
    }

    pub fn dispose(&self) {
        self.stop_reconnection();
    }
}

impl Inner {
    // The runtime has no inconsistent intermediate state across a panic, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Runtime> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks_mut(&self) -> std::sync::RwLockWriteGuard<'_, Callbacks> {
        self.callbacks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> std::sync::RwLockReadGuard<'_, Callbacks> {
        self.callbacks.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay before the next attempt: the base delay, or the jittered exponential backoff rounded
    /// to whole milliseconds and capped at the configured maximum.
    fn next_delay(&self, state: &mut Runtime) -> Duration {
        if !self.config.exponential {
            return self.config.initial_backoff;
        }

        let jittered = state
            .backoff
            .next_backoff()
            .unwrap_or(self.config.max_backoff);
        let millis = jittered.as_micros().saturating_add(500) / 1000;
        let rounded = Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX));

        rounded.min(self.config.max_backoff)
    }

    fn start_reconnection(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }

        let mut state = self.lock();
        if state.reconnecting {
            return;
        }

        if state.attempts >= self.config.max_attempts {
            let attempts = state.attempts;
            drop(state);

            self.logger.warn(format_args!(
                "Max reconnection attempts ({}) reached",
                self.config.max_attempts
            ));
            let callback = self.callbacks().on_max_attempts.clone();
            if let Some(callback) = callback {
                callback(attempts);
            }
            return;
        }

        state.reconnecting = true;
        state.attempts = state.attempts.saturating_add(1);
        let delay = self.next_delay(&mut state);
        state.current_delay = delay;

        let inner = Arc::clone(self);
        state
            .timer
            .arm(delay, move |generation| inner.attempt(generation));

        let attempt = state.attempts;
        drop(state);

        self.logger.info(format_args!(
            "Reconnection attempt {attempt}/{} scheduled in {:.1}s",
            self.config.max_attempts,
            delay.as_secs_f64()
        ));
    }

    async fn attempt(self: Arc<Self>, generation: u64) {
        let attempt = {
            let mut state = self.lock();
            if !state.reconnecting || !state.timer.claim(generation) {
                return;
            }
            state.attempts
        };

        self.logger.info(format_args!(
            "Reconnecting (attempt {attempt}/{})",
            self.config.max_attempts
        ));
        let callback = self.callbacks().on_attempt.clone();
        if let Some(callback) = callback {
            callback(attempt);
        }

        match (self.action)().await {
            Ok(()) => {
                self.logger
                    .info(format_args!("Reconnected on attempt {attempt}"));
                let callback = self.callbacks().on_success.clone();
                if let Some(callback) = callback {
                    callback();
                }
                self.reset();
            }
            Err(e) => {
                self.logger
                    .error(format_args!("Reconnection attempt {attempt} failed: {e}"));
                let callback = self.callbacks().on_failure.clone();
                if let Some(callback) = callback {
                    callback(attempt, &e);
                }

                {
                    let mut state = self.lock();
                    // Stopped or reset while the attempt was in flight
                    if !state.reconnecting || !state.timer.is_current(generation) {
                        return;
                    }
                    state.reconnecting = false;
                }

                self.start_reconnection();
            }
        }
    }

    fn reset(&self) {
        {
            let mut state = self.lock();
            state.attempts = 0;
            state.current_delay = self.config.initial_backoff;
            state.reconnecting = false;
            state.timer.cancel();
            state.backoff.reset();
        }

        self.logger.debug("Reconnection state reset");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::sleep;

    use super::*;

    #[derive(Clone, Default)]
    struct Counters {
        calls: Arc<AtomicU32>,
        attempts: Arc<AtomicU32>,
        successes: Arc<AtomicU32>,
        failures: Arc<AtomicU32>,
        exhausted: Arc<AtomicU32>,
    }

    impl Counters {
        fn manager(&self, config: ReconnectConfig, succeed: bool) -> ReconnectionManager {
            let calls = Arc::clone(&self.calls);
            let manager = ReconnectionManager::new(
                config,
                Logger::detached("Reconnection", true),
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if succeed {
                            Ok(())
                        } else {
                            Err(Error::validation("server unavailable"))
                        }
                    }
                },
            );

            let attempts = Arc::clone(&self.attempts);
            manager.on_reconnect_attempt(move |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
            });
            let successes = Arc::clone(&self.successes);
            manager.on_reconnect_success(move || {
                successes.fetch_add(1, Ordering::SeqCst);
            });
            let failures = Arc::clone(&self.failures);
            manager.on_reconnect_failure(move |_, _| {
                failures.fetch_add(1, Ordering::SeqCst);
            });
            let exhausted = Arc::clone(&self.exhausted);
            manager.on_max_attempts_reached(move |_| {
                exhausted.fetch_add(1, Ordering::SeqCst);
            });

            manager
        }
    }

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            ..ReconnectConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_is_noop() {
        let counters = Counters::default();
        let manager = counters.manager(ReconnectConfig::disabled(), true);

        manager.start_reconnection();
        sleep(Duration::from_secs(60)).await;

        assert!(!manager.is_reconnecting());
        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stats().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_action_retries_until_budget_exhausted() {
        let counters = Counters::default();
        let manager = counters.manager(fast_config(), false);

        manager.start_reconnection();
        assert!(manager.is_reconnecting());
        assert_eq!(manager.stats().next_attempt_in, NextAttempt::Scheduled);

        sleep(Duration::from_secs(2)).await;

        assert_eq!(counters.calls.load(Ordering::SeqCst), 3);
        assert_eq!(counters.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(counters.failures.load(Ordering::SeqCst), 3);
        assert_eq!(counters.exhausted.load(Ordering::SeqCst), 1);

        let stats = manager.stats();
        assert!(!stats.is_reconnecting);
        assert_eq!(stats.reconnect_attempts, 3);
        assert_eq!(stats.next_attempt_in, NextAttempt::NotScheduled);

        // A further request only reports exhaustion
        manager.start_reconnection();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(counters.calls.load(Ordering::SeqCst), 3);
        assert_eq!(counters.exhausted.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().next_attempt_in, NextAttempt::NotScheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_state() {
        let counters = Counters::default();
        let manager = counters.manager(fast_config(), true);

        manager.start_reconnection();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(counters.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counters.successes.load(Ordering::SeqCst), 1);
        let stats = manager.stats();
        assert!(!stats.is_reconnecting);
        assert_eq!(stats.reconnect_attempts, 0);
        assert!((stats.current_delay - 0.1).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_delays_stay_in_jitter_band() {
        let counters = Counters::default();
        let manager = counters.manager(
            ReconnectConfig {
                max_attempts: 10,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(20),
                ..ReconnectConfig::default()
            },
            false,
        );

        for attempt in 1..=8_i32 {
            manager.start_reconnection();
            let delay = manager.stats().current_delay;
            let nominal = 2.0_f64.powi(attempt - 1);
            let lower = (nominal * 0.75).min(20.0);
            let upper = (nominal * 1.25).min(20.0);

            assert!(delay >= lower - 0.001, "attempt {attempt}: {delay}");
            assert!(delay <= upper + 0.001, "attempt {attempt}: {delay}");

            manager.stop_reconnection();
        }

        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stats().reconnect_attempts, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_past_cap_is_exactly_cap() {
        for _ in 0..50 {
            let counters = Counters::default();
            let manager = counters.manager(
                ReconnectConfig {
                    max_attempts: 10,
                    initial_backoff: Duration::from_secs(1),
                    max_backoff: Duration::from_secs(2),
                    ..ReconnectConfig::default()
                },
                false,
            );

            // Attempt 6 has a nominal delay of 32s
            for _ in 0..6 {
                manager.start_reconnection();
                manager.stop_reconnection();
            }

            let delay = manager.stats().current_delay;
            assert!((delay - 2.0).abs() < f64::EPSILON, "delay {delay}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn running_attempt_reports_in_progress() {
        let manager = ReconnectionManager::new(
            fast_config(),
            Logger::detached("Reconnection", true),
            || async {
                sleep(Duration::from_secs(1)).await;
                Ok(())
            },
        );

        manager.start_reconnection();
        assert_eq!(manager.stats().next_attempt_in, NextAttempt::Scheduled);

        sleep(Duration::from_millis(200)).await;
        let stats = manager.stats();
        assert!(stats.is_reconnecting);
        assert_eq!(stats.next_attempt_in, NextAttempt::InProgress);
        assert_eq!(stats.next_attempt_in.to_string(), "in progress");

        sleep(Duration::from_secs(1)).await;
        assert!(!manager.is_reconnecting());
        assert_eq!(manager.stats().next_attempt_in, NextAttempt::NotScheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn linear_policy_uses_base_delay() {
        let counters = Counters::default();
        let manager = counters.manager(
            ReconnectConfig {
                exponential: false,
                ..fast_config()
            },
            false,
        );

        for _ in 0..3 {
            manager.start_reconnection();
            assert!((manager.stats().current_delay - 0.1).abs() < f64::EPSILON);
            manager.stop_reconnection();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_attempt() {
        let counters = Counters::default();
        let manager = counters.manager(fast_config(), true);

        manager.start_reconnection();
        manager.stop_reconnection();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
        let stats = manager.stats();
        assert!(!stats.is_reconnecting);
        assert_eq!(stats.reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_is_idempotent() {
        let counters = Counters::default();
        let manager = counters.manager(fast_config(), false);

        manager.start_reconnection();
        manager.reset();
        manager.reset();

        let stats = manager.stats();
        assert!(!stats.is_reconnecting);
        assert_eq!(stats.reconnect_attempts, 0);
        assert!((stats.current_delay - 0.1).abs() < f64::EPSILON);
        assert_eq!(stats.next_attempt_in, NextAttempt::NotScheduled);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
    }
}
