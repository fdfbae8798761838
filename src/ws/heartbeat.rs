//! Liveness detection through periodic probes.
//!
//! The [`HeartbeatManager`] sends a probe payload every interval and, when an expected reply is
//! configured, waits a bounded time for it. Each unanswered probe counts as a miss; reaching the
//! configured maximum raises the timeout callback. The manager never closes the connection itself.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt as _;
use futures::future::BoxFuture;

use super::config::HeartbeatConfig;
use super::events::Logger;
use super::stats::HeartbeatStats;
use super::timer::Timer;
use crate::Result;
use crate::types::{Message, Payload};

/// Fixed delay before the next probe after a probe could not be sent.
const SEND_FAILURE_RETRY_DELAY: Duration = Duration::from_secs(1);

type SendFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_healthy: Option<Callback>,
    on_unhealthy: Option<Callback>,
    on_timeout: Option<Callback>,
}

#[derive(Debug, Default)]
struct Runtime {
    active: bool,
    missed: u32,
    waiting_for_pong: bool,
    last_sent: Option<DateTime<Utc>>,
    last_pong: Option<DateTime<Utc>>,
    probe: Timer,
    pong_timeout: Timer,
}

struct Inner {
    config: HeartbeatConfig,
    send: SendFn,
    logger: Logger,
    callbacks: RwLock<Callbacks>,
    state: Mutex<Runtime>,
}

/// Heartbeat (ping/pong) state machine.
///
/// Timers run as tokio tasks, so [`HeartbeatManager::start`] must be called from within a tokio
/// runtime. Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct HeartbeatManager {
    inner: Arc<Inner>,
}

impl HeartbeatManager {
    /// Create a manager that sends probes through `send`.
    pub fn new<F, Fut>(config: HeartbeatConfig, logger: Logger, send: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                config,
                send: Arc::new(move |payload| send(payload).boxed()),
                logger,
                callbacks: RwLock::new(Callbacks::default()),
                state: Mutex::new(Runtime::default()),
            }),
        }
    }

    /// Fired whenever a qualifying reply or other inbound traffic proves the connection alive.
    pub fn on_connection_healthy<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.inner.callbacks_mut().on_healthy = Some(Arc::new(callback));
    }

    /// Fired on every missed probe.
    pub fn on_connection_unhealthy<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.inner.callbacks_mut().on_unhealthy = Some(Arc::new(callback));
    }

    /// Fired once the miss counter reaches the configured maximum.
    pub fn on_heartbeat_timeout<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.inner.callbacks_mut().on_timeout = Some(Arc::new(callback));
    }

    /// Start probing. No-op when disabled by configuration or already active.
    pub fn start(&self) {
        if !self.inner.config.enabled {
            return;
        }

        {
            let mut state = self.inner.lock();
            if state.active {
                return;
            }
            state.active = true;
            state.missed = 0;
            state.waiting_for_pong = false;
            Inner::schedule_probe(&self.inner, &mut state, self.inner.config.interval);
        }

        self.inner.logger.info(format_args!(
            "Heartbeat started (interval: {:?}, timeout: {:?})",
            self.inner.config.interval, self.inner.config.timeout
        ));
    }

    /// Stop probing and cancel all timers. The miss counter is kept for inspection.
    pub fn stop(&self) {
        {
            let mut state = self.inner.lock();
            if !state.active {
                return;
            }
            state.active = false;
            state.waiting_for_pong = false;
            state.probe.cancel();
            state.pong_timeout.cancel();
        }

        self.inner.logger.info("Heartbeat stopped");
    }

    /// Handle a reply to a probe.
    pub fn handle_pong(&self, payload: &Payload) {
        self.inner.handle_pong(payload);
    }

    /// Inspect an inbound message for a probe reply and as evidence of liveness.
    pub fn handle_incoming_message(&self, message: &Message) {
        let waiting = {
            let state = self.inner.lock();
            if !state.active {
                return;
            }
            state.waiting_for_pong
        };

        if waiting && self.inner.is_pong(&message.payload) {
            self.inner.handle_pong(&message.payload);
        }

        let recovered = {
            let mut state = self.inner.lock();
            if state.active && state.missed > 0 {
                state.missed = 0;
                true
            } else {
                false
            }
        };

        if recovered {
            self.inner
                .logger
                .debug("Inbound traffic received, resetting missed heartbeats");
            self.inner.fire(|callbacks| callbacks.on_healthy.clone());
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    #[must_use]
    pub fn stats(&self) -> HeartbeatStats {
        let state = self.inner.lock();
        HeartbeatStats {
            is_active: state.active,
            missed_heartbeats: state.missed,
            waiting_for_pong: state.waiting_for_pong,
            last_heartbeat_sent: state.last_sent,
            last_pong_received: state.last_pong,
            heartbeat_interval: self.inner.config.interval.as_secs_f64(),
            max_missed_heartbeats: self.inner.config.max_missed,
        }
    }

    /// Stop and release every timer.
    pub fn dispose(&self) {
        self.stop();
        let mut state = self.inner.lock();
        state.probe.cancel();
        state.pong_timeout.cancel();
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

    /// Invoke the selected callback outside of any lock.
    fn fire<S: FnOnce(&Callbacks) -> Option<Callback>>(&self, select: S) {
        let callback = {
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            select(&*callbacks)
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    fn is_pong(&self, payload: &Payload) -> bool {
        match &self.config.expected_pong {
            Some(expected) => payload.matches_text(expected),
            None => payload.to_string().to_lowercase().contains("pong"),
        }
    }

    fn schedule_probe(this: &Arc<Self>, state: &mut Runtime, delay: Duration) {
        let inner = Arc::clone(this);
        state
            .probe
            .arm(delay, move |generation| inner.send_probe(generation));
    }

    fn schedule_pong_timeout(this: &Arc<Self>, state: &mut Runtime) {
        let inner = Arc::clone(this);
        state
            .pong_timeout
            .arm(this.config.timeout, move |generation| async move {
                inner.pong_timed_out(generation);
            });
    }

    async fn send_probe(self: Arc<Self>, generation: u64) {
        {
            let mut state = self.lock();
            if !state.active || !state.probe.claim(generation) {
                return;
            }
            state.last_sent = Some(Utc::now());
        }

        self.logger
            .debug(format_args!("Sending heartbeat: {}", self.config.message));
        let result = (self.send)(self.config.message.clone()).await;

        let mut state = self.lock();
        // Stopped or restarted while the probe was in flight
        if !state.active || !state.probe.is_current(generation) {
            return;
        }

        match result {
            Ok(()) if self.config.expected_pong.is_some() => {
                state.waiting_for_pong = true;
                Self::schedule_pong_timeout(&self, &mut state);
            }
            Ok(()) => {
                Self::schedule_probe(&self, &mut state, self.config.interval);
            }
            Err(e) => {
                drop(state);
                self.logger
                    .error(format_args!("Failed to send heartbeat: {e}"));
                self.missed(SEND_FAILURE_RETRY_DELAY);
            }
        }
    }

    fn pong_timed_out(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.lock();
            if !state.active || !state.pong_timeout.claim(generation) || !state.waiting_for_pong {
                return;
            }
        }

        self.missed(self.config.interval);
    }

    /// Count a missed probe, rescheduling after `retry_delay` unless the budget is exhausted.
    fn missed(self: &Arc<Self>, retry_delay: Duration) {
        let (missed, exhausted) = {
            let mut state = self.lock();
            state.missed = state.missed.saturating_add(1);
            state.waiting_for_pong = false;
            let exhausted = state.missed >= self.config.max_missed;
            if !exhausted {
                Self::schedule_probe(self, &mut state, retry_delay);
            }
            (state.missed, exhausted)
        };

        self.logger.warn(format_args!(
            "Heartbeat missed ({missed}/{})",
            self.config.max_missed
        ));
        self.fire(|callbacks| callbacks.on_unhealthy.clone());

        if exhausted {
            self.logger.error(format_args!(
                "Heartbeat timeout: {missed} consecutive heartbeats missed"
            ));
            self.fire(|callbacks| callbacks.on_timeout.clone());
        }
    }

    fn handle_pong(self: &Arc<Self>, payload: &Payload) {
        let expected = match &self.config.expected_pong {
            None => true,
            Some(expected) => payload.matches_text(expected),
        };

        let healthy = {
            let mut state = self.lock();
            if !state.active {
                return;
            }
            state.last_pong = Some(Utc::now());

            if state.waiting_for_pong && expected {
                state.waiting_for_pong = false;
                state.missed = 0;
                state.pong_timeout.cancel();
                Self::schedule_probe(self, &mut state, self.config.interval);
                true
            } else {
                false
            }
        };

        if healthy {
            self.logger.debug("Pong received");
            self.fire(|callbacks| callbacks.on_healthy.clone());
        } else if !expected {
            self.logger
                .debug(format_args!("Ignoring unexpected pong payload: {payload}"));
        }
    }
}
