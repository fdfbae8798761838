//! Fan-out event sinks and the component logger built on top of them.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{SecondsFormat, Utc};
use tokio::sync::broadcast;

/// Broadcast channel capacity for event sinks.
pub const BROADCAST_CAPACITY: usize = 1024;

/// A closable broadcast point.
///
/// Any number of listeners may subscribe and drop their receivers independently. Emitting with no
/// listeners, or after [`EventSink::close`], silently discards the value.
#[derive(Debug)]
pub struct EventSink<T: Clone> {
    tx: RwLock<Option<broadcast::Sender<T>>>,
}

impl<T: Clone> Default for EventSink<T> {
    fn default() -> Self {
        Self::new(BROADCAST_CAPACITY)
    }
}

impl<T: Clone> EventSink<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx: RwLock::new(Some(tx)),
        }
    }

    /// Publish `value` to every current subscriber.
    pub fn emit(&self, value: T) {
        // The guarded Option has no inconsistent intermediate state, so a poisoned lock is safe to reuse.
        if let Some(tx) = self
            .tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            _ = tx.send(value);
        }
    }

    /// Subscribe to future values. A closed sink hands out a receiver that reports `Closed`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        if let Some(tx) = self
            .tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return tx.subscribe();
        }

        let (_tx, rx) = broadcast::channel(1);
        rx
    }

    /// Close the sink. Existing receivers drain what was already sent and then see `Closed`.
    pub fn close(&self) {
        drop(
            self.tx
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Per-component logger.
///
/// Every line goes to `tracing` (when the `tracing` feature is on) and, as a timestamped plain
/// text line, to the attached log sink. A logger built with logging disabled does neither.
#[derive(Debug, Clone)]
pub struct Logger {
    component: &'static str,
    enabled: bool,
    sink: Option<Arc<EventSink<String>>>,
}

impl Logger {
    #[must_use]
    pub fn new(component: &'static str, enabled: bool, sink: Arc<EventSink<String>>) -> Self {
        Self {
            component,
            enabled,
            sink: Some(sink),
        }
    }

    /// A logger that only reports to `tracing`.
    #[must_use]
    pub fn detached(component: &'static str, enabled: bool) -> Self {
        Self {
            component,
            enabled,
            sink: None,
        }
    }

    /// The same sink and switch under a different component tag.
    #[must_use]
    pub fn named(&self, component: &'static str) -> Self {
        Self {
            component,
            ..self.clone()
        }
    }

    pub fn debug<M: fmt::Display>(&self, message: M) {
        self.log(Level::Debug, message);
    }

    pub fn info<M: fmt::Display>(&self, message: M) {
        self.log(Level::Info, message);
    }

    pub fn warn<M: fmt::Display>(&self, message: M) {
        self.log(Level::Warn, message);
    }

    pub fn error<M: fmt::Display>(&self, message: M) {
        self.log(Level::Error, message);
    }

    fn log<M: fmt::Display>(&self, level: Level, message: M) {
        if !self.enabled {
            return;
        }

        #[cfg(feature = "tracing")]
        match level {
            Level::Debug => tracing::debug!(component = self.component, "{message}"),
            Level::Info => tracing::info!(component = self.component, "{message}"),
            Level::Warn => tracing::warn!(component = self.component, "{message}"),
            Level::Error => tracing::error!(component = self.component, "{message}"),
        }
        #[cfg(not(feature = "tracing"))]
        let _ = level;

        if let Some(sink) = &self.sink {
            let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            sink.emit(format!("[{timestamp}] [{}] {message}", self.component));
        }
    }
}
