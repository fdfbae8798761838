//! Ordered message and error hooks.
//!
//! Interceptors run strictly in registration order. Each hook is awaited before the next
//! interceptor sees the (possibly transformed) message, and returning `Ok(None)` from a message
//! hook cancels the message for the rest of the chain.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt as _;

use super::events::Logger;
use crate::Result;
use crate::error::Error;
use crate::types::Message;

/// A hook that observes, transforms or cancels traffic crossing the client boundary.
///
/// Every method has a pass-through default, so implementors only override what they need.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Outgoing message hook. `Ok(None)` drops the message before it reaches the transport.
    async fn on_send(&self, message: Message) -> Result<Option<Message>> {
        Ok(Some(message))
    }

    /// Incoming message hook. `Ok(None)` drops the message before liveness tracking and
    /// application delivery.
    async fn on_receive(&self, message: Message) -> Result<Option<Message>> {
        Ok(Some(message))
    }

    /// Error observer. Cannot veto propagation.
    async fn on_error(&self, _error: &Error) {}
}

type MessageHook = Arc<dyn Fn(Message) -> Result<Option<Message>> + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// An [`Interceptor`] assembled from plain closures.
///
/// ```
/// use adapter_websocket::types::{Message, Payload};
/// use adapter_websocket::ws::interceptor::FnInterceptor;
///
/// let tagger = FnInterceptor::new().on_send(|message: Message| {
///     let text = format!("{}-out", message.payload);
///     Ok(Some(message.with_payload(Payload::Text(text))))
/// });
/// # let _ = tagger;
/// ```
#[derive(Clone, Default)]
pub struct FnInterceptor {
    on_send: Option<MessageHook>,
    on_receive: Option<MessageHook>,
    on_error: Option<ErrorHook>,
}

impl FnInterceptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(Message) -> Result<Option<Message>> + Send + Sync + 'static,
    {
        self.on_send = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_receive<F>(mut self, hook: F) -> Self
    where
        F: Fn(Message) -> Result<Option<Message>> + Send + Sync + 'static,
    {
        self.on_receive = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_error<F: Fn(&Error) + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for FnInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnInterceptor")
            .field("on_send", &self.on_send.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[async_trait]
impl Interceptor for FnInterceptor {
    async fn on_send(&self, message: Message) -> Result<Option<Message>> {
        match &self.on_send {
            Some(hook) => hook(message),
            None => Ok(Some(message)),
        }
    }

    async fn on_receive(&self, message: Message) -> Result<Option<Message>> {
        match &self.on_receive {
            Some(hook) => hook(message),
            None => Ok(Some(message)),
        }
    }

    async fn on_error(&self, error: &Error) {
        if let Some(hook) = &self.on_error {
            hook(error);
        }
    }
}

/// Registration-ordered list of interceptors.
pub struct InterceptorChain {
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
    logger: Logger,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl InterceptorChain {
    #[must_use]
    pub fn new(logger: Logger) -> Self {
        Self {
            interceptors: RwLock::new(Vec::new()),
            logger,
        }
    }

    pub fn add(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    pub fn clear(&self) {
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Hooks are awaited without holding the lock, so registration during a pass only affects
    // later messages.
    fn snapshot(&self) -> Vec<Arc<dyn Interceptor>> {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Thread `message` through every `on_send` hook. `Ok(None)` means some hook cancelled it.
    pub async fn process_send(&self, message: Message) -> Result<Option<Message>> {
        let mut current = message;
        for interceptor in self.snapshot() {
            match interceptor.on_send(current).await? {
                Some(next) => current = next,
                None => {
                    self.logger.debug("Outgoing message cancelled by interceptor");
                    return Ok(None);
                }
            }
        }

        Ok(Some(current))
    }

    /// Thread `message` through every `on_receive` hook. `Ok(None)` means some hook cancelled it.
    pub async fn process_receive(&self, message: Message) -> Result<Option<Message>> {
        let mut current = message;
        for interceptor in self.snapshot() {
            match interceptor.on_receive(current).await? {
                Some(next) => current = next,
                None => {
                    self.logger.debug("Incoming message cancelled by interceptor");
                    return Ok(None);
                }
            }
        }

        Ok(Some(current))
    }

    /// Notify every interceptor of `error`. A hook that panics is logged and skipped.
    pub async fn notify_error(&self, error: &Error) {
        for interceptor in self.snapshot() {
            let outcome = std::panic::AssertUnwindSafe(interceptor.on_error(error))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                self.logger.error("Interceptor panicked while handling an error");
            }
        }
    }
}
