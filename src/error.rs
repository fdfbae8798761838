use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Operation not permitted in the client's current state (not connected, disposed)
    State,
    /// Error related to invalid configuration or input
    Validation,
    /// Error related to WebSocket connections
    WebSocket,
    /// An interceptor hook failed while processing a message
    Interceptor,
    /// Connection attempt exceeded the configured timeout
    Timeout,
    /// Internal error from dependencies
    Internal,
}

/// The error type for every fallible operation in this crate.
///
/// Cheap to clone so the same failure can be returned to the caller and republished on the
/// client's error stream.
#[derive(Debug, Clone)]
pub struct Error {
    kind: Kind,
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
    backtrace: Arc<Backtrace>,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Arc::new(source)),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    #[must_use]
    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn interceptor<S: Into<String>>(message: S) -> Self {
        InterceptorFailure {
            reason: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn not_connected() -> Self {
        NotConnected.into()
    }

    #[must_use]
    pub fn disposed() -> Self {
        Disposed.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// A send was attempted while the connection was not in the connected state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct NotConnected;

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebSocket is not connected")
    }
}

impl StdError for NotConnected {}

/// The client was disposed and can no longer be used.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Disposed;

impl fmt::Display for Disposed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client has been disposed")
    }
}

impl StdError for Disposed {}

#[non_exhaustive]
#[derive(Debug)]
pub struct InterceptorFailure {
    pub reason: String,
}

impl fmt::Display for InterceptorFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interceptor failed: {}", self.reason)
    }
}

impl StdError for InterceptorFailure {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<NotConnected> for Error {
    fn from(err: NotConnected) -> Self {
        Error::with_source(Kind::State, err)
    }
}

impl From<Disposed> for Error {
    fn from(err: Disposed) -> Self {
        Error::with_source(Kind::State, err)
    }
}

impl From<InterceptorFailure> for Error {
    fn from(err: InterceptorFailure) -> Self {
        Error::with_source(Kind::Interceptor, err)
    }
}
