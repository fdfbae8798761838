use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

/// A cancellable one-shot timer slot.
///
/// At most one instance is outstanding per slot. Arming the slot cancels the previous instance and
/// bumps a generation counter; the fired task must [`Timer::claim`] its generation under the
/// owner's lock before acting, so an instance that was superseded while waking up does nothing.
#[derive(Debug, Default)]
pub(crate) struct Timer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    /// Cancel any outstanding instance and spawn `fire(generation)` after `delay`.
    pub(crate) fn arm<F, Fut>(&mut self, delay: Duration, fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            fire(generation).await;
        }));
    }

    /// Cancel the outstanding instance, if any.
    pub(crate) fn cancel(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Called by a fired instance. Returns `false` if it was superseded or cancelled.
    ///
    /// A successful claim detaches the running task from the slot without aborting it.
    pub(crate) fn claim(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        self.handle = None;
        true
    }

    /// Whether `generation` is still the latest instance (nothing re-armed or cancelled since).
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}
