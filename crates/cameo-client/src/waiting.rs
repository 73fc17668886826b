//! Cancelable resources
//!
//! Every blocking handle (instances, key/value getters, communication
//! objects) registers itself in a [`WaitingSet`] so that one call can
//! cancel or terminate all of them, for example when the process is asked
//! to stop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use cameo_core::prelude::*;

/// Outcome of a wait that may time out or be canceled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Waited<T> {
    Done(T),
    TimedOut,
    Canceled,
}

impl<T> Waited<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Waited::Done(_))
    }

    pub fn done(self) -> Option<T> {
        match self {
            Waited::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Waited<U> {
        match self {
            Waited::Done(value) => Waited::Done(f(value)),
            Waited::TimedOut => Waited::TimedOut,
            Waited::Canceled => Waited::Canceled,
        }
    }

    /// `TimedOut` and `Canceled` as errors.
    pub fn into_result(self) -> Result<T> {
        match self {
            Waited::Done(value) => Ok(value),
            Waited::TimedOut => Err(Error::Timeout),
            Waited::Canceled => Err(Error::Canceled),
        }
    }
}

/// A resource that can be woken out of a blocking call or shut down.
pub trait Cancelable: Send + Sync {
    /// Interrupt the current or next wait. The resource stays usable.
    fn cancel(&self);

    /// Release the resource. Further waits return immediately.
    fn terminate(&self);
}

#[derive(Default)]
struct Entries {
    next_key: u64,
    entries: Vec<(u64, Weak<dyn Cancelable>)>,
}

/// All outstanding waitings of a process.
#[derive(Clone, Default)]
pub struct WaitingSet {
    inner: Arc<Mutex<Entries>>,
}

impl fmt::Debug for WaitingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitingSet")
            .field("waitings", &self.len())
            .finish()
    }
}

impl WaitingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track `item` until the returned guard is dropped or unregistered.
    pub fn register<C: Cancelable + 'static>(&self, item: &Arc<C>) -> WaitingGuard {
        let weak: Weak<dyn Cancelable> = Arc::downgrade(item) as Weak<dyn Cancelable>;
        let mut entries = self.lock();
        entries.next_key += 1;
        let key = entries.next_key;
        entries.entries.push((key, weak));
        WaitingGuard {
            key,
            set: Arc::downgrade(&self.inner),
            registered: AtomicBool::new(true),
        }
    }

    /// Live registrations.
    pub fn len(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot taken under the lock; callbacks run outside it.
    fn live(&self) -> Vec<Arc<dyn Cancelable>> {
        let mut entries = self.lock();
        entries.entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries
            .entries
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub fn cancel_all(&self) {
        let live = self.live();
        debug!("Canceling {} waiting(s)", live.len());
        for item in live {
            item.cancel();
        }
    }

    pub fn terminate_all(&self) {
        let live = self.live();
        debug!("Terminating {} waiting(s)", live.len());
        for item in live {
            item.terminate();
        }
    }
}

/// Registration handle. Unregisters on drop.
pub struct WaitingGuard {
    key: u64,
    set: Weak<Mutex<Entries>>,
    registered: AtomicBool,
}

impl WaitingGuard {
    /// Idempotent; returns whether this call did the removal.
    pub fn unregister(&self) -> bool {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(set) = self.set.upgrade() {
            let mut entries = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.entries.retain(|(key, _)| *key != self.key);
        }
        true
    }
}

impl fmt::Debug for WaitingGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitingGuard")
            .field("key", &self.key)
            .field("registered", &self.registered.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.unregister();
    }
}
