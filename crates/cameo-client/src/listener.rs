//! Event listeners
//!
//! Each listener owns an unbounded FIFO queue. The dispatch task pushes
//! every event whose instance name matches the listener's filter, or only
//! the events of its instance once the listener tracks one; a local
//! cancel is pushed into the same queue, so it is observed in order with
//! the events that preceded it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use cameo_core::prelude::*;
use cameo_core::Event;

/// One item in a listener queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event(Event),
    /// Wakes the waiter of instance `id`. Never sent over the wire.
    Cancel { id: i32 },
}

/// How long a wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Blocking,
    /// Only consume what is already queued.
    NonBlocking,
    Timeout(Duration),
}

impl WaitMode {
    pub(crate) fn until(self) -> Until {
        match self {
            WaitMode::Blocking => Until::Forever,
            WaitMode::NonBlocking => Until::Now,
            WaitMode::Timeout(limit) => Until::At(Instant::now() + limit),
        }
    }
}

impl From<Option<Duration>> for WaitMode {
    /// `None` blocks.
    fn from(timeout: Option<Duration>) -> Self {
        timeout.map_or(WaitMode::Blocking, WaitMode::Timeout)
    }
}

/// A [`WaitMode`] resolved to a fixed deadline, shared by every pop of one wait.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Until {
    Forever,
    Now,
    At(Instant),
}

/// Result of one pop.
#[derive(Debug)]
pub(crate) enum Popped {
    Delivery(Delivery),
    /// Non-blocking and nothing queued.
    Empty,
    TimedOut,
    /// Unregistered and drained.
    Closed,
}

struct Slot {
    key: u64,
    name: Option<String>,
    tracked_id: Option<i32>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Slot {
    fn accepts(&self, event: &Event) -> bool {
        match self.tracked_id {
            Some(id) => id == event.id(),
            None => self.name.as_deref().map_or(true, |name| name == event.name()),
        }
    }
}

#[derive(Default)]
struct Slots {
    next_key: u64,
    slots: Vec<Slot>,
}

/// Every listener registered with one server connection.
#[derive(Clone, Default)]
pub struct ListenerSet {
    inner: Arc<Mutex<Slots>>,
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener for events of instances named `name`, or every event if `None`.
    pub fn register(&self, name: Option<&str>) -> EventListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slots = self.lock();
        slots.next_key += 1;
        let key = slots.next_key;
        slots.slots.push(Slot {
            key,
            name: name.map(str::to_string),
            tracked_id: None,
            tx,
        });
        trace!("Registered listener {} for {:?}", key, name);

        EventListener {
            key,
            set: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push `event` to every matching listener.
    ///
    /// A terminal status also unregisters the listeners tracking that
    /// instance, after the event has been queued to them.
    pub fn dispatch(&self, event: &Event) {
        let mut slots = self.lock();
        for slot in slots.slots.iter().filter(|slot| slot.accepts(event)) {
            // The receiver may already be gone; its slot is removed on drop.
            let _ = slot.tx.send(Delivery::Event(event.clone()));
        }

        if let Some(status) = event.terminal_status() {
            let before = slots.slots.len();
            slots
                .slots
                .retain(|slot| slot.tracked_id != Some(status.id));
            let removed = before - slots.slots.len();
            if removed > 0 {
                debug!(
                    "#{} terminated in {}, unregistered {} listener(s)",
                    status.id, status.state, removed
                );
            }
        }
    }

    /// Unregister every listener; their queues close once drained.
    pub fn close_all(&self) {
        self.lock().slots.clear();
    }

    fn track(&self, key: u64, id: i32) {
        if let Some(slot) = self.lock().slots.iter_mut().find(|s| s.key == key) {
            slot.tracked_id = Some(id);
        }
    }

    fn push(&self, key: u64, delivery: Delivery) -> bool {
        self.lock()
            .slots
            .iter()
            .find(|s| s.key == key)
            .is_some_and(|slot| slot.tx.send(delivery).is_ok())
    }

    fn remove(&self, key: u64) -> bool {
        let mut slots = self.lock();
        let before = slots.slots.len();
        slots.slots.retain(|s| s.key != key);
        before != slots.slots.len()
    }

    fn contains(&self, key: u64) -> bool {
        self.lock().slots.iter().any(|s| s.key == key)
    }
}

/// The consuming side of one registered listener. Unregisters on drop.
pub struct EventListener {
    key: u64,
    set: ListenerSet,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("key", &self.key)
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl EventListener {
    /// Unregister automatically once instance `id` reaches a terminal state.
    pub fn track(&self, id: i32) {
        self.set.track(self.key, id);
    }

    /// Queue a cancel for instance `id` behind whatever is already queued.
    ///
    /// Returns false if the listener is no longer registered.
    pub fn cancel(&self, id: i32) -> bool {
        self.set.push(self.key, Delivery::Cancel { id })
    }

    /// Idempotent.
    pub fn unregister(&self) -> bool {
        self.set.remove(self.key)
    }

    pub fn is_registered(&self) -> bool {
        self.set.contains(self.key)
    }

    pub(crate) async fn pop(&self, until: Until) -> Popped {
        match until {
            Until::Now => {
                let mut rx = self.rx.lock().await;
                match rx.try_recv() {
                    Ok(delivery) => Popped::Delivery(delivery),
                    Err(mpsc::error::TryRecvError::Empty) => Popped::Empty,
                    Err(mpsc::error::TryRecvError::Disconnected) => Popped::Closed,
                }
            }
            Until::Forever => {
                let mut rx = self.rx.lock().await;
                rx.recv().await.map_or(Popped::Closed, Popped::Delivery)
            }
            Until::At(deadline) => {
                let popped = tokio::time::timeout_at(deadline, async {
                    let mut rx = self.rx.lock().await;
                    rx.recv().await
                })
                .await;
                match popped {
                    Ok(Some(delivery)) => Popped::Delivery(delivery),
                    Ok(None) => Popped::Closed,
                    Err(_) => Popped::TimedOut,
                }
            }
        }
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.set.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cameo_core::{State, StateSet, StatusEvent};

    fn status(id: i32, name: &str, state: State) -> Event {
        Event::Status(StatusEvent {
            id,
            name: name.into(),
            state,
            past_states: StateSet::from(state),
            exit_code: None,
        })
    }

    async fn drain(listener: &EventListener) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Popped::Delivery(d) = listener.pop(Until::Now).await {
            out.push(d);
        }
        out
    }

    #[tokio::test]
    async fn test_name_filter() {
        let set = ListenerSet::new();
        let all = set.register(None);
        let workers = set.register(Some("worker"));

        set.dispatch(&status(1, "worker", State::Running));
        set.dispatch(&status(2, "other", State::Running));

        assert_eq!(drain(&all).await.len(), 2);
        assert_eq!(
            drain(&workers).await,
            vec![Delivery::Event(status(1, "worker", State::Running))]
        );
    }

    #[tokio::test]
    async fn test_cancel_is_ordered_with_events() {
        let set = ListenerSet::new();
        let listener = set.register(Some("worker"));

        set.dispatch(&status(1, "worker", State::Running));
        assert!(listener.cancel(1));
        set.dispatch(&status(1, "worker", State::Stopped));

        assert_eq!(
            drain(&listener).await,
            vec![
                Delivery::Event(status(1, "worker", State::Running)),
                Delivery::Cancel { id: 1 },
                Delivery::Event(status(1, "worker", State::Stopped)),
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_status_unregisters_tracking_listener() {
        let set = ListenerSet::new();
        let tracking = set.register(Some("worker"));
        tracking.track(1);
        let other = set.register(Some("worker"));
        other.track(2);

        set.dispatch(&status(1, "worker", State::Success));
        assert!(!tracking.is_registered());
        assert!(other.is_registered());

        // The terminal event itself was delivered, then the queue closes.
        assert!(matches!(
            tracking.pop(Until::Now).await,
            Popped::Delivery(Delivery::Event(_))
        ));
        assert!(matches!(tracking.pop(Until::Now).await, Popped::Closed));

        // A second terminal event for the same id is a no-op.
        set.dispatch(&status(1, "worker", State::Success));
        assert_eq!(set.len(), 1);
        assert!(!tracking.unregister());
    }

    #[tokio::test]
    async fn test_tracking_listener_only_receives_its_instance() {
        let set = ListenerSet::new();
        let unnamed = set.register(None);
        unnamed.track(7);

        set.dispatch(&status(3, "other", State::Running));
        set.dispatch(&status(7, "worker", State::Running));
        set.dispatch(&status(8, "worker", State::Running));

        let received = drain(&unnamed).await;
        assert_eq!(received, vec![Delivery::Event(status(7, "worker", State::Running))]);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let set = ListenerSet::new();
        let listener = set.register(None);
        assert_eq!(set.len(), 1);
        drop(listener);
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_modes() {
        let set = ListenerSet::new();
        let listener = set.register(None);

        assert!(matches!(listener.pop(Until::Now).await, Popped::Empty));
        let deadline = WaitMode::Timeout(Duration::from_millis(50)).until();
        assert!(matches!(listener.pop(deadline).await, Popped::TimedOut));

        set.dispatch(&status(1, "a", State::Running));
        assert!(matches!(
            listener.pop(Until::Forever).await,
            Popped::Delivery(_)
        ));

        set.close_all();
        assert!(matches!(listener.pop(Until::Forever).await, Popped::Closed));
        assert!(!listener.cancel(1));
    }
}
