//! Handle on one remote application instance
//!
//! An [`Instance`] mirrors the instance's state from the events its
//! listener receives. Waits consume that listener's queue in order, so a
//! state the instance passed through before the wait began is still seen
//! through the accumulated past states.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cameo_core::prelude::*;
use cameo_core::{
    responder_port_name, Event, InstanceStatus, PublisherInfo, Request, Response, State, StateSet,
    TcpTransport, Transport,
};

use crate::key_value::KeyValueGetter;
use crate::listener::{Delivery, EventListener, Popped, Until, WaitMode};
use crate::server::Server;
use crate::session::effective_timeout;
use crate::waiting::{Cancelable, Waited, WaitingGuard};

/// What the instance is known to have gone through so far.
#[derive(Debug, Default)]
struct Tracker {
    last_state: State,
    past_states: StateSet,
    exit_code: Option<i32>,
    result: Option<Vec<u8>>,
}

/// Outcome of scanning the queue for one kind of event.
pub(crate) enum Step<R> {
    Found(R),
    Terminated(State),
    /// Non-blocking and the queue is drained.
    Empty,
    TimedOut,
    Canceled,
}

struct InstanceInner<T: Transport> {
    id: i32,
    name: String,
    server: Server<T>,
    listener: EventListener,
    tracker: Mutex<Tracker>,
}

impl<T: Transport> Cancelable for InstanceInner<T> {
    fn cancel(&self) {
        self.listener.cancel(self.id);
    }

    fn terminate(&self) {
        self.listener.unregister();
    }
}

impl<T: Transport> InstanceInner<T> {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold an event of this instance into the tracker.
    fn observe(&self, event: &Event) {
        let mut tracker = self.tracker();
        match event {
            Event::Status(status) => {
                // A snapshot taken before this event may already be ahead of it.
                if (status.past_states | tracker.past_states) == status.past_states {
                    tracker.last_state = status.state;
                    tracker.past_states = status.past_states;
                    if status.exit_code.is_some() {
                        tracker.exit_code = status.exit_code;
                    }
                }
            }
            Event::Result(result) => tracker.result = Some(result.data.clone()),
            _ => {}
        }
    }
}

/// A started or connected application instance. Cheap to clone.
pub struct Instance<T: Transport = TcpTransport> {
    inner: Arc<InstanceInner<T>>,
    _waiting: Arc<WaitingGuard>,
}

impl<T: Transport> Clone for Instance<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _waiting: Arc::clone(&self._waiting),
        }
    }
}

impl<T: Transport> fmt::Debug for Instance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracker = self.inner.tracker();
        f.debug_struct("Instance")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("last_state", &tracker.last_state)
            .field("past_states", &tracker.past_states)
            .finish()
    }
}

impl<T: Transport> Instance<T> {
    pub(crate) fn new(
        server: Server<T>,
        listener: EventListener,
        id: i32,
        name: &str,
        state: State,
        past_states: StateSet,
    ) -> Self {
        listener.track(id);
        let inner = Arc::new(InstanceInner {
            id,
            name: name.to_string(),
            tracker: Mutex::new(Tracker {
                last_state: state,
                past_states,
                ..Default::default()
            }),
            listener,
            server,
        });
        let waiting = inner.server.waitings().register(&inner);
        Self {
            inner,
            _waiting: Arc::new(waiting),
        }
    }

    /// Apply an event that reached this instance outside its own queue.
    ///
    /// A terminal status also unregisters the listener, as dispatch would have.
    pub(crate) fn absorb(&self, event: &Event) {
        self.inner.observe(event);
        if self.cached_state().is_terminal() {
            self.inner.listener.unregister();
        }
    }

    pub fn id(&self) -> i32 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server(&self) -> &Server<T> {
        &self.inner.server
    }

    pub fn past_states(&self) -> StateSet {
        self.inner.tracker().past_states
    }

    /// Exit code of the process, once a terminal status carried one.
    pub fn exit_code(&self) -> Option<i32> {
        self.inner.tracker().exit_code
    }

    fn cached_state(&self) -> State {
        self.inner.tracker().last_state
    }

    /// `Some(last_state)` if a wait for `mask` has nothing left to wait for.
    fn satisfied(&self, mask: StateSet) -> Option<State> {
        let tracker = self.inner.tracker();
        (tracker.last_state.is_terminal() || mask.intersects(tracker.past_states))
            .then_some(tracker.last_state)
    }

    /// Pop events of this instance until `matcher` accepts one, the instance terminates or the wait ends.
    pub(crate) async fn next_match<R>(
        &self,
        until: Until,
        mut matcher: impl FnMut(&Event) -> Option<R>,
    ) -> Step<R> {
        let id = self.inner.id;
        loop {
            match self.inner.listener.pop(until).await {
                Popped::Delivery(Delivery::Cancel { id: canceled }) => {
                    if canceled == id {
                        return Step::Canceled;
                    }
                }
                Popped::Delivery(Delivery::Event(event)) => {
                    if event.id() != id {
                        continue;
                    }
                    self.inner.observe(&event);
                    if let Some(found) = matcher(&event) {
                        return Step::Found(found);
                    }
                    if let Some(status) = event.terminal_status() {
                        return Step::Terminated(status.state);
                    }
                }
                Popped::Empty => return Step::Empty,
                Popped::TimedOut => return Step::TimedOut,
                Popped::Closed => {
                    // Another waiter may have consumed the terminal event.
                    let state = self.cached_state();
                    return if state.is_terminal() {
                        Step::Terminated(state)
                    } else {
                        Step::Canceled
                    };
                }
            }
        }
    }

    /// Wait until the instance has been in one of the `mask` states, or has terminated.
    ///
    /// Returns immediately if a state in `mask` was already passed through.
    /// In non-blocking mode the queued events are applied and the last state is returned.
    pub async fn wait_for(&self, mask: impl Into<StateSet>, mode: WaitMode) -> Waited<State> {
        let mask = mask.into();
        if let Some(state) = self.satisfied(mask) {
            return Waited::Done(state);
        }

        let step = self
            .next_match(mode.until(), |event| match event {
                Event::Status(status) if status.past_states.intersects(mask) => Some(status.state),
                _ => None,
            })
            .await;
        match step {
            Step::Found(state) | Step::Terminated(state) => Waited::Done(state),
            Step::Empty => Waited::Done(self.cached_state()),
            Step::TimedOut => Waited::TimedOut,
            Step::Canceled => {
                debug!("Wait on #{} {} canceled", self.inner.id, self.inner.name);
                Waited::Canceled
            }
        }
    }

    /// Block until a terminal state.
    pub async fn wait_for_completion(&self) -> Waited<State> {
        self.wait_for(StateSet::TERMINAL, WaitMode::Blocking).await
    }

    /// Apply every queued event and return the resulting state.
    pub async fn last_state(&self) -> State {
        match self.wait_for(StateSet::EMPTY, WaitMode::NonBlocking).await {
            Waited::Done(state) => state,
            _ => self.cached_state(),
        }
    }

    /// Wait for termination and return the result data the instance set, if any.
    pub async fn result(&self) -> Waited<Option<Vec<u8>>> {
        self.wait_for_completion()
            .await
            .map(|_| self.inner.tracker().result.clone())
    }

    /// Queue a cancel behind the events already received; the current or next wait returns `Canceled`.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub async fn stop(&self) -> Result<()> {
        self.inner.server.stop(self.inner.id).await
    }

    pub async fn kill(&self) -> Result<()> {
        self.inner.server.kill(self.inner.id).await
    }

    /// Current status as the server sees it.
    pub async fn status(&self) -> Result<InstanceStatus> {
        self.inner.server.status(self.inner.id).await
    }

    pub fn key_value_getter(&self, key: &str) -> KeyValueGetter<T> {
        KeyValueGetter::new(self.inner.server.clone(), self.inner.id, &self.inner.name, key)
    }

    /// Wait until the instance has registered the publisher `name`.
    pub async fn wait_for_publisher(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Waited<PublisherInfo>> {
        let request = Request::GetPublisher {
            id: self.inner.id,
            name: name.to_string(),
        };
        self.wait_registered(
            request,
            timeout,
            |response| match response {
                Response::Publisher(info) => Ok(info),
                other => Err(other.unexpected("publisher")),
            },
            |event| matches!(event, Event::Publisher(p) if p.publisher_name == name),
        )
        .await
    }

    /// Wait until the instance has been assigned the port `name`.
    pub async fn wait_for_port(&self, name: &str, timeout: Option<Duration>) -> Result<Waited<u16>> {
        let request = Request::GetPort {
            id: self.inner.id,
            name: name.to_string(),
        };
        self.wait_registered(
            request,
            timeout,
            |response| match response {
                Response::Port { port } => Ok(port),
                other => Err(other.unexpected("port")),
            },
            |event| matches!(event, Event::Port(p) if p.port_name == name),
        )
        .await
    }

    /// Port of the responder `name` of this instance.
    pub async fn wait_for_responder(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Waited<u16>> {
        self.wait_for_port(&responder_port_name(name), timeout).await
    }

    /// Query first; on `UndefinedKey`, wait for the announcing event and query again.
    async fn wait_registered<R>(
        &self,
        request: Request,
        timeout: Option<Duration>,
        extract: impl Fn(Response) -> Result<R>,
        announced: impl Fn(&Event) -> bool,
    ) -> Result<Waited<R>> {
        let until = WaitMode::from(effective_timeout(timeout)).until();
        loop {
            match self.inner.server.session().request(request.clone()).await {
                Ok(response) => return extract(response).map(Waited::Done),
                Err(Error::UndefinedKey { key }) => {
                    trace!("#{} has no '{}' yet, waiting", self.inner.id, key);
                }
                Err(e) => return Err(e),
            }

            match self
                .next_match(until, |event| announced(event).then_some(()))
                .await
            {
                Step::Found(()) => continue,
                Step::Terminated(_) => return Err(Error::not_found(self.inner.id)),
                Step::Empty | Step::TimedOut => return Ok(Waited::TimedOut),
                Step::Canceled => return Ok(Waited::Canceled),
            }
        }
    }
}
