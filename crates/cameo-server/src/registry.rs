//! Application registry
//!
//! The authoritative map from instance id to instance record. Every
//! mutating operation runs under one registry-wide lock and publishes its
//! event before releasing it, so:
//!
//! - per-instance transitions are totally ordered on the event stream;
//! - a client that queries the state and then waits for events can never
//!   miss the transition that happened between the two.
//!
//! A terminal transition is broadcast first and the instance removed
//! afterwards, releasing its id and ports.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use cameo_core::prelude::*;
use cameo_core::{
    publisher_port_name, Event, InstanceInfo, InstanceStatus, KeyEvent, KeyStatus, PortEvent,
    PortInfo, PublisherEvent, PublisherInfo, ResultEvent, State, StateSet, StatusEvent,
};

use crate::allocator::{IdAllocator, PortAllocator};
use crate::publisher::EventPublisher;

/// What the lifecycle task has been asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    Stop,
    Kill,
}

/// Requests from clients to an instance's lifecycle task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    /// The instance reported RUNNING itself.
    pub running_reported: bool,
    pub stop: Option<StopRequest>,
}

/// Limits applied when registering an instance.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    /// Live instances allowed with the same name, -1 for unlimited.
    pub max_instances: i32,
}

impl Admission {
    pub const UNLIMITED: Admission = Admission { max_instances: -1 };
}

/// A freshly registered instance, in STARTING.
#[derive(Debug)]
pub struct Registration {
    pub id: i32,
    pub signals: watch::Receiver<Signals>,
}

#[derive(Debug)]
struct Instance {
    id: i32,
    name: String,
    args: Vec<String>,
    state: State,
    past_states: StateSet,
    exit_code: Option<i32>,
    pid: Option<u32>,
    managed: bool,
    started_at: chrono::DateTime<Utc>,
    stop_handler: Option<Duration>,
    ports: BTreeMap<String, u16>,
    publishers: BTreeMap<String, u32>,
    key_values: HashMap<String, String>,
    signals: watch::Sender<Signals>,
}

impl Instance {
    fn status_event(&self) -> StatusEvent {
        StatusEvent {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            past_states: self.past_states,
            exit_code: self.exit_code,
        }
    }

    fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            past_states: self.past_states,
            exit_code: self.exit_code,
        }
    }

    fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id,
            name: self.name.clone(),
            args: self.args.clone(),
            state: self.state,
            past_states: self.past_states,
            pid: self.pid,
            started_at: self.started_at,
        }
    }
}

struct Inner {
    instances: BTreeMap<i32, Instance>,
    ids: IdAllocator,
    ports: PortAllocator,
    max_applications: usize,
}

impl Inner {
    fn get(&self, id: i32) -> Result<&Instance> {
        self.instances.get(&id).ok_or_else(|| Error::not_found(id))
    }

    fn get_mut(&mut self, id: i32) -> Result<&mut Instance> {
        self.instances.get_mut(&id).ok_or_else(|| Error::not_found(id))
    }

    fn count_named(&self, name: &str) -> usize {
        self.instances.values().filter(|i| i.name == name).count()
    }
}

pub struct Registry {
    inner: Mutex<Inner>,
    publisher: EventPublisher,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(
        ids: IdAllocator,
        ports: PortAllocator,
        max_applications: usize,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                instances: BTreeMap::new(),
                ids,
                ports,
                max_applications,
            }),
            publisher,
        }
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a transition, broadcast it, and remove the instance if it is now terminal.
    fn apply(
        &self,
        inner: &mut Inner,
        id: i32,
        state: State,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let instance = inner.get_mut(id)?;
        if instance.state == state {
            return Ok(());
        }

        debug!("#{} {}: {} -> {}", id, instance.name, instance.state, state);
        instance.state = state;
        instance.past_states |= state;
        if exit_code.is_some() {
            instance.exit_code = exit_code;
        }
        self.publisher.publish(&Event::Status(instance.status_event()));

        if state.is_terminal() {
            if let Some(instance) = inner.instances.remove(&id) {
                inner.ids.release(id);
                for port in instance.ports.values() {
                    inner.ports.release(*port);
                }
                info!(
                    "#{} {} terminated in {} (exit code {:?})",
                    id, instance.name, state, instance.exit_code
                );
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Register a new instance and enter STARTING.
    pub fn register(
        &self,
        name: &str,
        args: Vec<String>,
        admission: Admission,
        managed: bool,
    ) -> Result<Registration> {
        let mut inner = self.lock();

        if inner.instances.len() >= inner.max_applications {
            info!("Max number of applications reached");
            return Err(Error::capacity(format!(
                "maximum of {} applications reached",
                inner.max_applications
            )));
        }
        let running = inner.count_named(name);
        if admission.max_instances == 1 && running > 0 {
            return Err(Error::already_running(name));
        }
        if admission.max_instances > 0 && running >= admission.max_instances as usize {
            return Err(Error::capacity(format!(
                "maximum of {} instances of '{}' reached",
                admission.max_instances, name
            )));
        }

        let id = inner.ids.allocate()?;
        let (signals_tx, signals_rx) = watch::channel(Signals::default());
        inner.instances.insert(
            id,
            Instance {
                id,
                name: name.to_string(),
                args,
                state: State::Unknown,
                past_states: StateSet::EMPTY,
                exit_code: None,
                pid: None,
                managed,
                started_at: Utc::now(),
                stop_handler: None,
                ports: BTreeMap::new(),
                publishers: BTreeMap::new(),
                key_values: HashMap::new(),
                signals: signals_tx,
            },
        );
        self.apply(&mut inner, id, State::Starting, None)?;

        Ok(Registration {
            id,
            signals: signals_rx,
        })
    }

    /// Server-driven transition.
    pub fn set_state(&self, id: i32, state: State) -> Result<()> {
        let mut inner = self.lock();
        self.apply(&mut inner, id, state, None)
    }

    /// Terminal transition carrying the exit code.
    pub fn terminate(&self, id: i32, state: State, exit_code: Option<i32>) -> Result<()> {
        let mut inner = self.lock();
        self.apply(&mut inner, id, state, exit_code)
    }

    /// The only transition a client may request on itself: STARTING -> RUNNING.
    ///
    /// Returns false if the instance is neither STARTING nor RUNNING.
    pub fn set_state_from_client(&self, id: i32, state: State) -> Result<bool> {
        if state != State::Running {
            return Err(Error::invalid_transition(format!(
                "clients may only set RUNNING, not {state}"
            )));
        }

        let mut inner = self.lock();
        let instance = inner.get_mut(id)?;
        match instance.state {
            State::Running => Ok(true),
            State::Starting => {
                instance
                    .signals
                    .send_modify(|signals| signals.running_reported = true);
                self.apply(&mut inner, id, State::Running, None)?;
                Ok(true)
            }
            other => {
                debug!("#{} cannot report RUNNING from {}", id, other);
                Ok(false)
            }
        }
    }

    /// Record a stop or kill request.
    ///
    /// Managed instances are driven to a terminal state by their lifecycle
    /// task. Unmanaged instances have none, so the registry moves them itself.
    pub fn request_stop(&self, id: i32, request: StopRequest) -> Result<()> {
        let mut inner = self.lock();
        let instance = inner.get_mut(id)?;
        info!("#{} {}: {:?} requested", id, instance.name, request);

        if instance.managed {
            instance.signals.send_modify(|signals| {
                // A kill overrides a pending stop, never the reverse.
                if signals.stop != Some(StopRequest::Kill) {
                    signals.stop = Some(request);
                }
            });
            return Ok(());
        }

        let next = match request {
            StopRequest::Kill => State::Killed,
            StopRequest::Stop if instance.stop_handler.is_some() => State::Stopping,
            StopRequest::Stop => State::Stopped,
        };
        self.apply(&mut inner, id, next, None)
    }

    pub fn set_pid(&self, id: i32, pid: Option<u32>) -> Result<()> {
        let mut inner = self.lock();
        inner.get_mut(id)?.pid = pid;
        Ok(())
    }

    pub fn set_stop_handler(&self, id: i32, stopping_time: Duration) -> Result<()> {
        let mut inner = self.lock();
        inner.get_mut(id)?.stop_handler = Some(stopping_time);
        Ok(())
    }

    /// Grace period if the instance handles STOPPING itself.
    pub fn stop_handler(&self, id: i32) -> Result<Option<Duration>> {
        Ok(self.lock().get(id)?.stop_handler)
    }

    /// Register an already running process.
    pub fn attach_unmanaged(&self, name: &str, pid: Option<u32>) -> Result<i32> {
        let registration = self.register(name, Vec::new(), Admission::UNLIMITED, false)?;
        let mut inner = self.lock();
        inner.get_mut(registration.id)?.pid = pid;
        self.apply(&mut inner, registration.id, State::Running, None)?;
        Ok(registration.id)
    }

    /// An unmanaged instance leaves: STOPPED if it was stopping, SUCCESS otherwise.
    pub fn detach_unmanaged(&self, id: i32) -> Result<()> {
        let mut inner = self.lock();
        let instance = inner.get(id)?;
        if instance.managed {
            return Err(Error::invalid_transition(format!(
                "#{id} is managed by the server and cannot detach"
            )));
        }
        let terminal = if instance.state == State::Stopping {
            State::Stopped
        } else {
            State::Success
        };
        self.apply(&mut inner, id, terminal, None)
    }

    pub fn set_result(&self, id: i32, data: Vec<u8>) -> Result<()> {
        let inner = self.lock();
        let instance = inner.get(id)?;
        self.publisher.publish(&Event::Result(ResultEvent {
            id,
            name: instance.name.clone(),
            data,
        }));
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    /// Current status; `Unknown` with name `"?"` for an id that is not live.
    pub fn status(&self, id: i32) -> InstanceStatus {
        self.lock()
            .instances
            .get(&id)
            .map(Instance::status)
            .unwrap_or_else(|| InstanceStatus::unknown(id))
    }

    pub fn is_alive(&self, id: i32) -> bool {
        self.status(id).state.is_alive()
    }

    pub fn list(&self) -> Result<Vec<InstanceInfo>> {
        Ok(self.lock().instances.values().map(Instance::info).collect())
    }

    /// Snapshot of the live instances named `name`.
    pub fn connect(&self, name: &str) -> Result<Vec<InstanceInfo>> {
        Ok(self
            .lock()
            .instances
            .values()
            .filter(|i| i.name == name)
            .map(Instance::info)
            .collect())
    }

    pub fn connect_with_id(&self, id: i32) -> Result<InstanceInfo> {
        Ok(self.lock().get(id)?.info())
    }

    pub fn count_named(&self, name: &str) -> usize {
        self.lock().count_named(name)
    }

    pub fn live_ids(&self) -> Vec<i32> {
        self.lock().instances.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().instances.is_empty()
    }

    // ─────────────────────────────────────────────────────────────
    // Key/Value Store
    // ─────────────────────────────────────────────────────────────

    pub fn store_key_value(&self, id: i32, key: &str, value: &str) -> Result<()> {
        let mut inner = self.lock();
        let instance = inner.get_mut(id)?;
        if instance.key_values.contains_key(key) {
            return Err(Error::key_exists(key));
        }
        instance.key_values.insert(key.to_string(), value.to_string());
        self.publisher.publish(&Event::KeyValue(KeyEvent {
            id,
            name: instance.name.clone(),
            key: key.to_string(),
            value: value.to_string(),
            status: KeyStatus::Stored,
        }));
        Ok(())
    }

    pub fn get_key_value(&self, id: i32, key: &str) -> Result<String> {
        let inner = self.lock();
        inner
            .get(id)?
            .key_values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::undefined_key(key))
    }

    pub fn remove_key(&self, id: i32, key: &str) -> Result<()> {
        let mut inner = self.lock();
        let instance = inner.get_mut(id)?;
        let value = instance
            .key_values
            .remove(key)
            .ok_or_else(|| Error::undefined_key(key))?;
        self.publisher.publish(&Event::KeyValue(KeyEvent {
            id,
            name: instance.name.clone(),
            key: key.to_string(),
            value,
            status: KeyStatus::Removed,
        }));
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Ports
    // ─────────────────────────────────────────────────────────────

    /// Allocate a named port for an instance. Asking again for the same name returns the same port.
    pub fn request_port(&self, id: i32, port_name: &str) -> Result<u16> {
        let mut inner = self.lock();
        if let Some(port) = inner.get(id)?.ports.get(port_name) {
            return Ok(*port);
        }

        let port = inner.ports.allocate()?;
        let instance = inner.get_mut(id)?;
        instance.ports.insert(port_name.to_string(), port);
        debug!("#{} {}: port {} = {}", id, instance.name, port_name, port);
        self.publisher.publish(&Event::Port(PortEvent {
            id,
            name: instance.name.clone(),
            port_name: port_name.to_string(),
        }));
        Ok(port)
    }

    pub fn release_port(&self, id: i32, port_name: &str) -> Result<()> {
        let mut inner = self.lock();
        let port = inner
            .get_mut(id)?
            .ports
            .remove(port_name)
            .ok_or_else(|| Error::undefined_key(port_name))?;
        inner.ports.release(port);
        Ok(())
    }

    /// A port could not be bound; forget any owner and never hand it out again.
    pub fn set_port_unavailable(&self, port: u16) -> Result<()> {
        let mut inner = self.lock();
        for instance in inner.instances.values_mut() {
            instance.ports.retain(|_, p| *p != port);
        }
        inner.ports.set_unavailable(port);
        warn!("Port {} marked unavailable", port);
        Ok(())
    }

    pub fn get_port(&self, id: i32, port_name: &str) -> Result<u16> {
        let inner = self.lock();
        inner
            .get(id)?
            .ports
            .get(port_name)
            .copied()
            .ok_or_else(|| Error::undefined_key(port_name))
    }

    pub fn ports(&self) -> Result<Vec<PortInfo>> {
        let inner = self.lock();
        let mut ports: Vec<PortInfo> = inner
            .instances
            .values()
            .flat_map(|instance| {
                instance.ports.iter().map(|(name, port)| PortInfo {
                    port: *port,
                    owner_id: instance.id,
                    owner_name: instance.name.clone(),
                    name: name.clone(),
                })
            })
            .collect();
        ports.sort_by_key(|p| p.port);
        Ok(ports)
    }

    // ─────────────────────────────────────────────────────────────
    // Publishers
    // ─────────────────────────────────────────────────────────────

    /// Record a publisher. Its port must already have been requested.
    pub fn register_publisher(&self, id: i32, name: &str, subscribers: u32) -> Result<()> {
        let mut inner = self.lock();
        let instance = inner.get_mut(id)?;
        let port_name = publisher_port_name(name);
        if !instance.ports.contains_key(&port_name) {
            return Err(Error::undefined_key(port_name));
        }
        if instance.publishers.contains_key(name) {
            return Err(Error::key_exists(name));
        }
        instance.publishers.insert(name.to_string(), subscribers);
        self.publisher.publish(&Event::Publisher(PublisherEvent {
            id,
            name: instance.name.clone(),
            publisher_name: name.to_string(),
        }));
        Ok(())
    }

    pub fn unregister_publisher(&self, id: i32, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner
            .get_mut(id)?
            .publishers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::undefined_key(name))
    }

    pub fn get_publisher(&self, id: i32, name: &str) -> Result<PublisherInfo> {
        let inner = self.lock();
        let instance = inner.get(id)?;
        let subscribers = *instance
            .publishers
            .get(name)
            .ok_or_else(|| Error::undefined_key(name))?;
        let port = instance
            .ports
            .get(&publisher_port_name(name))
            .copied()
            .ok_or_else(|| Error::undefined_key(publisher_port_name(name)))?;
        Ok(PublisherInfo {
            id,
            name: name.to_string(),
            port,
            subscribers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cameo_core::{Decoded, Endpoint, MemoryTransport, Subscription, Transport};

    async fn registry_with_events(max_applications: usize) -> (Registry, Subscription) {
        let transport = MemoryTransport::new();
        let endpoint = Endpoint::new("registry", 1);
        let binding = transport.bind_publisher(&endpoint).await.unwrap();
        let events = transport.subscribe(&endpoint, &[]).await.unwrap();
        let registry = Registry::new(
            IdAllocator::default(),
            PortAllocator::new(9000),
            max_applications,
            EventPublisher::new(binding),
        );
        (registry, events)
    }

    /// Let the subscription forwarder catch up.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Drain every event published so far.
    fn drain(events: &mut Subscription) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(frame) = events.try_recv() {
            match Event::decode(&frame.payload).unwrap() {
                Decoded::Event(event) => out.push(event),
                Decoded::Unknown(kind) => panic!("unexpected type {kind}"),
            }
        }
        out
    }

    fn states(events: &[Event]) -> Vec<State> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Status(s) => Some(s.state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_register_enters_starting() {
        let (registry, mut events) = registry_with_events(10).await;
        let reg = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap();
        assert_eq!(reg.id, 1);

        let status = registry.status(reg.id);
        assert_eq!(status.state, State::Starting);
        assert_eq!(status.past_states, StateSet::from(State::Starting));

        settle().await;
        assert_eq!(states(&drain(&mut events)), vec![State::Starting]);
    }

    #[tokio::test]
    async fn test_registry_keeps_working_after_poisoned_lock() {
        let (registry, _events) = registry_with_events(10).await;
        let id = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap()
            .id;

        std::thread::scope(|scope| {
            let poisoning = scope.spawn(|| {
                let _guard = registry.inner.lock().unwrap();
                panic!("poison the registry lock");
            });
            assert!(poisoning.join().is_err());
        });
        assert!(registry.inner.is_poisoned());

        registry.set_state(id, State::Running).unwrap();
        assert_eq!(registry.status(id).state, State::Running);
        assert_eq!(registry.live_ids(), vec![id]);
        let err = registry.set_state(4242, State::Running).unwrap_err();
        assert!(matches!(err, Error::NotFound { id: 4242 }));
    }

    #[tokio::test]
    async fn test_past_states_accumulate_and_terminal_removes() {
        let (registry, mut events) = registry_with_events(10).await;
        let id = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap()
            .id;
        let port = registry.request_port(id, "data").unwrap();

        registry.set_state(id, State::Running).unwrap();
        registry.set_state(id, State::Stopping).unwrap();
        let status = registry.status(id);
        assert_eq!(
            status.past_states,
            State::Starting | State::Running | State::Stopping
        );
        assert!(status.past_states.contains(status.state));

        registry.terminate(id, State::Stopped, Some(0)).unwrap();
        assert_eq!(registry.status(id).state, State::Unknown);
        assert_eq!(registry.status(id).name, "?");
        assert!(registry.ports().unwrap().is_empty());

        settle().await;
        let published = drain(&mut events);
        assert_eq!(
            states(&published),
            vec![State::Starting, State::Running, State::Stopping, State::Stopped]
        );
        let Some(Event::Status(last)) = published.last() else {
            panic!("expected a status event");
        };
        assert_eq!(last.exit_code, Some(0));
        assert_eq!(
            last.past_states,
            State::Starting | State::Running | State::Stopping | State::Stopped
        );

        // Port and id are free again.
        let id2 = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap()
            .id;
        assert_eq!(registry.request_port(id2, "data").unwrap(), port);
    }

    #[tokio::test]
    async fn test_transitions_on_removed_instance_are_not_found() {
        let (registry, _events) = registry_with_events(10).await;
        let id = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap()
            .id;
        registry.terminate(id, State::Success, Some(0)).unwrap();
        assert!(matches!(
            registry.set_state(id, State::Running),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_repeated_state_is_not_republished() {
        let (registry, mut events) = registry_with_events(10).await;
        let id = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap()
            .id;
        registry.set_state(id, State::Running).unwrap();
        registry.set_state(id, State::Running).unwrap();
        settle().await;
        assert_eq!(
            states(&drain(&mut events)),
            vec![State::Starting, State::Running]
        );
    }

    #[tokio::test]
    async fn test_single_instance_policy() {
        let (registry, _events) = registry_with_events(10).await;
        let single = Admission { max_instances: 1 };
        registry.register("db", vec![], single, true).unwrap();
        let err = registry.register("db", vec![], single, true).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_per_name_and_global_caps() {
        let (registry, _events) = registry_with_events(3).await;
        let two = Admission { max_instances: 2 };
        registry.register("w", vec![], two, true).unwrap();
        registry.register("w", vec![], two, true).unwrap();
        assert!(matches!(
            registry.register("w", vec![], two, true),
            Err(Error::CapacityExceeded { .. })
        ));

        registry
            .register("other", vec![], Admission::UNLIMITED, true)
            .unwrap();
        assert!(matches!(
            registry.register("third", vec![], Admission::UNLIMITED, true),
            Err(Error::CapacityExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_client_may_only_set_running_from_starting() {
        let (registry, _events) = registry_with_events(10).await;
        let reg = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap();
        let id = reg.id;

        assert!(matches!(
            registry.set_state_from_client(id, State::Stopped),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(registry.set_state_from_client(id, State::Running).unwrap());
        assert!(reg.signals.borrow().running_reported);
        // Already RUNNING: succeeds without change.
        assert!(registry.set_state_from_client(id, State::Running).unwrap());

        registry.set_state(id, State::Stopping).unwrap();
        assert!(!registry.set_state_from_client(id, State::Running).unwrap());
        assert!(matches!(
            registry.set_state_from_client(99, State::Running),
            Err(Error::NotFound { id: 99 })
        ));
    }

    #[tokio::test]
    async fn test_stop_request_signals_managed_instance() {
        let (registry, _events) = registry_with_events(10).await;
        let reg = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap();
        registry.request_stop(reg.id, StopRequest::Stop).unwrap();
        assert_eq!(reg.signals.borrow().stop, Some(StopRequest::Stop));
        registry.request_stop(reg.id, StopRequest::Kill).unwrap();
        registry.request_stop(reg.id, StopRequest::Stop).unwrap();
        assert_eq!(reg.signals.borrow().stop, Some(StopRequest::Kill));
        // State is left to the lifecycle task.
        assert_eq!(registry.status(reg.id).state, State::Starting);
    }

    #[tokio::test]
    async fn test_unmanaged_lifecycle() {
        let (registry, mut events) = registry_with_events(10).await;
        let id = registry.attach_unmanaged("ext", Some(4242)).unwrap();
        assert_eq!(registry.status(id).state, State::Running);
        assert_eq!(registry.connect_with_id(id).unwrap().pid, Some(4242));

        registry.set_stop_handler(id, Duration::from_secs(1)).unwrap();
        registry.request_stop(id, StopRequest::Stop).unwrap();
        assert_eq!(registry.status(id).state, State::Stopping);
        registry.detach_unmanaged(id).unwrap();
        assert!(registry.is_empty());

        settle().await;
        assert_eq!(
            states(&drain(&mut events)),
            vec![
                State::Starting,
                State::Running,
                State::Stopping,
                State::Stopped
            ]
        );

        let id = registry.attach_unmanaged("ext", None).unwrap();
        registry.request_stop(id, StopRequest::Kill).unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_managed_instance_cannot_detach() {
        let (registry, _events) = registry_with_events(10).await;
        let id = registry
            .register("worker", vec![], Admission::UNLIMITED, true)
            .unwrap()
            .id;
        assert!(matches!(
            registry.detach_unmanaged(id),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_key_values() {
        let (registry, mut events) = registry_with_events(10).await;
        let id = registry.attach_unmanaged("kv", None).unwrap();

        registry.store_key_value(id, "color", "blue").unwrap();
        assert!(matches!(
            registry.store_key_value(id, "color", "red"),
            Err(Error::KeyAlreadyExists { .. })
        ));
        assert_eq!(registry.get_key_value(id, "color").unwrap(), "blue");
        registry.remove_key(id, "color").unwrap();
        assert!(matches!(
            registry.get_key_value(id, "color"),
            Err(Error::UndefinedKey { .. })
        ));
        assert!(matches!(
            registry.remove_key(id, "color"),
            Err(Error::UndefinedKey { .. })
        ));

        settle().await;
        let keys: Vec<(String, KeyStatus)> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                Event::KeyValue(k) => Some((k.value, k.status)),
                _ => None,
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                ("blue".to_string(), KeyStatus::Stored),
                ("blue".to_string(), KeyStatus::Removed)
            ]
        );
    }

    #[tokio::test]
    async fn test_ports() {
        let (registry, _events) = registry_with_events(10).await;
        let a = registry.attach_unmanaged("a", None).unwrap();
        let b = registry.attach_unmanaged("b", None).unwrap();

        assert_eq!(registry.request_port(a, "x").unwrap(), 9000);
        assert_eq!(registry.request_port(a, "x").unwrap(), 9000);
        assert_eq!(registry.request_port(b, "y").unwrap(), 9001);
        assert_eq!(registry.get_port(b, "y").unwrap(), 9001);

        registry.set_port_unavailable(9000).unwrap();
        assert!(matches!(
            registry.get_port(a, "x"),
            Err(Error::UndefinedKey { .. })
        ));
        assert_eq!(registry.request_port(a, "x").unwrap(), 9002);

        registry.release_port(b, "y").unwrap();
        assert_eq!(registry.request_port(b, "z").unwrap(), 9001);

        let listed: Vec<(u16, String)> = registry
            .ports()
            .unwrap()
            .into_iter()
            .map(|p| (p.port, p.owner_name))
            .collect();
        assert_eq!(listed, vec![(9001, "b".into()), (9002, "a".into())]);
    }

    #[tokio::test]
    async fn test_publishers() {
        let (registry, _events) = registry_with_events(10).await;
        let id = registry.attach_unmanaged("pub", None).unwrap();

        assert!(matches!(
            registry.register_publisher(id, "frames", 2),
            Err(Error::UndefinedKey { .. })
        ));
        let port = registry
            .request_port(id, &publisher_port_name("frames"))
            .unwrap();
        registry.register_publisher(id, "frames", 2).unwrap();
        assert!(matches!(
            registry.register_publisher(id, "frames", 2),
            Err(Error::KeyAlreadyExists { .. })
        ));

        let info = registry.get_publisher(id, "frames").unwrap();
        assert_eq!(info.port, port);
        assert_eq!(info.subscribers, 2);

        registry.unregister_publisher(id, "frames").unwrap();
        assert!(registry.get_publisher(id, "frames").is_err());
    }

    #[tokio::test]
    async fn test_set_result_and_queries() {
        let (registry, mut events) = registry_with_events(10).await;
        let id = registry.attach_unmanaged("calc", None).unwrap();
        registry.set_result(id, b"42".to_vec()).unwrap();
        assert!(matches!(
            registry.set_result(77, vec![]),
            Err(Error::NotFound { id: 77 })
        ));

        assert!(registry.is_alive(id));
        assert!(!registry.is_alive(77));
        assert_eq!(registry.connect("calc").unwrap().len(), 1);
        assert!(registry.connect("other").unwrap().is_empty());
        assert_eq!(registry.list().unwrap().len(), 1);
        assert_eq!(registry.live_ids(), vec![id]);

        settle().await;
        assert!(drain(&mut events)
            .iter()
            .any(|e| matches!(e, Event::Result(r) if r.data == b"42")));
    }
}
