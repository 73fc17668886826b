//! Connection to one cameo server
//!
//! A [`Server`] owns the request session and the event dispatch task.
//! Handles created from it ([`Instance`], [`KeyValueGetter`], ...) keep
//! the connection alive; it closes when the last one is dropped.
//!
//! [`KeyValueGetter`]: crate::KeyValueGetter

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cameo_core::prelude::*;
use cameo_core::{
    topics, ApplicationSummary, Endpoint, InstanceInfo, InstanceStatus, PortInfo, Request,
    Response, State, StateSet, TcpTransport, Transport,
};

use crate::dispatch::Dispatcher;
use crate::instance::Instance;
use crate::listener::{Delivery, EventListener, ListenerSet, Popped, Until};
use crate::session::RequestSession;
use crate::waiting::WaitingSet;

struct ServerInner<T: Transport> {
    session: RequestSession<T>,
    event_endpoint: Endpoint,
    listeners: ListenerSet,
    waitings: WaitingSet,
    dispatcher: Dispatcher,
}

/// Handle on a server connection. Cheap to clone.
pub struct Server<T: Transport = TcpTransport> {
    inner: Arc<ServerInner<T>>,
}

impl<T: Transport> Clone for Server<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", self.inner.session.endpoint())
            .field("event_endpoint", &self.inner.event_endpoint)
            .field("listeners", &self.inner.listeners)
            .finish()
    }
}

impl Server<TcpTransport> {
    /// Connect over TCP with no request timeout.
    pub async fn connect_tcp(endpoint: Endpoint) -> Result<Self> {
        Self::with_transport(TcpTransport::default(), endpoint, None).await
    }
}

impl<T: Transport> Server<T> {
    /// Connect through `transport`. `timeout` is the default request timeout; `None` or zero waits forever.
    pub async fn with_transport(
        transport: T,
        endpoint: Endpoint,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        Self::with_waitings(transport, endpoint, timeout, WaitingSet::new()).await
    }

    /// Connect and register every handle in an existing [`WaitingSet`].
    pub async fn with_waitings(
        transport: T,
        endpoint: Endpoint,
        timeout: Option<Duration>,
        waitings: WaitingSet,
    ) -> Result<Self> {
        let session = RequestSession::new(transport.clone(), endpoint, timeout);

        let event_endpoint: Endpoint = match session.request(Request::EventEndpoint).await? {
            Response::Endpoint { endpoint } => endpoint.parse()?,
            other => return Err(other.unexpected("endpoint")),
        };
        let subscription = transport.subscribe(&event_endpoint, &topics::ALL).await?;
        info!(
            "Connected to {}, events from {}",
            session.endpoint(),
            event_endpoint
        );

        let listeners = ListenerSet::new();
        let dispatcher = Dispatcher::spawn(subscription, listeners.clone());

        Ok(Self {
            inner: Arc::new(ServerInner {
                session,
                event_endpoint,
                listeners,
                waitings,
                dispatcher,
            }),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.inner.session.endpoint()
    }

    pub fn event_endpoint(&self) -> &Endpoint {
        &self.inner.event_endpoint
    }

    pub fn session(&self) -> &RequestSession<T> {
        &self.inner.session
    }

    pub fn transport(&self) -> &T {
        self.inner.session.transport()
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.inner.listeners
    }

    pub fn waitings(&self) -> &WaitingSet {
        &self.inner.waitings
    }

    /// Whether the event stream is still being read.
    pub fn is_connected(&self) -> bool {
        !self.inner.dispatcher.is_finished()
    }

    /// Stop the dispatch task. Blocked waits on this connection return `Canceled`.
    pub fn terminate(&self) {
        self.inner.dispatcher.cancel();
    }

    // ─────────────────────────────────────────────────────────────
    // Instances
    // ─────────────────────────────────────────────────────────────

    /// Start a new instance of `name`.
    ///
    /// Its listener is registered before the request is sent, so even the
    /// first transitions are observed.
    pub async fn start(&self, name: &str, args: Vec<String>) -> Result<Instance<T>> {
        let listener = self.inner.listeners.register(Some(name));
        let request = Request::Start {
            name: name.to_string(),
            args,
        };
        let id = match self.inner.session.request(request).await? {
            Response::Id { id } => id,
            other => return Err(other.unexpected("id")),
        };
        debug!("Started #{} {}", id, name);
        Ok(Instance::new(
            self.clone(),
            listener,
            id,
            name,
            State::Starting,
            StateSet::from(State::Starting),
        ))
    }

    /// Connect to the first live instance of `name`, if any.
    pub async fn connect(&self, name: &str) -> Result<Option<Instance<T>>> {
        let listener = self.inner.listeners.register(Some(name));
        let instances = self.connect_request(name).await?;
        Ok(instances
            .into_iter()
            .next()
            .map(|info| self.instance_from(listener, info)))
    }

    /// Connect to every live instance of `name`.
    pub async fn connect_all(&self, name: &str) -> Result<Vec<Instance<T>>> {
        // Catches what is dispatched before the per-instance listeners exist.
        let collector = self.inner.listeners.register(Some(name));
        let infos = self.connect_request(name).await?;
        Ok(self.adopt(collector, name, infos).await)
    }

    /// Build one instance per snapshot entry, then fold in the events `collector` queued meanwhile.
    pub(crate) async fn adopt(
        &self,
        collector: EventListener,
        name: &str,
        infos: Vec<InstanceInfo>,
    ) -> Vec<Instance<T>> {
        let instances: Vec<_> = infos
            .into_iter()
            .map(|info| {
                let listener = self.inner.listeners.register(Some(name));
                self.instance_from(listener, info)
            })
            .collect();

        // Anything dispatched after this point is also in the instances' own queues.
        while let Popped::Delivery(delivery) = collector.pop(Until::Now).await {
            if let Delivery::Event(event) = delivery {
                if let Some(instance) = instances.iter().find(|i| i.id() == event.id()) {
                    instance.absorb(&event);
                }
            }
        }
        instances
    }

    pub async fn connect_with_id(&self, id: i32) -> Result<Instance<T>> {
        // The name is unknown until the reply arrives; tracking the id then narrows the filter.
        let listener = self.inner.listeners.register(None);
        let info = match self
            .inner
            .session
            .request(Request::ConnectWithId { id })
            .await?
        {
            Response::Instances { mut instances } if !instances.is_empty() => instances.remove(0),
            other => return Err(other.unexpected("instances")),
        };
        Ok(self.instance_from(listener, info))
    }

    async fn connect_request(&self, name: &str) -> Result<Vec<InstanceInfo>> {
        match self
            .inner
            .session
            .request(Request::Connect {
                name: name.to_string(),
            })
            .await?
        {
            Response::Instances { instances } => Ok(instances),
            other => Err(other.unexpected("instances")),
        }
    }

    fn instance_from(&self, listener: EventListener, info: InstanceInfo) -> Instance<T> {
        Instance::new(
            self.clone(),
            listener,
            info.id,
            &info.name,
            info.state,
            info.past_states,
        )
    }

    // ─────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────

    pub async fn apps(&self) -> Result<Vec<ApplicationSummary>> {
        match self.inner.session.request(Request::Apps).await? {
            Response::Configs { configs } => Ok(configs),
            other => Err(other.unexpected("configs")),
        }
    }

    pub async fn list(&self) -> Result<Vec<InstanceInfo>> {
        match self.inner.session.request(Request::List).await? {
            Response::Instances { instances } => Ok(instances),
            other => Err(other.unexpected("instances")),
        }
    }

    pub async fn is_alive(&self, id: i32) -> Result<bool> {
        match self.inner.session.request(Request::IsAlive { id }).await? {
            Response::Bool { value } => Ok(value),
            other => Err(other.unexpected("bool")),
        }
    }

    pub async fn status(&self, id: i32) -> Result<InstanceStatus> {
        match self.inner.session.request(Request::GetStatus { id }).await? {
            Response::Status(status) => Ok(status),
            other => Err(other.unexpected("status")),
        }
    }

    pub async fn ports(&self) -> Result<Vec<PortInfo>> {
        match self.inner.session.request(Request::Ports).await? {
            Response::Ports { ports } => Ok(ports),
            other => Err(other.unexpected("ports")),
        }
    }

    pub async fn version(&self) -> Result<String> {
        match self.inner.session.request(Request::Version).await? {
            Response::Version { version } => Ok(version),
            other => Err(other.unexpected("version")),
        }
    }

    pub async fn stop(&self, id: i32) -> Result<()> {
        self.inner.session.request_ok(Request::Stop { id }).await
    }

    pub async fn kill(&self, id: i32) -> Result<()> {
        self.inner.session.request_ok(Request::Kill { id }).await
    }
}
