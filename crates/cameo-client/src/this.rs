//! The current process as a cameo instance
//!
//! A process launched by the server finds its identity in the environment
//! (`CAMEO_ID`, `CAMEO_NAME`, `CAMEO_SERVER`). A process started by other
//! means attaches itself by name and is then unmanaged: it detaches when it
//! terminates.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

use cameo_core::messages::env;
use cameo_core::prelude::*;
use cameo_core::{Endpoint, Event, Request, Response, State, TcpTransport, Transport};

use crate::listener::{Delivery, Popped, Until};
use crate::server::Server;

/// Handle on the current process's own instance.
pub struct This<T: Transport = TcpTransport> {
    id: i32,
    name: String,
    managed: bool,
    server: Server<T>,
    stop_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> fmt::Debug for This<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("This")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("managed", &self.managed)
            .field("server", self.server.endpoint())
            .finish()
    }
}

impl This<TcpTransport> {
    /// Identity from the environment, connected over TCP.
    pub async fn init() -> Result<Self> {
        Self::from_env(TcpTransport::default()).await
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::config(format!("{key} is not set")))
}

impl<T: Transport> This<T> {
    /// Identity from the variables the server sets for the processes it launches.
    pub async fn from_env(transport: T) -> Result<Self> {
        let id: i32 = env_var(env::ID)?
            .parse()
            .map_err(|e| Error::config(format!("invalid {}: {e}", env::ID)))?;
        let name = env_var(env::NAME)?;
        let endpoint: Endpoint = env_var(env::SERVER)?.parse()?;
        Self::managed(transport, endpoint, id, &name).await
    }

    /// A process launched by the server as instance `id`.
    pub async fn managed(transport: T, endpoint: Endpoint, id: i32, name: &str) -> Result<Self> {
        let server = Server::with_transport(transport, endpoint, None).await?;
        info!("Initialized as #{} {} (managed)", id, name);
        Ok(Self::with_server(server, id, name, true))
    }

    /// Register this process with the server under `name`.
    pub async fn attach(transport: T, endpoint: Endpoint, name: &str) -> Result<Self> {
        let server = Server::with_transport(transport, endpoint, None).await?;
        let request = Request::AttachUnmanaged {
            name: name.to_string(),
            pid: Some(std::process::id()),
        };
        let id = match server.session().request(request).await? {
            Response::Id { id } => id,
            other => return Err(other.unexpected("id")),
        };
        info!("Attached as #{} {} (unmanaged)", id, name);
        Ok(Self::with_server(server, id, name, false))
    }

    fn with_server(server: Server<T>, id: i32, name: &str, managed: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            managed,
            server,
            stop_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn server(&self) -> &Server<T> {
        &self.server
    }

    /// Report that initialization is done. False if the instance is past STARTING/RUNNING.
    pub async fn set_running(&self) -> Result<bool> {
        let request = Request::SetStatus {
            id: self.id,
            state: State::Running,
        };
        match self.server.session().request(request).await? {
            Response::Bool { value } => Ok(value),
            other => Err(other.unexpected("bool")),
        }
    }

    pub async fn set_result(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.server
            .session()
            .request_ok(Request::SetResult {
                id: self.id,
                data: data.into(),
            })
            .await
    }

    pub async fn store_key_value(&self, key: &str, value: &str) -> Result<()> {
        self.server
            .session()
            .request_ok(Request::StoreKeyValue {
                id: self.id,
                key: key.to_string(),
                value: value.to_string(),
            })
            .await
    }

    pub async fn get_key_value(&self, key: &str) -> Result<String> {
        let request = Request::GetKeyValue {
            id: self.id,
            key: key.to_string(),
        };
        match self.server.session().request(request).await? {
            Response::Value { value } => Ok(value),
            other => Err(other.unexpected("value")),
        }
    }

    pub async fn remove_key(&self, key: &str) -> Result<()> {
        self.server
            .session()
            .request_ok(Request::RemoveKey {
                id: self.id,
                key: key.to_string(),
            })
            .await
    }

    /// Port assigned to this instance under `name`; the same port on every call.
    pub async fn request_port(&self, name: &str) -> Result<u16> {
        let request = Request::RequestPort {
            id: self.id,
            name: name.to_string(),
        };
        match self.server.session().request(request).await? {
            Response::Port { port } => Ok(port),
            other => Err(other.unexpected("port")),
        }
    }

    pub async fn release_port(&self, name: &str) -> Result<()> {
        self.server
            .session()
            .request_ok(Request::ReleasePort {
                id: self.id,
                name: name.to_string(),
            })
            .await
    }

    /// Mark `port` as taken by something outside cameo.
    pub async fn set_port_unavailable(&self, port: u16) -> Result<()> {
        self.server
            .session()
            .request_ok(Request::SetPortUnavailable { port })
            .await
    }

    /// Handle stop requests: the server moves the instance to STOPPING and
    /// allows `stopping_time` (zero: the application default) before killing it.
    ///
    /// `handler` runs once, on the runtime, when this instance's STOPPING
    /// status arrives. It should only signal the rest of the program.
    pub async fn handle_stop<F>(&self, stopping_time: Duration, handler: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        // Listen before the server knows about the handler so STOPPING cannot be missed.
        let listener = self.server.listeners().register(Some(&self.name));
        listener.track(self.id);

        self.server
            .session()
            .request_ok(Request::SetStopHandler {
                id: self.id,
                stopping_time_ms: u64::try_from(stopping_time.as_millis()).unwrap_or(u64::MAX),
            })
            .await?;

        let id = self.id;
        let task = tokio::spawn(async move {
            loop {
                match listener.pop(Until::Forever).await {
                    Popped::Delivery(Delivery::Event(Event::Status(status))) if status.id == id => {
                        if status.state == State::Stopping {
                            debug!("#{} STOPPING, running stop handler", id);
                            handler();
                            return;
                        }
                        if status.state.is_terminal() {
                            return;
                        }
                    }
                    Popped::Delivery(_) => {}
                    Popped::Empty | Popped::TimedOut | Popped::Closed => return,
                }
            }
        });

        let mut slot = self
            .stop_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Cancel every blocking wait of this process.
    pub fn cancel_waitings(&self) {
        self.server.waitings().cancel_all();
    }

    /// Release everything this process holds. An unmanaged instance detaches from the server.
    pub async fn terminate(&self) {
        self.server.waitings().terminate_all();

        if let Some(task) = self
            .stop_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }

        if !self.managed {
            let request = Request::DetachUnmanaged { id: self.id };
            if let Err(e) = self.server.session().request_ok(request).await {
                warn!("Failed to detach #{} {}: {}", self.id, self.name, e);
            }
        }
        self.server.terminate();
    }
}

impl<T: Transport> Drop for This<T> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.stop_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
