//! Requesting side of a request/reply channel
//!
//! A request that times out leaves the requester out of sync: the reply
//! may still arrive on the abandoned channel. Every later request fails
//! with `Resync` until [`Requester::resync`] has looked the responder up again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cameo_core::prelude::*;
use cameo_core::{responder_port_name, Request, Response, TcpTransport, Transport};

use crate::instance::Instance;
use crate::session::RequestSession;
use crate::waiting::{Cancelable, WaitingGuard};

struct RequesterInner<T: Transport> {
    instance: Instance<T>,
    responder_name: String,
    session: Mutex<RequestSession<T>>,
    out_of_sync: AtomicBool,
    token: CancellationToken,
}

impl<T: Transport> Cancelable for RequesterInner<T> {
    fn cancel(&self) {
        self.token.cancel();
    }

    fn terminate(&self) {
        self.token.cancel();
    }
}

impl<T: Transport> RequesterInner<T> {
    fn session(&self) -> MutexGuard<'_, RequestSession<T>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A session to `port` on the host of `instance`'s server.
fn session_to<T: Transport>(instance: &Instance<T>, port: u16) -> RequestSession<T> {
    let server = instance.server();
    RequestSession::new(
        server.transport().clone(),
        server.endpoint().with_port(port),
        None,
    )
}

/// Sends requests to a responder of another instance.
pub struct Requester<T: Transport = TcpTransport> {
    inner: Arc<RequesterInner<T>>,
    _waiting: WaitingGuard,
}

impl<T: Transport> fmt::Debug for Requester<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("responder", &self.inner.responder_name)
            .field("instance", &self.inner.instance.id())
            .field("endpoint", self.inner.session().endpoint())
            .field("out_of_sync", &self.is_out_of_sync())
            .finish()
    }
}

impl<T: Transport> Requester<T> {
    /// Wait up to `timeout` (`None` or zero: forever) for `instance` to bind `responder_name`.
    pub async fn create(
        instance: &Instance<T>,
        responder_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let port = instance
            .wait_for_responder(responder_name, timeout)
            .await?
            .into_result()?;

        let inner = Arc::new(RequesterInner {
            instance: instance.clone(),
            responder_name: responder_name.to_string(),
            session: Mutex::new(session_to(instance, port)),
            out_of_sync: AtomicBool::new(false),
            token: CancellationToken::new(),
        });
        debug!(
            "Requester to '{}' of #{} on port {}",
            responder_name,
            instance.id(),
            port
        );
        let waiting = instance.server().waitings().register(&inner);
        Ok(Self {
            inner,
            _waiting: waiting,
        })
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.inner.out_of_sync.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Send one request and wait up to `timeout` (`None` or zero: forever) for the reply.
    pub async fn request(
        &self,
        data: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        if self.is_out_of_sync() {
            return Err(Error::Resync);
        }
        if self.is_canceled() {
            return Err(Error::Canceled);
        }

        let session = self.inner.session().clone();
        let reply = tokio::select! {
            _ = self.inner.token.cancelled() => return Err(Error::Canceled),
            reply = session.send(data.into(), timeout) => reply,
        };
        if let Err(e @ Error::ConnectionTimeout { .. }) = &reply {
            warn!(
                "Request to '{}' timed out, resync needed: {}",
                self.inner.responder_name, e
            );
            self.inner.out_of_sync.store(true, Ordering::SeqCst);
        }
        reply
    }

    /// Look the responder up again and continue on a fresh channel.
    pub async fn resync(&self) -> Result<()> {
        let instance = &self.inner.instance;
        let request = Request::GetPort {
            id: instance.id(),
            name: responder_port_name(&self.inner.responder_name),
        };
        let port = match instance.server().session().request(request).await? {
            Response::Port { port } => port,
            other => return Err(other.unexpected("port")),
        };

        *self.inner.session() = session_to(instance, port);
        self.inner.out_of_sync.store(false, Ordering::SeqCst);
        info!(
            "Requester to '{}' resynchronized on port {}",
            self.inner.responder_name, port
        );
        Ok(())
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}
