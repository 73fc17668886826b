//! Answering side of a request/reply channel

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cameo_core::prelude::*;
use cameo_core::{
    responder_port_name, Incoming, Request as ServerRequest, ResponderBinding, TcpTransport,
    Transport,
};

use super::bind_named_port;
use crate::server::Server;
use crate::this::This;
use crate::waiting::{Cancelable, WaitingGuard};

/// One request received by a [`Responder`]. Answer it with [`reply`](Self::reply).
pub struct Request {
    incoming: Incoming,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("payload_len", &self.incoming.payload.len())
            .finish()
    }
}

impl Request {
    pub fn payload(&self) -> &[u8] {
        &self.incoming.payload
    }

    /// Send the single reply. Fails if the requester already gave up.
    pub fn reply(self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.incoming.reply(data.into())
    }
}

struct ResponderInner<T: Transport> {
    id: i32,
    name: String,
    server: Server<T>,
    binding: tokio::sync::Mutex<Option<ResponderBinding>>,
    token: CancellationToken,
}

impl<T: Transport> Cancelable for ResponderInner<T> {
    fn cancel(&self) {
        self.token.cancel();
    }

    fn terminate(&self) {
        self.token.cancel();
        if let Ok(mut binding) = self.binding.try_lock() {
            binding.take();
        }
    }
}

/// A named request endpoint owned by the current instance.
pub struct Responder<T: Transport = TcpTransport> {
    inner: Arc<ResponderInner<T>>,
    port: u16,
    _waiting: WaitingGuard,
}

impl<T: Transport> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("name", &self.inner.name)
            .field("port", &self.port)
            .finish()
    }
}

impl<T: Transport> Responder<T> {
    pub async fn create(this: &This<T>, name: &str) -> Result<Self> {
        let transport = this.server().transport();
        let (port, binding) =
            bind_named_port(this, &responder_port_name(name), |endpoint| async move {
                transport.bind_responder(&endpoint).await
            })
            .await?;
        info!("Responder '{}' of #{} on port {}", name, this.id(), port);

        let inner = Arc::new(ResponderInner {
            id: this.id(),
            name: name.to_string(),
            server: this.server().clone(),
            binding: tokio::sync::Mutex::new(Some(binding)),
            token: CancellationToken::new(),
        });
        let waiting = this.server().waitings().register(&inner);
        Ok(Self {
            inner,
            port,
            _waiting: waiting,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Next request; `None` once canceled or terminated.
    pub async fn receive(&self) -> Option<Request> {
        let mut slot = self.inner.binding.lock().await;
        let binding = slot.as_mut()?;
        tokio::select! {
            _ = self.inner.token.cancelled() => None,
            incoming = binding.recv() => incoming.map(|incoming| Request { incoming }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Unbind and give the port back.
    pub async fn terminate(&self) {
        self.inner.token.cancel();
        self.inner.binding.lock().await.take();
        let release = ServerRequest::ReleasePort {
            id: self.inner.id,
            name: responder_port_name(&self.inner.name),
        };
        if let Err(e) = self.inner.server.session().request_ok(release).await {
            warn!("Failed to release port of responder '{}': {}", self.inner.name, e);
        }
    }
}
