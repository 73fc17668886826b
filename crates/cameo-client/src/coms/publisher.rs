//! Publishing side of a data stream

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cameo_core::prelude::*;
use cameo_core::{publisher_port_name, PublisherBinding, Request, TcpTransport, Transport};

use super::{bind_named_port, DATA_TOPIC, END_TOPIC};
use crate::server::Server;
use crate::session::effective_timeout;
use crate::this::This;
use crate::waiting::{Cancelable, Waited, WaitingGuard};

/// Interval between two subscriber counts.
const SUBSCRIBER_POLL: Duration = Duration::from_millis(10);

struct PublisherInner<T: Transport> {
    id: i32,
    name: String,
    server: Server<T>,
    binding: PublisherBinding,
    subscribers: u32,
    token: CancellationToken,
    terminated: AtomicBool,
}

impl<T: Transport> Cancelable for PublisherInner<T> {
    fn cancel(&self) {
        self.token.cancel();
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.token.cancel();
    }
}

/// A named publisher owned by the current instance.
pub struct Publisher<T: Transport = TcpTransport> {
    inner: Arc<PublisherInner<T>>,
    _waiting: WaitingGuard,
}

impl<T: Transport> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("name", &self.inner.name)
            .field("binding", &self.inner.binding)
            .field("subscribers", &self.inner.subscribers)
            .finish()
    }
}

impl<T: Transport> Publisher<T> {
    /// Bind the publisher `name` and register it, expecting `subscribers` subscribers.
    pub async fn create(this: &This<T>, name: &str, subscribers: u32) -> Result<Self> {
        let existing = this
            .server()
            .session()
            .request(Request::GetPublisher {
                id: this.id(),
                name: name.to_string(),
            })
            .await;
        match existing {
            Ok(_) => return Err(Error::key_exists(name)),
            Err(Error::UndefinedKey { .. }) => {}
            Err(e) => return Err(e),
        }

        let transport = this.server().transport();
        let (port, binding) =
            bind_named_port(this, &publisher_port_name(name), |endpoint| async move {
                transport.bind_publisher(&endpoint).await
            })
            .await?;

        this.server()
            .session()
            .request_ok(Request::RegisterPublisher {
                id: this.id(),
                name: name.to_string(),
                subscribers,
            })
            .await?;
        info!("Publisher '{}' of #{} on port {}", name, this.id(), port);

        let inner = Arc::new(PublisherInner {
            id: this.id(),
            name: name.to_string(),
            server: this.server().clone(),
            binding,
            subscribers,
            token: CancellationToken::new(),
            terminated: AtomicBool::new(false),
        });
        let waiting = this.server().waitings().register(&inner);
        Ok(Self {
            inner,
            _waiting: waiting,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn port(&self) -> u16 {
        self.inner.binding.endpoint().port()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.binding.subscriber_count()
    }

    /// Wait until the expected number of subscribers are connected.
    ///
    /// Once canceled, this and every later call return `Canceled`.
    pub async fn wait_for_subscribers(&self, timeout: Option<Duration>) -> Waited<()> {
        let expected = self.inner.subscribers as usize;
        let deadline = effective_timeout(timeout).map(|t| Instant::now() + t);
        loop {
            if self.inner.token.is_cancelled() {
                return Waited::Canceled;
            }
            if self.subscriber_count() >= expected {
                return Waited::Done(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Waited::TimedOut;
            }
            tokio::select! {
                _ = self.inner.token.cancelled() => return Waited::Canceled,
                _ = tokio::time::sleep(SUBSCRIBER_POLL) => {}
            }
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<usize> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        Ok(self.inner.binding.publish(topic, payload))
    }

    /// Publish one message; returns how many subscribers it was queued for.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<usize> {
        self.publish(DATA_TOPIC, data.into())
    }

    /// Tell subscribers the stream is over.
    pub fn send_end(&self) -> Result<usize> {
        self.publish(END_TOPIC, Vec::new())
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Unregister the publisher and give its port back.
    pub async fn terminate(&self) {
        self.inner.terminate();
        let inner = &self.inner;
        let session = inner.server.session();
        let unregister = Request::UnregisterPublisher {
            id: inner.id,
            name: inner.name.clone(),
        };
        if let Err(e) = session.request_ok(unregister).await {
            warn!("Failed to unregister publisher '{}': {}", inner.name, e);
        }
        let release = Request::ReleasePort {
            id: inner.id,
            name: publisher_port_name(&inner.name),
        };
        if let Err(e) = session.request_ok(release).await {
            warn!("Failed to release port of publisher '{}': {}", inner.name, e);
        }
    }
}
