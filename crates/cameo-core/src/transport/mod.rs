//! Messaging substrate
//!
//! The rest of the system only needs four things from a transport:
//! a one-shot request/reply exchange, a topic-filtered subscription to a
//! broadcast stream, and the two matching bind operations. [`Transport`]
//! captures exactly that; [`MemoryTransport`] and [`TcpTransport`] provide it.

mod memory;
mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

use std::fmt;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Capacity of each publisher's broadcast ring.
pub const PUBLISHER_CAPACITY: usize = 1024;

/// Queue depth between an accepting responder and its owner.
const RESPONDER_QUEUE: usize = 64;

#[trait_variant::make(Transport: Send)]
pub trait LocalTransport: Clone + Send + Sync + 'static {
    /// Open a fresh channel to `endpoint`, send one message and wait for one reply.
    ///
    /// `None` waits forever. The channel is released on every path.
    async fn request(
        &self,
        endpoint: &Endpoint,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>>;

    /// Subscribe to the broadcast stream at `endpoint`. An empty filter receives every topic.
    ///
    /// Returns once the publisher has registered the subscription: every
    /// frame published afterwards is delivered.
    async fn subscribe(&self, endpoint: &Endpoint, topics: &[&str]) -> Result<Subscription>;

    async fn bind_responder(&self, endpoint: &Endpoint) -> Result<ResponderBinding>;

    async fn bind_publisher(&self, endpoint: &Endpoint) -> Result<PublisherBinding>;
}

/// One message on a broadcast stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    fn matches(&self, topics: &[String]) -> bool {
        topics.is_empty() || topics.iter().any(|t| *t == self.topic)
    }
}

/// Aborts a background task when dropped.
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs a release action exactly once, when dropped.
pub(crate) struct Unbind(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Unbind {
    pub(crate) fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub(crate) fn none() -> Self {
        Self(None)
    }
}

impl Drop for Unbind {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Receiving side of a broadcast subscription.
///
/// Yields frames in publish order; `None` once the publisher is gone.
/// Dropping it releases the underlying connection.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Frame>,
    _task: TaskGuard,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Frame>, task: TaskGuard) -> Self {
        Self { rx, _task: task }
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// A frame that has already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// A request received by a bound responder.
pub struct Incoming {
    pub payload: Vec<u8>,
    reply_tx: oneshot::Sender<Vec<u8>>,
}

impl Incoming {
    pub(crate) fn new(payload: Vec<u8>) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (Self { payload, reply_tx }, reply_rx)
    }

    /// Send the single reply. Fails if the requester already gave up.
    pub fn reply(self, payload: Vec<u8>) -> Result<()> {
        self.reply_tx
            .send(payload)
            .map_err(|_| Error::channel_send("requester is gone"))
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A bound request endpoint. Dropping it unbinds the endpoint.
pub struct ResponderBinding {
    endpoint: Endpoint,
    rx: mpsc::Receiver<Incoming>,
    _task: Option<TaskGuard>,
    _unbind: Unbind,
}

impl ResponderBinding {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Next incoming request, or `None` once the binding is closed.
    pub async fn recv(&mut self) -> Option<Incoming> {
        self.rx.recv().await
    }
}

impl fmt::Debug for ResponderBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponderBinding")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// A bound broadcast endpoint. Dropping it ends every subscription.
pub struct PublisherBinding {
    endpoint: Endpoint,
    tx: broadcast::Sender<Frame>,
    _task: Option<TaskGuard>,
    _unbind: Unbind,
}

impl PublisherBinding {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Publish a frame to every current subscriber.
    ///
    /// Returns the number of subscribers it was queued for; frames published
    /// while nobody is subscribed are dropped.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> usize {
        self.tx.send(Frame::new(topic, payload)).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl fmt::Debug for PublisherBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherBinding")
            .field("endpoint", &self.endpoint)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Forward frames matching `topics` from a broadcast receiver until either side closes.
pub(crate) async fn forward_frames(
    mut rx: broadcast::Receiver<Frame>,
    tx: mpsc::UnboundedSender<Frame>,
    topics: Vec<String>,
) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if frame.matches(&topics) && tx.send(frame).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Subscriber lagged, {} frames dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
