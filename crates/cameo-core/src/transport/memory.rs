//! In-process transport
//!
//! Endpoints live in a shared hub. Cloning a [`MemoryTransport`] shares the
//! hub, so a server and any number of clients in one process can talk to each
//! other without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use super::{
    forward_frames, Frame, Incoming, PublisherBinding, ResponderBinding, Subscription, TaskGuard,
    Transport, Unbind, PUBLISHER_CAPACITY, RESPONDER_QUEUE,
};
use crate::endpoint::Endpoint;
use crate::prelude::*;

#[derive(Default)]
struct Hub {
    responders: Mutex<HashMap<Endpoint, mpsc::Sender<Incoming>>>,
    publishers: Mutex<HashMap<Endpoint, broadcast::Sender<Frame>>>,
    channels_opened: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("channels_opened", &self.channels_opened())
            .finish()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of request channels opened so far.
    pub fn channels_opened(&self) -> u64 {
        self.hub.channels_opened.load(Ordering::SeqCst)
    }

    fn responder(&self, endpoint: &Endpoint) -> Result<mpsc::Sender<Incoming>> {
        let responders = self
            .hub
            .responders
            .lock()
            .map_err(|_| Error::transport("responder table poisoned"))?;
        responders
            .get(endpoint)
            .filter(|tx| !tx.is_closed())
            .cloned()
            .ok_or_else(|| Error::transport(format!("nothing bound at {endpoint}")))
    }
}

impl Transport for MemoryTransport {
    async fn request(
        &self,
        endpoint: &Endpoint,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let id = self.hub.channels_opened.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Opening channel #{} to {}", id, endpoint);

        let responder = self.responder(endpoint)?;
        let (incoming, reply_rx) = Incoming::new(payload);

        let exchange = async move {
            responder
                .send(incoming)
                .await
                .map_err(|_| Error::transport(format!("{endpoint} closed")))?;
            reply_rx.await.map_err(|_| Error::ChannelClosed)
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| Error::connection_timeout(endpoint, limit))?,
            None => exchange.await,
        }
    }

    async fn subscribe(&self, endpoint: &Endpoint, topics: &[&str]) -> Result<Subscription> {
        let rx = {
            let publishers = self
                .hub
                .publishers
                .lock()
                .map_err(|_| Error::transport("publisher table poisoned"))?;
            publishers
                .get(endpoint)
                .map(broadcast::Sender::subscribe)
                .ok_or_else(|| Error::transport(format!("no publisher at {endpoint}")))?
        };

        let (tx, frames) = mpsc::unbounded_channel();
        let topics = topics.iter().map(|t| t.to_string()).collect();
        let task = TaskGuard::spawn(forward_frames(rx, tx, topics));
        Ok(Subscription::new(frames, task))
    }

    async fn bind_responder(&self, endpoint: &Endpoint) -> Result<ResponderBinding> {
        let (tx, rx) = mpsc::channel(RESPONDER_QUEUE);
        {
            let mut responders = self
                .hub
                .responders
                .lock()
                .map_err(|_| Error::transport("responder table poisoned"))?;
            if responders.get(endpoint).is_some_and(|tx| !tx.is_closed()) {
                return Err(Error::transport(format!("{endpoint} already bound")));
            }
            responders.insert(endpoint.clone(), tx);
        }
        debug!("Bound responder at {}", endpoint);

        let hub = Arc::clone(&self.hub);
        let key = endpoint.clone();
        Ok(ResponderBinding {
            endpoint: endpoint.clone(),
            rx,
            _task: None,
            _unbind: Unbind::new(move || {
                if let Ok(mut responders) = hub.responders.lock() {
                    responders.remove(&key);
                }
            }),
        })
    }

    async fn bind_publisher(&self, endpoint: &Endpoint) -> Result<PublisherBinding> {
        let (tx, _) = broadcast::channel(PUBLISHER_CAPACITY);
        {
            let mut publishers = self
                .hub
                .publishers
                .lock()
                .map_err(|_| Error::transport("publisher table poisoned"))?;
            if publishers.contains_key(endpoint) {
                return Err(Error::transport(format!("{endpoint} already bound")));
            }
            publishers.insert(endpoint.clone(), tx.clone());
        }
        debug!("Bound publisher at {}", endpoint);

        let hub = Arc::clone(&self.hub);
        let key = endpoint.clone();
        Ok(PublisherBinding {
            endpoint: endpoint.clone(),
            tx,
            _task: None,
            _unbind: Unbind::new(move || {
                if let Ok(mut publishers) = hub.publishers.lock() {
                    publishers.remove(&key);
                }
            }),
        })
    }
}
