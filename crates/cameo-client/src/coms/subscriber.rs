//! Receiving side of a data stream

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cameo_core::prelude::*;
use cameo_core::{PublisherInfo, Subscription, Transport};

use super::{DATA_TOPIC, END_TOPIC};
use crate::instance::Instance;
use crate::waiting::{Cancelable, WaitingGuard};

struct SubscriberInner {
    publisher: PublisherInfo,
    publisher_name: String,
    subscription: tokio::sync::Mutex<Option<Subscription>>,
    token: CancellationToken,
    ended: AtomicBool,
}

impl Cancelable for SubscriberInner {
    fn cancel(&self) {
        self.token.cancel();
    }

    fn terminate(&self) {
        self.token.cancel();
        if let Ok(mut subscription) = self.subscription.try_lock() {
            subscription.take();
        }
    }
}

/// Subscription to a publisher of another instance.
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
    _waiting: WaitingGuard,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("publisher", &self.inner.publisher_name)
            .field("instance", &self.inner.publisher.id)
            .field("port", &self.inner.publisher.port)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Subscriber {
    /// Wait up to `timeout` (`None` or zero: forever) for `instance` to register `publisher_name`, then subscribe.
    pub async fn create<T: Transport>(
        instance: &Instance<T>,
        publisher_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let publisher = instance
            .wait_for_publisher(publisher_name, timeout)
            .await?
            .into_result()?;
        let server = instance.server();
        let endpoint = server.endpoint().with_port(publisher.port);
        let subscription = server
            .transport()
            .subscribe(&endpoint, &[DATA_TOPIC, END_TOPIC])
            .await?;
        debug!(
            "Subscribed to '{}' of #{} at {}",
            publisher_name, publisher.id, endpoint
        );

        let inner = Arc::new(SubscriberInner {
            publisher,
            publisher_name: publisher_name.to_string(),
            subscription: tokio::sync::Mutex::new(Some(subscription)),
            token: CancellationToken::new(),
            ended: AtomicBool::new(false),
        });
        let waiting = server.waitings().register(&inner);
        Ok(Self {
            inner,
            _waiting: waiting,
        })
    }

    pub fn publisher(&self) -> &PublisherInfo {
        &self.inner.publisher
    }

    /// The publisher sent its end or went away.
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Next message; `None` once the stream ended or the subscriber was canceled.
    pub async fn receive(&self) -> Option<Vec<u8>> {
        if self.is_ended() {
            return None;
        }
        let mut slot = self.inner.subscription.lock().await;
        let subscription = slot.as_mut()?;
        loop {
            let frame = tokio::select! {
                _ = self.inner.token.cancelled() => return None,
                frame = subscription.recv() => frame,
            };
            match frame {
                Some(frame) if frame.topic == DATA_TOPIC => return Some(frame.payload),
                Some(frame) if frame.topic != END_TOPIC => {
                    trace!("Ignoring frame on '{}'", frame.topic);
                }
                _ => break,
            }
        }

        debug!("Stream '{}' ended", self.inner.publisher_name);
        self.inner.ended.store(true, Ordering::SeqCst);
        slot.take();
        None
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}
