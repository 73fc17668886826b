//! Waiting for a key of another instance

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cameo_core::prelude::*;
use cameo_core::{Event, KeyStatus, Request, Response, TcpTransport, Transport};

use crate::listener::{Delivery, EventListener, Popped, Until, WaitMode};
use crate::server::Server;
use crate::session::effective_timeout;
use crate::waiting::{Cancelable, Waited, WaitingGuard};

struct GetterInner<T: Transport> {
    server: Server<T>,
    id: i32,
    key: String,
    listener: EventListener,
}

impl<T: Transport> Cancelable for GetterInner<T> {
    fn cancel(&self) {
        self.listener.cancel(self.id);
    }

    fn terminate(&self) {
        self.listener.unregister();
    }
}

/// Gets the value of one key, waiting for it to be stored if needed.
pub struct KeyValueGetter<T: Transport = TcpTransport> {
    inner: Arc<GetterInner<T>>,
    _waiting: WaitingGuard,
}

impl<T: Transport> fmt::Debug for KeyValueGetter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueGetter")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .finish()
    }
}

impl<T: Transport> KeyValueGetter<T> {
    pub(crate) fn new(server: Server<T>, id: i32, name: &str, key: &str) -> Self {
        let listener = server.listeners().register(Some(name));
        listener.track(id);
        let inner = Arc::new(GetterInner {
            id,
            key: key.to_string(),
            listener,
            server,
        });
        let waiting = inner.server.waitings().register(&inner);
        Self {
            inner,
            _waiting: waiting,
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Return the value, waiting up to `timeout` (`None` or zero: forever) for it to be stored.
    ///
    /// Fails with `UndefinedKey` if the key is removed while waiting and
    /// with `NotFound` if the instance terminates first.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Waited<String>> {
        let inner = &self.inner;
        if let Some(early) = self.drain_stale().await {
            return early;
        }

        let until = WaitMode::from(effective_timeout(timeout)).until();
        loop {
            let request = Request::GetKeyValue {
                id: inner.id,
                key: inner.key.clone(),
            };
            match inner.server.session().request(request).await {
                Ok(Response::Value { value }) => return Ok(Waited::Done(value)),
                Ok(other) => return Err(other.unexpected("value")),
                Err(Error::UndefinedKey { .. }) => {}
                Err(e) => return Err(e),
            }
            trace!("Key '{}' of #{} not stored yet", inner.key, inner.id);

            loop {
                let event = match inner.listener.pop(until).await {
                    Popped::Delivery(Delivery::Event(event)) if event.id() == inner.id => event,
                    Popped::Delivery(Delivery::Cancel { id }) if id == inner.id => {
                        return Ok(Waited::Canceled)
                    }
                    Popped::Delivery(_) => continue,
                    Popped::Empty | Popped::TimedOut => return Ok(Waited::TimedOut),
                    Popped::Closed => return Ok(Waited::Canceled),
                };

                match event {
                    // The value may already be gone again: ask for it.
                    Event::KeyValue(kv) if kv.key == inner.key && kv.status == KeyStatus::Stored => {
                        break
                    }
                    Event::KeyValue(kv) if kv.key == inner.key => {
                        return Err(Error::undefined_key(kv.key));
                    }
                    Event::Status(status) if status.state.is_terminal() => {
                        return Err(Error::not_found(inner.id));
                    }
                    _ => {}
                }
            }
        }
    }

    /// Drop events queued before this call; the query that follows supersedes them.
    ///
    /// A pending cancel or a terminal status still ends the call.
    async fn drain_stale(&self) -> Option<Result<Waited<String>>> {
        let inner = &self.inner;
        loop {
            match inner.listener.pop(Until::Now).await {
                Popped::Delivery(Delivery::Cancel { id }) if id == inner.id => {
                    return Some(Ok(Waited::Canceled))
                }
                Popped::Delivery(Delivery::Event(Event::Status(status)))
                    if status.id == inner.id && status.state.is_terminal() =>
                {
                    return Some(Err(Error::not_found(inner.id)));
                }
                Popped::Delivery(_) => {}
                Popped::Empty | Popped::TimedOut | Popped::Closed => return None,
            }
        }
    }

    /// Wake the current or next [`get`](Self::get) with `Canceled`.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}
