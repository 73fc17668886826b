//! Request/reply sessions
//!
//! Every request opens a fresh channel through the transport, sends one
//! message and waits for one reply. Channels are never pooled: after a
//! timeout the substrate cannot tell a lost reply from a late one, so the
//! channel is abandoned and the caller decides whether to try again.

use std::time::Duration;

use cameo_core::prelude::*;
use cameo_core::{Endpoint, Request, Response, TcpTransport, Transport};

/// Zero means no timeout.
pub(crate) fn effective_timeout(timeout: Option<Duration>) -> Option<Duration> {
    timeout.filter(|t| !t.is_zero())
}

/// Sends requests to one responder endpoint.
#[derive(Debug, Clone)]
pub struct RequestSession<T: Transport = TcpTransport> {
    transport: T,
    endpoint: Endpoint,
    timeout: Option<Duration>,
}

impl<T: Transport> RequestSession<T> {
    /// `timeout` applies to every request that does not override it; `None` or zero waits forever.
    pub fn new(transport: T, endpoint: Endpoint, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            endpoint,
            timeout: effective_timeout(timeout),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Raw exchange: one payload out, one payload back.
    pub async fn send(&self, payload: Vec<u8>, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let timeout = effective_timeout(timeout.or(self.timeout));
        self.transport
            .request(&self.endpoint, payload, timeout)
            .await
    }

    /// Send a request with the session timeout.
    ///
    /// An error reply from the server comes back as the matching [`Error`].
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.request_with_timeout(request, None).await
    }

    pub async fn request_with_timeout(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let description = request.description();
        let reply = self.send(request.encode()?, timeout).await.map_err(|e| {
            debug!("Request '{}' to {} failed: {}", description, self.endpoint, e);
            e
        })?;
        Response::decode(&reply)?.into_result()
    }

    /// Send a request that is answered with `ok`.
    pub async fn request_ok(&self, request: Request) -> Result<()> {
        match self.request(request).await? {
            Response::Ok => Ok(()),
            other => Err(other.unexpected("ok")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cameo_core::{Error, MemoryTransport};

    /// Bind a responder that answers every request with `reply`, optionally after a delay.
    async fn responder(
        transport: &MemoryTransport,
        endpoint: &Endpoint,
        reply: Response,
        delay: Option<Duration>,
    ) -> tokio::task::JoinHandle<()> {
        let mut binding = transport.bind_responder(endpoint).await.unwrap();
        tokio::spawn(async move {
            while let Some(incoming) = binding.recv().await {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = incoming.reply(reply.encode().unwrap());
            }
        })
    }

    #[tokio::test]
    async fn test_request_reply() {
        let transport = MemoryTransport::new();
        let endpoint = Endpoint::new("session", 1);
        let _task = responder(&transport, &endpoint, Response::Id { id: 4 }, None).await;

        let session = RequestSession::new(transport.clone(), endpoint, None);
        assert_eq!(
            session.request(Request::Sync).await.unwrap(),
            Response::Id { id: 4 }
        );
        assert!(session.request_ok(Request::Sync).await.is_err());
    }

    #[tokio::test]
    async fn test_error_reply_is_rebuilt() {
        let transport = MemoryTransport::new();
        let endpoint = Endpoint::new("session", 2);
        let reply = Response::from_error(&Error::not_found(9));
        let _task = responder(&transport, &endpoint, reply, None).await;

        let session = RequestSession::new(transport, endpoint, None);
        let err = session.request(Request::Kill { id: 9 }).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { id: 9 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_opens_fresh_channel_next_time() {
        let transport = MemoryTransport::new();
        let endpoint = Endpoint::new("session", 3);
        let _task = responder(
            &transport,
            &endpoint,
            Response::Ok,
            Some(Duration::from_secs(3600)),
        )
        .await;

        let session = RequestSession::new(
            transport.clone(),
            endpoint,
            Some(Duration::from_millis(100)),
        );
        let started = tokio::time::Instant::now();
        let err = session.request(Request::Sync).await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, Error::ConnectionTimeout { .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));
        assert_eq!(transport.channels_opened(), 1);

        let _ = session.request(Request::Sync).await;
        assert_eq!(transport.channels_opened(), 2);
    }

    #[test]
    fn test_zero_timeout_means_forever() {
        assert_eq!(effective_timeout(Some(Duration::ZERO)), None);
        assert_eq!(
            effective_timeout(Some(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
    }
}
