//! Server run loop
//!
//! Binds the event publisher and the request responder, then answers
//! requests one at a time until cancelled. Each request is processed
//! synchronously, so replies leave in the order the registry mutated.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cameo_core::prelude::*;
use cameo_core::{Endpoint, Incoming, Request, ResponderBinding, Response, Transport};

use crate::allocator::{IdAllocator, PortAllocator, MAX_ID};
use crate::config::ServerConfig;
use crate::manager::Manager;
use crate::process::Launcher;
use crate::processor::RequestProcessor;
use crate::publisher::EventPublisher;
use crate::registry::Registry;

/// A running server. Dropping it without [`ServerHandle::shutdown`] stops answering requests
/// but leaves instances running.
#[derive(Debug)]
pub struct ServerHandle {
    endpoint: Endpoint,
    event_endpoint: Endpoint,
    manager: Manager,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bind both endpoints and start serving.
    pub async fn start<T: Transport>(
        transport: &T,
        config: ServerConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        config.validate()?;
        let endpoint = config.server.endpoint();
        let event_endpoint = config.server.event_endpoint();

        let publisher = EventPublisher::new(transport.bind_publisher(&event_endpoint).await?);
        let binding = transport.bind_responder(&endpoint).await?;
        info!(
            "Server listening on {}, events on {}",
            binding.endpoint(),
            publisher.endpoint()
        );

        let max_applications = usize::try_from(config.server.max_applications).unwrap_or(1);
        let registry = Arc::new(Registry::new(
            IdAllocator::new(MAX_ID),
            PortAllocator::new(config.server.base_port),
            max_applications,
            publisher,
        ));
        let manager = Manager::new(registry, launcher, Arc::new(config), endpoint.clone());
        let processor = RequestProcessor::new(manager.clone(), event_endpoint.clone());

        let token = CancellationToken::new();
        let task = tokio::spawn(serve(binding, processor, token.clone()));

        Ok(Self {
            endpoint,
            event_endpoint,
            manager,
            token,
            task: Some(task),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn event_endpoint(&self) -> &Endpoint {
        &self.event_endpoint
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.manager.registry()
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Kill every instance, then stop serving.
    pub async fn shutdown(mut self) {
        info!("Server shutting down");
        self.manager.shutdown().await;
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Server task failed: {}", e);
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn serve(mut binding: ResponderBinding, processor: RequestProcessor, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Server loop cancelled");
                break;
            }
            incoming = binding.recv() => match incoming {
                Some(incoming) => answer(&processor, incoming),
                None => {
                    warn!("Request endpoint closed");
                    break;
                }
            }
        }
    }
}

fn answer(processor: &RequestProcessor, incoming: Incoming) {
    let response = match Request::decode(&incoming.payload) {
        Ok(request) => {
            trace!("Processing '{}'", request.description());
            processor.process(request)
        }
        Err(e) => {
            warn!("Dropping malformed request: {}", e);
            Response::from_error(&e)
        }
    };

    match response.encode() {
        Ok(bytes) => {
            if let Err(e) = incoming.reply(bytes) {
                debug!("Reply not delivered: {}", e);
            }
        }
        Err(e) => error!("Failed to encode reply: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApplicationConfig;
    use crate::test_utils::FakeLauncher;
    use cameo_core::{Error, MemoryTransport};

    fn config() -> ServerConfig {
        let mut config = ServerConfig {
            applications: vec![ApplicationConfig::new("worker", "worker-bin")],
            ..Default::default()
        };
        config.server.host = "server-test".into();
        config
    }

    async fn call(transport: &MemoryTransport, server: &ServerHandle, request: Request) -> Response {
        let reply = transport
            .request(server.endpoint(), request.encode().unwrap(), None)
            .await
            .unwrap();
        Response::decode(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_serves_requests() {
        let transport = MemoryTransport::new();
        let server = ServerHandle::start(&transport, config(), FakeLauncher::new())
            .await
            .unwrap();

        assert_eq!(call(&transport, &server, Request::Sync).await, Response::Ok);
        let Response::Id { id } = call(
            &transport,
            &server,
            Request::Start {
                name: "worker".into(),
                args: vec![],
            },
        )
        .await
        else {
            panic!("expected an id");
        };
        assert_eq!(id, 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_request_gets_parse_error() {
        let transport = MemoryTransport::new();
        let server = ServerHandle::start(&transport, config(), FakeLauncher::new())
            .await
            .unwrap();

        let reply = transport
            .request(server.endpoint(), b"{not json".to_vec(), None)
            .await
            .unwrap();
        let err = Response::decode(&reply).unwrap().into_result().unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));

        // Still serving.
        assert_eq!(call(&transport, &server, Request::Sync).await, Response::Ok);
    }

    #[tokio::test]
    async fn test_shutdown_unbinds() {
        let transport = MemoryTransport::new();
        let server = ServerHandle::start(&transport, config(), FakeLauncher::new())
            .await
            .unwrap();
        let endpoint = server.endpoint().clone();
        server.shutdown().await;

        let err = transport
            .request(&endpoint, Request::Sync.encode().unwrap(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let transport = MemoryTransport::new();
        let mut config = config();
        config.applications.push(ApplicationConfig::new("worker", "again"));
        let err = ServerHandle::start(&transport, config, FakeLauncher::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
