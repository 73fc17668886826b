//! Shared fixture: one in-process server and client over `MemoryTransport`

#![allow(dead_code)]

use std::sync::Arc;

use cameo_client::{Instance, Server, This};
use cameo_core::MemoryTransport;
use cameo_server::test_utils::{FakeLauncher, FakeProcess};
use cameo_server::{ApplicationConfig, ServerConfig, ServerHandle};

pub struct Cluster {
    pub transport: MemoryTransport,
    pub handle: ServerHandle,
    pub launcher: Arc<FakeLauncher>,
    pub client: Server<MemoryTransport>,
}

impl Cluster {
    pub async fn start(applications: Vec<ApplicationConfig>) -> Self {
        let mut config = ServerConfig {
            applications,
            ..Default::default()
        };
        config.server.host = "integration".into();

        let transport = MemoryTransport::new();
        let launcher = FakeLauncher::new();
        let handle = ServerHandle::start(&transport, config, launcher.clone())
            .await
            .unwrap();
        let client = Server::with_transport(transport.clone(), handle.endpoint().clone(), None)
            .await
            .unwrap();

        Self {
            transport,
            handle,
            launcher,
            client,
        }
    }

    /// A separate connection, as another process would open.
    pub async fn connect(&self) -> Server<MemoryTransport> {
        Server::with_transport(self.transport.clone(), self.handle.endpoint().clone(), None)
            .await
            .unwrap()
    }

    /// The process launched for the `n`th start (0-based), once launched.
    pub async fn process(&self, n: usize) -> Arc<FakeProcess> {
        loop {
            if let Some(process) = self.launcher.launched().get(n) {
                return Arc::clone(process);
            }
            tokio::task::yield_now().await;
        }
    }

    /// The `This` of a started instance, as its own process would create it.
    pub async fn this_of(&self, instance: &Instance<MemoryTransport>) -> This<MemoryTransport> {
        This::managed(
            self.transport.clone(),
            self.handle.endpoint().clone(),
            instance.id(),
            instance.name(),
        )
        .await
        .unwrap()
    }
}

/// Started with the default starting time: RUNNING right away.
pub fn app(name: &str) -> ApplicationConfig {
    ApplicationConfig::new(name, format!("/opt/{name}"))
}

/// Stays STARTING until it reports RUNNING itself.
pub fn reporting(name: &str) -> ApplicationConfig {
    let mut app = app(name);
    app.starting_time_ms = -1;
    app
}
