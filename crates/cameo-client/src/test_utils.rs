//! In-process server fixture for client tests

use std::sync::Arc;

use cameo_core::MemoryTransport;
use cameo_server::test_utils::{FakeLauncher, FakeProcess};
use cameo_server::{ApplicationConfig, ServerConfig, ServerHandle};

use crate::server::Server;

pub(crate) struct Harness {
    pub transport: MemoryTransport,
    pub handle: ServerHandle,
    pub launcher: Arc<FakeLauncher>,
    pub server: Server<MemoryTransport>,
}

impl Harness {
    /// A server hosting `applications`, and a client connected to it.
    pub async fn start(applications: Vec<ApplicationConfig>) -> Self {
        let mut config = ServerConfig {
            applications,
            ..Default::default()
        };
        config.server.host = "client-test".into();

        let transport = MemoryTransport::new();
        let launcher = FakeLauncher::new();
        let handle = ServerHandle::start(&transport, config, launcher.clone())
            .await
            .unwrap();
        let server = Server::with_transport(transport.clone(), handle.endpoint().clone(), None)
            .await
            .unwrap();

        Self {
            transport,
            handle,
            launcher,
            server,
        }
    }

    /// The most recently launched process, once its launch has happened.
    pub async fn process(&self) -> Arc<FakeProcess> {
        loop {
            if let Some(process) = self.launcher.last() {
                return process;
            }
            tokio::task::yield_now().await;
        }
    }

    /// A second client connection to the same server.
    pub async fn client(&self) -> Server<MemoryTransport> {
        Server::with_transport(self.transport.clone(), self.handle.endpoint().clone(), None)
            .await
            .unwrap()
    }
}

/// An application that stays STARTING until it reports RUNNING itself.
pub(crate) fn reporting(name: &str) -> ApplicationConfig {
    let mut app = ApplicationConfig::new(name, format!("{name}-bin"));
    app.starting_time_ms = -1;
    app
}
