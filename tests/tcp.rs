//! End-to-end over real sockets: server and client on `TcpTransport`

mod support;

use std::net::TcpListener;

use cameo_client::{Server, Waited};
use cameo_core::{State, TcpTransport};
use cameo_server::test_utils::FakeLauncher;
use cameo_server::{ServerConfig, ServerHandle};

use support::app;

/// A port `p` on loopback with `p + 1` also free, for the request and event endpoints.
fn free_port_pair() -> u16 {
    loop {
        let first = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        if port < u16::MAX && TcpListener::bind(("127.0.0.1", port + 1)).is_ok() {
            return port;
        }
    }
}

async fn start_tcp_server(launcher: std::sync::Arc<FakeLauncher>) -> ServerHandle {
    let mut config = ServerConfig {
        applications: vec![app("quick")],
        ..Default::default()
    };
    config.server.host = "127.0.0.1".into();
    config.server.port = free_port_pair();
    ServerHandle::start(&TcpTransport::default(), config, launcher)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_instance_exiting_at_once_is_seen_over_tcp() {
    let launcher = FakeLauncher::new();
    launcher.exits_with("/opt/quick", 0);
    let handle = start_tcp_server(launcher.clone()).await;

    // Start right after connecting: the terminal status must not be lost.
    let client = Server::connect_tcp(handle.endpoint().clone()).await.unwrap();
    let quick = client.start("quick", vec![]).await.unwrap();
    assert_eq!(quick.wait_for_completion().await, Waited::Done(State::Success));
    assert_eq!(quick.exit_code(), Some(0));
}

#[tokio::test]
async fn test_queries_over_tcp() {
    let launcher = FakeLauncher::new();
    let handle = start_tcp_server(launcher.clone()).await;

    let client = Server::connect_tcp(handle.endpoint().clone()).await.unwrap();
    let quick = client.start("quick", vec![]).await.unwrap();

    let console = Server::connect_tcp(handle.endpoint().clone()).await.unwrap();
    let instances = console.list().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].id, quick.id());
    assert!(console.is_alive(quick.id()).await.unwrap());

    console.kill(quick.id()).await.unwrap();
    assert_eq!(quick.wait_for_completion().await, Waited::Done(State::Killed));
}
