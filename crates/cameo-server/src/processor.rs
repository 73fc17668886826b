//! Request processor
//!
//! Maps each decoded [`Request`] onto the manager and registry and builds
//! the single reply. Failures become [`Response::Error`]; nothing here can
//! take the server down.

use std::time::Duration;

use cameo_core::prelude::*;
use cameo_core::{Endpoint, Request, Response};

use crate::manager::Manager;

#[derive(Debug, Clone)]
pub struct RequestProcessor {
    manager: Manager,
    event_endpoint: Endpoint,
}

impl RequestProcessor {
    pub fn new(manager: Manager, event_endpoint: Endpoint) -> Self {
        Self {
            manager,
            event_endpoint,
        }
    }

    pub fn process(&self, request: Request) -> Response {
        let description = request.description();
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                debug!("Request '{}' failed: {}", description, e);
                Response::from_error(&e)
            }
        }
    }

    fn dispatch(&self, request: Request) -> Result<Response> {
        let registry = self.manager.registry();
        let response = match request {
            Request::Sync => Response::Ok,
            Request::Version => Response::Version {
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            Request::EventEndpoint => Response::Endpoint {
                endpoint: self.event_endpoint.to_string(),
            },

            // Lifecycle
            Request::Start { name, args } => Response::Id {
                id: self.manager.start(&name, args)?,
            },
            Request::Stop { id } => {
                self.manager.stop(id)?;
                Response::Ok
            }
            Request::Kill { id } => {
                self.manager.kill(id)?;
                Response::Ok
            }
            Request::SetStatus { id, state } => Response::Bool {
                value: registry.set_state_from_client(id, state)?,
            },
            Request::SetResult { id, data } => {
                registry.set_result(id, data)?;
                Response::Ok
            }
            Request::SetStopHandler {
                id,
                stopping_time_ms,
            } => {
                registry.set_stop_handler(id, Duration::from_millis(stopping_time_ms))?;
                Response::Ok
            }
            Request::AttachUnmanaged { name, pid } => Response::Id {
                id: registry.attach_unmanaged(&name, pid)?,
            },
            Request::DetachUnmanaged { id } => {
                registry.detach_unmanaged(id)?;
                Response::Ok
            }

            // Queries
            Request::Connect { name } => Response::Instances {
                instances: registry.connect(&name)?,
            },
            Request::ConnectWithId { id } => Response::Instances {
                instances: vec![registry.connect_with_id(id)?],
            },
            Request::Apps => Response::Configs {
                configs: self.manager.apps(),
            },
            Request::List => Response::Instances {
                instances: registry.list()?,
            },
            Request::IsAlive { id } => Response::Bool {
                value: registry.is_alive(id),
            },
            Request::GetStatus { id } => Response::Status(registry.status(id)),

            // Key/values
            Request::StoreKeyValue { id, key, value } => {
                registry.store_key_value(id, &key, &value)?;
                Response::Ok
            }
            Request::GetKeyValue { id, key } => Response::Value {
                value: registry.get_key_value(id, &key)?,
            },
            Request::RemoveKey { id, key } => {
                registry.remove_key(id, &key)?;
                Response::Ok
            }

            // Ports
            Request::RequestPort { id, name } => Response::Port {
                port: registry.request_port(id, &name)?,
            },
            Request::ReleasePort { id, name } => {
                registry.release_port(id, &name)?;
                Response::Ok
            }
            Request::SetPortUnavailable { port } => {
                registry.set_port_unavailable(port)?;
                Response::Ok
            }
            Request::GetPort { id, name } => Response::Port {
                port: registry.get_port(id, &name)?,
            },
            Request::Ports => Response::Ports {
                ports: registry.ports()?,
            },

            // Publishers
            Request::RegisterPublisher {
                id,
                name,
                subscribers,
            } => {
                registry.register_publisher(id, &name, subscribers)?;
                Response::Ok
            }
            Request::UnregisterPublisher { id, name } => {
                registry.unregister_publisher(id, &name)?;
                Response::Ok
            }
            Request::GetPublisher { id, name } => {
                Response::Publisher(registry.get_publisher(id, &name)?)
            }
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::allocator::{IdAllocator, PortAllocator};
    use crate::config::{ApplicationConfig, ServerConfig};
    use crate::publisher::EventPublisher;
    use crate::registry::Registry;
    use crate::test_utils::FakeLauncher;
    use cameo_core::{publisher_port_name, Error, MemoryTransport, State, Transport};

    async fn processor() -> RequestProcessor {
        let transport = MemoryTransport::new();
        let events = Endpoint::new("proc", 2);
        let binding = transport.bind_publisher(&events).await.unwrap();
        let registry = Arc::new(Registry::new(
            IdAllocator::default(),
            PortAllocator::new(9000),
            10,
            EventPublisher::new(binding),
        ));
        let config = ServerConfig {
            applications: vec![ApplicationConfig::new("worker", "worker-bin")],
            ..Default::default()
        };
        let manager = Manager::new(
            registry,
            FakeLauncher::new(),
            Arc::new(config),
            Endpoint::new("proc", 1),
        );
        RequestProcessor::new(manager, events)
    }

    fn error_kind(response: Response) -> Error {
        response.into_result().unwrap_err()
    }

    #[tokio::test]
    async fn test_version_sync_and_event_endpoint() {
        let p = processor().await;
        assert_eq!(p.process(Request::Sync), Response::Ok);
        assert!(matches!(p.process(Request::Version), Response::Version { .. }));
        assert_eq!(
            p.process(Request::EventEndpoint),
            Response::Endpoint {
                endpoint: "tcp://proc:2".into()
            }
        );
    }

    #[tokio::test]
    async fn test_start_and_status() {
        let p = processor().await;
        let Response::Id { id } = p.process(Request::Start {
            name: "worker".into(),
            args: vec![],
        }) else {
            panic!("expected an id");
        };
        let Response::Status(status) = p.process(Request::GetStatus { id }) else {
            panic!("expected a status");
        };
        assert_eq!(status.name, "worker");
        assert!(status.state.is_alive());

        assert_eq!(
            p.process(Request::IsAlive { id }),
            Response::Bool { value: true }
        );
        let Response::Configs { configs } = p.process(Request::Apps) else {
            panic!("expected configs");
        };
        assert_eq!(configs[0].running, 1);
    }

    #[tokio::test]
    async fn test_errors_become_error_replies() {
        let p = processor().await;
        assert!(matches!(
            error_kind(p.process(Request::Start {
                name: "nope".into(),
                args: vec![]
            })),
            Error::UnknownApplication { .. }
        ));
        assert!(matches!(
            error_kind(p.process(Request::Stop { id: 42 })),
            Error::NotFound { id: 42 }
        ));
        assert!(matches!(
            error_kind(p.process(Request::SetStatus {
                id: 1,
                state: State::Killed
            })),
            Error::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_status_reply() {
        let p = processor().await;
        let Response::Status(status) = p.process(Request::GetStatus { id: 7 }) else {
            panic!("expected a status");
        };
        assert_eq!(status.state, State::Unknown);
        assert_eq!(status.name, "?");
    }

    #[tokio::test]
    async fn test_unmanaged_key_values_ports_and_publishers() {
        let p = processor().await;
        let Response::Id { id } = p.process(Request::AttachUnmanaged {
            name: "ext".into(),
            pid: None,
        }) else {
            panic!("expected an id");
        };

        assert_eq!(
            p.process(Request::StoreKeyValue {
                id,
                key: "k".into(),
                value: "v".into()
            }),
            Response::Ok
        );
        assert_eq!(
            p.process(Request::GetKeyValue { id, key: "k".into() }),
            Response::Value { value: "v".into() }
        );

        let Response::Port { port } = p.process(Request::RequestPort {
            id,
            name: publisher_port_name("data"),
        }) else {
            panic!("expected a port");
        };
        assert_eq!(port, 9000);
        assert_eq!(
            p.process(Request::RegisterPublisher {
                id,
                name: "data".into(),
                subscribers: 1
            }),
            Response::Ok
        );
        let Response::Publisher(info) = p.process(Request::GetPublisher {
            id,
            name: "data".into(),
        }) else {
            panic!("expected a publisher");
        };
        assert_eq!(info.port, 9000);

        assert_eq!(p.process(Request::DetachUnmanaged { id }), Response::Ok);
        let Response::Ports { ports } = p.process(Request::Ports) else {
            panic!("expected ports");
        };
        assert!(ports.is_empty());
    }
}
