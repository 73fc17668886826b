//! Request and reply messages exchanged with the server
//!
//! Both directions are JSON objects with a `type` discriminator. A request
//! always gets exactly one reply; registry failures come back as
//! [`Response::Error`] and are turned back into an [`Error`] on the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::{State, StateSet};

/// Environment variables the server sets for the processes it launches.
pub mod env {
    pub const ID: &str = "CAMEO_ID";
    pub const NAME: &str = "CAMEO_NAME";
    pub const SERVER: &str = "CAMEO_SERVER";
}

/// Port name under which an instance binds the publisher `name`.
pub fn publisher_port_name(name: &str) -> String {
    format!("publisher:{name}")
}

/// Port name under which an instance binds the responder `name`.
pub fn responder_port_name(name: &str) -> String {
    format!("responder:{name}")
}

/// Snapshot of one live instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub state: State,
    pub past_states: StateSet,
    #[serde(default)]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Current status of an instance, or `Unknown` with name `"?"` if the id is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: i32,
    pub name: String,
    pub state: State,
    pub past_states: StateSet,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl InstanceStatus {
    pub fn unknown(id: i32) -> Self {
        Self {
            id,
            name: "?".to_string(),
            state: State::Unknown,
            past_states: StateSet::EMPTY,
            exit_code: None,
        }
    }
}

/// A configured application, as listed by `apps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// -1 for unlimited.
    pub max_instances: i32,
    pub running: usize,
}

/// An allocated port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port: u16,
    pub owner_id: i32,
    pub owner_name: String,
    pub name: String,
}

/// Publisher contract registered by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInfo {
    pub id: i32,
    pub name: String,
    pub port: u16,
    pub subscribers: u32,
}

/// Requests understood by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Sync,
    Version,
    Start {
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Stop {
        id: i32,
    },
    Kill {
        id: i32,
    },
    Connect {
        name: String,
    },
    ConnectWithId {
        id: i32,
    },
    Apps,
    List,
    IsAlive {
        id: i32,
    },
    GetStatus {
        id: i32,
    },
    SetStatus {
        id: i32,
        state: State,
    },
    SetResult {
        id: i32,
        data: Vec<u8>,
    },
    SetStopHandler {
        id: i32,
        stopping_time_ms: u64,
    },
    AttachUnmanaged {
        name: String,
        #[serde(default)]
        pid: Option<u32>,
    },
    DetachUnmanaged {
        id: i32,
    },
    StoreKeyValue {
        id: i32,
        key: String,
        value: String,
    },
    GetKeyValue {
        id: i32,
        key: String,
    },
    RemoveKey {
        id: i32,
        key: String,
    },
    RequestPort {
        id: i32,
        name: String,
    },
    ReleasePort {
        id: i32,
        name: String,
    },
    SetPortUnavailable {
        port: u16,
    },
    Ports,
    RegisterPublisher {
        id: i32,
        name: String,
        subscribers: u32,
    },
    UnregisterPublisher {
        id: i32,
        name: String,
    },
    GetPublisher {
        id: i32,
        name: String,
    },
    GetPort {
        id: i32,
        name: String,
    },
    EventEndpoint,
}

impl Request {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Request::Sync => "sync",
            Request::Version => "version",
            Request::Start { .. } => "start",
            Request::Stop { .. } => "stop",
            Request::Kill { .. } => "kill",
            Request::Connect { .. } => "connect",
            Request::ConnectWithId { .. } => "connect with id",
            Request::Apps => "list configured applications",
            Request::List => "list instances",
            Request::IsAlive { .. } => "is alive",
            Request::GetStatus { .. } => "get status",
            Request::SetStatus { .. } => "set status",
            Request::SetResult { .. } => "set result",
            Request::SetStopHandler { .. } => "set stop handler",
            Request::AttachUnmanaged { .. } => "attach unmanaged",
            Request::DetachUnmanaged { .. } => "detach unmanaged",
            Request::StoreKeyValue { .. } => "store key value",
            Request::GetKeyValue { .. } => "get key value",
            Request::RemoveKey { .. } => "remove key",
            Request::RequestPort { .. } => "request port",
            Request::ReleasePort { .. } => "release port",
            Request::SetPortUnavailable { .. } => "set port unavailable",
            Request::Ports => "list ports",
            Request::RegisterPublisher { .. } => "register publisher",
            Request::UnregisterPublisher { .. } => "unregister publisher",
            Request::GetPublisher { .. } => "get publisher",
            Request::GetPort { .. } => "get port",
            Request::EventEndpoint => "event endpoint",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::parse(format!("invalid request: {e}")))
    }
}

/// Replies sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Id {
        id: i32,
    },
    Bool {
        value: bool,
    },
    Status(InstanceStatus),
    Instances {
        instances: Vec<InstanceInfo>,
    },
    Configs {
        configs: Vec<ApplicationSummary>,
    },
    Value {
        value: String,
    },
    Port {
        port: u16,
    },
    Ports {
        ports: Vec<PortInfo>,
    },
    Publisher(PublisherInfo),
    Version {
        version: String,
    },
    Endpoint {
        endpoint: String,
    },
    Error {
        kind: String,
        #[serde(default)]
        subject: Option<String>,
        message: String,
    },
}

impl Response {
    pub fn from_error(err: &Error) -> Self {
        Response::Error {
            kind: err.kind().to_string(),
            subject: err.subject(),
            message: err.to_string(),
        }
    }

    /// Turn an error reply back into an `Err`.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error {
                kind,
                subject,
                message,
            } => Err(Error::from_remote(&kind, subject.as_deref(), &message)),
            other => Ok(other),
        }
    }

    /// Error for a reply of the wrong shape.
    pub fn unexpected(&self, expected: &str) -> Error {
        Error::parse(format!("expected '{expected}' reply, got {self:?}"))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::parse(format!("invalid reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_request_wire_format() {
        let req = Request::Start {
            name: "worker".into(),
            args: vec!["-v".into()],
        };
        let value: Value = serde_json::from_slice(&req.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "start", "name": "worker", "args": ["-v"]}));

        let value: Value = serde_json::from_slice(&Request::Sync.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "sync"}));
    }

    #[test]
    fn test_request_args_default_to_empty() {
        let req = Request::decode(br#"{"type":"start","name":"worker"}"#).unwrap();
        assert_eq!(
            req,
            Request::Start {
                name: "worker".into(),
                args: vec![]
            }
        );
    }

    #[test]
    fn test_unknown_request_type_is_parse_error() {
        let err = Request::decode(br#"{"type":"reboot"}"#).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_set_status_carries_numeric_state() {
        let req = Request::SetStatus {
            id: 1,
            state: State::Running,
        };
        let value: Value = serde_json::from_slice(&req.encode().unwrap()).unwrap();
        assert_eq!(value["state"], 2);
        assert_eq!(value["type"], "set_status");
    }

    #[test]
    fn test_error_reply_round_trips_into_error() {
        let reply = Response::from_error(&Error::already_running("db"));
        let decoded = Response::decode(&reply.encode().unwrap()).unwrap();
        let err = decoded.into_result().unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { ref name } if name == "db"));
    }

    #[test]
    fn test_non_error_reply_passes_through() {
        let reply = Response::Id { id: 9 }.into_result().unwrap();
        assert_eq!(reply, Response::Id { id: 9 });
    }

    #[test]
    fn test_unknown_status() {
        let status = InstanceStatus::unknown(12);
        assert_eq!(status.name, "?");
        assert_eq!(status.state, State::Unknown);
    }
}
