//! Events broadcast by the server
//!
//! Every event carries the owning instance's `id` and `name` so a client can
//! filter by name before it knows the id it is interested in.
//!
//! The wire form is a JSON object with a `type` discriminator; the broadcast
//! topic of an event is the same string (see [`topics`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::state::{State, StateSet};

/// Broadcast topic names, one per event type.
pub mod topics {
    pub const STATUS: &str = "status";
    pub const RESULT: &str = "result";
    pub const PUBLISHER: &str = "publisher";
    pub const PORT: &str = "port";
    pub const KEY_VALUE: &str = "keyvalue";

    /// Every topic a client subscribes to.
    pub const ALL: [&str; 5] = [STATUS, RESULT, PUBLISHER, PORT, KEY_VALUE];
}

/// State transition of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: i32,
    pub name: String,
    pub state: State,
    pub past_states: StateSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Result payload set by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub id: i32,
    pub name: String,
    pub data: Vec<u8>,
}

/// A publisher has been registered by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherEvent {
    pub id: i32,
    pub name: String,
    pub publisher_name: String,
}

/// A named port has been assigned to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEvent {
    pub id: i32,
    pub name: String,
    pub port_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Stored,
    Removed,
}

/// Key/value mutation on an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub id: i32,
    pub name: String,
    pub key: String,
    pub value: String,
    pub status: KeyStatus,
}

/// Any event that travels on the broadcast stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Status(StatusEvent),
    Result(ResultEvent),
    Publisher(PublisherEvent),
    Port(PortEvent),
    #[serde(rename = "keyvalue")]
    KeyValue(KeyEvent),
}

/// Outcome of decoding one frame from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(Event),
    /// A well-formed message with a `type` this build does not know.
    Unknown(String),
}

impl Event {
    pub fn id(&self) -> i32 {
        match self {
            Event::Status(e) => e.id,
            Event::Result(e) => e.id,
            Event::Publisher(e) => e.id,
            Event::Port(e) => e.id,
            Event::KeyValue(e) => e.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Event::Status(e) => &e.name,
            Event::Result(e) => &e.name,
            Event::Publisher(e) => &e.name,
            Event::Port(e) => &e.name,
            Event::KeyValue(e) => &e.name,
        }
    }

    /// Broadcast topic for this event.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::Status(_) => topics::STATUS,
            Event::Result(_) => topics::RESULT,
            Event::Publisher(_) => topics::PUBLISHER,
            Event::Port(_) => topics::PORT,
            Event::KeyValue(_) => topics::KEY_VALUE,
        }
    }

    /// A status event whose state is terminal.
    pub fn terminal_status(&self) -> Option<&StatusEvent> {
        match self {
            Event::Status(e) if e.state.is_terminal() => Some(e),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a frame, reading the `type` discriminator first.
    pub fn decode(bytes: &[u8]) -> Result<Decoded> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| Error::parse(format!("not JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::parse("missing 'type' field"))?
            .to_string();

        if !topics::ALL.contains(&kind.as_str()) {
            return Ok(Decoded::Unknown(kind));
        }

        serde_json::from_value(value)
            .map(Decoded::Event)
            .map_err(|e| Error::parse(format!("invalid '{kind}' event: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::Status(StatusEvent {
                id: 3,
                name: "worker".into(),
                state: State::Failure,
                past_states: State::Starting | State::Running | State::Failure,
                exit_code: Some(2),
            }),
            Event::Status(StatusEvent {
                id: 3,
                name: "worker".into(),
                state: State::Starting,
                past_states: State::Starting.into(),
                exit_code: None,
            }),
            Event::Result(ResultEvent {
                id: 4,
                name: "calc".into(),
                data: vec![0, 1, 255],
            }),
            Event::Publisher(PublisherEvent {
                id: 5,
                name: "pub".into(),
                publisher_name: "frames".into(),
            }),
            Event::Port(PortEvent {
                id: 5,
                name: "pub".into(),
                port_name: "publisher:frames".into(),
            }),
            Event::KeyValue(KeyEvent {
                id: 6,
                name: "kv".into(),
                key: "color".into(),
                value: "blue".into(),
                status: KeyStatus::Removed,
            }),
        ]
    }

    #[test]
    fn test_every_variant_survives_the_codec() {
        for event in sample_events() {
            let bytes = event.encode().unwrap();
            assert_eq!(Event::decode(&bytes).unwrap(), Decoded::Event(event));
        }
    }

    #[test]
    fn test_discriminator_matches_topic() {
        for event in sample_events() {
            let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
            assert_eq!(value["type"], event.topic());
        }
    }

    #[test]
    fn test_status_wire_format() {
        let event = &sample_events()[0];
        let value: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["state"], 32);
        assert_eq!(value["past_states"], 35);
        assert_eq!(value["exit_code"], 2);
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let decoded = Event::decode(br#"{"type":"stream","id":1}"#).unwrap();
        assert_eq!(decoded, Decoded::Unknown("stream".into()));
    }

    #[test]
    fn test_malformed_frames_are_parse_errors() {
        assert!(matches!(
            Event::decode(b"not json"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            Event::decode(br#"{"id":1}"#),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            Event::decode(br#"{"type":"status","id":"x"}"#),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn test_terminal_status() {
        let events = sample_events();
        assert!(events[0].terminal_status().is_some());
        assert!(events[1].terminal_status().is_none());
        assert!(events[2].terminal_status().is_none());
    }
}
