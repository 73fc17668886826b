//! # cameo-core - Shared Types and Transports
//!
//! Foundation crate for cameo. Provides the error taxonomy, application
//! states, the wire protocol (events, requests, replies) and the messaging
//! substrate used by both the server and the client library.
//!
//! ## Public API
//!
//! ### States (`state`)
//! - [`State`] - Application lifecycle state, one bit flag per state
//! - [`StateSet`] - Bitmask of states (past states, wait masks)
//!
//! ### Events (`events`)
//! - [`Event`] - Broadcast events: status, result, publisher, port, key/value
//! - [`Decoded`] - Decoding outcome; unknown event types are not errors
//!
//! ### Messages (`messages`)
//! - [`Request`], [`Response`] - Request/reply protocol with the server
//!
//! ### Transport (`transport`)
//! - [`Transport`] - Request/reply and publish/subscribe substrate
//! - [`MemoryTransport`] - In-process hub, used by tests and embedded servers
//! - [`TcpTransport`] - Length-prefixed frames over TCP
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use cameo_core::prelude::*;
//! ```

pub mod endpoint;
pub mod error;
pub mod events;
pub mod logging;
pub mod messages;
pub mod state;
pub mod transport;

/// Prelude for common imports used throughout all cameo crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

pub use endpoint::Endpoint;
pub use error::{Error, Result, ResultExt};
pub use events::{
    topics, Decoded, Event, KeyEvent, KeyStatus, PortEvent, PublisherEvent, ResultEvent,
    StatusEvent,
};
pub use messages::{
    publisher_port_name, responder_port_name, ApplicationSummary, InstanceInfo, InstanceStatus,
    PortInfo, PublisherInfo, Request, Response,
};
pub use state::{State, StateSet};
pub use transport::{
    Frame, Incoming, LocalTransport, MemoryTransport, PublisherBinding, ResponderBinding,
    Subscription, TcpTransport, Transport,
};
