//! # cameo-client - Client Library
//!
//! Talks to a cameo server: starts and connects to application instances,
//! waits on their lifecycle, and lets the current process act as an
//! instance with its own key/values, ports and communication objects.
//!
//! Depends on [`cameo_core`] for the wire protocol, transports and errors.
//!
//! ## Public API
//!
//! ### Connecting
//! - [`Server`] - One server connection: request session plus event dispatch task
//! - [`RequestSession`] - One-shot request/reply exchanges with a timeout
//!
//! ### Instances
//! - [`Instance`] - Remote instance handle; state waits, stop/kill, result
//! - [`KeyValueGetter`] - Wait for a key of another instance
//! - [`This`] - The current process as an instance
//!
//! ### Waiting
//! - [`WaitMode`] - Blocking, non-blocking or bounded waits
//! - [`Waited`] - Done, timed out or canceled
//! - [`WaitingSet`], [`Cancelable`] - Cancel or terminate every blocked handle at once
//! - [`ListenerSet`], [`EventListener`] - Per-handle event queues fed by the dispatch task
//!
//! ### Communication (`coms`)
//! - [`coms::Publisher`], [`coms::Subscriber`] - Data streams
//! - [`coms::Responder`], [`coms::Requester`] - Request/reply with resynchronization

pub mod coms;
mod dispatch;
pub mod instance;
pub mod key_value;
pub mod listener;
pub mod server;
pub mod session;
pub mod this;
pub mod waiting;

#[cfg(test)]
pub(crate) mod test_utils;

pub use instance::Instance;
pub use key_value::KeyValueGetter;
pub use listener::{Delivery, EventListener, ListenerSet, WaitMode};
pub use server::Server;
pub use session::RequestSession;
pub use this::This;
pub use waiting::{Cancelable, Waited, WaitingGuard, WaitingSet};
