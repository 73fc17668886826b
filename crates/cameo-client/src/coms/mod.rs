//! Communication objects between instances
//!
//! - [`Publisher`] / [`Subscriber`] - one-to-many data stream
//! - [`Responder`] / [`Requester`] - request/reply
//!
//! The binding side asks the server for a named port of its own instance
//! (`publisher:<name>`, `responder:<name>`); the connecting side waits for
//! that registration through the instance handle. Every object registers
//! with the process [`WaitingSet`](crate::WaitingSet), so a stop request can
//! wake whatever is blocked on it.

pub mod publisher;
pub mod requester;
pub mod responder;
pub mod subscriber;

use std::future::Future;

use cameo_core::prelude::*;
use cameo_core::{Endpoint, Transport};

use crate::this::This;

pub use publisher::Publisher;
pub use requester::Requester;
pub use responder::{Request, Responder};
pub use subscriber::Subscriber;

/// Topic of data frames on a publisher stream.
pub const DATA_TOPIC: &str = "data";
/// Topic of the frame that ends a publisher stream.
pub const END_TOPIC: &str = "end";

/// Ports tried before giving up on binding.
const MAX_BIND_ATTEMPTS: usize = 8;

/// Request the port `port_name` and bind on it.
///
/// A port that turns out to be in use elsewhere is reported unavailable
/// and a fresh one is requested.
pub(crate) async fn bind_named_port<T, B, F, Fut>(
    this: &This<T>,
    port_name: &str,
    bind: F,
) -> Result<(u16, B)>
where
    T: Transport,
    F: Fn(Endpoint) -> Fut,
    Fut: Future<Output = Result<B>>,
{
    let mut last_error = None;
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = this.request_port(port_name).await?;
        let endpoint = this.server().endpoint().with_port(port);
        match bind(endpoint).await {
            Ok(bound) => {
                debug!("Bound '{}' on port {}", port_name, port);
                return Ok((port, bound));
            }
            Err(e) => {
                warn!("Port {} for '{}' is unusable: {}", port, port_name, e);
                this.set_port_unavailable(port).await?;
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::transport(format!("cannot bind '{port_name}'"))))
}
