//! Outbound event stream

use cameo_core::prelude::*;
use cameo_core::{Endpoint, Event, PublisherBinding};

/// Serializes events onto the server's single broadcast stream.
///
/// Callers publish while holding the registry lock, so the stream order is
/// the order in which the registry mutated its state.
#[derive(Debug)]
pub struct EventPublisher {
    binding: PublisherBinding,
}

impl EventPublisher {
    pub fn new(binding: PublisherBinding) -> Self {
        Self { binding }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.binding.endpoint()
    }

    /// Publish to whoever is subscribed right now. No replay, no acknowledgment.
    pub fn publish(&self, event: &Event) {
        match event.encode() {
            Ok(bytes) => {
                let delivered = self.binding.publish(event.topic(), bytes);
                trace!(
                    "Published {} event for #{} to {} subscriber(s)",
                    event.topic(),
                    event.id(),
                    delivered
                );
            }
            Err(e) => error!("Failed to encode {} event: {}", event.topic(), e),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.binding.subscriber_count()
    }
}
