//! Event dispatch task
//!
//! One task per server connection reads the event stream and fans it out
//! to the [`ListenerSet`]. Queues are unbounded, so a slow consumer never
//! holds up the others.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cameo_core::prelude::*;
use cameo_core::{Decoded, Event, Frame, Subscription};

use crate::listener::ListenerSet;

/// Handle on the dispatch task. Dropping it stops the task.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub(crate) fn spawn(subscription: Subscription, listeners: ListenerSet) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(run(subscription, listeners, token.clone()));
        Self { token, task }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(mut subscription: Subscription, listeners: ListenerSet, token: CancellationToken) {
    debug!("Event dispatch started");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Event dispatch cancelled");
                break;
            }
            frame = subscription.recv() => match frame {
                Some(frame) => dispatch_frame(&listeners, &frame),
                None => {
                    info!("Event stream ended");
                    break;
                }
            }
        }
    }

    // Release the connection, then wake every waiter still blocked on a queue.
    drop(subscription);
    listeners.close_all();
}

fn dispatch_frame(listeners: &ListenerSet, frame: &Frame) {
    match Event::decode(&frame.payload) {
        Ok(Decoded::Event(event)) => {
            trace!("Dispatching {} event for #{}", event.topic(), event.id());
            listeners.dispatch(&event);
        }
        Ok(Decoded::Unknown(kind)) => debug!("Skipping unknown event type '{}'", kind),
        Err(e) => warn!("Dropping malformed event on '{}': {}", frame.topic, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Delivery, Popped, Until};
    use cameo_core::{Endpoint, MemoryTransport, ResultEvent, Transport};

    #[tokio::test]
    async fn test_malformed_and_unknown_events_are_skipped() {
        let transport = MemoryTransport::new();
        let endpoint = Endpoint::new("dispatch", 1);
        let publisher = transport.bind_publisher(&endpoint).await.unwrap();
        let subscription = transport.subscribe(&endpoint, &[]).await.unwrap();

        let listeners = ListenerSet::new();
        let listener = listeners.register(None);
        let _dispatcher = Dispatcher::spawn(subscription, listeners.clone());

        let good = Event::Result(ResultEvent {
            id: 1,
            name: "a".into(),
            data: vec![7],
        });
        publisher.publish("result", b"{broken".to_vec());
        publisher.publish("other", br#"{"type":"telemetry","id":1}"#.to_vec());
        publisher.publish("result", good.encode().unwrap());

        match listener.pop(Until::Forever).await {
            Popped::Delivery(Delivery::Event(event)) => assert_eq!(event, good),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_listeners() {
        let transport = MemoryTransport::new();
        let endpoint = Endpoint::new("dispatch", 2);
        let publisher = transport.bind_publisher(&endpoint).await.unwrap();
        let subscription = transport.subscribe(&endpoint, &[]).await.unwrap();

        let listeners = ListenerSet::new();
        let listener = listeners.register(None);
        let dispatcher = Dispatcher::spawn(subscription, listeners.clone());

        drop(publisher);
        assert!(matches!(listener.pop(Until::Forever).await, Popped::Closed));
        assert!(listeners.is_empty());
        tokio::task::yield_now().await;
        assert!(dispatcher.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let transport = MemoryTransport::new();
        let endpoint = Endpoint::new("dispatch", 3);
        let publisher = transport.bind_publisher(&endpoint).await.unwrap();
        let subscription = transport.subscribe(&endpoint, &[]).await.unwrap();

        let listeners = ListenerSet::new();
        let listener = listeners.register(None);
        let dispatcher = Dispatcher::spawn(subscription, listeners.clone());
        dispatcher.cancel();

        assert!(matches!(listener.pop(Until::Forever).await, Popped::Closed));
        // The publisher side sees the subscription go away.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
