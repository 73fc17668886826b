//! TCP transport with length-prefixed frames
//!
//! Every frame is a big-endian `u32` length followed by that many bytes.
//! A request exchange is one connection carrying one frame each way.
//! A subscriber sends one frame holding its topic filter (a JSON array) and
//! waits for an empty acknowledgement frame. From then on every published
//! frame reaches it as a `topic`, `payload` pair until the publisher closes.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use super::{
    Frame, Incoming, PublisherBinding, ResponderBinding, Subscription, TaskGuard,
    Transport, Unbind, PUBLISHER_CAPACITY, RESPONDER_QUEUE,
};
use crate::endpoint::Endpoint;
use crate::prelude::*;

/// Upper bound on a single frame.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::transport(format!("frame too large: {} bytes", payload.len())))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::parse(format!("frame length {len} exceeds limit")));
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(Some(buffer))
}

async fn exchange(endpoint: &Endpoint, payload: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(endpoint.socket_addr())
        .await
        .map_err(|e| Error::transport(format!("connect to {endpoint} failed: {e}")))?;
    write_frame(&mut stream, payload).await?;
    read_frame(&mut stream)
        .await?
        .ok_or_else(|| Error::transport(format!("{endpoint} closed without replying")))
}

async fn serve_request(mut stream: TcpStream, queue: mpsc::Sender<Incoming>) -> Result<()> {
    let Some(payload) = read_frame(&mut stream).await? else {
        return Ok(());
    };
    let (incoming, reply_rx) = Incoming::new(payload);
    queue
        .send(incoming)
        .await
        .map_err(|_| Error::channel_send("responder closed"))?;
    let reply = reply_rx.await.map_err(|_| Error::ChannelClosed)?;
    write_frame(&mut stream, &reply).await
}

async fn accept_requests(listener: TcpListener, queue: mpsc::Sender<Incoming>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!("Request connection from {}", peer);
                let queue = queue.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_request(stream, queue).await {
                        debug!("Request connection from {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
}

async fn serve_subscriber(mut stream: TcpStream, mut rx: broadcast::Receiver<Frame>) -> Result<()> {
    let Some(filter) = read_frame(&mut stream).await? else {
        return Ok(());
    };
    let topics: Vec<String> = serde_json::from_slice(&filter)?;
    // `rx` already exists, so nothing published after the ack is missed.
    write_frame(&mut stream, &[]).await?;

    loop {
        match rx.recv().await {
            Ok(frame) => {
                if !frame.matches(&topics) {
                    continue;
                }
                write_frame(&mut stream, frame.topic.as_bytes()).await?;
                write_frame(&mut stream, &frame.payload).await?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Subscriber lagged, {} frames dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn accept_subscribers(listener: TcpListener, tx: broadcast::Sender<Frame>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Subscriber connected from {}", peer);
                // Subscribe before the filter arrives so the connection counts immediately.
                let rx = tx.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = serve_subscriber(stream, rx).await {
                        debug!("Subscriber {} disconnected: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
}

async fn read_subscription(mut stream: TcpStream, tx: mpsc::UnboundedSender<Frame>) {
    loop {
        let topic = match read_frame(&mut stream).await {
            Ok(Some(topic)) => topic,
            Ok(None) => break,
            Err(e) => {
                debug!("Subscription read failed: {}", e);
                break;
            }
        };
        let payload = match read_frame(&mut stream).await {
            Ok(Some(payload)) => payload,
            _ => break,
        };
        let frame = Frame::new(String::from_utf8_lossy(&topic), payload);
        if tx.send(frame).is_err() {
            break;
        }
    }
}

impl Transport for TcpTransport {
    async fn request(
        &self,
        endpoint: &Endpoint,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        // The stream lives inside `exchange`, so it is closed on every exit path.
        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange(endpoint, &payload))
                .await
                .map_err(|_| Error::connection_timeout(endpoint, limit))?,
            None => exchange(endpoint, &payload).await,
        }
    }

    async fn subscribe(&self, endpoint: &Endpoint, topics: &[&str]) -> Result<Subscription> {
        let mut stream = TcpStream::connect(endpoint.socket_addr())
            .await
            .map_err(|e| Error::transport(format!("connect to {endpoint} failed: {e}")))?;
        write_frame(&mut stream, &serde_json::to_vec(topics)?).await?;
        read_frame(&mut stream)
            .await?
            .ok_or_else(|| Error::transport(format!("{endpoint} closed before subscribing")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = TaskGuard::spawn(read_subscription(stream, tx));
        Ok(Subscription::new(rx, task))
    }

    async fn bind_responder(&self, endpoint: &Endpoint) -> Result<ResponderBinding> {
        let listener = TcpListener::bind(endpoint.socket_addr()).await?;
        info!("Responder listening on {}", endpoint);

        let (tx, rx) = mpsc::channel(RESPONDER_QUEUE);
        Ok(ResponderBinding {
            endpoint: endpoint.clone(),
            rx,
            _task: Some(TaskGuard::spawn(accept_requests(listener, tx))),
            _unbind: Unbind::none(),
        })
    }

    async fn bind_publisher(&self, endpoint: &Endpoint) -> Result<PublisherBinding> {
        let listener = TcpListener::bind(endpoint.socket_addr()).await?;
        info!("Publisher listening on {}", endpoint);

        let (tx, _) = broadcast::channel(PUBLISHER_CAPACITY);
        Ok(PublisherBinding {
            endpoint: endpoint.clone(),
            tx: tx.clone(),
            _task: Some(TaskGuard::spawn(accept_subscribers(listener, tx))),
            _unbind: Unbind::none(),
        })
    }
}
