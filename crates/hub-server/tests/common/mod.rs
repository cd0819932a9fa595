// Shared helpers for hub-server integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use hub_core::{Envelope, EnvelopeKind, UserId};
use hub_protocol::{decode_frame, encode_frame, FrameFormat};
use hub_server::{ConnectionHandle, Hub, HubConfig, LogHandler, MessageHandler};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(3);

/// Hub settings with short deadlines and no keepalive noise.
pub fn test_config() -> HubConfig {
    HubConfig {
        read_idle_timeout: Duration::from_secs(30),
        keepalive_interval: Duration::from_secs(20),
        write_deadline: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(1),
        ..HubConfig::default()
    }
}

pub fn start_hub(config: HubConfig) -> Hub {
    Hub::start(config, Arc::new(LogHandler))
}

pub fn start_hub_with(config: HubConfig, handler: impl MessageHandler) -> Hub {
    Hub::start(config, Arc::new(handler))
}

/// Client side of an in-memory connection.
pub struct Peer {
    io: DuplexStream,
    buf: BytesMut,
    format: FrameFormat,
}

impl Peer {
    pub fn new(io: DuplexStream) -> Self {
        Peer {
            io,
            buf: BytesMut::new(),
            format: FrameFormat::LengthPrefixed,
        }
    }

    /// Next envelope from the hub, or `None` once the hub closed the transport.
    pub async fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = decode_frame(self.format, &mut self.buf).unwrap() {
                return Some(envelope);
            }
            let n = timeout(WAIT, self.io.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for the hub")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
        }
    }

    /// Next non-keepalive envelope.
    pub async fn recv(&mut self) -> Envelope {
        loop {
            let envelope = self
                .try_recv()
                .await
                .expect("transport closed while waiting for an envelope");
            if !envelope.kind().is_keepalive() {
                return envelope;
            }
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        let mut frame = BytesMut::new();
        encode_frame(self.format, envelope, &mut frame).unwrap();
        self.io.write_all(&frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
    }

    /// Read until the hub closes the transport, returning what arrived.
    pub async fn drain_until_closed(&mut self) -> Vec<Envelope> {
        let mut seen = Vec::new();
        while let Some(envelope) = self.try_recv().await {
            seen.push(envelope);
        }
        seen
    }
}

/// Register a new in-memory connection for `user` and consume its welcome.
pub async fn connect(hub: &Hub, user: &str) -> (ConnectionHandle, Peer) {
    let (server, client) = tokio::io::duplex(64 * 1024);
    let handle = hub.accept(server, UserId::from(user)).await.unwrap();

    let mut peer = Peer::new(client);
    let welcome = peer.recv().await;
    assert_eq!(welcome.kind(), &EnvelopeKind::Welcome);
    assert_eq!(welcome.user_id(), Some(&UserId::from(user)));

    (handle, peer)
}

/// Poll `check` until it holds or the wait budget runs out.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {}", what);
}
