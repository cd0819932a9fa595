//! TCP listener and handshake in front of the hub.
//!
//! This module:
//! - Listens on the configured address/port.
//! - Accepts new TCP connections, up to `max_clients` at a time. A
//!   client holds its slot from accept (handshake included) until its
//!   connection is fully closed.
//! - Detects the framing from the first byte (`{` → newline-delimited
//!   JSON, anything else → length-prefixed).
//! - Reads a `hello` envelope carrying the peer's `userID`.
//! - Hands the stream to [`Hub::register`].
//!
//! The hello is trusted as-is. Deployments that need authentication put
//! their own gateway in front of `Hub::accept` instead of this one.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::BytesMut;
use hub_core::{Envelope, EnvelopeKind, UserId};
use hub_protocol::{FrameDecoder, FrameFormat};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::hub::Hub;

/// Kind of the first envelope a client must send.
pub const HELLO_KIND: &str = "hello";

/// Pause after an accept error caused by resource exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the configured address and serve until the hub shuts down.
pub async fn run(config: ServerConfig, hub: Hub) -> anyhow::Result<()> {
    let addr = config.socket_addr_string();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "listening");

    serve(listener, hub, config.max_clients).await
}

/// Accept loop over an already-bound listener.
///
/// Accept errors never stop the loop; only hub shutdown does.
pub async fn serve(listener: TcpListener, hub: Hub, max_clients: usize) -> anyhow::Result<()> {
    let shutdown = hub.shutdown_token();
    let slots = Arc::new(Semaphore::new(max_clients.min(Semaphore::MAX_PERMITS)));

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                let backoff = accept_backoff(&e);
                warn!(error = %e, backoff = ?backoff, "accept failed");
                if let Some(backoff) = backoff {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                }
                continue;
            }
        };

        let slot = match slots.clone().try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                warn!(
                    peer = %peer_addr,
                    max_clients,
                    "rejecting connection: max_clients reached"
                );
                // Just drop the stream; client will see connection closed.
                continue;
            }
        };

        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handshake(stream, peer_addr, hub, slot).await {
                warn!(peer = %peer_addr, error = %e, "handshake failed");
            }
        });
    }

    info!("gateway stopped accepting connections");
    Ok(())
}

/// Errors from one failed accept leave the listener usable. Running out
/// of descriptors or memory needs a pause before retrying; everything
/// else (aborted or reset handshakes) is retried at once.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

async fn handshake(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Hub,
    slot: OwnedSemaphorePermit,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let deadline = hub.config().read_idle_timeout;

    let mut first_byte = [0u8; 1];
    let n = timeout(deadline, stream.peek(&mut first_byte))
        .await
        .context("timed out waiting for hello")??;
    if n == 0 {
        bail!("peer closed before hello");
    }
    let format = FrameFormat::detect(first_byte[0]);

    let mut stream = stream;
    let mut buf = BytesMut::with_capacity(1024);
    let hello = timeout(deadline, read_hello(&mut stream, format, &mut buf))
        .await
        .context("timed out waiting for hello")??;

    let user_id = user_from_hello(&hello)?;
    debug!(peer = %peer_addr, user_id = %user_id, ?format, "hello received");

    // Anything the client pipelined after the hello stays in `buf`.
    let connection = Connection::accept(stream, user_id, hub.config())
        .with_format(format)
        .with_pending_input(buf)
        .with_slot(slot);
    let handle = hub.register(connection).await?;

    info!(
        peer = %peer_addr,
        conn_id = %handle.id(),
        user_id = %handle.user_id(),
        "accepted connection"
    );
    Ok(())
}

async fn read_hello(
    stream: &mut TcpStream,
    format: FrameFormat,
    buf: &mut BytesMut,
) -> anyhow::Result<Envelope> {
    let mut decoder = FrameDecoder::new(format);
    loop {
        if let Some(envelope) = decoder.decode(buf)? {
            return Ok(envelope);
        }
        if stream.read_buf(buf).await? == 0 {
            bail!("peer closed before hello");
        }
    }
}

fn user_from_hello(hello: &Envelope) -> anyhow::Result<UserId> {
    if hello.kind() != &EnvelopeKind::Application(HELLO_KIND.to_string()) {
        bail!("expected {:?} envelope, got {:?}", HELLO_KIND, hello.kind().as_str());
    }

    match hello.user_id() {
        Some(user_id) if !user_id.as_str().trim().is_empty() => Ok(user_id.clone()),
        _ => bail!("hello without userID"),
    }
}

/// Periodically log hub stats until the hub shuts down.
pub async fn report_stats(hub: Hub, every: Duration) {
    let shutdown = hub.shutdown_token();
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let stats = hub.stats().await;
                let counters = hub.counters();
                info!(
                    total_connections = stats.total_connections,
                    unique_users = stats.unique_users,
                    accepted = counters.connections_accepted,
                    dropped = counters.messages_dropped,
                    broadcasts = counters.broadcasts,
                    "hub stats"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_must_carry_a_user() {
        let hello = Envelope::application(HELLO_KIND, json!(null)).with_user(UserId::from("u1"));
        assert_eq!(user_from_hello(&hello).unwrap(), UserId::from("u1"));

        let anonymous = Envelope::application(HELLO_KIND, json!(null));
        assert!(user_from_hello(&anonymous).is_err());

        let blank = Envelope::application(HELLO_KIND, json!(null)).with_user(UserId::from("  "));
        assert!(user_from_hello(&blank).is_err());
    }

    #[test]
    fn accept_errors_back_off_only_on_exhaustion() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_backoff(&aborted), None);

        // EMFILE
        let too_many_files = io::Error::from_raw_os_error(24);
        assert_eq!(accept_backoff(&too_many_files), Some(ACCEPT_BACKOFF));
    }

    #[test]
    fn first_envelope_must_be_hello() {
        let ping = Envelope::ping().with_user(UserId::from("u1"));
        assert!(user_from_hello(&ping).is_err());
    }
}
