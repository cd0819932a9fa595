//! One live connection: a bounded outbound queue and two pumps.
//!
//! - The **read pump** decodes frames from the transport, answers
//!   keepalives itself and hands everything else to the
//!   [`MessageHandler`]. It stops on peer close, decode error, transport
//!   error or when nothing arrives within the read idle timeout.
//! - The **write pump** drains the outbound queue to the transport and
//!   pings the peer on a keepalive interval. It stops on a write error,
//!   a missed write deadline, or when the connection is closed, in which
//!   case it flushes what is queued and writes a `close` envelope.
//!
//! Either pump stopping closes the connection (both pumps observe the
//! same per-connection token) and reports the id on the hub's
//! unregister stream. The hub only ever holds a [`ConnectionHandle`].

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use hub_core::{ConnectionId, EnqueueError, Envelope, EnvelopeKind, UserId};
use hub_protocol::{encode_frame, FrameDecoder, FrameFormat, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::handler::MessageHandler;
use crate::types::UnregisterTx;

/// Anything a connection can run over: a TCP stream, a TLS stream,
/// an in-memory duplex pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type BoxedTransport = Box<dyn Transport>;

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 4096;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Lifecycle of a connection. Only ever moves forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Accepted, not yet in the registry.
    Connecting = 0,
    /// Registered; pumps running.
    Active = 1,
    /// A pump hit a terminal condition or the hub forced a close.
    Closing = 2,
    /// Both pumps exited and the transport is released.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Debug)]
struct Shared {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<Envelope>,
    closing: CancellationToken,
    state: AtomicU8,
    live_pumps: AtomicUsize,
    last_activity_ms: AtomicI64,
    dropped: AtomicU64,
    // Gateway admission slot, held until both pumps have exited.
    slot: Mutex<Option<OwnedSemaphorePermit>>,
}

/// Cheap, cloneable routing handle to a connection.
///
/// Holding a handle does not keep the transport open; it only allows
/// enqueueing envelopes and requesting a close.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Last time a frame arrived from the peer (or accept time).
    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.inner.last_activity_ms.load(Ordering::Relaxed);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
    }

    /// Envelopes dropped on this connection because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Try to queue an envelope for the write pump without waiting.
    ///
    /// A full queue drops `envelope` (the queued ones keep their order)
    /// and reports a slow consumer; the connection stays up.
    pub fn enqueue(&self, envelope: Envelope) -> Result<(), EnqueueError> {
        if self.state() >= ConnectionState::Closing {
            return Err(EnqueueError::Closed);
        }

        match self.inner.outbound.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(envelope)) => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    conn_id = %self.id(),
                    user_id = %self.user_id(),
                    kind = envelope.kind().as_str(),
                    dropped,
                    "slow consumer: outbound queue full, dropping envelope"
                );
                Err(EnqueueError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Force the connection closed.
    ///
    /// Returns `true` if this call moved it to `Closing`. The pumps exit
    /// on their own and report to the hub.
    pub fn close(&self) -> bool {
        let first = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
            })
            .is_ok();
        self.inner.closing.cancel();
        first
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Resolves once the connection starts closing.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closing.cancelled()
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn touch(&self) {
        self.inner
            .last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn pump_exited(&self) {
        if self.inner.live_pumps.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner
                .state
                .store(ConnectionState::Closed as u8, Ordering::Release);
            let slot = match self.inner.slot.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            drop(slot);
        }
    }
}

/// An accepted connection that owns its transport.
///
/// Built by the gateway, handed to the hub for registration, which
/// consumes it to start the pumps. Only the [`ConnectionHandle`]
/// survives in the registry.
pub struct Connection {
    handle: ConnectionHandle,
    transport: BoxedTransport,
    outbound_rx: mpsc::Receiver<Envelope>,
    format: FrameFormat,
    pending_input: BytesMut,
}

impl Connection {
    /// Wrap a live transport for an already-authenticated user.
    pub fn accept<T: Transport>(transport: T, user_id: UserId, config: &HubConfig) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_capacity.max(1));

        let shared = Shared {
            id: next_connection_id(),
            user_id,
            outbound,
            closing: CancellationToken::new(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            live_pumps: AtomicUsize::new(0),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            dropped: AtomicU64::new(0),
            slot: Mutex::new(None),
        };

        Connection {
            handle: ConnectionHandle {
                inner: Arc::new(shared),
            },
            transport: Box::new(transport),
            outbound_rx,
            format: config.frame_format,
            pending_input: BytesMut::new(),
        }
    }

    pub fn with_format(mut self, format: FrameFormat) -> Self {
        self.format = format;
        self
    }

    /// Bytes already read off the transport (e.g. during a handshake)
    /// that the read pump must decode before reading more.
    pub fn with_pending_input(mut self, pending: BytesMut) -> Self {
        self.pending_input = pending;
        self
    }

    /// Admission slot released once the connection is fully closed, or
    /// when it is dropped without ever being registered.
    pub fn with_slot(self, permit: OwnedSemaphorePermit) -> Self {
        match self.handle.inner.slot.lock() {
            Ok(mut guard) => *guard = Some(permit),
            Err(poisoned) => *poisoned.into_inner() = Some(permit),
        }
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn user_id(&self) -> &UserId {
        self.handle.user_id()
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Split the transport and spawn both pumps on `ctx.tracker`.
    pub(crate) fn start_pumps(self, ctx: &PumpContext) {
        let Connection {
            handle,
            transport,
            outbound_rx,
            format,
            pending_input,
        } = self;

        let (reader, writer) = tokio::io::split(transport);
        handle.inner.live_pumps.store(2, Ordering::Release);

        ctx.tracker.spawn(read_pump(
            handle.clone(),
            reader,
            pending_input,
            format,
            ctx.clone(),
        ));
        ctx.tracker
            .spawn(write_pump(handle, writer, outbound_rx, format, ctx.clone()));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.handle.id())
            .field("user_id", self.handle.user_id())
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Everything the pumps need from the hub, without a reference to it.
#[derive(Clone)]
pub(crate) struct PumpContext {
    pub unregister_tx: UnregisterTx,
    pub handler: Arc<dyn MessageHandler>,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
    pub read_idle_timeout: Duration,
    pub write_deadline: Duration,
    pub keepalive_interval: Duration,
}

// -----------------------------------------------------------------------------
// Read pump
// -----------------------------------------------------------------------------

#[derive(Debug)]
enum ReadExit {
    PeerClosed,
    CloseRequested,
    IdleTimeout,
    Closed,
    Decode(ProtocolError),
    Transport(std::io::Error),
}

async fn read_pump(
    handle: ConnectionHandle,
    mut reader: ReadHalf<BoxedTransport>,
    mut buf: BytesMut,
    format: FrameFormat,
    ctx: PumpContext,
) {
    let exit = read_loop(&handle, &mut reader, &mut buf, format, &ctx).await;

    match &exit {
        ReadExit::PeerClosed | ReadExit::CloseRequested => {
            info!(conn_id = %handle.id(), user_id = %handle.user_id(), "peer closed connection");
        }
        ReadExit::IdleTimeout => {
            info!(
                conn_id = %handle.id(),
                user_id = %handle.user_id(),
                idle = ?ctx.read_idle_timeout,
                "read idle timeout, closing connection"
            );
        }
        ReadExit::Closed => {
            debug!(conn_id = %handle.id(), "read pump stopped");
        }
        ReadExit::Decode(e) => {
            warn!(conn_id = %handle.id(), user_id = %handle.user_id(), error = %e, "malformed frame, closing connection");
        }
        ReadExit::Transport(e) => {
            warn!(conn_id = %handle.id(), user_id = %handle.user_id(), error = %e, "read failed, closing connection");
        }
    }

    drop(reader);
    finish_pump(&handle, &ctx).await;
}

async fn read_loop(
    handle: &ConnectionHandle,
    reader: &mut ReadHalf<BoxedTransport>,
    buf: &mut BytesMut,
    format: FrameFormat,
    ctx: &PumpContext,
) -> ReadExit {
    let mut decoder = FrameDecoder::new(format);
    loop {
        // Frames already buffered (e.g. handed over by the gateway) go first.
        loop {
            match decoder.decode(buf) {
                Ok(Some(envelope)) => {
                    handle.touch();
                    if let Some(exit) = dispatch_inbound(handle, ctx.handler.as_ref(), envelope) {
                        return exit;
                    }
                }
                Ok(None) => break,
                Err(e) => return ReadExit::Decode(e),
            }
        }

        buf.reserve(READ_CHUNK);
        tokio::select! {
            _ = handle.closed() => return ReadExit::Closed,
            _ = ctx.shutdown.cancelled() => return ReadExit::Closed,
            read = timeout(ctx.read_idle_timeout, reader.read_buf(buf)) => match read {
                Err(_) => return ReadExit::IdleTimeout,
                Ok(Ok(0)) => return ReadExit::PeerClosed,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return ReadExit::Transport(e),
            },
        }
    }
}

/// Route one inbound envelope. `Some` means the read pump must stop.
fn dispatch_inbound(
    handle: &ConnectionHandle,
    handler: &dyn MessageHandler,
    envelope: Envelope,
) -> Option<ReadExit> {
    match envelope.kind() {
        EnvelopeKind::Ping => {
            let _ = handle.enqueue(Envelope::pong_for(&envelope));
            None
        }
        EnvelopeKind::Pong => None,
        EnvelopeKind::Close => Some(ReadExit::CloseRequested),
        EnvelopeKind::Welcome | EnvelopeKind::Notice | EnvelopeKind::Application(_) => {
            // Peers cannot speak for other users.
            let envelope = envelope.with_user(handle.user_id().clone());
            handler.on_envelope(handle, envelope);
            None
        }
    }
}

// -----------------------------------------------------------------------------
// Write pump
// -----------------------------------------------------------------------------

#[derive(Debug)]
enum WriteExit {
    Closed,
    Shutdown,
    QueueClosed,
    Failed(anyhow::Error),
}

async fn write_pump(
    handle: ConnectionHandle,
    mut writer: WriteHalf<BoxedTransport>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    format: FrameFormat,
    ctx: PumpContext,
) {
    let mut frame = BytesMut::with_capacity(1024);
    let exit = write_loop(&handle, &mut writer, &mut outbound_rx, format, &mut frame, &ctx).await;

    let reason = match exit {
        WriteExit::Failed(e) => {
            warn!(
                conn_id = %handle.id(),
                user_id = %handle.user_id(),
                error = %e,
                "write failed, closing connection"
            );
            None
        }
        WriteExit::Shutdown => Some("server shutting down"),
        WriteExit::Closed | WriteExit::QueueClosed => Some("connection closed"),
    };

    if let Some(reason) = reason {
        // Best effort: flush what is already queued, then say goodbye.
        let mut flushed = 0usize;
        let mut result = Ok(());
        while let Ok(envelope) = outbound_rx.try_recv() {
            result = write_envelope(&mut writer, format, &envelope, &mut frame, ctx.write_deadline).await;
            if result.is_err() {
                break;
            }
            flushed += 1;
        }
        if result.is_ok() {
            result = write_envelope(
                &mut writer,
                format,
                &Envelope::close(reason),
                &mut frame,
                ctx.write_deadline,
            )
            .await;
        }
        debug!(conn_id = %handle.id(), flushed, reason, ok = result.is_ok(), "write pump closing");
    }

    outbound_rx.close();
    let _ = timeout(ctx.write_deadline, writer.shutdown()).await;
    drop(writer);
    finish_pump(&handle, &ctx).await;
}

async fn write_loop(
    handle: &ConnectionHandle,
    writer: &mut WriteHalf<BoxedTransport>,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    format: FrameFormat,
    frame: &mut BytesMut,
    ctx: &PumpContext,
) -> WriteExit {
    let mut keepalive = interval_at(
        Instant::now() + ctx.keepalive_interval,
        ctx.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = handle.closed() => return WriteExit::Closed,
            _ = ctx.shutdown.cancelled() => return WriteExit::Shutdown,
            queued = outbound_rx.recv() => match queued {
                Some(envelope) => {
                    if let Err(e) = write_envelope(writer, format, &envelope, frame, ctx.write_deadline).await {
                        return WriteExit::Failed(e);
                    }
                }
                None => return WriteExit::QueueClosed,
            },
            _ = keepalive.tick() => {
                if let Err(e) = write_envelope(writer, format, &Envelope::ping(), frame, ctx.write_deadline).await {
                    return WriteExit::Failed(e);
                }
            }
        }
    }
}

async fn write_envelope(
    writer: &mut WriteHalf<BoxedTransport>,
    format: FrameFormat,
    envelope: &Envelope,
    frame: &mut BytesMut,
    deadline: Duration,
) -> anyhow::Result<()> {
    frame.clear();
    if let Err(e) = encode_frame(format, envelope, frame) {
        // Unencodable envelopes are dropped; the connection stays up.
        warn!(kind = envelope.kind().as_str(), error = %e, "dropping unencodable envelope");
        return Ok(());
    }

    timeout(deadline, async {
        writer.write_all(&frame[..]).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| anyhow!("write deadline of {:?} elapsed", deadline))?
    .context("transport write failed")?;

    Ok(())
}

async fn finish_pump(handle: &ConnectionHandle, ctx: &PumpContext) {
    handle.close();
    handle.pump_exited();
    // Both pumps report; the hub treats the second one as a no-op.
    let _ = ctx.unregister_tx.send(handle.id()).await;
}
