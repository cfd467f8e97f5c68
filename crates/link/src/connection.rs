//! One authenticated duplex stream, multiplexed into channels and kept alive
//! with heartbeats.
//!
//! Every connection runs two tasks:
//!
//! - **reader**: short-timeout reads into a buffer, frame decoding, routing to
//!   channels, and the remote-idle check (`2 ×` the peer's advertised
//!   heartbeat period).
//! - **writer**: drains the outbound frame queue, giving a due heartbeat
//!   priority over queued data.
//!
//! A failure in either task force-stops the connection; the error is returned
//! by [`Connection::dispose`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelShared};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::frame::{Frame, FrameType};

/// Lifecycle of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Which side of the authentication handshake this end played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

pub(crate) struct ConnectionShared {
    pub(crate) id: Uuid,
    role: Role,
    config: LinkConfig,
    state: watch::Sender<ConnectionState>,
    channels: Mutex<HashMap<u16, Arc<ChannelShared>>>,
    outbound: mpsc::Sender<Frame>,
    stop: CancellationToken,
    peer_heartbeat_ms: AtomicU64,
}

impl ConnectionShared {
    pub(crate) fn is_open(&self) -> bool {
        *self.state.borrow() < ConnectionState::Disconnecting
    }

    fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<u16, Arc<ChannelShared>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn channel_shared(&self, id: u16) -> Arc<ChannelShared> {
        let mut channels = self.channels();
        if let Some(shared) = channels.get(&id) {
            return Arc::clone(shared);
        }
        let shared = ChannelShared::spawn(
            id,
            self.outbound.clone(),
            self.config.max_frame_size,
            self.stop.child_token(),
        );
        // Checked under the channel lock: `run_reader` publishes the final
        // state before it sweeps the map.
        if self.is_open() {
            debug!(connection = %self.id, channel = id, "opening channel");
            channels.insert(id, Arc::clone(&shared));
        } else {
            shared.shut();
        }
        shared
    }

    pub(crate) fn forget_channel(&self, id: u16) {
        self.channels().remove(&id);
    }

    fn shut_channels(&self) {
        let channels: Vec<_> = self.channels().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.shut();
        }
    }

    fn peer_heartbeat(&self) -> Duration {
        Duration::from_millis(self.peer_heartbeat_ms.load(Ordering::Relaxed))
    }

    /// Handle one inbound frame. Returns `false` when the peer disconnected.
    fn route(&self, frame: Frame) -> bool {
        match frame.kind {
            FrameType::ChannelData => {
                self.channel_shared(frame.channel).push(&frame.payload);
            }
            FrameType::Heartbeat => {
                if let Some(period) = frame.heartbeat_period() {
                    let millis = (period.as_millis() as u64).max(1);
                    let previous = self.peer_heartbeat_ms.swap(millis, Ordering::Relaxed);
                    if previous != millis {
                        debug!(connection = %self.id, period_ms = millis, "peer heartbeat period");
                    }
                }
            }
            FrameType::Debug => {
                if let Some(text) = frame.debug_text() {
                    debug!(connection = %self.id, peer_debug = %text, "debug frame");
                }
            }
            FrameType::Disconnect => {
                info!(connection = %self.id, "peer disconnected");
                self.advance(ConnectionState::Disconnecting);
                return false;
            }
        }
        true
    }
}

struct Loops {
    reader: Option<JoinHandle<Result<(), LinkError>>>,
    writer: Option<JoinHandle<Result<(), LinkError>>>,
    errors: Vec<LinkError>,
}

struct Inner {
    shared: Arc<ConnectionShared>,
    loops: tokio::sync::Mutex<Loops>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

/// A multiplexed connection. Cheap to clone; the transport is stopped when
/// the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Start the reader and writer tasks over an already-authenticated stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S, role: Role, mut config: LinkConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if let Err(problem) = config.validate() {
            warn!(problem = %problem, "link config out of range, clamping");
            config.max_frame_size = config.max_frame_size.clamp(1, i32::MAX as usize);
        }
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let peer_heartbeat_ms = AtomicU64::new(config.heartbeat().as_millis() as u64);

        let shared = Arc::new(ConnectionShared {
            id: Uuid::new_v4(),
            role,
            config,
            state,
            channels: Mutex::new(HashMap::new()),
            outbound,
            stop: CancellationToken::new(),
            peer_heartbeat_ms,
        });

        let reader = tokio::spawn(run_reader(Arc::clone(&shared), read_half));
        let writer = tokio::spawn(run_writer(Arc::clone(&shared), write_half, outbound_rx));

        shared.advance(ConnectionState::Connected);
        info!(connection = %shared.id, role = ?role, "connection established");

        Self {
            inner: Arc::new(Inner {
                shared,
                loops: tokio::sync::Mutex::new(Loops {
                    reader: Some(reader),
                    writer: Some(writer),
                    errors: Vec::new(),
                }),
            }),
        }
    }

    /// Two connected ends over an in-process pipe: `(server, client)`.
    pub fn loopback_pair(config: LinkConfig) -> (Self, Self) {
        let capacity = config.max_frame_size.saturating_mul(2).max(64 * 1024);
        let (server_io, client_io) = tokio::io::duplex(capacity);
        (
            Self::from_stream(server_io, Role::Server, config.clone()),
            Self::from_stream(client_io, Role::Client, config),
        )
    }

    pub fn id(&self) -> Uuid {
        self.inner.shared.id
    }

    pub fn role(&self) -> Role {
        self.inner.shared.role
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The heartbeat period most recently advertised by the peer.
    pub fn peer_heartbeat(&self) -> Duration {
        self.inner.shared.peer_heartbeat()
    }

    /// The channel with id `id`, created on first use.
    pub fn channel(&self, id: u16) -> Channel {
        let shared = self.inner.shared.channel_shared(id);
        Channel::new(shared, Arc::clone(&self.inner.shared))
    }

    /// Send free-form diagnostic text; the peer logs it.
    pub async fn send_debug(&self, text: &str) -> Result<(), LinkError> {
        if !self.inner.shared.is_open() {
            return Err(LinkError::Disconnected);
        }
        self.inner
            .shared
            .outbound
            .send(Frame::debug(text))
            .await
            .map_err(|_| LinkError::Disconnected)
    }

    /// Resolves once both loops have stopped for any reason.
    pub async fn closed(&self) {
        let mut state = self.inner.shared.state.subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    /// Cooperative shutdown: send a disconnect notice after everything already
    /// queued, then stop both loops.
    ///
    /// The notice is best effort. Each loop gets the configured join timeout
    /// to finish; stragglers are aborted.
    pub async fn disconnect(&self) {
        let shared = &self.inner.shared;
        if shared.advance(ConnectionState::Disconnecting) {
            debug!(connection = %shared.id, "disconnecting");
            let notice = tokio::time::timeout(
                shared.config.join_timeout(),
                shared.outbound.send(Frame::disconnect()),
            )
            .await;
            if !matches!(notice, Ok(Ok(()))) {
                debug!(connection = %shared.id, "disconnect notice not delivered");
            }
        }

        let join_timeout = shared.config.join_timeout();
        let mut loops = self.inner.loops.lock().await;

        if let Some(writer) = loops.writer.take() {
            if let Some(err) = join_loop(writer, join_timeout, "writer", shared.id).await {
                loops.errors.push(err);
            }
        }
        shared.stop.cancel();
        if let Some(reader) = loops.reader.take() {
            if let Some(err) = join_loop(reader, join_timeout, "reader", shared.id).await {
                loops.errors.push(err);
            }
        }
        shared.advance(ConnectionState::Disconnected);
    }

    /// Disconnect, close every channel, and report whatever failed the
    /// connection loops since it was opened.
    pub async fn dispose(&self) -> Result<(), LinkError> {
        self.disconnect().await;
        self.inner.shared.shut_channels();
        let errors = std::mem::take(&mut self.inner.loops.lock().await.errors);
        match LinkError::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

async fn join_loop(
    mut handle: JoinHandle<Result<(), LinkError>>,
    timeout: Duration,
    name: &'static str,
    connection: Uuid,
) -> Option<LinkError> {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => None,
        Ok(Ok(Err(err))) => Some(err),
        Ok(Err(join)) if join.is_cancelled() => None,
        Ok(Err(join)) => Some(LinkError::Join(join)),
        Err(_) => {
            warn!(connection = %connection, loop_name = name, ?timeout, "connection loop did not stop in time, aborting");
            handle.abort();
            None
        }
    }
}

async fn run_reader<R>(shared: Arc<ConnectionShared>, io: R) -> Result<(), LinkError>
where
    R: AsyncRead + Unpin,
{
    let result = read_loop(&shared, io).await;
    if let Err(err) = &result {
        warn!(connection = %shared.id, error = %err, "reader stopped, closing connection");
    }
    // Close to new writes before stopping the channel writers.
    shared.advance(ConnectionState::Disconnected);
    shared.stop.cancel();
    shared.shut_channels();
    result
}

async fn read_loop<R>(shared: &ConnectionShared, mut io: R) -> Result<(), LinkError>
where
    R: AsyncRead + Unpin,
{
    let read_timeout = shared.config.read_timeout();
    let max_frame_size = shared.config.max_frame_size;
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut last_remote = Instant::now();

    loop {
        let read = tokio::select! {
            _ = shared.stop.cancelled() => return Ok(()),
            read = tokio::time::timeout(read_timeout, io.read_buf(&mut buf)) => read,
        };

        match read {
            Ok(Ok(0)) => {
                if shared.is_open() {
                    return Err(LinkError::PeerClosed);
                }
                return Ok(());
            }
            Ok(Ok(_)) => {
                last_remote = Instant::now();
                while let Some(frame) = Frame::try_decode(&mut buf, max_frame_size)? {
                    if !shared.route(frame) {
                        return Ok(());
                    }
                }
            }
            Ok(Err(err)) => return Err(err.into()),
            // A quiet transport is expected; fall through to the idle check.
            Err(_elapsed) => {}
        }

        let limit = shared.peer_heartbeat() * 2;
        let idle = last_remote.elapsed();
        if idle > limit {
            return Err(LinkError::IdleTimeout { idle, limit });
        }
    }
}

async fn run_writer<W>(
    shared: Arc<ConnectionShared>,
    io: W,
    outbound: mpsc::Receiver<Frame>,
) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    let result = write_loop(&shared, io, outbound).await;
    if let Err(err) = &result {
        warn!(connection = %shared.id, error = %err, "writer stopped, closing connection");
        shared.stop.cancel();
    }
    result
}

async fn write_loop<W>(
    shared: &ConnectionShared,
    mut io: W,
    mut outbound: mpsc::Receiver<Frame>,
) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    let period = shared.config.heartbeat();
    let max_frame_size = shared.config.max_frame_size;
    let mut heartbeat = tokio::time::interval(period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = BytesMut::new();

    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            _ = heartbeat.tick() => Frame::heartbeat(period),
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        let last = frame.kind == FrameType::Disconnect;
        buf.clear();
        frame.encode(&mut buf, max_frame_size)?;
        io.write_all(&buf).await?;
        if last || outbound.is_empty() {
            io.flush().await?;
        }
        if last {
            break;
        }
    }

    // Best effort: the peer may already be gone.
    let _ = io.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> LinkConfig {
        LinkConfig::default()
            .with_heartbeat(Duration::from_millis(200))
            .with_read_timeout(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn states_progress_to_disconnected() {
        let (server, client) = Connection::loopback_pair(fast());
        assert!(server.is_connected());
        assert_eq!(client.role(), Role::Client);

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);

        tokio::time::timeout(Duration::from_secs(2), server.closed())
            .await
            .expect("server should observe the disconnect");
        assert!(server.dispose().await.is_ok());
        assert!(client.dispose().await.is_ok());
    }

    #[tokio::test]
    async fn channels_are_created_lazily_and_shared() {
        let (server, client) = Connection::loopback_pair(fast());
        let a = client.channel(4);
        let b = client.channel(4);
        a.write(b"ab").unwrap();
        b.write(b"cd").unwrap();
        a.flush().await.unwrap();

        let incoming = server.channel(4);
        let mut buf = [0u8; 4];
        incoming.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        client.dispose().await.unwrap();
        server.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_advertises_period() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = Connection::from_stream(
            server_io,
            Role::Server,
            fast().with_heartbeat(Duration::from_millis(300)),
        );
        let client = Connection::from_stream(
            client_io,
            Role::Client,
            fast().with_heartbeat(Duration::from_millis(700)),
        );

        // Both writers send a heartbeat as soon as they start.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.peer_heartbeat(), Duration::from_millis(700));
        assert_eq!(client.peer_heartbeat(), Duration::from_millis(300));

        client.dispose().await.unwrap();
        server.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn writes_after_disconnect_are_refused() {
        let (server, client) = Connection::loopback_pair(fast());
        let channel = client.channel(1);
        client.disconnect().await;
        assert!(matches!(channel.write(b"late"), Err(LinkError::ChannelClosed(1))));
        assert!(client.send_debug("late").await.is_err());
        server.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn zero_frame_size_is_clamped() {
        let (server, client) = Connection::loopback_pair(fast().with_max_frame_size(0));
        assert_eq!(client.config().max_frame_size, 1);

        client.channel(2).write(b"abc").unwrap();
        let mut buf = [0u8; 3];
        tokio::time::timeout(Duration::from_secs(2), server.channel(2).read_exact(&mut buf))
            .await
            .expect("one-byte frames should still arrive")
            .unwrap();
        assert_eq!(&buf, b"abc");

        client.dispose().await.unwrap();
        server.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn flush_settles_when_the_peer_drops_mid_write() {
        for _ in 0..20 {
            let (server, client) = Connection::loopback_pair(fast());
            let channel = client.channel(5);
            let writer = tokio::spawn({
                let channel = channel.clone();
                async move {
                    while channel.write(b"payload").is_ok() {
                        tokio::task::yield_now().await;
                    }
                }
            });

            server.disconnect().await;
            tokio::time::timeout(Duration::from_secs(2), writer)
                .await
                .expect("writes should be refused once disconnected")
                .unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(2), channel.flush())
                .await
                .expect("flush must settle after disconnect");

            let _ = client.dispose().await;
            let _ = server.dispose().await;
        }
    }
}
