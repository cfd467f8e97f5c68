//! Logical byte streams multiplexed over a [`Connection`](crate::Connection).
//!
//! Writes land in a per-channel buffer; a dedicated writer task slices that
//! buffer into `ChannelData` frames no larger than the configured maximum and
//! hands them to the connection. Reads drain a receive buffer that the
//! connection's reader task fills as frames arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, BytesMut};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::ConnectionShared;
use crate::error::LinkError;
use crate::frame::Frame;

#[derive(Default)]
struct Inbound {
    buf: BytesMut,
    eof: bool,
}

#[derive(Default)]
struct Outgoing {
    buf: BytesMut,
    /// Set by the writer task as it exits; later writes are refused.
    retired: bool,
}

/// State shared between every handle of one channel, its writer task and the
/// connection's reader task.
pub(crate) struct ChannelShared {
    id: u16,
    inbound: Mutex<Inbound>,
    readable: Notify,
    outgoing: Mutex<Outgoing>,
    writable: Notify,
    /// Bytes written but not yet handed to the connection.
    pending: watch::Sender<usize>,
    /// Set once the connection stopped accepting frames from this channel.
    broken: AtomicBool,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl ChannelShared {
    /// Create the channel state and start its writer task.
    pub(crate) fn spawn(
        id: u16,
        outbound: mpsc::Sender<Frame>,
        max_frame_size: usize,
        stop: CancellationToken,
    ) -> Arc<Self> {
        let (pending, _) = watch::channel(0);
        let shared = Arc::new(Self {
            id,
            inbound: Mutex::new(Inbound::default()),
            readable: Notify::new(),
            outgoing: Mutex::new(Outgoing::default()),
            writable: Notify::new(),
            pending,
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop,
        });
        tokio::spawn(write_loop(Arc::clone(&shared), outbound, max_frame_size));
        shared
    }

    /// Queue bytes received from the peer.
    pub(crate) fn push(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        lock(&self.inbound).buf.extend_from_slice(payload);
        self.readable.notify_waiters();
    }

    /// Mark end-of-stream for readers and stop the writer task.
    pub(crate) fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.inbound).eof = true;
        self.readable.notify_waiters();
        self.stop.cancel();
    }

    /// Copy queued bytes into `buf`. `Some(0)` means end-of-stream, `None`
    /// means nothing is queued yet.
    fn take(&self, buf: &mut [u8]) -> Option<usize> {
        let mut inbound = lock(&self.inbound);
        if !inbound.buf.is_empty() {
            let n = buf.len().min(inbound.buf.len());
            inbound.buf.copy_to_slice(&mut buf[..n]);
            return Some(n);
        }
        inbound.eof.then_some(0)
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
        let mut outgoing = lock(&self.outgoing);
        outgoing.retired = true;
        outgoing.buf.clear();
        self.pending.send_replace(0);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Slice the write buffer into frames until stopped; drains what is left on stop.
async fn write_loop(shared: Arc<ChannelShared>, outbound: mpsc::Sender<Frame>, max_frame_size: usize) {
    let max_frame_size = max_frame_size.max(1);
    loop {
        let stopping = tokio::select! {
            _ = shared.writable.notified() => false,
            _ = shared.stop.cancelled() => true,
        };

        let mut chunk = {
            let mut outgoing = lock(&shared.outgoing);
            // Retire under the same lock writers take, so no write can land
            // after the final drain.
            if stopping && outgoing.buf.is_empty() {
                outgoing.retired = true;
                break;
            }
            outgoing.buf.split().freeze()
        };
        let drained = chunk.len();
        while !chunk.is_empty() {
            let piece = chunk.split_to(chunk.len().min(max_frame_size));
            trace!(channel = shared.id, bytes = piece.len(), "queueing channel frame");
            if outbound.send(Frame::data(shared.id, piece)).await.is_err() {
                debug!(channel = shared.id, "connection writer gone, dropping channel output");
                shared.mark_broken();
                return;
            }
        }
        if drained > 0 {
            shared.pending.send_modify(|p| *p = p.saturating_sub(drained));
        }
    }
}

/// A bidirectional byte stream identified by a channel id.
///
/// Handles are cheap clones of the same channel. Ordering is guaranteed per
/// direction as long as there is one writer and one reader at a time.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    connection: Arc<ConnectionShared>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>, connection: Arc<ConnectionShared>) -> Self {
        Self { shared, connection }
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    /// Append `data` to the write buffer. Never waits on the transport.
    pub fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        if self.shared.closed.load(Ordering::SeqCst)
            || self.shared.broken.load(Ordering::SeqCst)
            || !self.connection.is_open()
        {
            return Err(LinkError::ChannelClosed(self.shared.id));
        }
        if data.is_empty() {
            return Ok(());
        }
        {
            let mut outgoing = lock(&self.shared.outgoing);
            if outgoing.retired {
                return Err(LinkError::ChannelClosed(self.shared.id));
            }
            // Count before buffering so the writer never subtracts bytes that
            // were not yet counted.
            self.shared.pending.send_modify(|p| *p += data.len());
            outgoing.buf.extend_from_slice(data);
        }
        self.shared.writable.notify_one();
        Ok(())
    }

    /// Wait until every written byte has been handed to the connection.
    pub async fn flush(&self) -> Result<(), LinkError> {
        let mut pending = self.shared.pending.subscribe();
        // The sender lives in `self.shared`, so this cannot observe a closed channel.
        let _ = pending.wait_for(|p| *p == 0).await;
        if self.shared.broken.load(Ordering::SeqCst) {
            return Err(LinkError::ChannelClosed(self.shared.id));
        }
        Ok(())
    }

    /// Read at least one byte, waiting until data arrives.
    ///
    /// Returns as soon as any data has been copied, without trying to fill
    /// `buf`. Returns `Ok(0)` once the channel or its connection has closed
    /// and the receive buffer is empty.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.shared.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(n) = self.shared.take(buf) {
                return Ok(n);
            }
            notified.await;
        }
    }

    /// Read whatever is queued; returns 0 immediately when nothing is.
    pub fn try_read(&self, buf: &mut [u8]) -> usize {
        self.shared.take(buf).unwrap_or(0)
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), LinkError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(LinkError::ChannelClosed(self.shared.id));
            }
            filled += n;
        }
        Ok(())
    }

    /// Bytes received and not yet read.
    pub fn available(&self) -> usize {
        lock(&self.shared.inbound).buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Flush, stop the writer task and unregister from the connection.
    ///
    /// The connection itself stays up.
    pub async fn close(&self) -> Result<(), LinkError> {
        let flushed = if self.is_closed() {
            Ok(())
        } else {
            self.flush().await
        };
        self.shared.shut();
        self.connection.forget_channel(self.shared.id);
        debug!(channel = self.shared.id, "channel closed");
        flushed
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("connection", &self.connection.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
