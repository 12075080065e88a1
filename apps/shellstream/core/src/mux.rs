//! Logical channels over one upgraded websocket connection.
//!
//! A [`MuxConnection`] owns two background tasks: a reader that demultiplexes
//! incoming frames into per-channel queues, and a writer that frames outgoing
//! payloads in submission order. Losing the physical connection unblocks every
//! [`ChannelReader`] and fails every pending [`ChannelWriter::write`]; the
//! writer task then only waits to send the close frame [`MuxConnection::close`]
//! asks for.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelId, ChannelSet, Side};
use crate::frame::{decode_frame, encode_frame, WireMessage};
use crate::protocol::ProtocolVariant;
use crate::signal::CloseSignal;

const DEFAULT_CHANNEL_DEPTH: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MuxError {
    #[error("{0} channel is closed")]
    ChannelClosed(ChannelId),
    #[error("connection is closed")]
    Disconnected,
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        io::Error::new(io::ErrorKind::BrokenPipe, err)
    }
}

enum Outbound {
    Data(ChannelId, Bytes),
    Close,
}

pub struct MuxConnection {
    variant: ProtocolVariant,
    side: Side,
    channels: ChannelSet,
    outbound: mpsc::Sender<Outbound>,
    close_requested: Option<oneshot::Sender<()>>,
    readers: [Option<ChannelReader>; 5],
    writer_closed: [Arc<AtomicBool>; 5],
    disconnected: Arc<CloseSignal>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxConnection")
            .field("variant", &self.variant)
            .field("side", &self.side)
            .field("channels", &self.channels)
            .finish()
    }
}

impl MuxConnection {
    /// Starts multiplexing over an already upgraded connection.
    ///
    /// Readers are created for every channel in `channels` that `side`
    /// consumes; frames for any other channel are discarded.
    pub fn open<Si, St, E>(
        sink: Si,
        stream: St,
        variant: ProtocolVariant,
        side: Side,
        channels: ChannelSet,
    ) -> Self
    where
        Si: Sink<WireMessage, Error = E> + Send + 'static,
        St: Stream<Item = Result<WireMessage, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(DEFAULT_CHANNEL_DEPTH);
        let (close_tx, close_rx) = oneshot::channel();
        let disconnected = Arc::new(CloseSignal::new());

        let mut routes: [Option<mpsc::Sender<Bytes>>; 5] = Default::default();
        let mut readers: [Option<ChannelReader>; 5] = Default::default();
        for channel in channels.iter().filter(|channel| side.reads(*channel)) {
            let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_DEPTH);
            routes[channel.index() as usize] = Some(tx);
            readers[channel.index() as usize] = Some(ChannelReader::new(channel, rx));
        }

        let reader_task = tokio::spawn(read_loop(
            stream,
            variant,
            routes,
            Arc::clone(&disconnected),
        ));
        let writer_task = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            close_rx,
            variant,
            Arc::clone(&disconnected),
        ));

        Self {
            variant,
            side,
            channels,
            outbound: outbound_tx,
            close_requested: Some(close_tx),
            readers,
            writer_closed: Default::default(),
            disconnected,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    /// Hands out the reader for `channel`; `None` if not readable here or already taken.
    pub fn take_reader(&mut self, channel: ChannelId) -> Option<ChannelReader> {
        self.readers[channel.index() as usize].take()
    }

    /// A writer for `channel` if this side produces it and it is open.
    /// Every writer for the same channel shares its close state.
    pub fn writer(&self, channel: ChannelId) -> Option<ChannelWriter> {
        if !self.side.writes(channel) || !self.channels.contains(channel) {
            return None;
        }
        Some(ChannelWriter {
            channel,
            outbound: self.outbound.clone(),
            closed: Arc::clone(&self.writer_closed[channel.index() as usize]),
        })
    }

    /// Sends a zero-length frame so the peer knows the streams are ready.
    pub async fn signal_ready(&self, channel: ChannelId) -> Result<(), MuxError> {
        self.outbound
            .send(Outbound::Data(channel, Bytes::new()))
            .await
            .map_err(|_| MuxError::Disconnected)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.is_closed()
    }

    /// Resolves once the peer has gone away.
    pub async fn disconnected(&self) {
        self.disconnected.closed().await
    }

    /// Sends a close frame after every queued frame, then waits for the peer
    /// to acknowledge it (bounded by a grace period). If the peer has already
    /// gone, queued frames are dropped but the close frame is still sent.
    pub async fn close(mut self) {
        for reader in self.readers.iter_mut() {
            reader.take();
        }
        let _ = self.outbound.send(Outbound::Close).await;
        if let Some(close) = self.close_requested.take() {
            let _ = close.send(());
        }
        if let Some(writer) = self.writer_task.take() {
            let _ = writer.await;
        }
        if let Some(mut reader) = self.reader_task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut reader).await.is_err() {
                debug!(variant = %self.variant, "peer did not acknowledge close");
                reader.abort();
            }
        }
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

/// Read half of one logical channel.
#[derive(Debug)]
pub struct ChannelReader {
    channel: ChannelId,
    rx: mpsc::Receiver<Bytes>,
    closed: Arc<CloseSignal>,
}

impl ChannelReader {
    fn new(channel: ChannelId, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            channel,
            rx,
            closed: Arc::new(CloseSignal::new()),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Next chunk in arrival order; `None` once the peer disconnected or the
    /// read side was closed through a [`ReadCloser`].
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.closed.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.closed() => None,
            chunk = self.rx.recv() => chunk,
        }
    }

    /// Handle that can close this reader from another task.
    pub fn closer(&self) -> ReadCloser {
        ReadCloser {
            signal: Arc::clone(&self.closed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadCloser {
    signal: Arc<CloseSignal>,
}

impl ReadCloser {
    pub fn close(&self) {
        self.signal.close();
    }
}

/// Write half of one logical channel. Clones share the same close state.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    channel: ChannelId,
    outbound: mpsc::Sender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl ChannelWriter {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub async fn write(&self, data: Bytes) -> Result<(), MuxError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::ChannelClosed(self.channel));
        }
        self.outbound
            .send(Outbound::Data(self.channel, data))
            .await
            .map_err(|_| MuxError::Disconnected)
    }

    /// Closes this channel only; the connection and other channels stay open.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    /// Resolves when the connection can no longer carry writes.
    pub async fn disconnected(&self) {
        self.outbound.closed().await
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outbound::Data(channel, data) => write!(f, "Data({channel}, {} bytes)", data.len()),
            Outbound::Close => f.write_str("Close"),
        }
    }
}

async fn read_loop<St, E>(
    stream: St,
    variant: ProtocolVariant,
    mut routes: [Option<mpsc::Sender<Bytes>>; 5],
    disconnected: Arc<CloseSignal>,
) where
    St: Stream<Item = Result<WireMessage, E>>,
    E: fmt::Display,
{
    let mut stream = Box::pin(stream);
    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "connection read failed");
                break;
            }
        };
        let Some(data) = message.into_data() else {
            trace!("peer sent close frame");
            break;
        };
        let (channel, payload) = match decode_frame(variant, data) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, protocol = %variant, "dropping malformed frame");
                continue;
            }
        };
        if payload.is_empty() {
            continue;
        }

        let slot = &mut routes[channel.index() as usize];
        let delivered = match slot.as_ref() {
            Some(tx) => tx.send(payload).await.is_ok(),
            None => {
                trace!(channel = %channel, "dropping frame for unopened channel");
                continue;
            }
        };
        if !delivered {
            *slot = None;
        }
    }
    disconnected.close();
}

async fn write_loop<Si, E>(
    sink: Si,
    mut outbound: mpsc::Receiver<Outbound>,
    close_requested: oneshot::Receiver<()>,
    variant: ProtocolVariant,
    disconnected: Arc<CloseSignal>,
) where
    Si: Sink<WireMessage, Error = E>,
    E: fmt::Display,
{
    let mut sink = Box::pin(sink);
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            _ = disconnected.closed() => None,
        };
        match next {
            Some(Outbound::Data(channel, payload)) => {
                let frame = encode_frame(variant, channel, &payload);
                if let Err(err) = sink.send(frame).await {
                    debug!(error = %err, channel = %channel, "connection write failed");
                    break;
                }
            }
            Some(Outbound::Close) => {
                send_close(&mut sink).await;
                return;
            }
            None => break,
        }
    }

    // Writes fail from here on; only the owner's close is still honoured.
    outbound.close();
    while let Ok(next) = outbound.try_recv() {
        if let Outbound::Close = next {
            send_close(&mut sink).await;
            return;
        }
    }
    if close_requested.await.is_ok() {
        send_close(&mut sink).await;
    }
}

async fn send_close<Si, E>(sink: &mut Pin<Box<Si>>)
where
    Si: Sink<WireMessage, Error = E>,
    E: fmt::Display,
{
    if let Err(err) = sink.send(WireMessage::Close).await {
        trace!(error = %err, "close frame not delivered");
    }
    let _ = sink.close().await;
}
