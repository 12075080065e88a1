//! Client half of an exec session.
//!
//! An [`Executor`] dials an exec URL, lets the server pick one of the offered
//! stream protocols, and then copies local streams to and from the session's
//! channels until the server hangs up.

use std::fmt;
use std::io;

use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use shellstream_core::{
    decode_status, ChannelId, ChannelReader, ChannelSet, ChannelWriter, ExecOutcome,
    MuxConnection, ProtocolVariant, Side, StatusDecodeError, StreamOptions, TerminalSize,
    WireMessage, HEADER_PROTOCOL_VERSION, HEADER_WEBSOCKET_PROTOCOL,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    handshake::client::Request,
    http::{HeaderMap, HeaderName, HeaderValue},
    Message,
};
use tracing::{debug, info, warn};

const COPY_BUFFER_SIZE: usize = 32 * 1024;

pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Protocols to offer, most preferred first.
    pub protocols: Vec<ProtocolVariant>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            protocols: vec![ProtocolVariant::V4Binary],
        }
    }
}

/// Local ends of an exec session. A stream left as `None` is not attached.
#[derive(Default)]
pub struct StreamIo {
    pub stdin: Option<LocalReader>,
    pub stdout: Option<LocalWriter>,
    pub stderr: Option<LocalWriter>,
    pub tty: bool,
    /// Terminal sizes to forward while the session runs (TTY only).
    pub resize: Option<mpsc::UnboundedReceiver<TerminalSize>>,
}

impl StreamIo {
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            stdin: self.stdin.is_some(),
            stdout: self.stdout.is_some(),
            stderr: self.stderr.is_some(),
            tty: self.tty,
        }
    }
}

impl fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamIo")
            .field("options", &self.stream_options())
            .field("resize", &self.resize.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("exec upgrade failed: {reason}")]
    UpgradeFailed { status: Option<u16>, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unreadable status record: {0}")]
    Status(#[from] StatusDecodeError),
}

impl ExecutorError {
    /// The HTTP status the server refused the upgrade with, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ExecutorError::UpgradeFailed { status, .. } => *status,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Executor {
    url: String,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(url: impl Into<String>, config: ExecutorConfig) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Runs the session to completion and returns the remote outcome.
    ///
    /// A command that exits non-zero is still `Ok`; errors are reserved for
    /// sessions that could not be established or whose status was garbled.
    pub async fn stream(&self, io: StreamIo) -> Result<ExecOutcome, ExecutorError> {
        let request = self.upgrade_request()?;
        let (socket, response) = connect_async(request).await.map_err(upgrade_error)?;
        let variant = negotiated_variant(response.headers());
        info!(url = %self.url, protocol = %variant, "exec upgrade negotiated");

        let (sink, stream) = socket.split();
        let sink = sink.with(|message: WireMessage| {
            future::ready(Ok::<_, tungstenite::Error>(to_message(message)))
        });
        let stream = stream.filter_map(|message| future::ready(from_message(message)));
        drive(sink, stream, variant, io).await
    }

    fn upgrade_request(&self) -> Result<Request, ExecutorError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(upgrade_error)?;
        if self.config.protocols.is_empty() {
            return Ok(request);
        }

        let offered = self
            .config
            .protocols
            .iter()
            .map(|variant| variant.identifier())
            .collect::<Vec<_>>()
            .join(", ");
        let value = HeaderValue::from_str(&offered).map_err(|err| ExecutorError::UpgradeFailed {
            status: None,
            reason: err.to_string(),
        })?;
        for name in [HEADER_WEBSOCKET_PROTOCOL, HEADER_PROTOCOL_VERSION] {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                ExecutorError::UpgradeFailed {
                    status: None,
                    reason: err.to_string(),
                }
            })?;
            request.headers_mut().insert(name, value.clone());
        }
        Ok(request)
    }
}

/// Reads the protocol the server chose; servers that predate negotiation
/// answer with neither header and speak the legacy binary protocol.
pub fn negotiated_variant(headers: &HeaderMap) -> ProtocolVariant {
    [HEADER_PROTOCOL_VERSION, HEADER_WEBSOCKET_PROTOCOL]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .find_map(ProtocolVariant::from_identifier)
        .unwrap_or_default()
}

/// Runs the client side of a session over an already upgraded connection.
pub async fn drive<Si, St, E>(
    sink: Si,
    stream: St,
    variant: ProtocolVariant,
    io: StreamIo,
) -> Result<ExecOutcome, ExecutorError>
where
    Si: Sink<WireMessage, Error = E> + Send + 'static,
    St: Stream<Item = Result<WireMessage, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let options = io.stream_options();
    let mut mux = MuxConnection::open(
        sink,
        stream,
        variant,
        Side::Client,
        ChannelSet::for_options(&options),
    );
    let StreamIo {
        stdin,
        stdout,
        stderr,
        tty,
        resize,
    } = io;

    let mut inputs = JoinSet::new();
    if let (Some(local), Some(remote)) = (stdin, mux.writer(ChannelId::Stdin)) {
        inputs.spawn(send_local(local, remote));
    }
    if let (true, Some(sizes), Some(remote)) = (tty, resize, mux.writer(ChannelId::Resize)) {
        inputs.spawn(send_resizes(sizes, remote));
    }

    let mut outputs = JoinSet::new();
    for (channel, local) in [(ChannelId::Stdout, stdout), (ChannelId::Stderr, stderr)] {
        if let (Some(local), Some(remote)) = (local, mux.take_reader(channel)) {
            outputs.spawn(receive_remote(remote, local));
        }
    }

    let status = match mux.take_reader(ChannelId::Error) {
        Some(reader) => collect(reader).await,
        None => Vec::new(),
    };

    // The error channel only ends with the connection, so every output
    // channel has seen its last frame by now.
    let mut local_error = None;
    while let Some(joined) = outputs.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(error = %err, "failed to write remote output locally");
                local_error.get_or_insert(err);
            }
            Err(err) => warn!(error = %err, "output copy task failed"),
        }
    }
    inputs.abort_all();
    mux.close().await;

    if let Some(err) = local_error {
        return Err(err.into());
    }
    let outcome = decode_status(variant, &status)?;
    debug!(outcome = %outcome, "exec session finished");
    Ok(outcome)
}

async fn send_local(mut local: LocalReader, remote: ChannelWriter) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = local.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        remote.write(Bytes::copy_from_slice(&buf[..read])).await?;
        total += read as u64;
    }
    remote.close();
    debug!(bytes = total, "local stdin exhausted");
    Ok(total)
}

async fn send_resizes(
    mut sizes: mpsc::UnboundedReceiver<TerminalSize>,
    remote: ChannelWriter,
) -> io::Result<u64> {
    let mut sent = 0u64;
    while let Some(size) = sizes.recv().await {
        remote.write(size.encode()).await?;
        sent += 1;
    }
    Ok(sent)
}

async fn receive_remote(mut remote: ChannelReader, mut local: LocalWriter) -> io::Result<()> {
    while let Some(chunk) = remote.recv().await {
        local.write_all(&chunk).await?;
        local.flush().await?;
    }
    local.shutdown().await
}

async fn collect(mut reader: ChannelReader) -> Vec<u8> {
    let mut data = Vec::new();
    while let Some(chunk) = reader.recv().await {
        data.extend_from_slice(&chunk);
    }
    data
}

fn upgrade_error(err: tungstenite::Error) -> ExecutorError {
    match err {
        tungstenite::Error::Http(response) => ExecutorError::UpgradeFailed {
            status: Some(response.status().as_u16()),
            reason: format!("server answered {}", response.status()),
        },
        tungstenite::Error::Io(err) => ExecutorError::Io(err),
        other => ExecutorError::UpgradeFailed {
            status: None,
            reason: other.to_string(),
        },
    }
}

fn to_message(message: WireMessage) -> Message {
    match message {
        WireMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Close => Message::Close(None),
    }
}

fn from_message(
    message: Result<Message, tungstenite::Error>,
) -> Option<Result<WireMessage, tungstenite::Error>> {
    match message {
        Ok(Message::Binary(bytes)) => Some(Ok(WireMessage::Binary(bytes.into()))),
        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
        Ok(Message::Close(_)) => Some(Ok(WireMessage::Close)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(err) => Some(Err(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use shellstream_core::{encode_frame, encode_status};

    struct FakeServer {
        variant: ProtocolVariant,
        to_client: fmpsc::UnboundedSender<WireMessage>,
        from_client: fmpsc::UnboundedReceiver<WireMessage>,
    }

    impl FakeServer {
        fn send(&self, channel: ChannelId, payload: &[u8]) {
            self.to_client
                .unbounded_send(encode_frame(self.variant, channel, payload))
                .expect("client connected");
        }

        fn finish(self, outcome: &ExecOutcome) -> fmpsc::UnboundedReceiver<WireMessage> {
            if let Some(status) = encode_status(self.variant, outcome) {
                self.send(ChannelId::Error, &status);
            }
            self.from_client
        }
    }

    fn spawn_client(
        variant: ProtocolVariant,
        io: StreamIo,
    ) -> (
        FakeServer,
        tokio::task::JoinHandle<Result<ExecOutcome, ExecutorError>>,
    ) {
        let (to_client, client_in) = fmpsc::unbounded::<WireMessage>();
        let (client_out, from_client) = fmpsc::unbounded::<WireMessage>();
        let sink = client_out.sink_map_err(|err| err.to_string());
        let stream = client_in.map(Ok::<_, String>);
        let handle = tokio::spawn(drive(sink, stream, variant, io));
        (
            FakeServer {
                variant,
                to_client,
                from_client,
            },
            handle,
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn output_and_success_status_are_delivered() {
        let (stdout, mut stdout_peer) = tokio::io::duplex(1024);
        let io = StreamIo {
            stdout: Some(Box::new(stdout)),
            ..StreamIo::default()
        };
        let (server, client) = spawn_client(ProtocolVariant::V4Binary, io);

        server.send(ChannelId::Error, b"");
        server.send(ChannelId::Stdout, b"hello\n");
        drop(server.finish(&ExecOutcome::Success));

        let outcome = client.await.expect("join").expect("session");
        assert_eq!(outcome, ExecOutcome::Success);

        let mut seen = Vec::new();
        stdout_peer.read_to_end(&mut seen).await.expect("read stdout");
        assert_eq!(seen, b"hello\n");
    }

    #[test_timeout::tokio_timeout_test]
    async fn stdin_is_forwarded_and_exit_code_surfaces() {
        let (stdout, _stdout_peer) = tokio::io::duplex(1024);
        let io = StreamIo {
            stdin: Some(Box::new(&b"ping"[..])),
            stdout: Some(Box::new(stdout)),
            ..StreamIo::default()
        };
        let (mut server, client) = spawn_client(ProtocolVariant::V4Base64, io);

        let first = server.from_client.next().await.expect("stdin frame");
        assert_eq!(first, WireMessage::Text("0cGluZw==".to_string()));
        let mut from_client = server.finish(&ExecOutcome::ExitCode(2));

        let outcome = client.await.expect("join").expect("session");
        assert_eq!(outcome, ExecOutcome::ExitCode(2));
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(from_client.next().await, Some(WireMessage::Close));
    }

    #[test_timeout::tokio_timeout_test]
    async fn legacy_status_is_plain_text() {
        let (stderr, _stderr_peer) = tokio::io::duplex(1024);
        let io = StreamIo {
            stderr: Some(Box::new(stderr)),
            ..StreamIo::default()
        };
        let (server, client) = spawn_client(ProtocolVariant::LegacyBinary, io);
        server.send(ChannelId::Error, b"container not running");
        drop(server);

        let outcome = client.await.expect("join").expect("session");
        assert_eq!(outcome, ExecOutcome::Failed("container not running".into()));
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn resizes_are_sent_only_for_terminals() {
        let (stdout, _stdout_peer) = tokio::io::duplex(1024);
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        resize_tx.send(TerminalSize::new(24, 80)).expect("queue resize");
        let io = StreamIo {
            stdout: Some(Box::new(stdout)),
            tty: true,
            resize: Some(resize_rx),
            ..StreamIo::default()
        };
        let (mut server, client) = spawn_client(ProtocolVariant::V4Binary, io);

        let frame = server.from_client.next().await.expect("resize frame");
        let mut expected = vec![ChannelId::Resize.index()];
        expected.extend_from_slice(&TerminalSize::new(24, 80).encode());
        assert_eq!(frame, WireMessage::Binary(Bytes::from(expected)));

        drop(server.to_client);
        let outcome = client.await.expect("join").expect("session");
        assert_eq!(outcome, ExecOutcome::Success);
    }

    #[test_timeout::timeout]
    fn negotiated_protocol_is_read_from_response_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(negotiated_variant(&headers), ProtocolVariant::LegacyBinary);

        headers.insert(
            HeaderName::from_static("sec-websocket-protocol"),
            HeaderValue::from_static("base64.channel.k8s.io"),
        );
        assert_eq!(negotiated_variant(&headers), ProtocolVariant::LegacyBase64);

        headers.insert(
            HeaderName::from_static("x-stream-protocol-version"),
            HeaderValue::from_static("v4.channel.k8s.io"),
        );
        assert_eq!(negotiated_variant(&headers), ProtocolVariant::V4Binary);
    }

    #[test_timeout::timeout]
    fn upgrade_request_offers_protocols_in_order() {
        let executor = Executor::new(
            "ws://127.0.0.1:10010/exec/abc",
            ExecutorConfig {
                protocols: vec![ProtocolVariant::V4Base64, ProtocolVariant::LegacyBinary],
            },
        );
        let request = executor.upgrade_request().expect("request");
        let offered = request
            .headers()
            .get(HEADER_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok());
        assert_eq!(offered, Some("v4.base64.channel.k8s.io, channel.k8s.io"));
        assert_eq!(
            request.headers().get(HEADER_PROTOCOL_VERSION),
            request.headers().get(HEADER_WEBSOCKET_PROTOCOL)
        );

        let bare = Executor::new("ws://127.0.0.1:10010/exec/abc", ExecutorConfig { protocols: vec![] });
        let request = bare.upgrade_request().expect("request");
        assert!(request.headers().get(HEADER_PROTOCOL_VERSION).is_none());
    }
}
