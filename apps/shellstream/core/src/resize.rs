use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::mux::ChannelReader;

/// Terminal dimensions carried on the resize channel.
///
/// Encoded with the `Width`/`Height` field names kubectl sends; `cols`/`rows`
/// are accepted on input as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    #[serde(rename = "Height", alias = "rows")]
    pub rows: u16,
    #[serde(rename = "Width", alias = "cols")]
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    pub fn encode(&self) -> Bytes {
        // Two integer fields always serialize.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}

#[derive(Debug, Error)]
#[error("malformed resize record: {0}")]
pub struct ResizeDecodeError(#[from] serde_json::Error);

/// Incremental decoder for a stream of concatenated JSON size records.
///
/// Records may span channel messages, and one message may hold several.
#[derive(Debug, Default)]
pub struct ResizeDecoder {
    pending: Vec<u8>,
}

impl ResizeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every record it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<TerminalSize>, ResizeDecodeError> {
        self.pending.extend_from_slice(chunk);

        let mut sizes = Vec::new();
        let mut stream =
            serde_json::Deserializer::from_slice(&self.pending).into_iter::<TerminalSize>();
        let mut consumed = 0;
        loop {
            match stream.next() {
                Some(Ok(size)) => {
                    sizes.push(size);
                    consumed = stream.byte_offset();
                }
                Some(Err(err)) if err.is_eof() => break,
                Some(Err(err)) => return Err(err.into()),
                None => {
                    consumed = self.pending.len();
                    break;
                }
            }
        }
        self.pending.drain(..consumed);
        Ok(sizes)
    }
}

/// Decodes size records from `reader` and delivers each to `sink` in order.
///
/// Returns once the channel ends, the consumer goes away, or a record is
/// malformed; the session itself is unaffected in every case.
pub async fn run_resize_loop(
    mut reader: ChannelReader,
    sink: mpsc::UnboundedSender<TerminalSize>,
) -> Result<(), ResizeDecodeError> {
    let mut decoder = ResizeDecoder::new();
    while let Some(chunk) = reader.recv().await {
        for size in decoder.push(&chunk)? {
            trace!(rows = size.rows, cols = size.cols, "terminal resized");
            if sink.send(size).is_err() {
                debug!("resize consumer dropped");
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, ChannelSet, Side, StreamOptions};
    use crate::frame::{encode_frame, WireMessage};
    use crate::mux::MuxConnection;
    use crate::protocol::ProtocolVariant;
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};

    #[test_timeout::timeout]
    fn records_decode_in_order() {
        let mut decoder = ResizeDecoder::new();
        let sizes = decoder
            .push(br#"{"Width":80,"Height":24}{"Width":100,"Height":30}"#)
            .expect("decode");
        assert_eq!(sizes, vec![TerminalSize::new(24, 80), TerminalSize::new(30, 100)]);
    }

    #[test_timeout::timeout]
    fn records_may_span_chunks() {
        let mut decoder = ResizeDecoder::new();
        assert!(decoder.push(br#"{"rows":24,"#).expect("partial").is_empty());
        let sizes = decoder.push(br#""cols":80} "#).expect("rest");
        assert_eq!(sizes, vec![TerminalSize::new(24, 80)]);
        assert!(decoder.push(b"\n").expect("whitespace").is_empty());
    }

    #[test_timeout::timeout]
    fn malformed_record_is_an_error() {
        let mut decoder = ResizeDecoder::new();
        assert!(decoder.push(br#"{"Width":"wide"}"#).is_err());
        let mut decoder = ResizeDecoder::new();
        assert!(decoder.push(br#"{"Width":70000,"Height":1}"#).is_err());
    }

    #[test_timeout::timeout]
    fn encoding_uses_terminal_field_names() {
        let encoded = TerminalSize::new(24, 80).encode();
        assert_eq!(&encoded[..], br#"{"Height":24,"Width":80}"#);
    }

    #[test_timeout::tokio_timeout_test]
    async fn resize_loop_delivers_channel_records_in_order() {
        let variant = ProtocolVariant::V4Base64;
        let (to_server, server_in) = fmpsc::unbounded::<WireMessage>();
        let (server_out, _from_server) = fmpsc::unbounded::<WireMessage>();
        let options = StreamOptions {
            tty: true,
            stdout: true,
            ..Default::default()
        };
        let mut mux = MuxConnection::open(
            server_out.sink_map_err(|err| err.to_string()),
            server_in.map(Ok::<_, String>),
            variant,
            Side::Server,
            ChannelSet::for_options(&options),
        );
        let reader = mux.take_reader(ChannelId::Resize).expect("resize reader");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let resize_loop = tokio::spawn(run_resize_loop(reader, tx));

        for size in [TerminalSize::new(24, 80), TerminalSize::new(30, 100)] {
            to_server
                .unbounded_send(encode_frame(variant, ChannelId::Resize, &size.encode()))
                .expect("send resize");
        }
        to_server
            .unbounded_send(encode_frame(variant, ChannelId::Resize, b"garbage"))
            .expect("send garbage");

        assert_eq!(rx.recv().await, Some(TerminalSize::new(24, 80)));
        assert_eq!(rx.recv().await, Some(TerminalSize::new(30, 100)));
        assert!(resize_loop.await.expect("joined").is_err());
        assert_eq!(rx.recv().await, None);
        assert!(!mux.is_disconnected());
    }
}
