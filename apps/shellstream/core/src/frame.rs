use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;

use crate::channel::ChannelId;
use crate::protocol::ProtocolVariant;

/// A single websocket message, independent of the websocket library in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
    Close,
}

impl WireMessage {
    /// Raw payload of a data message; `None` for control frames.
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            WireMessage::Binary(bytes) => Some(bytes),
            WireMessage::Text(text) => Some(Bytes::from(text.into_bytes())),
            WireMessage::Close => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown channel index {0}")]
    UnknownChannel(u8),
    #[error("invalid base64 channel prefix {0:?}")]
    InvalidPrefix(char),
    #[error("base64 frame is not valid utf-8")]
    InvalidUtf8,
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}

/// Frames `payload` for `channel` according to the negotiated variant.
pub fn encode_frame(variant: ProtocolVariant, channel: ChannelId, payload: &[u8]) -> WireMessage {
    if variant.is_base64() {
        let mut text = String::with_capacity(1 + (payload.len() + 2) / 3 * 4);
        text.push(channel.base64_prefix());
        STANDARD.encode_string(payload, &mut text);
        WireMessage::Text(text)
    } else {
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(channel.index());
        buf.extend_from_slice(payload);
        WireMessage::Binary(Bytes::from(buf))
    }
}

/// Splits a received data message into its channel and payload.
///
/// Empty messages carry no channel and decode to `None`.
pub fn decode_frame(
    variant: ProtocolVariant,
    data: Bytes,
) -> Result<Option<(ChannelId, Bytes)>, FrameError> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };

    if variant.is_base64() {
        let prefix = char::from(first);
        let channel =
            ChannelId::from_base64_prefix(prefix).ok_or(FrameError::InvalidPrefix(prefix))?;
        let encoded = std::str::from_utf8(&data[1..]).map_err(|_| FrameError::InvalidUtf8)?;
        let payload = STANDARD
            .decode(encoded.trim_end())
            .map_err(|err| FrameError::InvalidBase64(err.to_string()))?;
        Ok(Some((channel, Bytes::from(payload))))
    } else {
        let channel = ChannelId::from_index(first).ok_or(FrameError::UnknownChannel(first))?;
        Ok(Some((channel, data.slice(1..))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn binary_frames_prefix_channel_index() {
        let frame = encode_frame(ProtocolVariant::V4Binary, ChannelId::Stdout, b"hi");
        assert_eq!(frame, WireMessage::Binary(Bytes::from_static(b"\x01hi")));

        let decoded = decode_frame(ProtocolVariant::LegacyBinary, Bytes::from_static(b"\x00abc"))
            .expect("decode ok");
        assert_eq!(decoded, Some((ChannelId::Stdin, Bytes::from_static(b"abc"))));
    }

    #[test_timeout::timeout]
    fn base64_frames_use_ascii_prefix() {
        let frame = encode_frame(ProtocolVariant::V4Base64, ChannelId::Stderr, b"hello\n");
        assert_eq!(frame, WireMessage::Text("2aGVsbG8K".to_string()));

        let decoded = decode_frame(
            ProtocolVariant::LegacyBase64,
            Bytes::from_static(b"0aGVsbG8K"),
        )
        .expect("decode ok");
        assert_eq!(
            decoded,
            Some((ChannelId::Stdin, Bytes::from_static(b"hello\n")))
        );
    }

    #[test_timeout::timeout]
    fn zero_length_payloads_keep_their_channel() {
        let frame = encode_frame(ProtocolVariant::V4Base64, ChannelId::Stdout, b"");
        assert_eq!(frame, WireMessage::Text("1".to_string()));
        let data = frame.into_data().expect("data frame");
        let decoded = decode_frame(ProtocolVariant::V4Base64, data).expect("decode ok");
        assert_eq!(decoded, Some((ChannelId::Stdout, Bytes::new())));
    }

    #[test_timeout::timeout]
    fn empty_message_is_skipped() {
        assert_eq!(
            decode_frame(ProtocolVariant::V4Binary, Bytes::new()),
            Ok(None)
        );
    }

    #[test_timeout::timeout]
    fn malformed_frames_are_rejected() {
        assert_eq!(
            decode_frame(ProtocolVariant::V4Binary, Bytes::from_static(b"\x09x")),
            Err(FrameError::UnknownChannel(9))
        );
        assert_eq!(
            decode_frame(ProtocolVariant::V4Base64, Bytes::from_static(b"zAAAA")),
            Err(FrameError::InvalidPrefix('z'))
        );
        assert!(matches!(
            decode_frame(ProtocolVariant::V4Base64, Bytes::from_static(b"0!!!")),
            Err(FrameError::InvalidBase64(_))
        ));
    }
}
