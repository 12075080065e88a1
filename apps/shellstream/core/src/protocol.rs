use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Header carrying the ordered list of stream protocols a client accepts.
pub const HEADER_PROTOCOL_VERSION: &str = "X-Stream-Protocol-Version";
/// Standard websocket subprotocol header, used for the same negotiation.
pub const HEADER_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

const V4_BINARY: &str = "v4.channel.k8s.io";
const V4_BASE64: &str = "v4.base64.channel.k8s.io";
const LEGACY_BINARY: &str = "channel.k8s.io";
const LEGACY_BASE64: &str = "base64.channel.k8s.io";

/// Wire encoding negotiated once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    V4Binary,
    V4Base64,
    LegacyBinary,
    LegacyBase64,
}

impl ProtocolVariant {
    /// Every variant the server speaks, in server preference order.
    pub const SUPPORTED: [ProtocolVariant; 4] = [
        ProtocolVariant::V4Binary,
        ProtocolVariant::V4Base64,
        ProtocolVariant::LegacyBinary,
        ProtocolVariant::LegacyBase64,
    ];

    pub fn identifier(self) -> &'static str {
        match self {
            ProtocolVariant::V4Binary => V4_BINARY,
            ProtocolVariant::V4Base64 => V4_BASE64,
            ProtocolVariant::LegacyBinary => LEGACY_BINARY,
            ProtocolVariant::LegacyBase64 => LEGACY_BASE64,
        }
    }

    pub fn from_identifier(value: &str) -> Option<Self> {
        match value.trim() {
            V4_BINARY => Some(ProtocolVariant::V4Binary),
            V4_BASE64 => Some(ProtocolVariant::V4Base64),
            LEGACY_BINARY => Some(ProtocolVariant::LegacyBinary),
            LEGACY_BASE64 => Some(ProtocolVariant::LegacyBase64),
            _ => None,
        }
    }

    /// Text frames with a `'0'+channel` prefix and base64 payloads.
    pub fn is_base64(self) -> bool {
        matches!(
            self,
            ProtocolVariant::V4Base64 | ProtocolVariant::LegacyBase64
        )
    }

    /// Structured JSON status records on the error channel.
    pub fn is_v4(self) -> bool {
        matches!(self, ProtocolVariant::V4Binary | ProtocolVariant::V4Base64)
    }

    pub fn metric_label(self) -> &'static str {
        match self {
            ProtocolVariant::V4Binary => "v4_binary",
            ProtocolVariant::V4Base64 => "v4_base64",
            ProtocolVariant::LegacyBinary => "legacy_binary",
            ProtocolVariant::LegacyBase64 => "legacy_base64",
        }
    }
}

impl Default for ProtocolVariant {
    /// The original, pre-versioned protocol.
    fn default() -> Self {
        ProtocolVariant::LegacyBinary
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported stream protocol: {0}")]
pub struct UnsupportedProtocol(pub String);

impl FromStr for ProtocolVariant {
    type Err = UnsupportedProtocol;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ProtocolVariant::from_identifier(value)
            .ok_or_else(|| UnsupportedProtocol(value.trim().to_string()))
    }
}

/// Splits raw header values (possibly comma separated) into an ordered offer list.
pub fn parse_offers<'a, I>(header_values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    header_values
        .into_iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// First client offer the server also speaks, honouring the client's order.
pub fn select_protocol<I, S>(offers: I) -> Option<ProtocolVariant>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    offers
        .into_iter()
        .find_map(|offer| ProtocolVariant::from_identifier(offer.as_ref()))
}

/// Like [`select_protocol`], falling back to [`ProtocolVariant::LegacyBinary`]
/// when the client offered nothing the server recognises.
pub fn negotiate<I, S>(offers: I) -> ProtocolVariant
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    select_protocol(offers).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn unknown_offer_is_skipped_in_client_order() {
        let chosen = negotiate(["v5.channel.k8s.io", "v4.channel.k8s.io"]);
        assert_eq!(chosen, ProtocolVariant::V4Binary);
    }

    #[test_timeout::timeout]
    fn client_order_wins_over_server_preference() {
        let chosen = negotiate(["base64.channel.k8s.io", "v4.channel.k8s.io"]);
        assert_eq!(chosen, ProtocolVariant::LegacyBase64);
    }

    #[test_timeout::timeout]
    fn nothing_recognised_falls_back_to_legacy_binary() {
        assert_eq!(negotiate(["bogus", "SPDY/3.1"]), ProtocolVariant::LegacyBinary);
        assert_eq!(negotiate(Vec::<String>::new()), ProtocolVariant::LegacyBinary);
        assert_eq!(select_protocol(["bogus"]), None);
    }

    #[test_timeout::timeout]
    fn offers_split_comma_separated_headers() {
        let offers = parse_offers([
            "v4.base64.channel.k8s.io, channel.k8s.io",
            " v4.channel.k8s.io ",
            "",
        ]);
        assert_eq!(
            offers,
            vec![
                "v4.base64.channel.k8s.io",
                "channel.k8s.io",
                "v4.channel.k8s.io"
            ]
        );
        assert_eq!(negotiate(&offers), ProtocolVariant::V4Base64);
    }

    #[test_timeout::timeout]
    fn identifiers_round_trip() {
        for variant in ProtocolVariant::SUPPORTED {
            assert_eq!(variant.identifier().parse::<ProtocolVariant>(), Ok(variant));
        }
        assert!(ProtocolVariant::V4Base64.is_base64());
        assert!(ProtocolVariant::V4Base64.is_v4());
        assert!(!ProtocolVariant::LegacyBinary.is_v4());
        assert!(!ProtocolVariant::LegacyBinary.is_base64());
    }
}
