//! Wire-level building blocks shared by the shellstream server and client.

pub mod channel;
pub mod frame;
pub mod mux;
pub mod protocol;
pub mod resize;
pub mod signal;
pub mod status;

pub use channel::{ChannelId, ChannelSet, Side, StreamOptions};
pub use frame::{decode_frame, encode_frame, FrameError, WireMessage};
pub use mux::{ChannelReader, ChannelWriter, MuxConnection, MuxError, ReadCloser};
pub use protocol::{
    negotiate, parse_offers, select_protocol, ProtocolVariant, UnsupportedProtocol,
    HEADER_PROTOCOL_VERSION, HEADER_WEBSOCKET_PROTOCOL,
};
pub use resize::{run_resize_loop, ResizeDecodeError, ResizeDecoder, TerminalSize};
pub use signal::CloseSignal;
pub use status::{decode_status, encode_status, ExecOutcome, Status, StatusDecodeError, StatusReporter};
