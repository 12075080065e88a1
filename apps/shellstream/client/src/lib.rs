//! Calling side of shellstream exec sessions.

pub mod executor;

pub use executor::{
    drive, negotiated_variant, Executor, ExecutorConfig, ExecutorError, LocalReader, LocalWriter,
    StreamIo,
};
pub use shellstream_core::{ExecOutcome, ProtocolVariant, TerminalSize};
