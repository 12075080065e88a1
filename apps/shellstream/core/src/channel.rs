use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical streams multiplexed over one exec connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelId {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    Error = 3,
    Resize = 4,
}

impl ChannelId {
    pub const ALL: [ChannelId; 5] = [
        ChannelId::Stdin,
        ChannelId::Stdout,
        ChannelId::Stderr,
        ChannelId::Error,
        ChannelId::Resize,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        ChannelId::ALL.get(index as usize).copied()
    }

    /// Prefix character used by the base64 variants.
    pub fn base64_prefix(self) -> char {
        char::from(b'0' + self.index())
    }

    pub fn from_base64_prefix(prefix: char) -> Option<Self> {
        let digit = prefix.to_digit(10)?;
        u8::try_from(digit).ok().and_then(ChannelId::from_index)
    }

    /// Which peer produces bytes on this channel.
    pub fn producer(self) -> Side {
        match self {
            ChannelId::Stdin | ChannelId::Resize => Side::Client,
            ChannelId::Stdout | ChannelId::Stderr | ChannelId::Error => Side::Server,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelId::Stdin => "stdin",
            ChannelId::Stdout => "stdout",
            ChannelId::Stderr => "stderr",
            ChannelId::Error => "error",
            ChannelId::Resize => "resize",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint of an exec connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    pub fn writes(self, channel: ChannelId) -> bool {
        channel.producer() == self
    }

    pub fn reads(self, channel: ChannelId) -> bool {
        !self.writes(channel)
    }
}

/// Which standard streams an exec session attaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
    #[serde(default)]
    pub tty: bool,
}

impl StreamOptions {
    /// Stderr is carried on stdout when a terminal is attached.
    pub fn stderr_enabled(&self) -> bool {
        self.stderr && !self.tty
    }

    /// Output channel that receives the zero-length "streams ready" write.
    pub fn ready_channel(&self) -> ChannelId {
        if self.stdout {
            ChannelId::Stdout
        } else if self.stderr_enabled() {
            ChannelId::Stderr
        } else {
            ChannelId::Error
        }
    }
}

/// The set of channels opened for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet {
    bits: u8,
}

impl ChannelSet {
    pub fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Error and resize are always open; the rest follow the stream options.
    pub fn for_options(options: &StreamOptions) -> Self {
        let mut set = ChannelSet::empty()
            .with(ChannelId::Error)
            .with(ChannelId::Resize);
        if options.stdin {
            set = set.with(ChannelId::Stdin);
        }
        if options.stdout {
            set = set.with(ChannelId::Stdout);
        }
        if options.stderr_enabled() {
            set = set.with(ChannelId::Stderr);
        }
        set
    }

    pub fn with(mut self, channel: ChannelId) -> Self {
        self.bits |= 1 << channel.index();
        self
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        self.bits & (1 << channel.index()) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ChannelId> + '_ {
        ChannelId::ALL
            .into_iter()
            .filter(move |channel| self.contains(*channel))
    }
}
