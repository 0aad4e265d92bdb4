//! Wire framing.
//!
//! A [`Protocol`] is a `tokio_util` codec that cuts a byte stream into frames and turns a
//! response ([`Chunks`]) back into bytes. Both directions use the same rules, so a [`Client`]
//! built on a codec can always talk to a [`Server`] built on the same codec.
//!
//! [`Client`]: crate::client::Client
//! [`Server`]: crate::server::Server

pub mod newline;
pub mod netstring;

use bytes::{Bytes, BytesMut};
use std::env;
use strum_macros::{Display, EnumString};
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

pub use netstring::NetstringCodec;
pub use newline::NewlineCodec;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, ThisError)]
pub enum FrameError {
    #[error("invalid frame length: {0:?}")]
    InvalidLength(String),
    #[error("frame terminator missing, found byte {0:#04x}")]
    MissingTerminator(u8),
    #[error("frame size exceeds limit of {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("payload contains the frame delimiter {0:#04x}")]
    EmbeddedDelimiter(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A framing codec usable by servers, connections and clients.
pub trait Protocol:
    Decoder<Item = BytesMut, Error = FrameError>
    + Encoder<Chunks, Error = FrameError>
    + Default
    + Unpin
    + 'static
{
    const NAME: &'static str;

    /// Checks that a response segment can be carried by this format.
    fn validate(_chunk: &[u8]) -> Result<(), FrameError> {
        Ok(())
    }
}

/// Names of the built-in codecs, for configuration.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProtocolKind {
    Newline,
    Netstring,
}

/// Upper bound on a single frame, read once per codec from `MAX_FRAME_SIZE`.
pub fn max_frame_size() -> usize {
    parse_max_frame_size(env::var("MAX_FRAME_SIZE").ok())
}

fn parse_max_frame_size(value: Option<String>) -> usize {
    match value {
        Some(value) => value.parse().unwrap_or_else(|_| {
            warn!(value, "MAX_FRAME_SIZE is not a number, using the default");
            DEFAULT_MAX_FRAME_SIZE
        }),
        None => DEFAULT_MAX_FRAME_SIZE,
    }
}

/// Ordered segments that go out on the wire as exactly one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Chunks(Vec<Bytes>);

impl Chunks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.0.push(chunk);
    }

    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.0.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of segments, empty ones included.
    pub fn segments(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.0.iter()
    }
}

impl From<Bytes> for Chunks {
    fn from(chunk: Bytes) -> Self {
        Chunks(vec![chunk])
    }
}

impl From<Vec<Bytes>> for Chunks {
    fn from(chunks: Vec<Bytes>) -> Self {
        Chunks(chunks)
    }
}
