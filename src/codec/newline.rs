use bytes::{BufMut, BytesMut};
use std::cmp;
use tokio_util::codec::{Decoder, Encoder};

use super::{max_frame_size, Chunks, FrameError, Protocol};

const DELIMITER: u8 = b'\n';

/// `<payload>\n`
///
/// Payloads are raw bytes and may not contain `\n`; nothing is escaped and `\r` is kept as is.
#[derive(Clone, Debug)]
pub struct NewlineCodec {
    // Index into the read buffer up to which we already know there is no delimiter.
    next_index: usize,
    max_length: usize,
}

impl NewlineCodec {
    pub fn new() -> Self {
        Self::with_max_length(max_frame_size())
    }

    pub fn with_max_length(max_length: usize) -> Self {
        NewlineCodec {
            next_index: 0,
            max_length,
        }
    }
}

impl Default for NewlineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NewlineCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = cmp::min(self.max_length.saturating_add(1), src.len());

        match src[self.next_index..read_to]
            .iter()
            .position(|b| *b == DELIMITER)
        {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;

                let mut line = src.split_to(end + 1);
                line.truncate(end);
                Ok(Some(line))
            }
            None if src.len() > self.max_length => Err(FrameError::FrameTooLarge {
                max: self.max_length,
            }),
            None => {
                self.next_index = read_to;
                Ok(None)
            }
        }
    }
}

impl Encoder<Chunks> for NewlineCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Chunks, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for chunk in item.iter() {
            Self::validate(chunk)?;
        }

        dst.reserve(item.len() + 1);
        for chunk in item.iter() {
            dst.extend_from_slice(chunk);
        }
        dst.put_u8(DELIMITER);

        Ok(())
    }
}

impl Protocol for NewlineCodec {
    const NAME: &'static str = "newline";

    fn validate(chunk: &[u8]) -> Result<(), FrameError> {
        match chunk.contains(&DELIMITER) {
            true => Err(FrameError::EmbeddedDelimiter(DELIMITER)),
            false => Ok(()),
        }
    }
}
