// http://cr.yp.to/proto/netstrings.txt

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{max_frame_size, Chunks, FrameError, Protocol};

static SEPARATOR: u8 = b':';
static TERMINATOR: u8 = b',';
// Most the decoder reserves up front for a body; the rest grows as bytes arrive.
const RESERVE_LIMIT: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    // Waiting for `<len>:`.
    Head,
    // Header consumed, waiting for `len` payload bytes plus the terminator.
    Body { len: usize },
}

/// `<decimal length>:<payload>,`
///
/// Binary safe: the payload may hold any byte, including `\n`, `:` and `,`.
#[derive(Clone, Debug)]
pub struct NetstringCodec {
    state: State,
    max_length: usize,
}

impl NetstringCodec {
    pub fn new() -> Self {
        Self::with_max_length(max_frame_size())
    }

    pub fn with_max_length(max_length: usize) -> Self {
        NetstringCodec {
            state: State::Head,
            max_length,
        }
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<usize>, FrameError> {
        let Some(end) = src.iter().position(|b| !b.is_ascii_digit()) else {
            // Only digits so far. Leading zeros are legal, so bound the header by the frame limit.
            if src.len() > self.max_length.max(20) {
                return Err(FrameError::FrameTooLarge {
                    max: self.max_length,
                });
            }
            return Ok(None);
        };

        if src[end] != SEPARATOR || end == 0 {
            let head = String::from_utf8_lossy(&src[..=end]).into_owned();
            return Err(FrameError::InvalidLength(head));
        }

        let len = parse_length(&src[..end], self.max_length)?;
        src.advance(end + 1);

        Ok(Some(len))
    }
}

impl Default for NetstringCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NetstringCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.state {
            State::Body { len } => len,
            State::Head => match self.decode_head(src)? {
                Some(len) => {
                    // The payload is always followed by the terminator.
                    src.reserve((len + 1).min(RESERVE_LIMIT).saturating_sub(src.len()));
                    self.state = State::Body { len };
                    len
                }
                None => return Ok(None),
            },
        };

        if src.len() < len + 1 {
            return Ok(None);
        }

        self.state = State::Head;

        let mut payload = src.split_to(len + 1);
        let terminator = payload[len];
        if terminator != TERMINATOR {
            return Err(FrameError::MissingTerminator(terminator));
        }
        payload.truncate(len);

        Ok(Some(payload))
    }
}

impl Encoder<Chunks> for NetstringCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Chunks, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        let head = len.to_string();

        dst.reserve(head.len() + 1 + len + 1);
        dst.extend_from_slice(head.as_bytes());
        dst.put_u8(SEPARATOR);
        for chunk in item.iter() {
            dst.extend_from_slice(chunk);
        }
        dst.put_u8(TERMINATOR);

        Ok(())
    }
}

impl Protocol for NetstringCodec {
    const NAME: &'static str = "netstring";
}

/// Parses an all-digit header, tolerating any number of leading zeros.
fn parse_length(digits: &[u8], max_length: usize) -> Result<usize, FrameError> {
    let significant = match digits.iter().position(|b| *b != b'0') {
        Some(start) => &digits[start..],
        None => return Ok(0),
    };

    // Digits are ASCII, so this cannot fail; overflow means the value is out of range anyway.
    let len = std::str::from_utf8(significant)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(FrameError::FrameTooLarge { max: max_length })?;

    // The body is read together with its terminator, so `len + 1` has to fit too.
    if len > max_length || len.checked_add(1).is_none() {
        return Err(FrameError::FrameTooLarge { max: max_length });
    }

    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn decode_all(codec: &mut NetstringCodec, data: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        let mut src = BytesMut::from(data);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut src)? {
            frames.push(frame.freeze());
        }
        Ok(frames)
    }

    #[test]
    fn decode_frame() {
        let mut codec = NetstringCodec::new();
        let mut src = BytesMut::from(&b"5:hello,"[..]);

        let frame = codec.decode(&mut src);

        assert!(matches!(frame, Ok(Some(ref p)) if &p[..] == b"hello"));
        assert!(src.is_empty());
    }

    #[test]
    fn decode_empty_frame() {
        let mut codec = NetstringCodec::new();
        let mut src = BytesMut::from(&b"0:,"[..]);

        let frame = codec.decode(&mut src);

        assert!(matches!(frame, Ok(Some(ref p)) if p.is_empty()));
    }

    #[test]
    fn decode_leading_zeros() {
        let mut codec = NetstringCodec::new();

        let frames = decode_all(&mut codec, b"0000000000000000000000002:ab,").unwrap();

        assert_eq!(frames, vec!["ab"]);
    }

    #[test]
    fn decode_binary_payload() {
        let mut codec = NetstringCodec::new();

        let frames = decode_all(&mut codec, b"7:a\nb:c,d,").unwrap();

        assert_eq!(frames, vec![&b"a\nb:c,d"[..]]);
    }

    #[test]
    fn decode_split_across_reads() {
        let mut codec = NetstringCodec::new();
        let mut src = BytesMut::from(&b"1"[..]);

        assert!(matches!(codec.decode(&mut src), Ok(None)));

        src.extend_from_slice(b"1:hello");
        assert!(matches!(codec.decode(&mut src), Ok(None)));
        assert_eq!(codec.state, State::Body { len: 11 });

        src.extend_from_slice(b" world");
        assert!(matches!(codec.decode(&mut src), Ok(None)));

        src.extend_from_slice(b",");
        let frame = codec.decode(&mut src);
        assert!(matches!(frame, Ok(Some(ref p)) if &p[..] == b"hello world"));
        assert_eq!(codec.state, State::Head);
    }

    #[test]
    fn decode_pipelined_frames_in_order() {
        let mut codec = NetstringCodec::new();

        let frames = decode_all(&mut codec, b"2:d1,2:d2,3:d33,").unwrap();

        assert_eq!(frames, vec!["d1", "d2", "d33"]);
    }

    #[test]
    fn decode_non_numeric_length() {
        let mut codec = NetstringCodec::new();
        let mut src = BytesMut::from(&b"xx:ab,"[..]);

        let frame = codec.decode(&mut src);

        assert!(matches!(frame, Err(FrameError::InvalidLength(ref h)) if h == "x"));
    }

    #[test]
    fn decode_signed_length() {
        let mut codec = NetstringCodec::new();

        assert!(matches!(
            decode_all(&mut codec, b"-1:,"),
            Err(FrameError::InvalidLength(_))
        ));
        assert!(matches!(
            decode_all(&mut NetstringCodec::new(), b"+1:a,"),
            Err(FrameError::InvalidLength(_))
        ));
    }

    #[test]
    fn decode_empty_length() {
        let mut codec = NetstringCodec::new();
        let mut src = BytesMut::from(&b":ab,"[..]);

        let frame = codec.decode(&mut src);

        assert!(matches!(frame, Err(FrameError::InvalidLength(ref h)) if h == ":"));
    }

    #[test]
    fn decode_missing_terminator() {
        let mut codec = NetstringCodec::new();
        let mut src = BytesMut::from(&b"2:abc"[..]);

        let frame = codec.decode(&mut src);

        assert!(matches!(frame, Err(FrameError::MissingTerminator(b'c'))));
    }

    #[test]
    fn decode_length_over_limit() {
        let mut codec = NetstringCodec::with_max_length(4);
        let mut src = BytesMut::from(&b"5:hello,"[..]);

        let frame = codec.decode(&mut src);

        assert!(matches!(frame, Err(FrameError::FrameTooLarge { max: 4 })));
    }

    #[test]
    fn decode_length_overflow() {
        let mut codec = NetstringCodec::new();
        let mut src = BytesMut::from(&b"99999999999999999999999999:"[..]);

        let frame = codec.decode(&mut src);

        assert!(matches!(frame, Err(FrameError::FrameTooLarge { .. })));
    }

    #[test]
    fn decode_large_header_does_not_preallocate() {
        let mut codec = NetstringCodec::with_max_length(512 * 1024 * 1024);
        let mut src = BytesMut::from(&b"536870911:"[..]);

        assert!(matches!(codec.decode(&mut src), Ok(None)));
        assert_eq!(codec.state, State::Body { len: 536870911 });
        assert!(src.capacity() <= 2 * RESERVE_LIMIT);

        src.extend_from_slice(b"abc");
        assert!(matches!(codec.decode(&mut src), Ok(None)));
    }

    #[test]
    fn decode_unlimited_length_at_usize_max() {
        let mut codec = NetstringCodec::with_max_length(usize::MAX);
        let header = format!("{}:", usize::MAX);
        let mut src = BytesMut::from(header.as_bytes());

        let frame = codec.decode(&mut src);

        assert!(matches!(frame, Err(FrameError::FrameTooLarge { max: usize::MAX })));
    }

    #[test]
    fn decode_unlimited_length_still_decodes() {
        let mut codec = NetstringCodec::with_max_length(usize::MAX);

        let frames = decode_all(&mut codec, b"5:hello,0:,").unwrap();

        assert_eq!(frames, vec!["hello", ""]);
    }

    #[test]
    fn encode_frame() {
        let mut codec = NetstringCodec::new();
        let mut dst = BytesMut::new();

        codec
            .encode(Chunks::from(Bytes::from("hello")), &mut dst)
            .unwrap();

        assert_eq!(&dst[..], b"5:hello,");
    }

    #[test]
    fn encode_chunks_as_single_frame() {
        let mut codec = NetstringCodec::new();
        let mut dst = BytesMut::new();
        let chunks = Chunks::from(vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);

        codec.encode(chunks, &mut dst).unwrap();

        assert_eq!(&dst[..], b"3:abc,");
    }

    #[test]
    fn encode_empty_frame() {
        let mut codec = NetstringCodec::new();
        let mut dst = BytesMut::new();

        codec.encode(Chunks::new(), &mut dst).unwrap();

        assert_eq!(&dst[..], b"0:,");
    }

    #[test]
    fn round_trip_every_byte() {
        let mut codec = NetstringCodec::new();
        let payload: Vec<u8> = (0u8..=255).collect();
        let mut buf = BytesMut::new();

        codec
            .encode(Chunks::from(Bytes::from(payload.clone())), &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap();

        assert_eq!(decoded.as_deref(), Some(&payload[..]));
    }
}
