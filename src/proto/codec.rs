use super::{
    block::{BinaryBlockDecoder, BlockHeader, TruncationPolicy, BLOCK_MARKER},
    command::{Command, ResponseKind},
    response::Response,
};
use bytes::{Buf, Bytes, BytesMut};
use std::{
    fmt::{self, Write},
    io,
};
use tokio_util::codec::{Decoder, Encoder};

const EOL: u8 = b'\n';

/// Upper bound for reserving buffer space ahead of a block payload.
const RESERVE_LIMIT: usize = 1 << 20;

/// Frames replies on the byte stream.
///
/// Replies which cannot be framed are returned as [`Response::Malformed`] or
/// [`Response::Unsolicited`] after their bytes were dropped, so the stream
/// stays usable for the next request.
#[derive(Default)]
pub struct ProtocolCodec {
    pending: Option<ResponseKind>,
    block: BinaryBlockDecoder,
    // A block may arrive before its terminating newline.
    skip_eol: bool,
}

impl ProtocolCodec {
    pub fn new(policy: TruncationPolicy) -> Self {
        Self {
            block: BinaryBlockDecoder::new(policy),
            ..Default::default()
        }
    }

    /// True while the reply to the last command is outstanding.
    pub fn expects_reply(&self) -> bool {
        self.pending.is_some()
    }

    fn take_line(src: &mut BytesMut) -> Option<BytesMut> {
        let offset = src.as_ref().iter().position(|b| *b == EOL)?;
        let mut line = src.split_to(offset + 1);
        line.truncate(offset);
        Some(line)
    }

    // Rest of a reply which cannot be framed: up to the next terminator, or
    // everything received so far.
    fn drop_reply(src: &mut BytesMut) -> Bytes {
        match Self::take_line(src) {
            Some(line) => line.freeze(),
            None => src.split().freeze(),
        }
    }

    fn text(line: &[u8]) -> Response {
        Response::Text(String::from_utf8_lossy(line).trim_end().to_string())
    }

    fn decode_block(&mut self, src: &mut BytesMut) -> Option<Response> {
        if src[0] != BLOCK_MARKER {
            // No header, the reply is raw data up to the terminator.
            return Self::take_line(src).map(|line| Response::Block(line.freeze()));
        }
        let header = match BlockHeader::peek(src) {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(error) => {
                let raw = Self::drop_reply(src);
                log::warn!("dropped malformed block ({} bytes): {}", raw.len(), error);
                return Some(Response::Malformed { error, raw });
            }
        };
        if src.len() < header.total_len() {
            src.reserve((header.total_len() - src.len()).min(RESERVE_LIMIT));
            return None;
        }
        let mut payload = src.split_to(header.total_len());
        payload.advance(header.offset());
        if src.is_empty() {
            self.skip_eol = true;
        } else if src[0] == EOL {
            src.advance(1);
        }
        Some(Response::Block(payload.freeze()))
    }
}

impl Decoder for ProtocolCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.skip_eol && !src.is_empty() {
            if src[0] == EOL {
                src.advance(1);
            }
            self.skip_eol = false;
        }
        if src.is_empty() {
            return Ok(None);
        }
        let response = match self.pending {
            Some(ResponseKind::Text) => Self::take_line(src).map(|line| Self::text(&line)),
            Some(ResponseKind::Block) => self.decode_block(src),
            None => Some(Response::Unsolicited(src.split().freeze())),
        };
        if response.is_some() {
            self.pending = None;
        }
        Ok(response)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(response) = self.decode(src)? {
            return Ok(Some(response));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Stream ended without terminator, the rest is the whole reply.
        let rest = src.split().freeze();
        let response = match self.pending.take() {
            Some(ResponseKind::Text) => Self::text(&rest),
            Some(ResponseKind::Block) => match self.block.decode(&rest) {
                Ok(payload) => Response::Block(rest.slice_ref(payload)),
                Err(error) => Response::Malformed { error, raw: rest },
            },
            None => Response::Unsolicited(rest),
        };
        Ok(Some(response))
    }
}

fn write_fmt_guarded(dst: &mut BytesMut, args: fmt::Arguments<'_>) -> Result<(), io::Error> {
    dst.write_fmt(args)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

impl Encoder<Command> for ProtocolCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_fmt_guarded(dst, format_args!("{}\n", item))?;
        self.pending = item.response();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::block::{encode, BlockError};
    use crate::proto::command::Palette;

    fn codec_expecting(cmd: Command) -> ProtocolCodec {
        let mut codec = ProtocolCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(cmd, &mut dst).unwrap();
        codec
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = ProtocolCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(Command::Run, &mut dst).unwrap();
        codec.encode(Command::Ident, &mut dst).unwrap();
        assert_eq!(&dst[..], b":RUN\n*IDN?\n");
    }

    #[test]
    fn test_text_line() {
        let mut codec = codec_expecting(Command::Ident);
        let mut src = BytesMut::from(&b"KEYSIGHT TECHNOLOGIES,DSOX1204G"[..]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        src.extend_from_slice(b",CN60167508,02.10.2019111333\r\n");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Response::Text(
                "KEYSIGHT TECHNOLOGIES,DSOX1204G,CN60167508,02.10.2019111333".into()
            ))
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_block_in_chunks() {
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        let mut wire = encode(&payload).unwrap();
        wire.push(b'\n');

        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::new();
        let mut result = None;
        for chunk in wire.chunks(7) {
            src.extend_from_slice(chunk);
            if let Some(r) = codec.decode(&mut src).unwrap() {
                result = Some(r);
            }
        }
        assert_eq!(result, Some(Response::Block(Bytes::from(payload))));
        assert!(src.is_empty());
    }

    #[test]
    fn test_block_payload_may_contain_newlines() {
        let payload = b"\n\n\x89PNG\r\n";
        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::from(&encode(payload).unwrap()[..]);
        src.extend_from_slice(b"\n");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Response::Block(Bytes::from_static(payload)))
        );
    }

    #[test]
    fn test_late_terminator_is_dropped() {
        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::from(&b"#13abc"[..]);
        assert!(codec.decode(&mut src).unwrap().is_some());
        src.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert!(src.is_empty());
    }

    #[test]
    fn test_late_terminator_before_next_reply() {
        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::from(&b"#13abc"[..]);
        assert!(codec.decode(&mut src).unwrap().is_some());
        codec.encode(Command::Ident, &mut BytesMut::new()).unwrap();
        src.extend_from_slice(b"\nA,B,C,D\n");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Response::Text("A,B,C,D".into()))
        );
    }

    #[test]
    fn test_block_without_header() {
        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::from(&b"raw-bytes\n"[..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Response::Block(Bytes::from_static(b"raw-bytes")))
        );
    }

    #[test]
    fn test_malformed_header_is_dropped() {
        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::from(&b"#A123
KEYSIGHT"[..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Response::Malformed {
                error: BlockError::Format {
                    offset: 1,
                    found: Some(b'A'),
                    expected: "digit count 1-9",
                },
                raw: Bytes::from_static(b"#A123"),
            })
        );
        assert!(!codec.expects_reply());
        assert_eq!(&src[..], b"KEYSIGHT");
    }

    #[test]
    fn test_malformed_header_without_terminator() {
        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::from(&b"#31x"[..]);
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(Response::Malformed { .. })
        ));
        assert!(src.is_empty());
    }

    #[test]
    fn test_large_header_reserves_bounded() {
        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::from(&b"#9999999999abc"[..]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert!(src.capacity() <= 4 * RESERVE_LIMIT);
        assert!(codec.expects_reply());
    }

    #[test]
    fn test_truncated_block_at_eof_lenient() {
        let mut codec = codec_expecting(Command::DisplayData(Palette::Color));
        let mut src = BytesMut::from(&b"#3100"[..]);
        src.extend_from_slice(&[1u8; 10]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut src).unwrap(),
            Some(Response::Block(Bytes::from(vec![1u8; 10])))
        );
    }

    #[test]
    fn test_truncated_block_at_eof_strict() {
        let mut codec = ProtocolCodec::new(TruncationPolicy::Strict);
        codec
            .encode(Command::DisplayData(Palette::Color), &mut BytesMut::new())
            .unwrap();
        let mut src = BytesMut::from(&b"#3100"[..]);
        src.extend_from_slice(&[1u8; 10]);
        match codec.decode_eof(&mut src).unwrap() {
            Some(Response::Malformed { error, raw }) => {
                assert_eq!(
                    error,
                    BlockError::Truncated {
                        declared: 100,
                        available: 10
                    }
                );
                assert_eq!(raw.len(), 15);
            }
            other => panic!("expected malformed block, got {:?}", other),
        }
    }

    #[test]
    fn test_unsolicited_data() {
        let mut codec = codec_expecting(Command::Run);
        let mut src = BytesMut::from(&b"1\n"[..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Response::Unsolicited(Bytes::from_static(b"1\n")))
        );
        assert!(src.is_empty());
    }
}
