//! IEEE 488.2 definite length arbitrary block.
//!
//! Binary queries like `:DISPlay:DATA?` answer with
//! `#<H><L as H digits><L bytes of payload>`. A reply which does not start
//! with `#` carries no header and is taken as payload as a whole.

use thiserror::Error;

/// First byte of a block header.
pub const BLOCK_MARKER: u8 = b'#';

/// Largest payload a header can announce (nine length digits).
pub const MAX_BLOCK_LEN: usize = 999_999_999;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Invalid block header at offset {offset}: expected {expected}, found {}", describe(.found))]
    Format {
        offset: usize,
        found: Option<u8>,
        expected: &'static str,
    },

    #[error("Block payload truncated: {declared} bytes declared, {available} available")]
    Truncated { declared: usize, available: usize },

    #[error("Payload of {0} bytes does not fit into a block header")]
    Oversized(usize),
}

fn describe(found: &Option<u8>) -> String {
    match *found {
        Some(b) if b.is_ascii_graphic() => format!("'{}' (0x{:02x})", b as char, b),
        Some(b) => format!("0x{:02x}", b),
        None => "end of data".to_string(),
    }
}

/// What to do when fewer payload bytes follow the header than it declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncationPolicy {
    /// Return the available bytes and log a warning.
    #[default]
    Lenient,
    /// Fail with [`BlockError::Truncated`].
    Strict,
}

/// Parsed `#<H><L>` prefix of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Number of ASCII digits in the length field (1..=9).
    pub digit_count: usize,
    /// Declared payload length in bytes.
    pub length: usize,
}

impl BlockHeader {
    /// Offset of the first payload byte.
    pub fn offset(&self) -> usize {
        2 + self.digit_count
    }

    /// Total size of header and payload.
    pub fn total_len(&self) -> usize {
        self.offset() + self.length
    }

    /// Parse a header from a buffer which may still be incomplete.
    ///
    /// `src` must start with [`BLOCK_MARKER`]. Returns `Ok(None)` if more
    /// bytes are needed to read the complete header.
    pub fn peek(src: &[u8]) -> Result<Option<Self>, BlockError> {
        match src.first() {
            Some(&BLOCK_MARKER) => {}
            found => {
                return Err(BlockError::Format {
                    offset: 0,
                    found: found.copied(),
                    expected: "'#'",
                })
            }
        }
        let digit_count = match src.get(1) {
            Some(b @ b'1'..=b'9') => (b - b'0') as usize,
            Some(b) => {
                return Err(BlockError::Format {
                    offset: 1,
                    found: Some(*b),
                    expected: "digit count 1-9",
                })
            }
            None => return Ok(None),
        };
        if src.len() < 2 + digit_count {
            // Reject garbage early, even before the length field is complete.
            check_digits(&src[2..], 2)?;
            return Ok(None);
        }
        let field = &src[2..2 + digit_count];
        check_digits(field, 2)?;
        let length = field
            .iter()
            .fold(0usize, |acc, b| acc * 10 + (b - b'0') as usize);
        Ok(Some(Self {
            digit_count,
            length,
        }))
    }

    /// Parse a header from a complete response.
    pub fn parse(src: &[u8]) -> Result<Self, BlockError> {
        Self::peek(src)?.ok_or(BlockError::Format {
            offset: src.len(),
            found: None,
            expected: "length digit",
        })
    }
}

fn check_digits(field: &[u8], base: usize) -> Result<(), BlockError> {
    match field.iter().position(|b| !b.is_ascii_digit()) {
        Some(pos) => Err(BlockError::Format {
            offset: base + pos,
            found: Some(field[pos]),
            expected: "length digit",
        }),
        None => Ok(()),
    }
}

/// Extracts the payload of a binary block response.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryBlockDecoder {
    policy: TruncationPolicy,
}

impl BinaryBlockDecoder {
    pub fn new(policy: TruncationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TruncationPolicy {
        self.policy
    }

    /// Returns the payload of `response`.
    ///
    /// Responses without a `#` header (including the empty response) are
    /// returned unchanged. Bytes following the declared payload are ignored.
    pub fn decode<'a>(&self, response: &'a [u8]) -> Result<&'a [u8], BlockError> {
        if response.first() != Some(&BLOCK_MARKER) {
            return Ok(response);
        }
        let header = BlockHeader::parse(response)?;
        let payload = &response[header.offset()..];
        if payload.len() >= header.length {
            return Ok(&payload[..header.length]);
        }
        match self.policy {
            TruncationPolicy::Strict => Err(BlockError::Truncated {
                declared: header.length,
                available: payload.len(),
            }),
            TruncationPolicy::Lenient => {
                log::warn!(
                    "block payload truncated: {} bytes declared, {} available",
                    header.length,
                    payload.len()
                );
                Ok(payload)
            }
        }
    }
}

/// Decode with the default (lenient) truncation policy.
pub fn decode(response: &[u8]) -> Result<&[u8], BlockError> {
    BinaryBlockDecoder::default().decode(response)
}

/// Prefix `payload` with a header using the smallest possible digit count.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, BlockError> {
    if payload.len() > MAX_BLOCK_LEN {
        return Err(BlockError::Oversized(payload.len()));
    }
    let length = payload.len().to_string();
    let mut block = Vec::with_capacity(2 + length.len() + payload.len());
    block.push(BLOCK_MARKER);
    block.push(b'0' + length.len() as u8);
    block.extend_from_slice(length.as_bytes());
    block.extend_from_slice(payload);
    Ok(block)
}
