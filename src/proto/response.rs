use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, io, str};

use super::block::BlockError;

/// Reply to a query, as framed by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A line of text without the line terminator
    Text(String),
    /// Payload of a binary block, header already stripped
    Block(Bytes),
    /// A block reply which could not be decoded, with the bytes dropped
    /// from the stream
    Malformed { error: BlockError, raw: Bytes },
    /// Data received while no reply was expected
    Unsolicited(Bytes),
}

/// Instrument identification (`*IDN?`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ident {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl TryFrom<&str> for Ident {
    type Error = io::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let values: Vec<&str> = value.trim().split(',').map(str::trim).collect();
        if values.len() == 4 {
            Ok(Self {
                manufacturer: String::from(values[0]),
                model: String::from(values[1]),
                serial: String::from(values[2]),
                firmware: String::from(values[3]),
            })
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid data for IDN response: {}", value),
            ))
        }
    }
}

impl TryFrom<&[u8]> for Ident {
    type Error = io::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let value = str::from_utf8(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Self::try_from(value)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.manufacturer, self.model, self.serial, self.firmware
        )
    }
}

/// Parse a numeric reply like `+1.00000E+03`.
pub fn parse_float(value: &str) -> Result<f64, io::Error> {
    value.trim().parse::<f64>().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid numeric response {:?}: {}", value, e),
        )
    })
}
