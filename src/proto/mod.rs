use std::io;
use thiserror::Error;

use self::{block::BlockError, response::Response};

pub mod block;
pub mod codec;
pub mod command;
#[cfg(test)]
pub(crate) mod fake;
pub mod response;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed binary block: {0}")]
    Format(BlockError),

    #[error("Truncated binary block: {declared} bytes declared, {available} available")]
    Truncated { declared: usize, available: usize },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection closed by instrument")]
    Abort,

    #[error("Unexpected response: {0:?}")]
    Unexpected(Response),
}

impl From<BlockError> for ProtoError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::Truncated {
                declared,
                available,
            } => Self::Truncated {
                declared,
                available,
            },
            other => Self::Format(other),
        }
    }
}

impl From<Response> for ProtoError {
    fn from(response: Response) -> Self {
        Self::Unexpected(response)
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
