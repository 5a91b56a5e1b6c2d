//! Error types for table operations.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("invalid region: {0}")]
    Region(&'static str),

    #[error("no free slot left in the region")]
    NoSpace,

    #[error("key not found")]
    NotFound,

    #[error("result buffer allocation failed")]
    OutOfMemory,

    #[error("table corrupted: {0}")]
    Corrupt(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("stored value is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("stored value is not a decimal integer: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
}

pub type Result<T> = std::result::Result<T, Error>;
