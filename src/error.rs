//! Errors returned by the meter client.
use crate::protocol as proto;

/// Represents all possible errors of a single meter exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wraps `proto::Error`: short, corrupt or rejected frames.
    #[error(transparent)]
    Protocol(#[from] proto::Error),

    /// Wraps `std::io::Error` from the serial line.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel could not be opened earlier in this poll cycle; the bus was not used.
    #[error("Channel is not open")]
    ChannelClosed,
}

impl Error {
    /// True for failures that only mean "no reading this time".
    pub fn is_transient(&self) -> bool {
        !matches!(self, Error::Io(_))
    }
}

/// The result type for meter operations.
pub type Result<T> = std::result::Result<T, Error>;
