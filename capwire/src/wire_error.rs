use thiserror::Error;

/// A list specifying the error categories of the wire engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WireError {
    /// A pointer word could not be interpreted: unexpected kind bits,
    /// an out-of-range offset, or a misaligned size.
    #[error("Malformed pointer: {}", _0)]
    MalformedPointer(String),

    /// A segment read or write reached beyond the segment's buffer.
    #[error("Out of bounds: {}", _0)]
    OutOfBounds(String),

    /// Allocation failed because the configured total-size cap is exhausted.
    #[error("Message size cap exhausted")]
    OutOfMemory,

    /// The segment-table header of an incoming message is unacceptable.
    #[error("Invalid message framing: {}", _0)]
    Framing(String),

    /// Error occured in communication with the stream.
    #[error(transparent)]
    Io {
        /// The causing Error.
        #[from]
        source: std::io::Error,
    },

    /// Error occured in thread synchronization.
    #[error("Error occured in thread synchronization")]
    Poison,

    /// Error caused by wrong usage.
    #[error("Wrong usage: {}", _0)]
    Usage(String),

    /// Implementation error.
    #[error("Implementation error: {}", _0)]
    Impl(String),
}

/// Abbreviation of `Result<T, WireError>`.
pub type WireResult<T> = std::result::Result<T, WireError>;

impl<G> From<std::sync::PoisonError<G>> for WireError {
    fn from(_error: std::sync::PoisonError<G>) -> Self {
        Self::Poison
    }
}

macro_rules! impl_err {
    ($($arg:tt)*) => {
        $crate::WireError::Impl(format!($($arg)*))
    };
}

macro_rules! usage_err {
    ($($arg:tt)*) => {
        $crate::WireError::Usage(format!($($arg)*))
    };
}

macro_rules! malformed_err {
    ($($arg:tt)*) => {
        $crate::WireError::MalformedPointer(format!($($arg)*))
    };
}

macro_rules! bounds_err {
    ($($arg:tt)*) => {
        $crate::WireError::OutOfBounds(format!($($arg)*))
    };
}
