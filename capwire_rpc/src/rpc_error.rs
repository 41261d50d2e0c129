use thiserror::Error;

/// A list specifying the error categories of the session engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RpcError {
    /// The wire engine rejected a message or a payload access.
    #[error(transparent)]
    Wire {
        /// The causing Error.
        #[from]
        source: capwire::WireError,
    },

    /// A call targeted an export id that is not in the table.
    #[error("Unknown capability: export id {}", _0)]
    UnknownCapability(u32),

    /// The target of a pipelined call failed to resolve.
    #[error("Promise broken: {}", _0)]
    PromiseBroken(String),

    /// The transport reported a send failure; the session is stopped.
    #[error("Transport failed")]
    TransportFailed,

    /// The peer (or a descriptor) uses a protocol level we do not speak.
    #[error("Unimplemented: {}", _0)]
    Unimplemented(String),

    /// The peer aborted the session.
    #[error("Peer aborted the session: {}", _0)]
    PeerAbort(String),

    /// The peer answered the call with an exception.
    #[error("Peer answered with an exception: {}", _0)]
    Peer(String),

    /// The call was canceled before a result was produced.
    #[error("Canceled")]
    Canceled,

    /// The session is stopped; no further calls are possible.
    #[error("Session is stopped")]
    Stopped,

    /// `wait` ran into its timeout; the question itself stays open.
    #[error("Timed out waiting for an answer")]
    Timeout,

    /// Error caused by wrong usage.
    #[error("Wrong usage: {}", _0)]
    Usage(String),

    /// Implementation error.
    #[error("Implementation error: {}", _0)]
    Impl(String),
}

/// Abbreviation of `Result<T, RpcError>`.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Best-effort duplicate, used when one stored outcome is delivered to
    /// several waiters. Source-carrying variants flatten into their message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::UnknownCapability(id) => Self::UnknownCapability(*id),
            Self::PromiseBroken(s) => Self::PromiseBroken(s.clone()),
            Self::TransportFailed => Self::TransportFailed,
            Self::Unimplemented(s) => Self::Unimplemented(s.clone()),
            Self::PeerAbort(s) => Self::PeerAbort(s.clone()),
            Self::Peer(s) => Self::Peer(s.clone()),
            Self::Canceled => Self::Canceled,
            Self::Stopped => Self::Stopped,
            Self::Timeout => Self::Timeout,
            Self::Usage(s) => Self::Usage(s.clone()),
            other => Self::Impl(other.to_string()),
        }
    }

    /// The exception text sent to the peer when a local answer fails.
    pub(crate) fn reason(&self) -> String {
        self.to_string()
    }
}

macro_rules! rpc_impl_err {
    ($($arg:tt)*) => {
        $crate::RpcError::Impl(format!($($arg)*))
    };
}

macro_rules! rpc_usage_err {
    ($($arg:tt)*) => {
        $crate::RpcError::Usage(format!($($arg)*))
    };
}
