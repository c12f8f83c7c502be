use core::fmt;

use std::io;

use strand_http::h1::proto::error::ProtoError;

/// client protocol error.
#[derive(Debug)]
pub enum Error {
    /// backend address did not resolve to any socket address.
    Resolve,
    /// tcp connect to the backend failed or timed out.
    Connect(io::Error),
    /// socket error while talking to the backend.
    Io(io::Error),
    /// malformed response head.
    Proto(ProtoError),
    /// backend did not answer `Expect: 100-continue` in time.
    ContinueTimeout,
    /// backend did not produce a response head in time.
    ResponseTimeout,
    /// backend closed the connection before a response head arrived.
    ClosedBeforeResponse,
    /// per backend connection allowance is used up.
    PoolExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Resolve => f.write_str("backend address did not resolve"),
            Self::Connect(ref e) => write!(f, "backend connect failed: {e}"),
            Self::Io(ref e) => write!(f, "backend io error: {e}"),
            Self::Proto(ref e) => write!(f, "bad backend response: {e}"),
            Self::ContinueTimeout => f.write_str("backend 100-continue timeout"),
            Self::ResponseTimeout => f.write_str("backend response timeout"),
            Self::ClosedBeforeResponse => f.write_str("backend closed before responding"),
            Self::PoolExhausted => f.write_str("backend connection allowance used up"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

/// failure of [PooledConnection::send](crate::PooledConnection::send).
///
/// when the request body stream was never pulled from it travels back inside
/// `body` so the caller can retry the request on a fresh connection.
pub struct SendError<B> {
    pub error: Error,
    pub body: Option<B>,
}

impl<B> SendError<B> {
    pub(crate) fn new(error: Error, body: Option<B>) -> Self {
        Self { error, body }
    }

    /// true when a retry against another connection is safe: no request body
    /// byte was consumed.
    pub fn is_retryable(&self) -> bool {
        self.body.is_some()
    }
}

impl<B> fmt::Debug for SendError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("error", &self.error)
            .field("body_preserved", &self.body.is_some())
            .finish()
    }
}
