//! error types.

use std::{
    convert::Infallible,
    error::Error,
    fmt::{self, Debug, Formatter},
    io,
};

use tracing::error;

/// Default Request/Response body error.
pub type BodyError = Box<dyn Error + Send + Sync>;

/// top level error of a connection task. produced by the h1 dispatcher and the
/// optional tls accept layer.
pub enum HttpServiceError<S> {
    /// error already handled and logged. nothing left to report.
    Ignored,
    Service(S),
    Body(BodyError),
    Io(io::Error),
    Proto(super::h1::proto::error::ProtoError),
    /// the connection sat idle past its keep alive allowance.
    KeepAliveExpire,
    /// request head did not complete within the read timeout.
    RequestTimeout,
    /// response bytes could not be flushed within the write timeout.
    WriteTimeout,
    #[cfg(feature = "rustls")]
    Tls(super::tls::TlsError),
    /// tls handshake did not finish in time.
    #[cfg(feature = "rustls")]
    TlsAcceptTimeout,
}

impl<S> Debug for HttpServiceError<S>
where
    S: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Ignored => write!(f, "error detail is ignored."),
            Self::Service(ref e) => Debug::fmt(e, f),
            Self::Body(ref e) => Debug::fmt(e, f),
            Self::Io(ref e) => Debug::fmt(e, f),
            Self::Proto(ref e) => Debug::fmt(e, f),
            Self::KeepAliveExpire => write!(f, "keep-alive timeout expired"),
            Self::RequestTimeout => write!(f, "request head read timeout"),
            Self::WriteTimeout => write!(f, "response write timeout"),
            #[cfg(feature = "rustls")]
            Self::Tls(ref e) => Debug::fmt(e, f),
            #[cfg(feature = "rustls")]
            Self::TlsAcceptTimeout => write!(f, "tls accept timeout"),
        }
    }
}

impl<S> HttpServiceError<S>
where
    S: Debug,
{
    pub fn log(self, target: &str) {
        error!(target = target, ?self);
    }
}

impl<S> From<io::Error> for HttpServiceError<S> {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<S> From<Infallible> for HttpServiceError<S> {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}
