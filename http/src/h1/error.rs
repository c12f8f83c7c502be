use core::fmt::{self, Debug, Formatter};

use std::io;

use crate::error::{BodyError, HttpServiceError};

use super::proto::error::ProtoError;

/// error type of the h1 dispatcher. `S` is the service's error type.
pub enum Error<S> {
    Service(S),
    Body(BodyError),
    Io(io::Error),
    Proto(ProtoError),
    KeepAliveExpire,
    RequestTimeout,
    WriteTimeout,
}

impl<S> Debug for Error<S>
where
    S: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Service(ref e) => Debug::fmt(e, f),
            Self::Body(ref e) => Debug::fmt(e, f),
            Self::Io(ref e) => Debug::fmt(e, f),
            Self::Proto(ref e) => Debug::fmt(e, f),
            Self::KeepAliveExpire => f.write_str("keep-alive timeout expired"),
            Self::RequestTimeout => f.write_str("request head read timeout"),
            Self::WriteTimeout => f.write_str("response write timeout"),
        }
    }
}

impl<S> From<io::Error> for Error<S> {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<S> From<ProtoError> for Error<S> {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

impl<S> From<Error<S>> for HttpServiceError<S> {
    fn from(e: Error<S>) -> Self {
        match e {
            Error::Service(e) => Self::Service(e),
            Error::Body(e) => Self::Body(e),
            Error::Io(e) => Self::Io(e),
            Error::Proto(e) => Self::Proto(e),
            Error::KeepAliveExpire => Self::KeepAliveExpire,
            Error::RequestTimeout => Self::RequestTimeout,
            Error::WriteTimeout => Self::WriteTimeout,
        }
    }
}
