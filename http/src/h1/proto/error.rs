use core::fmt;

use httparse::Error as HttparseError;

#[derive(Debug)]
pub enum ProtoError {
    // crate level parse error.
    Parse(Parse),
    // error from httparse crate.
    HttpParse(HttparseError),
    // error from http crate.
    Http(http::Error),
}

/// Failure on parsing.
#[derive(Debug)]
pub enum Parse {
    HeaderName,
    HeaderValue,
    HeaderTooLarge,
    StatusCode,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Parse(ref e) => write!(f, "parse error: {e:?}"),
            Self::HttpParse(ref e) => fmt::Display::fmt(e, f),
            Self::Http(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for ProtoError {}

impl From<HttparseError> for ProtoError {
    fn from(e: HttparseError) -> Self {
        match e {
            // exceeding the header array is handled the same as an oversized
            // head: both are bounded by configuration.
            HttparseError::TooManyHeaders => Self::Parse(Parse::HeaderTooLarge),
            HttparseError::HeaderName => Self::Parse(Parse::HeaderName),
            HttparseError::HeaderValue => Self::Parse(Parse::HeaderValue),
            e => Self::HttpParse(e),
        }
    }
}

impl From<http::Error> for ProtoError {
    fn from(e: http::Error) -> Self {
        Self::Http(e)
    }
}

impl From<http::method::InvalidMethod> for ProtoError {
    fn from(e: http::method::InvalidMethod) -> Self {
        Self::Http(e.into())
    }
}

impl From<http::uri::InvalidUri> for ProtoError {
    fn from(e: http::uri::InvalidUri) -> Self {
        Self::Http(e.into())
    }
}

impl From<http::uri::InvalidUriParts> for ProtoError {
    fn from(e: http::uri::InvalidUriParts) -> Self {
        Self::Http(e.into())
    }
}

impl From<Parse> for ProtoError {
    fn from(e: Parse) -> Self {
        Self::Parse(e)
    }
}
