//! http/1 server protocol.

pub mod body;
pub mod proto;

pub(crate) mod dispatcher;

mod error;
mod service;

pub use self::{
    error::Error,
    service::H1Service,
};

#[cfg(feature = "rustls")]
pub use self::service::H1TlsService;
