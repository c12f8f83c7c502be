//! Http/1 protocol core for strand.
//!
//! The crate hosts the server side protocol state machine together with the data
//! plumbing it is built from: transfer codecs, body types, ring/file/streamer
//! buffers, the cached date service and the readiness based io abstraction.
//! Higher level crates compose these into a running server.

#![forbid(unsafe_code)]
#![recursion_limit = "256"]

pub mod body;
pub mod buf;
pub mod config;
pub mod date;
pub mod error;
pub mod h1;
pub mod http;
pub mod io;
pub mod service;
pub mod util;

#[cfg(feature = "rustls")]
pub mod tls;

/// re-export bytes crate as module.
pub use bytes;

pub use self::{
    body::ResponseBody,
    error::{BodyError, HttpServiceError},
    service::Service,
};

pub(crate) fn unspecified_socket_addr() -> std::net::SocketAddr {
    std::net::SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0))
}
