//! Http/1 client protocol for strand.
//!
//! One [ConnectionPool] per backend per worker hands out [PooledConnection]s
//! that are either freshly connected or reused keep-alive transports. A
//! completed response whose connection is still reusable returns it to the
//! pool; everything else tears the transport down.

#![forbid(unsafe_code)]

pub mod body;
pub mod connection;
pub mod error;
pub mod pool;

mod connect;
mod h1;

pub use self::{
    body::ResponseBody,
    error::{Error, SendError},
    pool::{ConnectionPool, PoolConfig, PooledConnection},
};

// header count allowance for decoded backend responses.
pub(crate) const HEADER_LIMIT: usize = 64;
