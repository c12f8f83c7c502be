//! strand — an http/1.1 web server and reverse proxy.
//!
//! The crate wires the protocol core, the backend client and the worker
//! runtime into a configurable product: json configuration, prefix/vhost
//! routing, a static file handler, a reverse proxy handler with bounded
//! retries, a response filter chain with an on-disk file cache, an access log
//! and internal subrequests.

#![forbid(unsafe_code)]

pub mod access_log;
pub mod config;
pub mod filters;
pub mod handlers;
pub mod service;
pub mod subrequest;

use core::{future::Future, pin::Pin};

/// boxed local future used at the handler and filter seams, where trait
/// objects are required.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;
