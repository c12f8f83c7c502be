//! Multi worker server runtime for strand.
//!
//! Each worker owns a single threaded tokio runtime with its own accept loop
//! over cloned listener sockets; connection handling never crosses threads.
//! Blocking filesystem work goes through the [wpool::WorkerFactory].

#![forbid(unsafe_code)]

mod builder;
mod queue;
mod worker;

pub mod wpool;

pub use builder::Builder;
pub use worker::{ConnectionService, Server};
