use core::time::Duration;

use std::{io, net, sync::Arc};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::watch;

use crate::worker::{self, ConnectionService, Server};

pub struct Builder {
    worker_threads: usize,
    backlog: u32,
    max_connections: usize,
    shutdown_timeout: Duration,
    listeners: Vec<(String, net::TcpListener)>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            backlog: 2048,
            max_connections: 25600,
            shutdown_timeout: Duration::from_secs(30),
            listeners: Vec::new(),
        }
    }

    /// Set the number of event workers. Default: available logical cpus.
    ///
    /// # Panics:
    /// When receiving 0 as the worker count.
    pub fn worker_threads(mut self, num: usize) -> Self {
        assert_ne!(num, 0, "there must be at least one worker thread");
        self.worker_threads = num;
        self
    }

    pub fn backlog(mut self, num: u32) -> Self {
        self.backlog = num;
        self
    }

    /// Concurrent connection allowance per worker.
    pub fn max_connections(mut self, num: usize) -> Self {
        assert_ne!(num, 0, "connection allowance must be positive");
        self.max_connections = num;
        self
    }

    /// Grace period for in flight connections after a stop request.
    pub fn shutdown_timeout(mut self, dur: Duration) -> Self {
        self.shutdown_timeout = dur;
        self
    }

    /// Bind a named listen entry.
    pub fn bind(mut self, name: impl Into<String>, addr: net::SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.backlog as _)?;
        self.listeners.push((name.into(), socket.into()));
        Ok(self)
    }

    /// Adopt an externally prepared listener under a name.
    pub fn listen(mut self, name: impl Into<String>, listener: net::TcpListener) -> Self {
        self.listeners.push((name.into(), listener));
        self
    }

    /// Spawn the workers. `service_builder` runs once per worker and listener,
    /// inside that worker's runtime, and yields the connection service for the
    /// named listen entry.
    pub fn build<F, Svc>(self, service_builder: F) -> io::Result<Server>
    where
        F: Fn(&str) -> Svc + Send + Sync + 'static,
        Svc: ConnectionService + 'static,
    {
        if self.listeners.is_empty() {
            return Err(io::Error::other("no listen entry configured"));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service_builder = Arc::new(service_builder);
        let listeners = Arc::new(self.listeners);

        let handles = (0..self.worker_threads)
            .map(|index| {
                worker::spawn(
                    index,
                    listeners.clone(),
                    service_builder.clone(),
                    self.max_connections,
                    self.shutdown_timeout,
                    shutdown_rx.clone(),
                )
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Server::new(shutdown_tx, handles))
    }
}
