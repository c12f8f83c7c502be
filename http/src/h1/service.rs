use core::pin::pin;

use std::net::SocketAddr;

use crate::{
    config::HttpServiceConfig,
    date::DateTimeService,
    error::HttpServiceError,
    http::{Request, Response},
    io::TcpStream,
    service::Service,
    util::timer::Deadline,
    ResponseBody,
};

use super::{body::RequestBody, dispatcher};

use crate::config::{DEFAULT_HEADER_LIMIT, DEFAULT_READ_BUF_LIMIT, DEFAULT_WRITE_BUF_LIMIT};

/// connection service of the h1 protocol. wraps a request service and drives
/// the dispatcher over every accepted connection handed to it.
pub struct H1Service<
    S,
    const HEADER_LIMIT: usize = DEFAULT_HEADER_LIMIT,
    const READ_BUF_LIMIT: usize = DEFAULT_READ_BUF_LIMIT,
    const WRITE_BUF_LIMIT: usize = DEFAULT_WRITE_BUF_LIMIT,
> {
    config: HttpServiceConfig<HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>,
    date: DateTimeService,
    service: S,
}

impl<S, const HEADER_LIMIT: usize, const READ_BUF_LIMIT: usize, const WRITE_BUF_LIMIT: usize>
    H1Service<S, HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>
{
    /// construct the service. must be called from within a tokio local task
    /// context: the date service spawns its update task on the local set.
    pub fn new(config: HttpServiceConfig<HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>, service: S) -> Self {
        Self {
            config,
            date: DateTimeService::new(),
            service,
        }
    }
}

impl<S, const HEADER_LIMIT: usize, const READ_BUF_LIMIT: usize, const WRITE_BUF_LIMIT: usize>
    Service<(TcpStream, SocketAddr)> for H1Service<S, HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
{
    type Response = ();
    type Error = HttpServiceError<S::Error>;

    async fn call(&self, (io, addr): (TcpStream, SocketAddr)) -> Result<Self::Response, Self::Error> {
        let now = self.date.get().now();
        let mut timer = pin!(Deadline::new(now + self.config.keep_alive_timeout));
        let mut write_timer = pin!(Deadline::new(now + self.config.write_timeout));

        dispatcher::run(
            io,
            addr,
            false,
            timer.as_mut(),
            write_timer.as_mut(),
            self.config,
            &self.service,
            self.date.get(),
        )
        .await
        .map_err(Into::into)
    }
}

#[cfg(feature = "rustls")]
pub use tls_impl::H1TlsService;

#[cfg(feature = "rustls")]
mod tls_impl {
    use std::sync::Arc;

    use crate::{
        tls::TlsStream,
        util::timer::Timeout,
    };

    use super::*;

    /// tls terminating variant of [H1Service]. handshakes within the accept
    /// timeout, then serves h1 over the tls transport.
    pub struct H1TlsService<
        S,
        const HEADER_LIMIT: usize = DEFAULT_HEADER_LIMIT,
        const READ_BUF_LIMIT: usize = DEFAULT_READ_BUF_LIMIT,
        const WRITE_BUF_LIMIT: usize = DEFAULT_WRITE_BUF_LIMIT,
    > {
        inner: H1Service<S, HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>,
        acceptor: Arc<rustls::ServerConfig>,
    }

    impl<S, const HEADER_LIMIT: usize, const READ_BUF_LIMIT: usize, const WRITE_BUF_LIMIT: usize>
        H1TlsService<S, HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>
    {
        pub fn new(
            config: HttpServiceConfig<HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>,
            service: S,
            acceptor: Arc<rustls::ServerConfig>,
        ) -> Self {
            Self {
                inner: H1Service::new(config, service),
                acceptor,
            }
        }
    }

    impl<S, const HEADER_LIMIT: usize, const READ_BUF_LIMIT: usize, const WRITE_BUF_LIMIT: usize>
        Service<(TcpStream, SocketAddr)> for H1TlsService<S, HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>
    where
        S: Service<Request<RequestBody>, Response = Response<ResponseBody>>,
    {
        type Response = ();
        type Error = HttpServiceError<S::Error>;

        async fn call(&self, (io, addr): (TcpStream, SocketAddr)) -> Result<Self::Response, Self::Error> {
            let now = self.inner.date.get().now();

            let mut accept_timer = pin!(Deadline::new(now + self.inner.config.tls_accept_timeout));
            let io = TlsStream::accept(io, self.acceptor.clone())
                .timeout(accept_timer.as_mut())
                .await
                .map_err(|_| HttpServiceError::TlsAcceptTimeout)?
                .map_err(HttpServiceError::Tls)?;

            let mut timer = pin!(Deadline::new(now + self.inner.config.keep_alive_timeout));
            let mut write_timer = pin!(Deadline::new(now + self.inner.config.write_timeout));

            dispatcher::run(
                io,
                addr,
                true,
                timer.as_mut(),
                write_timer.as_mut(),
                self.inner.config,
                &self.inner.service,
                self.inner.date.get(),
            )
            .await
            .map_err(Into::into)
        }
    }
}
