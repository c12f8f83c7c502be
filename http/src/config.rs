use core::time::Duration;

pub const DEFAULT_HEADER_LIMIT: usize = 64;
pub const DEFAULT_READ_BUF_LIMIT: usize = 1024 * 1024;
pub const DEFAULT_WRITE_BUF_LIMIT: usize = 64 * 1024;

/// Per listener tuning of the h1 service.
///
/// Limits are const generics so the hot path arrays (header storage) can live on
/// the stack. `READ_BUF_LIMIT` doubles as the request head size cap: a head that
/// does not complete within it is rejected with `400 Bad Request`.
#[derive(Copy, Clone)]
pub struct HttpServiceConfig<
    const HEADER_LIMIT: usize = DEFAULT_HEADER_LIMIT,
    const READ_BUF_LIMIT: usize = DEFAULT_READ_BUF_LIMIT,
    const WRITE_BUF_LIMIT: usize = DEFAULT_WRITE_BUF_LIMIT,
> {
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) request_head_timeout: Duration,
    pub(crate) write_timeout: Duration,
    #[cfg_attr(not(feature = "rustls"), allow(dead_code))]
    pub(crate) tls_accept_timeout: Duration,
}

impl Default for HttpServiceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpServiceConfig {
    pub const fn new() -> Self {
        Self::with_limits()
    }
}

impl<const HEADER_LIMIT: usize, const READ_BUF_LIMIT: usize, const WRITE_BUF_LIMIT: usize>
    HttpServiceConfig<HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT>
{
    pub const fn with_limits() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(60),
            request_head_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            tls_accept_timeout: Duration::from_secs(3),
        }
    }

    /// Define max number of headers of a request. Default to 64.
    pub fn max_request_headers<const HEADER_LIMIT_2: usize>(
        self,
    ) -> HttpServiceConfig<HEADER_LIMIT_2, READ_BUF_LIMIT, WRITE_BUF_LIMIT> {
        self.mutate_const_generic()
    }

    /// Define max size of the read buffer, bounding both the request head and
    /// in flight body bytes. Default to 1MB.
    pub fn max_read_buf_size<const READ_BUF_LIMIT_2: usize>(
        self,
    ) -> HttpServiceConfig<HEADER_LIMIT, READ_BUF_LIMIT_2, WRITE_BUF_LIMIT> {
        self.mutate_const_generic()
    }

    /// Define max size of the write buffer before a flush is forced.
    /// Small response fragments coalesce inside it into single socket writes.
    pub fn max_write_buf_size<const WRITE_BUF_LIMIT_2: usize>(
        self,
    ) -> HttpServiceConfig<HEADER_LIMIT, READ_BUF_LIMIT, WRITE_BUF_LIMIT_2> {
        self.mutate_const_generic()
    }

    pub fn keep_alive_timeout(mut self, dur: Duration) -> Self {
        self.keep_alive_timeout = dur;
        self
    }

    pub fn request_head_timeout(mut self, dur: Duration) -> Self {
        self.request_head_timeout = dur;
        self
    }

    pub fn write_timeout(mut self, dur: Duration) -> Self {
        self.write_timeout = dur;
        self
    }

    pub fn tls_accept_timeout(mut self, dur: Duration) -> Self {
        self.tls_accept_timeout = dur;
        self
    }

    fn mutate_const_generic<const HEADER_LIMIT_2: usize, const READ_BUF_LIMIT_2: usize, const WRITE_BUF_LIMIT_2: usize>(
        self,
    ) -> HttpServiceConfig<HEADER_LIMIT_2, READ_BUF_LIMIT_2, WRITE_BUF_LIMIT_2> {
        HttpServiceConfig {
            keep_alive_timeout: self.keep_alive_timeout,
            request_head_timeout: self.request_head_timeout,
            write_timeout: self.write_timeout,
            tls_accept_timeout: self.tls_accept_timeout,
        }
    }
}
