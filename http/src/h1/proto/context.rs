use core::mem;

use std::net::SocketAddr;

use crate::http::{header::HeaderMap, Extensions};

/// Connection specific state kept across the requests of one connection.
///
/// Two kinds of state live here and age differently: request flags are wiped
/// by [Context::reset] when the next head is decoded, while the close mark and
/// the request counter belong to the connection and survive until it does.
pub struct Context<'a, D, const HEADER_LIMIT: usize> {
    addr: SocketAddr,
    // request scoped flags, valid between decode and response completion.
    flags: RequestFlags,
    // connection is done after the in flight response. sticky: once marked,
    // only an explicit keep-alive header on a later decode clears it.
    close: bool,
    // requests decoded on this connection so far.
    request_count: usize,
    // header map reused by the next request.
    header: Option<HeaderMap>,
    // http extensions reused by the next request.
    exts: Extensions,
    date: &'a D,
    pub(crate) is_tls: bool,
}

// flags of the request currently in flight, packed the same way the response
// encoder consumes them.
struct RequestFlags(u8);

impl RequestFlags {
    // request carries `Expect: 100-continue`.
    const EXPECT: u8 = 1 << 0;
    // request method is CONNECT.
    const CONNECT: u8 = 1 << 1;
    // request method is HEAD.
    const HEAD: u8 = 1 << 2;

    const fn none() -> Self {
        Self(0)
    }

    fn raise(&mut self, flag: u8) {
        self.0 |= flag;
    }

    const fn is_raised(&self, flag: u8) -> bool {
        (self.0 & flag) == flag
    }
}

impl<'a, D, const HEADER_LIMIT: usize> Context<'a, D, HEADER_LIMIT> {
    #[inline]
    pub fn new(date: &'a D, is_tls: bool) -> Self {
        Self::with_addr(crate::unspecified_socket_addr(), date, is_tls)
    }

    #[inline]
    pub fn with_addr(addr: SocketAddr, date: &'a D, is_tls: bool) -> Self {
        Self {
            addr,
            flags: RequestFlags::none(),
            close: false,
            request_count: 0,
            header: None,
            exts: Extensions::new(),
            date,
            is_tls,
        }
    }

    #[inline]
    pub fn date(&self) -> &D {
        self.date
    }

    /// Take ownership of the cached HeaderMap, or a fresh one.
    #[inline]
    pub fn take_headers(&mut self) -> HeaderMap {
        self.header.take().unwrap_or_default()
    }

    #[inline]
    pub fn take_extensions(&mut self) -> Extensions {
        mem::take(&mut self.exts)
    }

    /// Return an emptied HeaderMap for reuse by the next request.
    #[inline]
    pub fn replace_headers(&mut self, headers: HeaderMap) {
        debug_assert!(headers.is_empty());
        self.header = Some(headers);
    }

    #[inline]
    pub fn replace_extensions(&mut self, extensions: Extensions) {
        debug_assert!(extensions.is_empty());
        self.exts = extensions;
    }

    /// Drop the previous request's flags. Called when a new head is decoded.
    /// Connection scoped state (close mark, request counter) is untouched.
    #[inline]
    pub fn reset(&mut self) {
        self.flags = RequestFlags::none();
    }

    /// Account one more decoded request.
    #[inline]
    pub fn inc_request_count(&mut self) {
        self.request_count += 1;
    }

    /// Requests decoded on this connection so far.
    #[inline]
    pub fn request_count(&self) -> usize {
        self.request_count
    }

    #[inline]
    pub fn set_expect_header(&mut self) {
        self.flags.raise(RequestFlags::EXPECT)
    }

    #[inline]
    pub fn set_connect_method(&mut self) {
        self.flags.raise(RequestFlags::CONNECT)
    }

    #[inline]
    pub fn set_head_method(&mut self) {
        self.flags.raise(RequestFlags::HEAD)
    }

    #[inline]
    pub fn set_close(&mut self) {
        self.close = true;
    }

    #[inline]
    pub fn remove_close(&mut self) {
        self.close = false;
    }

    #[inline]
    pub const fn is_expect_header(&self) -> bool {
        self.flags.is_raised(RequestFlags::EXPECT)
    }

    #[inline]
    pub const fn is_connect_method(&self) -> bool {
        self.flags.is_raised(RequestFlags::CONNECT)
    }

    #[inline]
    pub const fn is_head_method(&self) -> bool {
        self.flags.is_raised(RequestFlags::HEAD)
    }

    /// true when the connection is to be shut down after the in flight
    /// response.
    #[inline]
    pub const fn is_connection_closed(&self) -> bool {
        self.close
    }

    #[inline]
    pub fn socket_addr(&self) -> &SocketAddr {
        &self.addr
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reset_keeps_connection_state() {
        let mut ctx = Context::<_, 4>::new(&(), false);

        ctx.set_expect_header();
        ctx.set_head_method();
        ctx.set_close();
        ctx.inc_request_count();

        ctx.reset();

        assert!(!ctx.is_expect_header());
        assert!(!ctx.is_head_method());
        // close and the counter outlive the request that raised them.
        assert!(ctx.is_connection_closed());
        assert_eq!(ctx.request_count(), 1);

        // a keep-alive header on a later request may still lift the mark.
        ctx.remove_close();
        assert!(!ctx.is_connection_closed());
    }
}
