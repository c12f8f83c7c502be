//! re-export of [http] crate types with strand specific extensions.

use std::net::SocketAddr;

pub use ::http::*;

/// remote peer address of the connection a request arrived on. stored inside
/// [Extensions] of every decoded request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemoteAddr(pub SocketAddr);

impl RemoteAddr {
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

/// look up the remote address a request was decoded with.
///
/// subrequests are dispatched without a socket and produce `None`.
pub fn remote_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions().get::<RemoteAddr>().map(RemoteAddr::addr)
}
