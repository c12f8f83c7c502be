use core::time::Duration;

use tokio::net::lookup_host;

use strand_http::io::TcpStream;

use crate::error::Error;

/// resolve the backend address and establish a fresh connection.
///
/// resolution picks the first address returned. the connect attempt is bounded
/// by `timeout` so a black holed backend surfaces as a retryable error instead
/// of stalling the request.
pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, Error> {
    let addr = lookup_host(addr)
        .await
        .map_err(Error::Connect)?
        .next()
        .ok_or(Error::Resolve)?;

    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Connect(std::io::ErrorKind::TimedOut.into()))?
        .map_err(Error::Connect)?;

    // small writes of proxied requests should leave right away.
    stream.set_nodelay(true).map_err(Error::Connect)?;

    Ok(TcpStream::new(stream))
}
