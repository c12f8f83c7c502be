//! bounded gather of a body stream into memory.

use core::{fmt, pin::pin};

use futures_core::stream::Stream;

use crate::{
    bytes::{Bytes, BytesMut},
    error::BodyError,
};

#[derive(Debug)]
pub enum CollectError {
    /// the stream produced more bytes than the caller allowed.
    OverLimit(usize),
    Body(BodyError),
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OverLimit(limit) => write!(f, "body exceeded collect limit of {limit} bytes"),
            Self::Body(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for CollectError {}

/// drain `stream` into one buffer, stopping with [CollectError::OverLimit] as
/// soon as `limit` is crossed. the input is not drained further after either
/// outcome.
pub async fn collect_limited<S, E>(stream: S, limit: usize) -> Result<BytesMut, CollectError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BodyError>,
{
    let mut stream = pin!(stream);
    let mut buf = BytesMut::new();

    while let Some(chunk) = core::future::poll_fn(|cx| stream.as_mut().poll_next(cx)).await {
        let chunk = chunk.map_err(|e| CollectError::Body(e.into()))?;
        if buf.len() + chunk.len() > limit {
            return Err(CollectError::OverLimit(limit));
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf)
}

#[cfg(test)]
mod test {
    use core::{
        convert::Infallible,
        pin::Pin,
        task::{Context, Poll},
    };

    use super::*;

    struct ChunkStream(std::vec::IntoIter<Bytes>);

    impl Stream for ChunkStream {
        type Item = Result<Bytes, Infallible>;

        fn poll_next(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Ready(self.get_mut().0.next().map(Ok))
        }
    }

    fn stream_of(chunks: &'static [&'static [u8]]) -> ChunkStream {
        ChunkStream(chunks.iter().map(|c| Bytes::from_static(c)).collect::<Vec<_>>().into_iter())
    }

    #[tokio::test]
    async fn collects_up_to_limit() {
        let body = stream_of(&[b"abc", b"def"]);
        let buf = collect_limited(body, 16).await.unwrap();
        assert_eq!(&buf[..], b"abcdef");
    }

    #[tokio::test]
    async fn over_limit_reports_error() {
        let body = stream_of(&[b"abc", b"def"]);
        match collect_limited(body, 4).await {
            Err(CollectError::OverLimit(4)) => {}
            res => panic!("unexpected result: {:?}", res.map(|b| b.len())),
        }
    }
}
