use core::{
    pin::Pin,
    task::{Context, Poll},
};

use std::io;

use futures_core::stream::{LocalBoxStream, Stream};

use crate::bytes::Bytes;

/// Decoded stream of request body chunks.
///
/// Handed to the service call as the request body. Dropping it without reading
/// to the end surrenders the connection: the dispatcher can not reuse a
/// transport with unread body bytes on it.
#[derive(Default)]
pub struct RequestBody(Inner);

#[derive(Default)]
enum Inner {
    /// request without body.
    #[default]
    None,
    Reader(LocalBoxStream<'static, io::Result<Bytes>>),
}

impl RequestBody {
    pub(crate) fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + 'static,
    {
        Self(Inner::Reader(Box::pin(stream)))
    }

    /// true for requests that carry no body at all.
    pub fn is_none(&self) -> bool {
        matches!(self.0, Inner::None)
    }
}

impl Stream for RequestBody {
    type Item = io::Result<Bytes>;

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().0 {
            Inner::None => Poll::Ready(None),
            Inner::Reader(ref mut stream) => stream.as_mut().poll_next(cx),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.0 {
            Inner::None => crate::body::none_body_hint(),
            Inner::Reader(_) => (0, None),
        }
    }
}
