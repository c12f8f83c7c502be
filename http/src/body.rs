//! HTTP body types.

use core::{
    convert::Infallible,
    marker::PhantomData,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use std::{
    error,
    sync::{Arc, Mutex},
};

use futures_core::stream::{LocalBoxStream, Stream};
use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use super::{
    bytes::{Buf, Bytes, BytesMut},
    error::BodyError,
};

// size hint marking a body that must not be polled at all.
pub const NONE_BODY_HINT: (usize, Option<usize>) = (usize::MAX, Some(0));

pub const fn none_body_hint() -> (usize, Option<usize>) {
    NONE_BODY_HINT
}

// size hint marking a body that produces exactly `size` bytes.
pub const fn exact_body_hint(size: usize) -> (usize, Option<usize>) {
    (size, Some(size))
}

/// None body type.
/// B type is used to infer the output type of other bodies used together with it.
pub struct NoneBody<B>(PhantomData<B>);

impl<B> Default for NoneBody<B> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<B> Stream for NoneBody<B> {
    type Item = Result<B, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        unreachable!("NoneBody must not be polled. See NONE_BODY_HINT for detail")
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        none_body_hint()
    }
}

/// Body serving a fixed memory region. produces the whole region in one poll
/// followed by end of stream.
#[derive(Default)]
pub struct Once<B>(Option<B>);

impl<B> Once<B>
where
    B: Buf + Unpin,
{
    #[inline]
    pub const fn new(body: B) -> Self {
        Self(Some(body))
    }
}

impl<B> Stream for Once<B>
where
    B: Buf + Unpin,
{
    type Item = Result<B, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(mem::replace(self.get_mut(), Self(None)).0.map(Ok))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.0 {
            Some(ref b) => exact_body_hint(b.remaining()),
            None => unreachable!("Once must check size_hint before it got polled"),
        }
    }
}

/// type erased stream body.
pub struct BoxBody(LocalBoxStream<'static, Result<Bytes, BodyError>>);

impl Default for BoxBody {
    fn default() -> Self {
        Self::new(NoneBody::default())
    }
}

impl BoxBody {
    #[inline]
    pub fn new<B, E>(body: B) -> Self
    where
        B: Stream<Item = Result<Bytes, E>> + 'static,
        E: Into<BodyError>,
    {
        Self(Box::pin(MapErr { body }))
    }
}

impl Stream for BoxBody {
    type Item = Result<Bytes, BodyError>;

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.as_mut().poll_next(cx)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

pin_project! {
    struct MapErr<B> {
        #[pin]
        body: B
    }
}

impl<B, T, E> Stream for MapErr<B>
where
    B: Stream<Item = Result<T, E>>,
    E: Into<BodyError>,
{
    type Item = Result<T, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().body.poll_next(cx).map_err(Into::into)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.body.size_hint()
    }
}

pin_project! {
    /// A unified response body type.
    /// Generic type is for custom pinned response body(type implement [Stream]).
    #[project = ResponseBodyProj]
    #[project_replace = ResponseBodyProjReplace]
    pub enum ResponseBody<B = BoxBody> {
        None,
        Bytes {
            bytes: Bytes,
        },
        Stream {
            #[pin]
            stream: B,
        },
    }
}

impl ResponseBody {
    /// Construct a new Stream variant with default type as [BoxBody].
    #[inline]
    pub fn box_stream<B, E>(stream: B) -> Self
    where
        B: Stream<Item = Result<Bytes, E>> + 'static,
        E: Into<BodyError>,
    {
        Self::stream(BoxBody::new(stream))
    }
}

impl<B> ResponseBody<B> {
    #[inline]
    pub fn stream(stream: B) -> Self {
        Self::Stream { stream }
    }

    #[inline]
    pub fn bytes<B2>(bytes: B2) -> Self
    where
        Bytes: From<B2>,
    {
        Self::Bytes {
            bytes: Bytes::from(bytes),
        }
    }

    /// erase generic body type by boxing the variant.
    #[inline]
    pub fn into_boxed<E>(self) -> ResponseBody
    where
        B: Stream<Item = Result<Bytes, E>> + 'static,
        E: Into<BodyError>,
    {
        match self {
            Self::None => ResponseBody::None,
            Self::Bytes { bytes } => ResponseBody::bytes(bytes),
            Self::Stream { stream } => ResponseBody::box_stream(stream),
        }
    }
}

impl<B, E> Stream for ResponseBody<B>
where
    B: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.as_mut().project() {
            ResponseBodyProj::None => Poll::Ready(None),
            ResponseBodyProj::Bytes { .. } => match self.project_replace(ResponseBody::None) {
                ResponseBodyProjReplace::Bytes { bytes } => Poll::Ready(Some(Ok(bytes))),
                _ => unreachable!(),
            },
            ResponseBodyProj::Stream { stream } => stream.poll_next(cx),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::None => none_body_hint(),
            Self::Bytes { ref bytes } => exact_body_hint(bytes.len()),
            Self::Stream { ref stream } => stream.size_hint(),
        }
    }
}

impl From<BoxBody> for ResponseBody {
    fn from(stream: BoxBody) -> Self {
        Self::stream(stream)
    }
}

macro_rules! bytes_impl {
    ($ty: ty) => {
        impl<B> From<$ty> for ResponseBody<B> {
            fn from(item: $ty) -> Self {
                Self::bytes(item)
            }
        }
    };
}

bytes_impl!(Bytes);
bytes_impl!(BytesMut);
bytes_impl!(&'static [u8]);
bytes_impl!(Vec<u8>);
bytes_impl!(String);

impl<B> From<&str> for ResponseBody<B> {
    fn from(str: &str) -> Self {
        Self::bytes(Bytes::copy_from_slice(str.as_bytes()))
    }
}

/// Body size hint derived from a stream's size_hint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BodySize {
    /// Absence of body can be assumed from method or status code.
    /// Will skip writing Content-Length header.
    None,
    /// Known size body. Will write `Content-Length: N` header.
    Sized(usize),
    /// Unknown size body. Paired with chunked Transfer-Encoding.
    Stream,
}

impl BodySize {
    pub fn from_stream<S>(stream: &S) -> Self
    where
        S: Stream,
    {
        match stream.size_hint() {
            NONE_BODY_HINT => Self::None,
            (_, Some(size)) => Self::Sized(size),
            (_, None) => Self::Stream,
        }
    }
}

/// helper turning an error into [BodyError] without the implicit From bound.
pub fn box_error<E>(e: E) -> BodyError
where
    E: error::Error + Send + Sync + 'static,
{
    Box::new(e)
}

/// response extension carrying a delivery notice.
///
/// a body producer that must learn when its bytes actually reached the peer
/// attaches this to the response it emits. the h1 dispatcher fires the notice
/// once the response's final byte was flushed to the transport; a connection
/// torn down first drops it unfired, which resolves the receiver with an
/// error instead. the file cache tee gates its commit on exactly this signal.
pub struct FlushNotice(Arc<Mutex<Option<oneshot::Sender<()>>>>);

impl Clone for FlushNotice {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl FlushNotice {
    /// build the notice together with the receiver that resolves on delivery.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    /// record the response as fully delivered to the transport. firing more
    /// than once is a no-op.
    pub fn notify(&self) {
        if let Some(tx) = self.0.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_body_size_hint() {
        let body = BoxBody::new(Once::new(Bytes::new()));
        assert_eq!(BodySize::from_stream(&body), BodySize::Sized(0));

        let body = BoxBody::new(NoneBody::<Bytes>::default());
        assert_eq!(BodySize::from_stream(&body), BodySize::None);
    }

    #[test]
    fn bytes_body_resolves_once() {
        let body = ResponseBody::<BoxBody>::bytes("abcd");
        assert_eq!(BodySize::from_stream(&body), BodySize::Sized(4));
    }
}
