use http::uri::{Authority, Scheme};
use httparse::Status;

use crate::{
    bytes::{Buf, BytesMut},
    http::{
        header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING, UPGRADE},
        Method, RemoteAddr, Request, Uri, Version,
    },
};

use super::{
    codec::TransferCoding,
    context::Context,
    error::{Parse, ProtoError},
    header::{self, HeaderIndex},
};

type Decoded = (Request<()>, TransferCoding);

impl<D, const MAX_HEADERS: usize> Context<'_, D, MAX_HEADERS> {
    // decode request head and produce the body decoder that goes with it.
    pub fn decode_head<const READ_BUF_LIMIT: usize>(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Decoded>, ProtoError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf)? {
            Status::Complete(len) => {
                // Important: reset context state for new request.
                self.reset();

                let method = Method::from_bytes(req.method.unwrap().as_bytes())?;

                // default body decoder from method.
                let mut decoder = match method {
                    // remember the method so the response encoder can special
                    // case it.
                    Method::CONNECT => {
                        self.set_connect_method();
                        TransferCoding::upgrade()
                    }
                    Method::HEAD => {
                        self.set_head_method();
                        TransferCoding::eof()
                    }
                    _ => TransferCoding::eof(),
                };

                // connection defaults to keep-alive on 1.1 and close below it.
                let version = if req.version.unwrap() == 1 {
                    Version::HTTP_11
                } else {
                    self.set_close();
                    Version::HTTP_10
                };

                // record header offsets before the buffer is split away.
                let mut header_idx = [HeaderIndex::default(); MAX_HEADERS];
                let header_idx_slice = HeaderIndex::record(&mut header_idx, buf, req.headers);
                let headers_len = req.headers.len();

                // record offsets of the request path.
                let path = req.path.unwrap();
                let path_head = path.as_ptr() as usize - buf.as_ptr() as usize;
                let path_len = path.len();

                // split the head from the buffer; body bytes stay behind.
                let slice = buf.split_to(len).freeze();

                let mut uri = Uri::from_maybe_shared(slice.slice(path_head..path_head + path_len))?.into_parts();

                // pop a cached headermap or construct a new one.
                let mut headers = self.take_headers();
                headers.reserve(headers_len);

                // write headers to headermap and update request states.
                for idx in header_idx_slice {
                    self.try_write_header(&mut headers, &mut decoder, idx, &slice, version)?;
                }

                // fill in authority from the host header when the request
                // target did not carry one.
                if uri.authority.is_none() {
                    if let Some(host) = headers.get(crate::http::header::HOST) {
                        uri.authority = Some(Authority::try_from(host.as_bytes())?);
                    }
                }

                if uri.authority.is_some() && uri.scheme.is_none() {
                    uri.scheme = if self.is_tls { Some(Scheme::HTTPS) } else { Some(Scheme::HTTP) };
                }

                let uri = Uri::from_parts(uri)?;

                let mut req = Request::new(());
                *req.method_mut() = method;
                *req.version_mut() = version;
                *req.uri_mut() = uri;
                *req.headers_mut() = headers;
                *req.extensions_mut() = self.take_extensions();
                req.extensions_mut().insert(RemoteAddr(*self.socket_addr()));

                Ok(Some((req, decoder)))
            }

            Status::Partial => {
                if buf.remaining() >= READ_BUF_LIMIT {
                    Err(ProtoError::Parse(Parse::HeaderTooLarge))
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub fn try_write_header(
        &mut self,
        headers: &mut HeaderMap,
        decoder: &mut TransferCoding,
        idx: &HeaderIndex,
        slice: &crate::bytes::Bytes,
        version: Version,
    ) -> Result<(), ProtoError> {
        let name = HeaderName::from_bytes(&slice[idx.name.0..idx.name.1]).map_err(|_| Parse::HeaderName)?;
        let value = HeaderValue::from_maybe_shared(idx.value_slice(slice)).map_err(|_| Parse::HeaderValue)?;

        match name {
            TRANSFER_ENCODING => {
                if version != Version::HTTP_11 {
                    return Err(ProtoError::Parse(Parse::HeaderName));
                }
                for val in value.to_str().map_err(|_| Parse::HeaderValue)?.split(',') {
                    if val.trim().eq_ignore_ascii_case("chunked") {
                        decoder.try_set(TransferCoding::decode_chunked())?;
                    }
                }
            }
            CONTENT_LENGTH => {
                let len = header::parse_content_length(&value)?;
                decoder.try_set(TransferCoding::length(len))?;
            }
            CONNECTION => self.try_set_close_from_header(&value)?,
            EXPECT => {
                if !value.as_bytes().eq_ignore_ascii_case(b"100-continue") {
                    return Err(ProtoError::Parse(Parse::HeaderValue));
                }
                self.set_expect_header()
            }
            UPGRADE => {
                if version != Version::HTTP_11 {
                    return Err(ProtoError::Parse(Parse::HeaderName));
                }
                decoder.try_set(TransferCoding::upgrade())?;
            }
            _ => {}
        }

        headers.append(name, value);

        Ok(())
    }

    pub(crate) fn try_set_close_from_header(&mut self, val: &HeaderValue) -> Result<(), ProtoError> {
        for val in val.to_str().map_err(|_| Parse::HeaderValue)?.split(',') {
            let val = val.trim();
            if val.eq_ignore_ascii_case("keep-alive") {
                self.remove_close()
            } else if val.eq_ignore_ascii_case("close") {
                self.set_close()
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_multiple_value() {
        let mut ctx = Context::<_, 4>::new(&(), false);

        let head = b"\
                GET / HTTP/1.1\r\n\
                Connection: keep-alive, upgrade\r\n\
                \r\n\
                ";
        let mut buf = BytesMut::from(&head[..]);

        let _ = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();
        assert!(!ctx.is_connection_closed());

        // a conflicting connection header is not rejected; the last close
        // value wins. this is a consistency check against regression rather
        // than a statement of intent.
        let head = b"\
                GET / HTTP/1.1\r\n\
                Connection: keep-alive, close, upgrade\r\n\
                \r\n\
                ";
        let mut buf = BytesMut::from(&head[..]);

        let _ = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();
        assert!(ctx.is_connection_closed());

        let head = b"\
                GET / HTTP/1.1\r\n\
                Connection: close, keep-alive, upgrade\r\n\
                \r\n\
                ";
        let mut buf = BytesMut::from(&head[..]);

        let _ = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();
        assert!(!ctx.is_connection_closed());
    }

    #[test]
    fn transfer_encoding() {
        let mut ctx = Context::<_, 4>::new(&(), false);

        let head = b"\
                GET / HTTP/1.1\r\n\
                Transfer-Encoding: gzip\r\n\
                Transfer-Encoding: chunked\r\n\
                \r\n\
                ";
        let mut buf = BytesMut::from(&head[..]);

        let (req, decoder) = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();
        let mut iter = req.headers().get_all(TRANSFER_ENCODING).into_iter();
        assert_eq!(iter.next().unwrap().to_str().unwrap(), "gzip");
        assert_eq!(iter.next().unwrap().to_str().unwrap(), "chunked");
        assert!(matches!(decoder, TransferCoding::DecodeChunked(..)));

        ctx.reset();

        let head = b"\
                GET / HTTP/1.1\r\n\
                Transfer-Encoding: gzip, chunked\r\n\
                \r\n\
                ";
        let mut buf = BytesMut::from(&head[..]);

        let (req, decoder) = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();
        assert_eq!(req.headers().get(TRANSFER_ENCODING).unwrap().to_str().unwrap(), "gzip, chunked");
        assert!(matches!(decoder, TransferCoding::DecodeChunked(..)));

        ctx.reset();

        let head = b"\
                GET / HTTP/1.1\r\n\
                Transfer-Encoding: identity\r\n\
                \r\n\
                ";
        let mut buf = BytesMut::from(&head[..]);
        let (_, decoder) = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();
        assert!(matches!(decoder, TransferCoding::Eof));
    }

    #[test]
    fn content_length_body_decoder() {
        let mut ctx = Context::<_, 4>::new(&(), false);

        let head = b"\
                POST /upload HTTP/1.1\r\n\
                Content-Length: 3\r\n\
                \r\n\
                abc";
        let mut buf = BytesMut::from(&head[..]);

        let (_, decoder) = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();
        assert_eq!(decoder, TransferCoding::length(3));
        // body bytes stay in the read buffer for the body decoder.
        assert_eq!(&buf[..], b"abc");
    }

    #[test]
    fn expect_header_sets_context() {
        let mut ctx = Context::<_, 4>::new(&(), false);

        let head = b"\
                POST / HTTP/1.1\r\n\
                Expect: 100-continue\r\n\
                Content-Length: 3\r\n\
                \r\n\
                ";
        let mut buf = BytesMut::from(&head[..]);

        let _ = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();
        assert!(ctx.is_expect_header());
    }

    #[test]
    fn host_fills_authority_and_scheme() {
        let mut ctx = Context::<_, 4>::new(&(), true);

        let head = b"\
                GET / HTTP/1.1\r\n\
                Host: example.com\r\n\
                \r\n\
                ";
        let mut buf = BytesMut::from(&head[..]);

        let (req, _) = ctx.decode_head::<128>(&mut buf).unwrap().unwrap();

        assert_eq!(req.uri().scheme(), Some(&Scheme::HTTPS));
        assert_eq!(req.uri().authority(), Some(&Authority::from_static("example.com")));
        assert_eq!(req.headers().get(crate::http::header::HOST).unwrap(), "example.com");
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut ctx = Context::<_, 8>::new(&(), false);

        // incomplete head already larger than the limit.
        let head = b"GET / HTTP/1.1\r\nX-Filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n";
        let mut buf = BytesMut::from(&head[..]);

        match ctx.decode_head::<32>(&mut buf) {
            Err(ProtoError::Parse(Parse::HeaderTooLarge)) => {}
            res => panic!("unexpected decode result: {:?}", res.map(|_| ())),
        }
    }
}
