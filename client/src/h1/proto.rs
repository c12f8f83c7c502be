//! request head encoding and response head decoding for backend connections.

use httparse::Status;

use strand_http::{
    body::BodySize,
    bytes::BytesMut,
    h1::proto::{
        codec::TransferCoding,
        error::{Parse, ProtoError},
        header::{self, HeaderIndex},
    },
    http::{
        header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING},
        request, Method, Response, StatusCode, Version,
    },
};

use crate::HEADER_LIMIT;

/// encode the request head into `buf`. returns the body encoder and whether
/// the head carries `Expect: 100-continue`.
pub(crate) fn encode_request<B>(
    parts: &request::Parts,
    body: &B,
    buf: &mut BytesMut,
) -> Result<(TransferCoding, bool), ProtoError>
where
    B: futures_core::Stream,
{
    let method = &parts.method;
    let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    buf.reserve(method.as_str().len() + path.len() + 11);
    buf.extend_from_slice(method.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    // backend requests always carry a host header; fall back to the uri
    // authority when the caller did not set one.
    if !parts.headers.contains_key(HOST) {
        if let Some(host) = parts.uri.host() {
            buf.extend_from_slice(b"host: ");
            buf.extend_from_slice(host.as_bytes());
            match parts.uri.port_u16() {
                None | Some(80) | Some(443) => {}
                Some(port) => {
                    let mut fmt = itoa::Buffer::new();
                    buf.extend_from_slice(b":");
                    buf.extend_from_slice(fmt.format(port).as_bytes());
                }
            }
            buf.extend_from_slice(b"\r\n");
        }
    }

    let mut expect = false;
    let mut encoder = None;

    for (name, value) in parts.headers.iter() {
        if *name == EXPECT {
            expect = value.as_bytes().eq_ignore_ascii_case(b"100-continue");
        } else if *name == CONTENT_LENGTH {
            encoder = Some(TransferCoding::length(header::parse_content_length(value)?));
        } else if *name == TRANSFER_ENCODING {
            for val in value.to_str().map_err(|_| Parse::HeaderValue)?.split(',') {
                if val.trim().eq_ignore_ascii_case("chunked") {
                    encoder = Some(TransferCoding::encode_chunked());
                }
            }
        }

        buf.reserve(name.as_str().len() + value.len() + 4);
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    // headers did not pin the body framing; derive it from the body itself.
    let encoder = match encoder {
        Some(encoder) => encoder,
        None => match BodySize::from_stream(body) {
            BodySize::None => TransferCoding::eof(),
            BodySize::Sized(0) => TransferCoding::eof(),
            BodySize::Sized(size) => {
                let mut fmt = itoa::Buffer::new();
                let fmt = fmt.format(size).as_bytes();
                buf.reserve(fmt.len() + 18);
                buf.extend_from_slice(b"content-length: ");
                buf.extend_from_slice(fmt);
                buf.extend_from_slice(b"\r\n");
                TransferCoding::length(size as u64)
            }
            BodySize::Stream => {
                buf.extend_from_slice(b"transfer-encoding: chunked\r\n");
                TransferCoding::encode_chunked()
            }
        },
    };

    buf.extend_from_slice(b"\r\n");

    // a head request uploads no body regardless of what the headers promise.
    let encoder = if *method == Method::HEAD { TransferCoding::eof() } else { encoder };

    let expect = expect && !matches!(encoder, TransferCoding::Eof);

    Ok((encoder, expect))
}

pub(crate) struct DecodedHead {
    pub(crate) response: Response<()>,
    pub(crate) decoder: TransferCoding,
    pub(crate) keep_alive: bool,
}

/// decode one response head out of `buf`. `Ok(None)` wants more input.
pub(crate) fn decode_response(
    buf: &mut BytesMut,
    is_head: bool,
    monitor_chunked: bool,
) -> Result<Option<DecodedHead>, ProtoError> {
    let mut headers = [httparse::EMPTY_HEADER; HEADER_LIMIT];
    let mut parsed = httparse::Response::new(&mut headers);

    let len = match parsed.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return Ok(None),
    };

    let version = if parsed.version.unwrap() == 1 {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };
    let status = StatusCode::from_u16(parsed.code.unwrap()).map_err(|_| Parse::StatusCode)?;

    let mut header_idx = [HeaderIndex::default(); HEADER_LIMIT];
    let header_idx_slice = HeaderIndex::record(&mut header_idx, buf, parsed.headers);
    let headers_len = parsed.headers.len();

    let slice = buf.split_to(len).freeze();

    let mut headers = HeaderMap::with_capacity(headers_len);

    // keep-alive is the 1.1 default; 1.0 must opt in.
    let mut keep_alive = version == Version::HTTP_11;
    let mut length = None;
    let mut chunked = false;

    for idx in header_idx_slice {
        let name = HeaderName::from_bytes(&slice[idx.name.0..idx.name.1]).map_err(|_| Parse::HeaderName)?;
        let value = HeaderValue::from_maybe_shared(idx.value_slice(&slice)).map_err(|_| Parse::HeaderValue)?;

        match name {
            CONTENT_LENGTH => length = Some(header::parse_content_length(&value)?),
            TRANSFER_ENCODING => {
                for val in value.to_str().map_err(|_| Parse::HeaderValue)?.split(',') {
                    if val.trim().eq_ignore_ascii_case("chunked") {
                        chunked = true;
                    }
                }
            }
            CONNECTION => {
                for val in value.to_str().map_err(|_| Parse::HeaderValue)?.split(',') {
                    let val = val.trim();
                    if val.eq_ignore_ascii_case("close") {
                        keep_alive = false;
                    } else if val.eq_ignore_ascii_case("keep-alive") {
                        keep_alive = true;
                    }
                }
            }
            _ => {}
        }

        headers.append(name, value);
    }

    let no_body = is_head
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let decoder = if no_body {
        TransferCoding::eof()
    } else if chunked {
        if monitor_chunked {
            TransferCoding::monitor_chunked()
        } else {
            TransferCoding::decode_chunked()
        }
    } else if let Some(len) = length {
        TransferCoding::length(len)
    } else {
        // body runs until the backend closes the connection.
        keep_alive = false;
        TransferCoding::close_delimited()
    };

    let mut response = Response::new(());
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = headers;

    Ok(Some(DecodedHead {
        response,
        decoder,
        keep_alive,
    }))
}
