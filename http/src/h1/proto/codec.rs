use core::{fmt, mem};

use std::io;

use tracing::warn;

use crate::bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{Parse, ProtoError};

/// Coder for different Transfer-Decoding/Transfer-Encoding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferCoding {
    /// Default coder indicates the Request/Response does not have a body.
    Eof,
    /// Coder used when a Content-Length header is passed with a positive integer.
    Length(u64),
    /// Decoder used when Transfer-Encoding is `chunked`.
    DecodeChunked(ChunkedState, u64),
    /// Encoder for when Transfer-Encoding includes `chunked`.
    EncodeChunked,
    /// Monitor only decoder: follows the chunk framing to locate the message
    /// end but hands every byte through untouched. Used when proxying a
    /// chunked body verbatim.
    MonitorChunked(ChunkedState, u64),
    /// Response body delimited by connection close (neither Content-Length nor
    /// chunked was present).
    CloseDelimited,
    /// Upgrade type coder that passes body bytes through without transforming.
    Upgrade,
}

impl TransferCoding {
    #[inline]
    pub const fn eof() -> Self {
        Self::Eof
    }

    #[inline]
    pub const fn length(len: u64) -> Self {
        Self::Length(len)
    }

    #[inline]
    pub const fn decode_chunked() -> Self {
        Self::DecodeChunked(ChunkedState::Size, 0)
    }

    #[inline]
    pub const fn encode_chunked() -> Self {
        Self::EncodeChunked
    }

    #[inline]
    pub const fn monitor_chunked() -> Self {
        Self::MonitorChunked(ChunkedState::Size, 0)
    }

    #[inline]
    pub const fn close_delimited() -> Self {
        Self::CloseDelimited
    }

    #[inline]
    pub const fn upgrade() -> Self {
        Self::Upgrade
    }

    /// Check if Self is in EOF state, meaning the coder ended gracefully and
    /// can not decode any further value.
    #[inline]
    pub fn is_eof(&self) -> bool {
        match self {
            Self::Eof => true,
            Self::EncodeChunked => unreachable!("TransferCoding can't decide eof state when encoding chunked data"),
            _ => false,
        }
    }

    #[inline]
    pub fn is_upgrade(&self) -> bool {
        matches!(self, Self::Upgrade)
    }

    #[inline]
    pub fn is_close_delimited(&self) -> bool {
        matches!(self, Self::CloseDelimited)
    }

    /// switch a chunked decoder into monitor mode before any body byte was
    /// consumed. no-op for every other coder.
    pub fn set_monitor(&mut self) {
        if matches!(self, Self::DecodeChunked(ChunkedState::Size, 0)) {
            *self = Self::monitor_chunked();
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl ChunkedState {
    /// advance the framing state machine by one non-body byte.
    ///
    /// [ChunkedState::Body] and [ChunkedState::End] are bulk states the caller
    /// handles itself.
    fn step_byte(self, b: u8, size: &mut u64) -> io::Result<Self> {
        match self {
            Self::Size => {
                let digit = match b {
                    b @ b'0'..=b'9' => b - b'0',
                    b @ b'a'..=b'f' => b + 10 - b'a',
                    b @ b'A'..=b'F' => b + 10 - b'A',
                    b'\t' | b' ' => return Ok(Self::SizeLws),
                    b';' => return Ok(Self::Extension),
                    b'\r' => return Ok(Self::SizeLf),
                    _ => return Err(invalid_input("invalid chunk size line: invalid size digit")),
                };
                *size = size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add(digit as u64))
                    .ok_or_else(|| invalid_data("invalid chunk size: overflow"))?;
                Ok(Self::Size)
            }
            Self::SizeLws => match b {
                // LWS can follow the chunk size, but no more digits can come.
                b'\t' | b' ' => Ok(Self::SizeLws),
                b';' => Ok(Self::Extension),
                b'\r' => Ok(Self::SizeLf),
                _ => Err(invalid_input("invalid chunk size linear white space")),
            },
            Self::Extension => match b {
                b'\r' => Ok(Self::SizeLf),
                // no supported extensions
                b'\n' => Err(invalid_data("invalid chunk extension contains newline")),
                _ => Ok(Self::Extension),
            },
            Self::SizeLf => match b {
                b'\n' if *size > 0 => Ok(Self::Body),
                b'\n' => Ok(Self::EndCr),
                _ => Err(invalid_input("invalid chunk size LF")),
            },
            Self::BodyCr => match b {
                b'\r' => Ok(Self::BodyLf),
                _ => Err(invalid_input("invalid chunk body CR")),
            },
            Self::BodyLf => match b {
                b'\n' => Ok(Self::Size),
                _ => Err(invalid_input("invalid chunk body LF")),
            },
            Self::Trailer => match b {
                b'\r' => Ok(Self::TrailerLf),
                _ => Ok(Self::Trailer),
            },
            Self::TrailerLf => match b {
                b'\n' => Ok(Self::EndCr),
                _ => Err(invalid_input("invalid trailer end LF")),
            },
            Self::EndCr => match b {
                b'\r' => Ok(Self::EndLf),
                _ => Ok(Self::Trailer),
            },
            Self::EndLf => match b {
                b'\n' => Ok(Self::End),
                _ => Err(invalid_input("invalid chunk end LF")),
            },
            Self::Body | Self::End => unreachable!("bulk states are stepped by the caller"),
        }
    }
}

fn invalid_input(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl TransferCoding {
    pub fn try_set(&mut self, other: Self) -> Result<(), ProtoError> {
        match (&self, &other) {
            // multiple set to plain upgrade is allowed. This can happen from
            // Connect method and/or Connection header.
            (Self::Upgrade, Self::Upgrade) => Ok(()),
            // mutating an already determined coder is forbidden.
            (Self::Upgrade, _) | (Self::DecodeChunked(..), _) | (Self::Length(..), _) | (Self::CloseDelimited, _) => {
                Err(ProtoError::Parse(Parse::HeaderName))
            }
            _ => {
                *self = other;
                Ok(())
            }
        }
    }

    #[inline]
    pub fn set_eof(&mut self) {
        *self = Self::Eof;
    }

    /// Encode body chunk into `buf`.
    pub fn encode(&mut self, mut bytes: Bytes, buf: &mut BytesMut) {
        // skip encode empty bytes. the chunked framing of an empty chunk would
        // terminate the body early.
        if bytes.is_empty() {
            return;
        }

        match *self {
            Self::Upgrade | Self::CloseDelimited => buf.extend_from_slice(&bytes),
            Self::EncodeChunked => {
                write_chunk_size(buf, bytes.len());
                buf.reserve(bytes.len() + 2);
                buf.extend_from_slice(&bytes);
                buf.extend_from_slice(b"\r\n");
            }
            Self::Length(ref mut rem) => {
                let len = bytes.len() as u64;
                if *rem >= len {
                    buf.extend_from_slice(&bytes);
                    *rem -= len;
                } else {
                    let rem = mem::replace(rem, 0u64);
                    buf.extend_from_slice(&bytes.split_to(rem as usize));
                }
            }
            Self::Eof => warn!(target: "h1_encode", "TransferCoding::Eof should not encode response body"),
            _ => unreachable!(),
        }
    }

    /// Encode end of body.
    pub fn encode_eof(&mut self, buf: &mut BytesMut) {
        match *self {
            Self::Eof | Self::Upgrade | Self::CloseDelimited | Self::Length(0) => {}
            Self::EncodeChunked => buf.extend_from_slice(b"0\r\n\r\n"),
            Self::Length(n) => unreachable!("UnexpectedEof for Length Body with {} remaining", n),
            _ => unreachable!(),
        }
    }

    /// decode body bytes out of `src`. See [ChunkResult] for the outcomes.
    pub fn decode(&mut self, src: &mut BytesMut) -> ChunkResult {
        match *self {
            // when the decoder reaches its end state it reports ChunkResult::Eof
            // once, then ChunkResult::AlreadyEof. callers rely on observing the
            // exact eof transition for one time completion work.
            Self::Length(0) | Self::DecodeChunked(ChunkedState::End, _) | Self::MonitorChunked(ChunkedState::End, _) => {
                *self = Self::Eof;
                ChunkResult::Eof
            }
            Self::Eof => ChunkResult::AlreadyEof,
            _ if src.is_empty() => ChunkResult::InsufficientData,
            Self::Length(ref mut rem) => ChunkResult::Ok(bounded_split(rem, src)),
            Self::Upgrade | Self::CloseDelimited => ChunkResult::Ok(src.split().freeze()),
            Self::DecodeChunked(ref mut state, ref mut size) => {
                loop {
                    if *state == ChunkedState::Body {
                        if src.is_empty() {
                            return ChunkResult::InsufficientData;
                        }
                        let bytes = bounded_split(size, src);
                        if *size == 0 {
                            *state = ChunkedState::BodyCr;
                        }
                        return ChunkResult::Ok(bytes);
                    }

                    if src.is_empty() {
                        return ChunkResult::InsufficientData;
                    }

                    let b = src[0];
                    src.advance(1);

                    match state.step_byte(b, size) {
                        Ok(ChunkedState::End) => {
                            *state = ChunkedState::End;
                            // yield the eof transition from the match above.
                            return self.decode(src);
                        }
                        Ok(next) => *state = next,
                        Err(e) => return ChunkResult::Err(e),
                    }
                }
            }
            Self::MonitorChunked(ref mut state, ref mut size) => {
                let mut pos = 0;
                loop {
                    if *state == ChunkedState::Body {
                        let n = (*size).min((src.len() - pos) as u64) as usize;
                        pos += n;
                        *size -= n as u64;
                        if *size == 0 {
                            *state = ChunkedState::BodyCr;
                        }
                    }

                    if pos == src.len() {
                        // everything scanned belongs to the stream; pass it on.
                        return ChunkResult::Ok(src.split().freeze());
                    }

                    if *state == ChunkedState::Body {
                        continue;
                    }

                    let b = src[pos];
                    pos += 1;

                    match state.step_byte(b, size) {
                        // terminal chunk ends inside src. pass the framing tail
                        // through and leave trailing pipelined bytes alone.
                        Ok(ChunkedState::End) => {
                            *state = ChunkedState::End;
                            return ChunkResult::Ok(src.split_to(pos).freeze());
                        }
                        Ok(next) => *state = next,
                        Err(e) => return ChunkResult::Err(e),
                    }
                }
            }
            _ => unreachable!(),
        }
    }
}

#[derive(Debug)]
pub enum ChunkResult {
    /// non empty chunk data produced by coder.
    Ok(Bytes),
    /// io error type produced by coder that can be bubbled up to upstream caller.
    Err(io::Error),
    /// insufficient data. More input bytes required.
    InsufficientData,
    /// coder reached EOF state and no more chunk can be produced.
    Eof,
    /// coder already reached EOF state. hints to stop feeding input and/or
    /// calling again.
    AlreadyEof,
}

impl fmt::Display for ChunkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Ok(_) => f.write_str("chunked data."),
            Self::InsufficientData => f.write_str("no sufficient data. More input bytes required."),
            Self::Eof => f.write_str("coder reached EOF state. no more chunk can be produced."),
            Self::AlreadyEof => f.write_str("coder already reached EOF state. no more chunk can be produced."),
            Self::Err(ref e) => fmt::Display::fmt(e, f),
        }
    }
}

impl From<io::Error> for ChunkResult {
    fn from(e: io::Error) -> Self {
        Self::Err(e)
    }
}

fn bounded_split(rem: &mut u64, buf: &mut BytesMut) -> Bytes {
    let len = buf.len() as u64;
    if *rem >= len {
        *rem -= len;
        buf.split().freeze()
    } else {
        let rem = mem::replace(rem, 0);
        buf.split_to(rem as usize).freeze()
    }
}

/// write a hex chunk size line.
pub(crate) fn write_chunk_size(buf: &mut BytesMut, len: usize) {
    struct Writer<'a>(&'a mut BytesMut);

    impl fmt::Write for Writer<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            self.0.put_slice(s.as_bytes());
            Ok(())
        }
    }

    use fmt::Write;
    write!(Writer(buf), "{len:X}\r\n").unwrap();
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(decoder: &mut TransferCoding, src: &mut BytesMut) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match decoder.decode(src) {
                ChunkResult::Ok(bytes) => out.extend_from_slice(&bytes),
                ChunkResult::Eof | ChunkResult::AlreadyEof | ChunkResult::InsufficientData => return out,
                ChunkResult::Err(e) => panic!("decode error: {e}"),
            }
        }
    }

    #[test]
    fn test_read_chunk_size() {
        use std::io::ErrorKind::{InvalidData, InvalidInput};

        fn read(s: &str) -> u64 {
            let mut state = ChunkedState::Size;
            let mut size = 0;
            for &b in s.as_bytes() {
                state = state.step_byte(b, &mut size).unwrap_or_else(|_| panic!("read_size failed for {s:?}"));
                if state == ChunkedState::Body || state == ChunkedState::EndCr {
                    break;
                }
            }
            size
        }

        fn read_err(s: &str, expected_err: io::ErrorKind) {
            let mut state = ChunkedState::Size;
            let mut size = 0;
            for &b in s.as_bytes() {
                match state.step_byte(b, &mut size) {
                    Ok(next) => state = next,
                    Err(e) => {
                        assert_eq!(expected_err, e.kind(), "reading {s:?}");
                        return;
                    }
                }
                if state == ChunkedState::Body || state == ChunkedState::End {
                    panic!("was Ok. Expected Err for {s:?}");
                }
            }
            panic!("ran out of input for {s:?}");
        }

        assert_eq!(1, read("1\r\n"));
        assert_eq!(1, read("01\r\n"));
        assert_eq!(0, read("0\r\n"));
        assert_eq!(0, read("00\r\n"));
        assert_eq!(10, read("A\r\n"));
        assert_eq!(10, read("a\r\n"));
        assert_eq!(255, read("Ff\r\n"));
        assert_eq!(255, read("Ff   \r\n"));
        // missing LF or CRLF
        read_err("F\rF", InvalidInput);
        // invalid hex digit
        read_err("X\r\n", InvalidInput);
        read_err("1X\r\n", InvalidInput);
        read_err("-\r\n", InvalidInput);
        read_err("-1\r\n", InvalidInput);
        // acceptable (if not fully valid) extensions do not influence the size
        assert_eq!(1, read("1;extension\r\n"));
        assert_eq!(10, read("a;ext name=value\r\n"));
        assert_eq!(1, read("1;extension;extension2\r\n"));
        assert_eq!(1, read("1;;;  ;\r\n"));
        assert_eq!(2, read("2; extension...\r\n"));
        assert_eq!(3, read("3   ; extension=123\r\n"));
        assert_eq!(3, read("3   ;\r\n"));
        assert_eq!(3, read("3   ;   \r\n"));
        // invalid extensions cause an error
        read_err("1 invalid extension\r\n", InvalidInput);
        read_err("1 A\r\n", InvalidInput);
        read_err("1;reject\nnewlines\r\n", InvalidData);
        // overflow
        read_err("f0000000000000003\r\n", InvalidData);
    }

    #[test]
    fn test_read_chunked_single_read() {
        let mock_buf = &mut BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n"[..]);

        match TransferCoding::decode_chunked().decode(mock_buf) {
            ChunkResult::Ok(buf) => {
                assert_eq!(16, buf.len());
                let result = String::from_utf8(buf.as_ref().to_vec()).expect("decode String");
                assert_eq!("1234567890abcdef", &result);
            }
            state => panic!("{state}"),
        }
    }

    #[test]
    fn test_read_chunked_trailer_with_missing_lf() {
        let mock_buf = &mut BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\nbad\r\r\n"[..]);

        let mut decoder = TransferCoding::decode_chunked();

        match decoder.decode(mock_buf) {
            ChunkResult::Ok(_) => {}
            state => panic!("{state}"),
        }

        match decoder.decode(mock_buf) {
            ChunkResult::Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            state => panic!("{state}"),
        }
    }

    #[test]
    fn test_read_chunked_after_eof() {
        let mock_buf = &mut BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        let mut decoder = TransferCoding::decode_chunked();

        // normal read
        match decoder.decode(mock_buf) {
            ChunkResult::Ok(buf) => {
                assert_eq!(16, buf.len());
                let result = String::from_utf8(buf.as_ref().to_vec()).unwrap();
                assert_eq!("1234567890abcdef", &result);
            }
            state => panic!("{state}"),
        }

        // eof read
        match decoder.decode(mock_buf) {
            ChunkResult::Eof => {}
            state => panic!("{state}"),
        }

        // already meet eof
        match decoder.decode(mock_buf) {
            ChunkResult::AlreadyEof => {}
            state => panic!("{state}"),
        }
    }

    #[test]
    fn encode_chunked() {
        let mut encoder = TransferCoding::encode_chunked();
        let dst = &mut BytesMut::new();

        encoder.encode(Bytes::from("foo bar"), dst);
        assert_eq!(&dst[..], b"7\r\nfoo bar\r\n");

        encoder.encode(Bytes::from("baz quux herp"), dst);
        assert_eq!(&dst[..], b"7\r\nfoo bar\r\nD\r\nbaz quux herp\r\n");

        encoder.encode_eof(dst);
        assert_eq!(&dst[..], b"7\r\nfoo bar\r\nD\r\nbaz quux herp\r\n0\r\n\r\n");
    }

    #[test]
    fn encode_length() {
        let max_len = 8;
        let mut encoder = TransferCoding::length(max_len as u64);
        let dst = &mut BytesMut::new();

        encoder.encode(Bytes::from("foo bar"), dst);
        assert_eq!(&dst[..], b"foo bar");

        for _ in 0..8 {
            encoder.encode(Bytes::from("baz"), dst);
            assert_eq!(dst.len(), max_len);
            assert_eq!(&dst[..], b"foo barb");
        }

        encoder.encode_eof(dst);
        assert_eq!(dst.len(), max_len);
        assert_eq!(&dst[..], b"foo barb");
    }

    #[test]
    fn encode_then_decode_roundtrip() {
        let payload: Vec<u8> = (0..937u32).map(|i| (i % 199) as u8).collect();

        let mut encoder = TransferCoding::encode_chunked();
        let mut wire = BytesMut::new();
        for chunk in payload.chunks(100) {
            encoder.encode(Bytes::copy_from_slice(chunk), &mut wire);
        }
        encoder.encode_eof(&mut wire);

        let mut decoder = TransferCoding::decode_chunked();
        assert_eq!(decode_all(&mut decoder, &mut wire), payload);
        assert!(decoder.is_eof());
    }

    #[test]
    fn monitor_mode_passes_framing_through() {
        let wire = b"3\r\nabc\r\n10\r\n1234567890abcdef\r\n0\r\n\r\n";
        let mut src = BytesMut::from(&wire[..]);
        // pipelined bytes after the terminal chunk must stay put.
        src.extend_from_slice(b"GET /next");

        let mut decoder = TransferCoding::monitor_chunked();
        let mut out = Vec::new();
        loop {
            match decoder.decode(&mut src) {
                ChunkResult::Ok(bytes) => out.extend_from_slice(&bytes),
                ChunkResult::Eof => break,
                state => panic!("{state}"),
            }
        }

        assert_eq!(out, wire);
        assert_eq!(&src[..], b"GET /next");
        assert!(matches!(decoder.decode(&mut src), ChunkResult::AlreadyEof));
    }

    #[test]
    fn monitor_mode_split_feed() {
        let wire = b"5\r\nhello\r\n0\r\n\r\n";
        let mut decoder = TransferCoding::monitor_chunked();
        let mut out = Vec::new();

        for part in wire.chunks(3) {
            let mut src = BytesMut::from(part);
            loop {
                match decoder.decode(&mut src) {
                    ChunkResult::Ok(bytes) => out.extend_from_slice(&bytes),
                    ChunkResult::InsufficientData | ChunkResult::Eof | ChunkResult::AlreadyEof => break,
                    ChunkResult::Err(e) => panic!("{e}"),
                }
            }
        }

        assert_eq!(out, wire);
    }

    #[test]
    fn close_delimited_passes_everything() {
        let mut decoder = TransferCoding::close_delimited();
        let mut src = BytesMut::from(&b"raw bytes until close"[..]);
        match decoder.decode(&mut src) {
            ChunkResult::Ok(bytes) => assert_eq!(&bytes[..], b"raw bytes until close"),
            state => panic!("{state}"),
        }
        assert!(matches!(decoder.decode(&mut src), ChunkResult::InsufficientData));
    }
}
