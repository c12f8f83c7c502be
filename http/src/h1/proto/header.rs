use httparse::Header;

use crate::{
    bytes::Bytes,
    http::header::HeaderValue,
};

use super::error::{Parse, ProtoError};

/// byte range of one parsed header inside the buffer it was parsed from.
///
/// httparse hands out slices borrowing the read buffer; recording offsets
/// instead lets the buffer be frozen and shared into [Bytes] backed header
/// values without copying.
#[derive(Clone, Copy, Default)]
pub struct HeaderIndex {
    pub name: (usize, usize),
    pub value: (usize, usize),
}

impl HeaderIndex {
    pub fn record<'i, const MAX_HEADERS: usize>(
        indices: &'i mut [HeaderIndex; MAX_HEADERS],
        buf: &[u8],
        headers: &[Header<'_>],
    ) -> &'i [HeaderIndex] {
        let head = buf.as_ptr() as usize;
        for (idx, header) in indices.iter_mut().zip(headers.iter()) {
            let name_start = header.name.as_ptr() as usize - head;
            let value_start = header.value.as_ptr() as usize - head;
            *idx = Self {
                name: (name_start, name_start + header.name.len()),
                value: (value_start, value_start + header.value.len()),
            };
        }
        &indices[..headers.len()]
    }

    #[inline]
    pub fn name_slice(&self, slice: &Bytes) -> Bytes {
        slice.slice(self.name.0..self.name.1)
    }

    #[inline]
    pub fn value_slice(&self, slice: &Bytes) -> Bytes {
        slice.slice(self.value.0..self.value.1)
    }
}

pub fn parse_content_length(value: &HeaderValue) -> Result<u64, ProtoError> {
    value
        .to_str()
        .map_err(|_| ProtoError::Parse(Parse::HeaderValue))?
        .trim()
        .parse()
        .map_err(|_| ProtoError::Parse(Parse::HeaderValue))
}
