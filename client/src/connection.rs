use strand_http::{bytes::BytesMut, io::TcpStream};

/// one backend transport with its read buffer and reuse accounting.
pub struct H1Connection {
    pub(crate) io: TcpStream,
    pub(crate) read_buf: BytesMut,
    pub(crate) request_count: usize,
}

impl H1Connection {
    pub(crate) fn new(io: TcpStream) -> Self {
        Self {
            io,
            read_buf: BytesMut::new(),
            request_count: 0,
        }
    }

    /// requests answered over this transport so far.
    pub fn request_count(&self) -> usize {
        self.request_count
    }
}
