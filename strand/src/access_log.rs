//! access log: one line per completed request.
//!
//! records are rendered into a per worker block buffer and flushed to the
//! shared append-only log file on the gc tick, when the block fills up and at
//! worker shutdown. rendering uses the byte arena so a busy worker builds
//! lines without per request allocation.

use core::cell::RefCell;

use std::{
    fs,
    io::{self, Write},
    net::SocketAddr,
    path::Path,
    rc::Rc,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::error;

use strand_http::{
    bytes::Bytes,
    http::{header::HeaderValue, Method},
    util::arena::Arena,
};

// flush threshold of a worker's block buffer.
const BLOCK_FLUSH_SIZE: usize = 16 * 1024;

// uids are unique per process run; high bits carry a coarse boot stamp so
// lines from consecutive runs do not collide.
static NEXT_UID: AtomicU64 = AtomicU64::new(0);

pub fn next_uid() -> u64 {
    let seq = NEXT_UID.fetch_add(1, Ordering::Relaxed);
    if seq == 0 {
        // lazily mix the boot stamp into the counter base.
        let stamp = UNIX_EPOCH.elapsed().map(|d| d.as_secs()).unwrap_or(0);
        NEXT_UID.fetch_add((stamp & 0xffff_ffff) << 24, Ordering::Relaxed);
    }
    seq.wrapping_add(1)
}

/// shared sink over the access log file. `disabled` swallows records.
#[derive(Clone)]
pub struct AccessLog {
    file: Option<Arc<Mutex<fs::File>>>,
}

impl AccessLog {
    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        let file = match path {
            Some(path) => {
                let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
                Some(Arc::new(Mutex::new(file)))
            }
            None => None,
        };
        Ok(Self { file })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    fn write_block(&self, block: &[u8]) {
        if block.is_empty() {
            return;
        }
        if let Some(ref file) = self.file {
            // append mode writes keep whole blocks of lines contiguous per
            // worker even with several processes on the same file.
            if let Err(e) = file.lock().unwrap().write_all(block) {
                error!(target: "access_log", "access log write failed: {e}");
            }
        }
    }
}

/// per worker buffered writer.
pub struct WorkerLog {
    sink: AccessLog,
    arena: RefCell<Arena>,
    block: RefCell<Vec<u8>>,
}

impl WorkerLog {
    pub fn new(sink: AccessLog) -> Rc<Self> {
        Rc::new(Self {
            sink,
            arena: RefCell::new(Arena::default()),
            block: RefCell::new(Vec::new()),
        })
    }

    pub fn write(&self, record: &AccessRecord) {
        if !self.sink.is_enabled() {
            return;
        }

        let mut arena = self.arena.borrow_mut();
        let line = record.render(&mut arena);

        let mut block = self.block.borrow_mut();
        block.extend_from_slice(&line);
        drop(line);
        arena.reset();

        if block.len() >= BLOCK_FLUSH_SIZE {
            self.sink.write_block(&block);
            block.clear();
        }
    }

    /// push the buffered block out. wired to the gc tick and shutdown.
    pub fn flush(&self) {
        let mut block = self.block.borrow_mut();
        self.sink.write_block(&block);
        block.clear();
    }
}

impl Drop for WorkerLog {
    fn drop(&mut self) {
        self.flush();
    }
}

/// proxy leg of a request, attached to the response by the proxy handler.
#[derive(Clone, Debug)]
pub struct ProxyLogInfo {
    pub uid: u64,
    pub request_n: usize,
    pub conns: usize,
    pub max_conns: usize,
    pub status: u16,
}

/// everything one log line carries.
pub struct AccessRecord {
    pub time: SystemTime,
    pub conn_uid: u64,
    pub req_uid: u64,
    /// absent for subrequests, which log their parent uid instead.
    pub remote: Option<SocketAddr>,
    pub parent_uid: Option<u64>,
    pub method: Method,
    pub http11: bool,
    pub host: Option<Bytes>,
    pub uri: Bytes,
    pub user_agent: Option<HeaderValue>,
    pub status: u16,
    pub bytes_sent: u64,
    pub duration: Duration,
    pub handler: &'static str,
    pub proxy: Option<ProxyLogInfo>,
}

impl AccessRecord {
    fn render(&self, arena: &mut Arena) -> Bytes {
        arena.start_stream();

        append_iso8601(arena, self.time);
        arena.append_char(b' ');
        append_hex16(arena, self.conn_uid);
        arena.append_char(b' ');
        append_hex16(arena, self.req_uid);
        arena.append_char(b' ');

        match (self.remote, self.parent_uid) {
            (Some(addr), _) => arena.append_str(&addr.to_string()),
            (None, Some(parent)) => append_hex16(arena, parent),
            (None, None) => arena.append_char(b'-'),
        }

        arena.append_char(b' ');
        arena.append_str(self.method.as_str());
        arena.append_char(b'.');
        arena.append_char(if self.http11 { b'1' } else { b'0' });
        arena.append_char(b' ');

        match self.host {
            Some(ref host) => arena.append(host),
            None => arena.append_char(b'-'),
        }
        arena.append_char(b' ');
        arena.append(&self.uri);

        if let Some(ref ua) = self.user_agent {
            arena.append_str(" ua:");
            arena.append(ua.as_bytes());
        }

        arena.append_char(b' ');
        arena.append_u64(self.status as u64);
        arena.append_char(b' ');
        arena.append_u64(self.bytes_sent);
        arena.append_str("b ");
        arena.append_u64(self.duration.as_millis() as u64);
        arena.append_str("ms ");
        arena.append_str(self.handler);

        if let Some(ref px) = self.proxy {
            arena.append_str(" {px:");
            append_hex16(arena, px.uid);
            arena.append_char(b' ');
            arena.append_u64(px.request_n as u64);
            arena.append_char(b'/');
            arena.append_u64(px.conns as u64);
            arena.append_char(b'/');
            arena.append_u64(px.max_conns as u64);
            arena.append_char(b' ');
            arena.append_u64(px.status as u64);
            arena.append_char(b'}');
        }

        arena.append_char(b'\n');
        arena.finish_stream()
    }
}

fn append_hex16(arena: &mut Arena, value: u64) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = [0u8; 16];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = HEX[((value >> (60 - i * 4)) & 0xf) as usize];
    }
    arena.append(&out);
}

// utc timestamp as 2026-08-01T12:34:56Z without pulling in a calendar crate.
fn append_iso8601(arena: &mut Arena, time: SystemTime) {
    let secs = time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0) as i64;

    let days = secs.div_euclid(86_400);
    let tod = secs.rem_euclid(86_400);

    // civil-from-days (Hinnant).
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    append_padded(arena, y as u64, 4);
    arena.append_char(b'-');
    append_padded(arena, m as u64, 2);
    arena.append_char(b'-');
    append_padded(arena, d as u64, 2);
    arena.append_char(b'T');
    append_padded(arena, (tod / 3600) as u64, 2);
    arena.append_char(b':');
    append_padded(arena, (tod / 60 % 60) as u64, 2);
    arena.append_char(b':');
    append_padded(arena, (tod % 60) as u64, 2);
    arena.append_char(b'Z');
}

fn append_padded(arena: &mut Arena, value: u64, width: usize) {
    let mut fmt = itoa::Buffer::new();
    let digits = fmt.format(value).as_bytes();
    for _ in digits.len()..width {
        arena.append_char(b'0');
    }
    arena.append(digits);
}

#[cfg(test)]
mod test {
    use super::*;

    fn record() -> AccessRecord {
        AccessRecord {
            time: UNIX_EPOCH + Duration::from_secs(1_754_042_096),
            conn_uid: 0xabc,
            req_uid: 0xabd,
            remote: Some("10.1.2.3:5060".parse().unwrap()),
            parent_uid: None,
            method: Method::GET,
            http11: true,
            host: Some(Bytes::from_static(b"example.com")),
            uri: Bytes::from_static(b"/index.html"),
            user_agent: Some(HeaderValue::from_static("curl/8")),
            status: 200,
            bytes_sent: 1234,
            duration: Duration::from_millis(7),
            handler: "file",
            proxy: None,
        }
    }

    #[test]
    fn renders_expected_line() {
        let mut arena = Arena::default();
        let line = record().render(&mut arena);
        let line = core::str::from_utf8(&line).unwrap();

        assert_eq!(
            line,
            "2025-08-01T09:54:56Z 0000000000000abc 0000000000000abd 10.1.2.3:5060 \
             GET.1 example.com /index.html ua:curl/8 200 1234b 7ms file\n"
        );
    }

    #[test]
    fn subrequest_logs_parent_uid() {
        let mut rec = record();
        rec.remote = None;
        rec.parent_uid = Some(0xabc);
        rec.user_agent = None;

        let mut arena = Arena::default();
        let line = rec.render(&mut arena);
        let line = core::str::from_utf8(&line).unwrap();
        assert!(line.contains(" 0000000000000abc GET.1 "));
        assert!(!line.contains("ua:"));
    }

    #[test]
    fn proxy_segment_renders() {
        let mut rec = record();
        rec.proxy = Some(ProxyLogInfo {
            uid: 0x11,
            request_n: 3,
            conns: 2,
            max_conns: 256,
            status: 200,
        });

        let mut arena = Arena::default();
        let line = rec.render(&mut arena);
        let line = core::str::from_utf8(&line).unwrap();
        assert!(line.ends_with("{px:0000000000000011 3/2/256 200}\n"));
    }

    #[test]
    fn worker_log_buffers_until_flush() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let sink = AccessLog::open(Some(tmp.path())).unwrap();
        let log = WorkerLog::new(sink);

        log.write(&record());
        assert_eq!(fs::read(tmp.path()).unwrap().len(), 0, "record must stay buffered");

        log.flush();
        let content = fs::read_to_string(tmp.path()).unwrap();
        assert!(content.ends_with("file\n"));
    }

    #[test]
    fn uids_are_unique() {
        let a = next_uid();
        let b = next_uid();
        assert_ne!(a, b);
    }
}
