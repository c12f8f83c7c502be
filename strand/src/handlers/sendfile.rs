//! static file handler.

use std::{io, path::PathBuf, time::SystemTime};

use percent_encoding::percent_decode_str;
use tracing::debug;

use strand_http::{
    buf::file::{chunk_read, DEFAULT_CHUNK_SIZE},
    h1::body::RequestBody,
    http::{
        header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED},
        Method, Request, Response, StatusCode,
    },
    ResponseBody,
};
use strand_server::wpool::WorkerFactory;

use crate::LocalBoxFuture;

use super::{Handler, HandlerOutcome, RequestContext};

pub struct FileHandler {
    root: PathBuf,
    index: String,
    wpool: WorkerFactory,
}

impl FileHandler {
    pub fn new(root: PathBuf, index: Option<String>, wpool: WorkerFactory) -> Self {
        Self {
            root,
            index: index.unwrap_or_else(|| "index.html".into()),
            wpool,
        }
    }

    fn resolve(&self, path_info: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(path_info).decode_utf8().ok()?;

        // reject traversal before touching the filesystem.
        if decoded.split('/').any(|seg| seg == "..") {
            return None;
        }

        let mut path = self.root.clone();
        path.push(decoded.trim_start_matches('/'));
        Some(path)
    }
}

impl Handler for FileHandler {
    fn name(&self) -> &'static str {
        "file"
    }

    fn handle<'a>(&'a self, ctx: &'a RequestContext, req: Request<RequestBody>) -> LocalBoxFuture<'a, HandlerOutcome> {
        Box::pin(async move {
            if req.method() != Method::GET && req.method() != Method::HEAD {
                return HandlerOutcome::Error(StatusCode::METHOD_NOT_ALLOWED);
            }
            let is_head = req.method() == Method::HEAD;

            let Some(mut path) = self.resolve(&ctx.path_info) else {
                return HandlerOutcome::Error(StatusCode::NOT_FOUND);
            };

            // stat on a blocking worker; the event loop never touches disk.
            let stat_path = path.clone();
            let meta = match self.wpool.execute(move || std::fs::metadata(stat_path)).await {
                Ok(meta) => meta,
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => return HandlerOutcome::Next(req),
                Err(e) => {
                    debug!(target: "sendfile", "stat failed for {}: {e}", path.display());
                    return HandlerOutcome::Error(StatusCode::NOT_FOUND);
                }
            };

            let meta = if meta.is_dir() {
                path.push(&self.index);
                let stat_path = path.clone();
                match self.wpool.execute(move || std::fs::metadata(stat_path)).await {
                    Ok(meta) if meta.is_file() => meta,
                    _ => return HandlerOutcome::Next(req),
                }
            } else {
                meta
            };

            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            // conditional get against whole-second mtime granularity.
            if let Some(ims) = req.headers().get(IF_MODIFIED_SINCE) {
                if let Some(ims) = ims.to_str().ok().and_then(|v| httpdate::parse_http_date(v).ok()) {
                    let mtime_secs = mtime
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    let ims_secs = ims
                        .duration_since(SystemTime::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    if mtime_secs <= ims_secs {
                        let mut res = super::status_response(StatusCode::NOT_MODIFIED);
                        res.headers_mut()
                            .insert(LAST_MODIFIED, date_value(mtime));
                        return HandlerOutcome::Respond(res);
                    }
                }
            }

            let open_path = path.clone();
            let file = match self.wpool.execute(move || std::fs::File::open(open_path)).await {
                Ok(file) => tokio::fs::File::from_std(file),
                Err(_) => return HandlerOutcome::Next(req),
            };

            let mime = mime_guess::from_path(&path).first_or_octet_stream();

            let mut res = if is_head {
                let mut res = Response::new(ResponseBody::None);
                res.headers_mut()
                    .insert(CONTENT_LENGTH, HeaderValue::from(meta.len()));
                res
            } else {
                Response::new(ResponseBody::box_stream(chunk_read(
                    file,
                    0,
                    meta.len(),
                    DEFAULT_CHUNK_SIZE,
                )))
            };

            res.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_str(mime.as_ref()).unwrap_or(HeaderValue::from_static("application/octet-stream")),
            );
            res.headers_mut().insert(LAST_MODIFIED, date_value(mtime));

            HandlerOutcome::Respond(res)
        })
    }
}

fn date_value(time: SystemTime) -> HeaderValue {
    HeaderValue::from_str(&httpdate::fmt_http_date(time)).expect("http date is a valid header value")
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn ctx(path_info: &str) -> RequestContext {
        RequestContext {
            remote_addr: None,
            secure: false,
            path_info: path_info.into(),
            req_uid: 1,
        }
    }

    fn get(uri: &str) -> Request<RequestBody> {
        let mut req = Request::new(RequestBody::default());
        *req.uri_mut() = uri.parse().unwrap();
        req
    }

    #[tokio::test]
    async fn serves_file_with_mime_and_last_modified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::File::create(&path).unwrap().write_all(b"hello").unwrap();

        let wpool = WorkerFactory::new(2);
        let handler = FileHandler::new(dir.path().into(), None, wpool.clone());

        match handler.handle(&ctx("/hello.txt"), get("/hello.txt")).await {
            HandlerOutcome::Respond(res) => {
                assert_eq!(res.status(), StatusCode::OK);
                assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
                assert!(res.headers().contains_key(LAST_MODIFIED));
            }
            _ => panic!("expected a response"),
        }

        wpool.shutdown();
    }

    #[tokio::test]
    async fn missing_file_defers_to_next_route() {
        let dir = tempfile::tempdir().unwrap();
        let wpool = WorkerFactory::new(2);
        let handler = FileHandler::new(dir.path().into(), None, wpool.clone());

        assert!(matches!(
            handler.handle(&ctx("/nope.txt"), get("/nope.txt")).await,
            HandlerOutcome::Next(_)
        ));

        wpool.shutdown();
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let wpool = WorkerFactory::new(2);
        let handler = FileHandler::new(dir.path().into(), None, wpool.clone());

        assert!(matches!(
            handler.handle(&ctx("/../etc/passwd"), get("/../etc/passwd")).await,
            HandlerOutcome::Error(StatusCode::NOT_FOUND)
        ));

        wpool.shutdown();
    }

    #[tokio::test]
    async fn if_modified_since_yields_304() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::File::create(&path).unwrap().write_all(b"<html/>").unwrap();

        let wpool = WorkerFactory::new(2);
        let handler = FileHandler::new(dir.path().into(), None, wpool.clone());

        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let mut req = get("/page.html");
        req.headers_mut().insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(mtime)).unwrap(),
        );

        match handler.handle(&ctx("/page.html"), req).await {
            HandlerOutcome::Respond(res) => assert_eq!(res.status(), StatusCode::NOT_MODIFIED),
            _ => panic!("expected 304"),
        }

        wpool.shutdown();
    }
}
