//! request handlers and their dispatch types.

pub mod proxy;
pub mod sendfile;

use std::net::SocketAddr;

use strand_http::{
    bytes::Bytes,
    h1::body::RequestBody,
    http::{Request, Response, StatusCode},
    util::arena::Arena,
    ResponseBody,
};

use crate::LocalBoxFuture;

/// per request routing facts handed to a handler.
pub struct RequestContext {
    pub remote_addr: Option<SocketAddr>,
    pub secure: bool,
    /// request path with the matched route prefix stripped.
    pub path_info: String,
    pub req_uid: u64,
}

/// what a handler decided about a request.
pub enum HandlerOutcome {
    /// response ready for the filter chain.
    Respond(Response<ResponseBody>),
    /// not mine; hand the request to the next matching route.
    Next(Request<RequestBody>),
    /// fail the request with a status code.
    Error(StatusCode),
}

pub trait Handler {
    fn name(&self) -> &'static str;

    /// cache key of a cacheable request, or None to bypass response caching.
    /// only called for bodyless GET requests.
    fn cache_key(&self, _ctx: &RequestContext, _req: &Request<RequestBody>, _arena: &mut Arena) -> Option<Bytes> {
        None
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        req: Request<RequestBody>,
    ) -> LocalBoxFuture<'a, HandlerOutcome>;
}

/// plain status response with an empty body.
pub fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut res = Response::new(ResponseBody::None);
    *res.status_mut() = status;
    res
}

/// canned error page.
pub fn error_response(status: StatusCode) -> Response<ResponseBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let body = format!(
        "<html><head><title>{code} {reason}</title></head><body><h1>{code} {reason}</h1></body></html>\n",
        code = status.as_u16(),
    );
    let mut res = Response::new(ResponseBody::bytes(body));
    *res.status_mut() = status;
    res.headers_mut().insert(
        strand_http::http::header::CONTENT_TYPE,
        strand_http::http::header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    res
}
