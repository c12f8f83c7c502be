//! cross origin resource sharing headers.

use strand_http::{
    http::{header::HeaderValue, Response},
    ResponseBody,
};

use crate::LocalBoxFuture;

use super::{Filter, FilterContext};

pub struct CorsFilter {
    origin: HeaderValue,
}

impl CorsFilter {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: HeaderValue::from_str(origin).unwrap_or(HeaderValue::from_static("*")),
        }
    }
}

impl Filter for CorsFilter {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn apply<'a>(&'a self, _: &'a FilterContext, mut resp: Response<ResponseBody>) -> LocalBoxFuture<'a, Response<ResponseBody>> {
        resp.headers_mut()
            .insert("access-control-allow-origin", self.origin.clone());
        resp.headers_mut().insert(
            "access-control-allow-methods",
            HeaderValue::from_static("GET, POST, HEAD, OPTIONS"),
        );
        Box::pin(async move { resp })
    }
}
