//! response filter chain.
//!
//! filters run after the handler produced a response, in the order the route
//! lists them. a filter may rewrite headers, wrap the body stream or, for the
//! cache bearing ones, answer a request before the handler runs at all.

pub mod cors;
pub mod file_cache;

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use strand_http::{
    http::Response,
    ResponseBody,
};

use crate::LocalBoxFuture;

pub struct FilterContext {
    /// translated cache key of this request, when a cache filter claimed it.
    pub cache_path: Option<PathBuf>,
    pub now: SystemTime,
}

pub trait Filter {
    fn name(&self) -> &'static str;

    /// turn the handler's virtual cache key into this filter's on-disk key.
    fn translate_cache_key(&self, key: &[u8]) -> Option<PathBuf> {
        let _ = key;
        None
    }

    /// chance to answer from cache before the handler runs.
    fn serve_from_cache<'a>(&'a self, path: &'a Path) -> LocalBoxFuture<'a, Option<Response<ResponseBody>>> {
        let _ = path;
        Box::pin(async { None })
    }

    /// transform the outgoing response.
    fn apply<'a>(
        &'a self,
        ctx: &'a FilterContext,
        resp: Response<ResponseBody>,
    ) -> LocalBoxFuture<'a, Response<ResponseBody>>;
}
