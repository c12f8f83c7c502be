//! internal dispatch of virtual requests.
//!
//! a subrequest runs a handler exactly as if a request had arrived on the
//! wire, without any socket: straight through the worker's router. the
//! response body can be grafted into a [Streamer] node, which is how composite
//! responses are assembled from fragments produced by other handlers.

use core::pin::pin;

use std::io;

use strand_http::{
    buf::streamer::StreamerNode,
    h1::body::RequestBody,
    http::{Method, Request, Response},
    service::Service,
    ResponseBody,
};

use crate::service::RouterService;

/// marker carried by every internally dispatched request.
#[derive(Clone, Copy, Debug)]
pub struct Subrequest {
    /// uid of the request this one was spawned for. access log lines of
    /// subrequests carry it in place of a peer address.
    pub parent_uid: u64,
}

/// dispatch a virtual GET through the router. the caller gets the response
/// head as soon as the handler produced it; the body streams on demand.
pub async fn dispatch(router: &RouterService, host: &str, uri: &str, parent_uid: u64) -> Response<ResponseBody> {
    let mut req = Request::new(RequestBody::default());
    *req.method_mut() = Method::GET;
    if let Ok(uri) = format!("http://{host}{uri}").parse() {
        *req.uri_mut() = uri;
    }
    req.extensions_mut().insert(Subrequest { parent_uid });

    router.call(req).await.unwrap_or_else(|e| match e {})
}

/// pump a subrequest's body into one node of a composite stream. resolves
/// when the fragment is fully transferred, which is the caller's completion
/// notification.
pub async fn pipe_into_node(body: ResponseBody, node: &mut StreamerNode) -> io::Result<()> {
    let mut body = pin!(body);

    while let Some(chunk) = core::future::poll_fn(|cx| body.as_mut().poll_next(cx)).await {
        let chunk = chunk.map_err(io::Error::other)?;
        node.write(chunk).await?;
    }

    node.close();
    Ok(())
}

#[cfg(test)]
mod test {
    use core::pin::Pin;

    use std::io::Write;

    use futures_core::stream::Stream;
    use tokio::task::LocalSet;

    use strand_http::buf::streamer::Streamer;
    use strand_server::wpool::WorkerFactory;

    use crate::{
        access_log::AccessLog,
        config::Config,
        service::WorkerEnv,
    };

    use super::*;

    async fn collect(stream: &mut Streamer) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = core::future::poll_fn(|cx| Pin::new(&mut *stream).poll_next(cx)).await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn subrequest_fragments_compose_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("a.txt")).unwrap().write_all(b"first").unwrap();
        std::fs::File::create(dir.path().join("b.txt")).unwrap().write_all(b"second").unwrap();

        let config: Config = serde_json::from_str(&format!(
            r#"{{ "routes": [{{ "prefix": "/", "handler": "file", "dir": {:?} }}] }}"#,
            dir.path().to_str().unwrap()
        ))
        .unwrap();

        let local = LocalSet::new();
        local
            .run_until(async {
                let env = WorkerEnv::new(WorkerFactory::new(2), AccessLog::disabled());
                let router = RouterService::from_config(&config, env.clone(), false);

                let mut streamer = Streamer::new();
                let control = streamer.control();
                let mut node_a = control.add_node();
                let mut node_b = control.add_node();
                control.close();

                let compose = async {
                    let res = dispatch(&router, "local", "/a.txt", 1).await;
                    assert_eq!(res.status(), 200);
                    pipe_into_node(res.into_body(), &mut node_a).await.unwrap();

                    let res = dispatch(&router, "local", "/b.txt", 1).await;
                    pipe_into_node(res.into_body(), &mut node_b).await.unwrap();
                };

                let (out, _) = tokio::join!(collect(&mut streamer), compose);
                assert_eq!(out, b"firstsecond");

                env.wpool.shutdown();
            })
            .await;
    }

    #[tokio::test]
    async fn subrequest_has_no_remote_addr() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("x.txt")).unwrap().write_all(b"x").unwrap();

        let config: Config = serde_json::from_str(&format!(
            r#"{{ "routes": [{{ "prefix": "/", "handler": "file", "dir": {:?} }}] }}"#,
            dir.path().to_str().unwrap()
        ))
        .unwrap();

        let local = LocalSet::new();
        local
            .run_until(async {
                let env = WorkerEnv::new(WorkerFactory::new(2), AccessLog::disabled());
                let router = RouterService::from_config(&config, env.clone(), false);

                let res = dispatch(&router, "local", "/x.txt", 42).await;
                assert_eq!(res.status(), 200);

                env.wpool.shutdown();
            })
            .await;
    }
}
