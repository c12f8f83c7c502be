use core::{
    cell::RefCell,
    future::Future,
    task::{Poll, Waker},
    time::Duration,
};

use std::{io, net::SocketAddr, rc::Rc, sync::Arc, thread};

use tokio::{sync::watch, task::LocalSet, time::sleep};
use tracing::{error, info, trace};

/// per connection entry point implemented by the protocol layer.
pub trait ConnectionService {
    fn handle(&self, stream: tokio::net::TcpStream, addr: SocketAddr) -> impl Future<Output = ()>;
}

/// running server. stops its workers on request and joins them on wait.
pub struct Server {
    shutdown: watch::Sender<bool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Server {
    pub(crate) fn new(shutdown: watch::Sender<bool>, handles: Vec<thread::JoinHandle<()>>) -> Self {
        Self { shutdown, handles }
    }

    /// ask every worker to stop accepting and drain.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// block until all workers exited.
    pub fn wait(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }

    /// block until SIGINT/SIGTERM style interrupt, then stop and drain.
    pub fn run_until_signal(self) -> io::Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(async {
            let _ = tokio::signal::ctrl_c().await;
        });
        info!("interrupt received. shutting down");
        self.stop();
        self.wait();
        Ok(())
    }
}

pub(crate) fn spawn<F, Svc>(
    index: usize,
    listeners: Arc<Vec<(String, std::net::TcpListener)>>,
    service_builder: Arc<F>,
    max_connections: usize,
    shutdown_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) -> io::Result<thread::JoinHandle<()>>
where
    F: Fn(&str) -> Svc + Send + Sync + 'static,
    Svc: ConnectionService + 'static,
{
    thread::Builder::new()
        .name(format!("strand-worker-{index}"))
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build worker runtime");

            let local = LocalSet::new();

            local.block_on(&rt, async move {
                let limit = Limit::new(max_connections);
                let mut accept_handles = Vec::new();

                for (name, listener) in listeners.iter() {
                    let listener = match clone_listener(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!("worker failed to adopt listener {name}: {e}");
                            continue;
                        }
                    };

                    let service = Rc::new(service_builder(name));
                    let accept = AcceptLoop {
                        listener,
                        service,
                        limit: limit.clone(),
                        shutdown: shutdown.clone(),
                    };
                    accept_handles.push(tokio::task::spawn_local(accept.run()));
                }

                info!("started {}", worker_name());

                for handle in accept_handles {
                    let _ = handle.await;
                }

                // grace period for in flight connections.
                let _ = tokio::time::timeout(shutdown_timeout, limit.drained()).await;
            });
        })
}

fn clone_listener(listener: &std::net::TcpListener) -> io::Result<tokio::net::TcpListener> {
    let listener = listener.try_clone()?;
    listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(listener)
}

fn worker_name() -> String {
    thread::current()
        .name()
        .map(ToString::to_string)
        .unwrap_or_else(|| String::from("strand-worker"))
}

struct AcceptLoop<Svc> {
    listener: tokio::net::TcpListener,
    service: Rc<Svc>,
    limit: Limit,
    shutdown: watch::Receiver<bool>,
}

impl<Svc> AcceptLoop<Svc>
where
    Svc: ConnectionService + 'static,
{
    async fn run(mut self) {
        loop {
            let guard = self.limit.ready().await;

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                }
                res = self.listener.accept() => match res {
                    Ok((stream, addr)) => {
                        trace!(target: "accept", %addr, "connection accepted");
                        let service = self.service.clone();
                        tokio::task::spawn_local(async move {
                            service.handle(stream, addr).await;
                            drop(guard);
                        });
                    }
                    Err(ref e) if connection_error(e) => continue,
                    Err(e) => {
                        // resource exhaustion (EMFILE and friends). back off
                        // instead of spinning on accept.
                        error!("error accepting connection: {e}");
                        sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
    }
}

/// per-connection errors out of `accept()`: the next connection may well be
/// fine, so retry immediately.
fn connection_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
        || e.kind() == io::ErrorKind::ConnectionAborted
        || e.kind() == io::ErrorKind::ConnectionReset
}

// concurrent connection counter with readiness based waiting.
pub(crate) struct Limit(Rc<RefCell<LimitInner>>);

struct LimitInner {
    count: usize,
    max: usize,
    ready_wakers: Vec<Waker>,
    idle_wakers: Vec<Waker>,
}

impl Clone for Limit {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Limit {
    pub(crate) fn new(max: usize) -> Self {
        Self(Rc::new(RefCell::new(LimitInner {
            count: 0,
            max,
            ready_wakers: Vec::new(),
            idle_wakers: Vec::new(),
        })))
    }

    // wait for a free slot and claim it.
    pub(crate) async fn ready(&self) -> LimitGuard {
        core::future::poll_fn(|cx| {
            let mut inner = self.0.borrow_mut();
            if inner.count < inner.max {
                inner.count += 1;
                Poll::Ready(())
            } else {
                inner.ready_wakers.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;
        LimitGuard(self.0.clone())
    }

    // wait for every claimed slot to be released.
    pub(crate) fn drained(&self) -> impl Future<Output = ()> + '_ {
        core::future::poll_fn(|cx| {
            let mut inner = self.0.borrow_mut();
            if inner.count == 0 {
                Poll::Ready(())
            } else {
                inner.idle_wakers.push(cx.waker().clone());
                Poll::Pending
            }
        })
    }
}

pub(crate) struct LimitGuard(Rc<RefCell<LimitInner>>);

impl Drop for LimitGuard {
    fn drop(&mut self) {
        let mut inner = self.0.borrow_mut();
        inner.count -= 1;
        if let Some(waker) = inner.ready_wakers.pop() {
            waker.wake();
        }
        if inner.count == 0 {
            for waker in inner.idle_wakers.drain(..) {
                waker.wake();
            }
        }
    }
}
