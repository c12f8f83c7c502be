//! sequential concatenation of several produced streams into one output.
//!
//! a composite response (server side includes, error page assembly) is built
//! from nodes appended in output order. every node owns a private data-in
//! handle; only the current node's writes make progress, the rest park until
//! the nodes before them finish. the streamer itself is the single data-out
//! [Stream].

use core::{
    cell::RefCell,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use std::{collections::VecDeque, io, rc::Rc};

use bytes::Bytes;
use futures_core::stream::Stream;

// queued byte allowance per node before its writer parks.
const NODE_QUEUE_LIMIT: usize = 16 * 1024;

/// the data-out side. polls bytes of the current node in append order,
/// producing one end of stream once the final node completes.
pub struct Streamer {
    shared: Rc<RefCell<Shared>>,
}

/// cloneable control surface: append nodes, close the queue.
pub struct StreamerControl {
    shared: Rc<RefCell<Shared>>,
}

/// data-in handle of one node.
pub struct StreamerNode {
    shared: Rc<RefCell<Shared>>,
    id: usize,
}

struct NodeState {
    queue: VecDeque<Bytes>,
    queued: usize,
    complete: bool,
    is_final: bool,
    write_waker: Option<Waker>,
}

struct Shared {
    nodes: Vec<NodeState>,
    current: usize,
    // set by close(): no nodes follow. an empty closed streamer emits bare eof.
    closed: bool,
    out_waker: Option<Waker>,
}

impl Shared {
    fn wake_out(&mut self) {
        if let Some(waker) = self.out_waker.take() {
            waker.wake();
        }
    }

    fn wake_current_writer(&mut self) {
        if let Some(node) = self.nodes.get_mut(self.current) {
            if let Some(waker) = node.write_waker.take() {
                waker.wake();
            }
        }
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new()
    }
}

impl Streamer {
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                nodes: Vec::new(),
                current: 0,
                closed: false,
                out_waker: None,
            })),
        }
    }

    pub fn control(&self) -> StreamerControl {
        StreamerControl {
            shared: self.shared.clone(),
        }
    }
}

impl StreamerControl {
    /// append a node at the queue tail and hand out its data-in.
    pub fn add_node(&self) -> StreamerNode {
        let mut shared = self.shared.borrow_mut();
        debug_assert!(!shared.closed, "node added after close");
        let id = shared.nodes.len();
        shared.nodes.push(NodeState {
            queue: VecDeque::new(),
            queued: 0,
            complete: false,
            is_final: false,
            write_waker: None,
        });
        StreamerNode {
            shared: self.shared.clone(),
            id,
        }
    }

    /// mark the most recently added node final; its completion becomes the
    /// streamer's eof. closing an empty streamer emits eof immediately.
    pub fn close(&self) {
        let mut shared = self.shared.borrow_mut();
        shared.closed = true;
        if let Some(last) = shared.nodes.last_mut() {
            last.is_final = true;
        }
        shared.wake_out();
    }
}

impl StreamerNode {
    /// queue a chunk on this node. parks while the node is not current or its
    /// allowance is used up.
    pub async fn write(&mut self, bytes: Bytes) -> io::Result<()> {
        core::future::poll_fn(|cx| self.poll_write_ready(cx)).await?;
        let mut shared = self.shared.borrow_mut();
        let node = &mut shared.nodes[self.id];
        node.queued += bytes.len();
        node.queue.push_back(bytes);
        shared.wake_out();
        Ok(())
    }

    fn poll_write_ready(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut shared = self.shared.borrow_mut();
        if shared.current != self.id || shared.nodes[self.id].queued >= NODE_QUEUE_LIMIT {
            shared.nodes[self.id].write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    /// end this node's input. buffered chunks still drain, then the streamer
    /// moves on to the next node.
    pub fn close(&mut self) {
        let mut shared = self.shared.borrow_mut();
        shared.nodes[self.id].complete = true;
        shared.wake_out();
    }
}

impl Drop for StreamerNode {
    fn drop(&mut self) {
        self.close();
    }
}

impl Stream for Streamer {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut shared = self.shared.borrow_mut();
        loop {
            let current = shared.current;
            match shared.nodes.get_mut(current) {
                Some(node) => {
                    if let Some(bytes) = node.queue.pop_front() {
                        node.queued -= bytes.len();
                        if let Some(waker) = node.write_waker.take() {
                            waker.wake();
                        }
                        return Poll::Ready(Some(Ok(bytes)));
                    }
                    if node.complete {
                        if node.is_final {
                            return Poll::Ready(None);
                        }
                        // switch to the next node and grant it readiness.
                        shared.current += 1;
                        shared.wake_current_writer();
                        continue;
                    }
                }
                None if shared.closed => return Poll::Ready(None),
                None => {}
            }
            shared.out_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
    }
}

#[cfg(test)]
mod test {
    use core::future::{poll_fn, Future};

    use super::*;

    async fn next(streamer: &mut Streamer) -> Option<io::Result<Bytes>> {
        poll_fn(|cx| Pin::new(&mut *streamer).poll_next(cx)).await
    }

    #[tokio::test]
    async fn nodes_concatenate_in_order_with_single_eof() {
        let mut streamer = Streamer::new();
        let control = streamer.control();

        let mut a = control.add_node();
        let mut b = control.add_node();
        control.close();

        let producers = async move {
            a.write(Bytes::from_static(b"ABC")).await.unwrap();
            a.close();
            b.write(Bytes::from_static(b"DE")).await.unwrap();
            b.close();
        };

        let consumer = async {
            let mut out = Vec::new();
            while let Some(chunk) = next(&mut streamer).await {
                out.extend_from_slice(&chunk.unwrap());
            }
            // eof is terminal: further polls keep reporting end of stream.
            assert!(next(&mut streamer).await.is_none());
            out
        };

        let (_, out) = tokio::join!(producers, consumer);
        assert_eq!(out, b"ABCDE");
    }

    #[tokio::test]
    async fn later_node_parks_until_current() {
        let mut streamer = Streamer::new();
        let control = streamer.control();

        let mut a = control.add_node();
        let mut b = control.add_node();
        control.close();

        // b's write must not complete while a is current.
        let mut b_write = Box::pin(b.write(Bytes::from_static(b"late")));
        assert!(poll_fn(|cx| Poll::Ready(b_write.as_mut().poll(cx).is_pending())).await);

        a.write(Bytes::from_static(b"first")).await.unwrap();
        a.close();

        assert_eq!(&next(&mut streamer).await.unwrap().unwrap()[..], b"first");

        // draining past a's completion makes b current, which unparks the
        // pending write and lets the next chunk through.
        let (write_res, chunk) = tokio::join!(b_write, next(&mut streamer));
        write_res.unwrap();
        assert_eq!(&chunk.unwrap().unwrap()[..], b"late");

        b.close();
        assert!(next(&mut streamer).await.is_none());
    }

    #[tokio::test]
    async fn closing_empty_streamer_emits_immediate_eof() {
        let mut streamer = Streamer::new();
        streamer.control().close();
        assert!(next(&mut streamer).await.is_none());
    }
}
