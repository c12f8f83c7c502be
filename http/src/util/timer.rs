use core::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::time::{sleep_until, Instant, Sleep};

pub(crate) trait Timeout: Sized {
    fn timeout(self, timer: Pin<&mut Deadline>) -> TimeoutFuture<'_, Self>;
}

impl<F> Timeout for F
where
    F: Future,
{
    fn timeout(self, timer: Pin<&mut Deadline>) -> TimeoutFuture<'_, Self> {
        TimeoutFuture { fut: self, timer }
    }
}

pin_project! {
    pub(crate) struct TimeoutFuture<'a, F> {
        #[pin]
        fut: F,
        timer: Pin<&'a mut Deadline>
    }
}

impl<F: Future> Future for TimeoutFuture<'_, F> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.fut.poll(cx) {
            Poll::Ready(res) => Poll::Ready(Ok(res)),
            Poll::Pending => this.timer.as_mut().poll(cx).map(Err),
        }
    }
}

pin_project! {
    /// A timer that lazily resets its underlying sleep after the previous
    /// deadline was met.
    ///
    /// Moving the deadline forward is a plain field store. The sleep entry in
    /// the runtime's timer wheel is only touched when it actually fires early,
    /// which it rarely does on connections that make progress. This keeps
    /// per request timer upkeep O(1) the same way a single interval timer
    /// queue does.
    pub struct Deadline {
        #[pin]
        sleep: Sleep,
        deadline: Instant,
    }
}

impl Deadline {
    #[inline]
    pub fn new(deadline: Instant) -> Self {
        Self {
            sleep: sleep_until(deadline),
            deadline,
        }
    }

    /// move the deadline. takes effect lazily on the next early wakeup.
    #[inline]
    pub fn update(self: Pin<&mut Self>, deadline: Instant) {
        *self.project().deadline = deadline;
    }

    #[inline]
    pub fn rearm(self: Pin<&mut Self>) {
        let this = self.project();
        this.sleep.reset(*this.deadline);
    }

    fn is_expired(&self) -> bool {
        self.sleep.deadline() >= self.deadline
    }
}

impl Future for Deadline {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().project();
        ready!(this.sleep.poll(cx));

        if self.is_expired() {
            Poll::Ready(())
        } else {
            self.as_mut().rearm();
            self.poll(cx)
        }
    }
}

#[cfg(test)]
mod test {
    use core::{pin::pin, time::Duration};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_after_update() {
        let start = Instant::now();
        let mut timer = pin!(Deadline::new(start + Duration::from_secs(1)));
        timer.as_mut().update(start + Duration::from_secs(3));
        timer.as_mut().await;
        assert!(Instant::now() >= start + Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn same_interval_timers_fire_in_arming_order() {
        let now = Instant::now();
        let interval = Duration::from_millis(100);
        let arm_gap = Duration::from_millis(1);

        // timers armed one after another with one shared interval carry strictly
        // monotone deadlines, so expiry order equals arming order.
        let t1 = Deadline::new(now + interval);
        let t2 = Deadline::new(now + arm_gap + interval);
        let t3 = Deadline::new(now + arm_gap * 2 + interval);

        let order = std::rc::Rc::new(core::cell::RefCell::new(Vec::new()));

        let local = tokio::task::LocalSet::new();
        for (id, timer) in [(1, t1), (2, t2), (3, t3)] {
            let order = order.clone();
            local.spawn_local(async move {
                timer.await;
                order.borrow_mut().push(id);
            });
        }
        local.await;

        assert_eq!(*order.borrow(), [1, 2, 3]);
    }
}
