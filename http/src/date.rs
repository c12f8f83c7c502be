//! low resolution date time service. one instance per worker keeps a pre
//! rendered http date string and a coarse clock sample so the hot path never
//! calls into the OS for either.

use std::{
    cell::RefCell,
    fmt::{self, Write},
    ops::Deref,
    rc::Rc,
    time::{Duration, SystemTime},
};

use httpdate::HttpDate;
use tokio::{
    task::JoinHandle,
    time::{interval, Instant},
};

/// Trait for getting current date/time.
pub trait DateTime {
    /// The size hint of slice by Self::with_date method.
    const DATE_VALUE_LENGTH: usize;

    /// closure would receive byte slice representation of [HttpDate].
    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O;

    /// coarse monotonic clock sample. refreshed on the service tick.
    fn now(&self) -> Instant;

    /// coarse wall clock sample paired with [DateTime::now].
    fn now_system(&self) -> SystemTime;
}

/// The length of byte representation of [HttpDate].
pub const DATE_VALUE_LENGTH: usize = 29;

/// Service refreshing its [DateTimeState] every 500 milliseconds on the local
/// runtime.
pub struct DateTimeService {
    state: Rc<RefCell<DateTimeState>>,
    handle: JoinHandle<()>,
}

impl Drop for DateTimeService {
    fn drop(&mut self) {
        // stop the update task on drop.
        self.handle.abort();
    }
}

impl Default for DateTimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeService {
    pub fn new() -> Self {
        let state = Rc::new(RefCell::new(DateTimeState::new()));
        let state_clone = Rc::clone(&state);
        let handle = tokio::task::spawn_local(async move {
            let mut interval = interval(Duration::from_millis(500));
            loop {
                let _ = interval.tick().await;
                *state_clone.borrow_mut() = DateTimeState::new();
            }
        });

        Self { state, handle }
    }

    #[inline]
    pub fn get(&self) -> &DateTimeHandle {
        self.state.deref()
    }
}

pub type DateTimeHandle = RefCell<DateTimeState>;

/// pre rendered http date bytes plus the clock samples they were taken at.
#[derive(Copy, Clone)]
pub struct DateTimeState {
    pub date: [u8; DATE_VALUE_LENGTH],
    pub now: Instant,
    pub system_now: SystemTime,
}

impl Default for DateTimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeState {
    pub fn new() -> Self {
        let system_now = SystemTime::now();
        let mut state = Self {
            date: [0; DATE_VALUE_LENGTH],
            now: Instant::now(),
            system_now,
        };
        let _ = write!(state, "{}", HttpDate::from(system_now));
        state
    }
}

impl Write for DateTimeState {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.date[..].copy_from_slice(s.as_bytes());
        Ok(())
    }
}

impl DateTime for DateTimeHandle {
    const DATE_VALUE_LENGTH: usize = DATE_VALUE_LENGTH;

    #[inline]
    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        let state = self.borrow();
        f(&state.date[..])
    }

    #[inline]
    fn now(&self) -> Instant {
        self.borrow().now
    }

    #[inline]
    fn now_system(&self) -> SystemTime {
        self.borrow().system_now
    }
}

/// Time handler backed by plain OS time on every call. for testing purpose.
pub struct SystemDateTimeHandler;

impl DateTime for SystemDateTimeHandler {
    const DATE_VALUE_LENGTH: usize = DATE_VALUE_LENGTH;

    fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        let date = HttpDate::from(SystemTime::now()).to_string();
        f(date.as_bytes())
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}
