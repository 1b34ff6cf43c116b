//! Runtime-independent timers.
//!
//! All sleeps share one lazily spawned thread that wakes each sleeping task at its deadline, so
//! these futures work on any executor, including [`futures::executor::block_on`].

use std::{
    collections::BTreeMap,
    future::Future,
    mem::replace,
    pin::{pin, Pin},
    sync::{mpsc, Condvar, LazyLock, Mutex, PoisonError},
    task::{Context, Poll, Waker},
    thread,
    time::{Duration, Instant},
};

use futures::future::{select, Either};
use parse_display::Display;

use super::lock;

pub use coalescer_macros::{should_timeout, timeout};

pub mod helpers;

static SLEEPER: LazyLock<Sleeper> = LazyLock::new(|| Sleeper {
    queue: Mutex::new(Deadlines::default()),
    condvar: Condvar::new(),
});

/// Deadline plus a sequence number, so equal instants stay distinct.
type DeadlineKey = (Instant, u64);

struct Sleeper {
    queue: Mutex<Deadlines>,
    condvar: Condvar,
}

#[derive(Default)]
struct Deadlines {
    wakers: BTreeMap<DeadlineKey, Waker>,
    next_seq: u64,
    worker_spawned: bool,
}

impl Sleeper {
    fn register(&self, deadline: Instant, waker: &Waker) -> DeadlineKey {
        let mut q = lock(&self.queue);
        if !q.worker_spawned {
            q.worker_spawned = true;
            thread::spawn(|| SLEEPER.run());
        }
        let key = (deadline, q.next_seq);
        q.next_seq += 1;
        let earliest = q
            .wakers
            .first_key_value()
            .is_none_or(|(first, _)| key < *first);
        q.wakers.insert(key, waker.clone());
        if earliest {
            self.condvar.notify_one();
        }
        key
    }

    fn update(&self, key: DeadlineKey, waker: &Waker) -> bool {
        match lock(&self.queue).wakers.get_mut(&key) {
            Some(registered) => {
                if !registered.will_wake(waker) {
                    registered.clone_from(waker);
                }
                true
            }
            None => false,
        }
    }

    fn cancel(&self, key: DeadlineKey) {
        lock(&self.queue).wakers.remove(&key);
    }

    fn run(&self) {
        let mut q = lock(&self.queue);
        loop {
            let now = Instant::now();
            let later = q.wakers.split_off(&(now, u64::MAX));
            let due = replace(&mut q.wakers, later);
            if !due.is_empty() {
                drop(q);
                due.into_values().for_each(Waker::wake);
                q = lock(&self.queue);
                continue;
            }
            let wait = q
                .wakers
                .first_key_value()
                .map(|((deadline, _), _)| deadline.saturating_duration_since(now));
            q = match wait {
                Some(wait) => {
                    self.condvar
                        .wait_timeout(q, wait)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .condvar
                    .wait(q)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

/// `deadline` is `None` when it lies beyond what `Instant` can represent.
struct Sleep {
    deadline: Option<Instant>,
    key: Option<DeadlineKey>,
}

impl Future for Sleep {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(deadline) = this.deadline else {
            return Poll::Pending;
        };
        if Instant::now() >= deadline {
            if let Some(key) = this.key.take() {
                SLEEPER.cancel(key);
            }
            return Poll::Ready(());
        }
        match this.key {
            Some(key) if SLEEPER.update(key, cx.waker()) => {}
            _ => this.key = Some(SLEEPER.register(deadline, cx.waker())),
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            SLEEPER.cancel(key);
        }
    }
}

/// Completes once `duration` has elapsed, measured from this call.
///
/// Never completes if the deadline overflows `Instant`.
pub fn sleep(duration: Duration) -> impl Future<Output = ()> + Send + 'static {
    Sleep {
        deadline: Instant::now().checked_add(duration),
        key: None,
    }
}

pub fn sleep_until(deadline: Instant) -> impl Future<Output = ()> + Send + 'static {
    Sleep {
        deadline: Some(deadline),
        key: None,
    }
}

#[derive(Debug, Display, PartialEq, Eq)]
#[display("timeout")]
pub struct TimeoutError {
    _private: (),
}
impl TimeoutError {
    fn new() -> Self {
        Self { _private: () }
    }
}

impl std::error::Error for TimeoutError {}

/// Polls `fut` until it completes or `duration` elapses. On timeout `fut` is dropped.
pub async fn with_timeout_async<T>(
    fut: impl Future<Output = T>,
    duration: Duration,
) -> Result<T, TimeoutError> {
    race(fut, sleep(duration)).await
}

pub async fn with_timeout_until_async<T>(
    fut: impl Future<Output = T>,
    deadline: Instant,
) -> Result<T, TimeoutError> {
    race(fut, sleep_until(deadline)).await
}

async fn race<T>(
    fut: impl Future<Output = T>,
    timer: impl Future<Output = ()>,
) -> Result<T, TimeoutError> {
    match select(pin!(fut), pin!(timer)).await {
        Either::Left((value, _)) => Ok(value),
        Either::Right(((), _)) => Err(TimeoutError::new()),
    }
}

/// Runs `f` on a new thread and waits at most `duration` for it.
///
/// On timeout the thread is left running; its result is discarded.
pub fn with_timeout<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
    duration: Duration,
) -> Result<T, TimeoutError> {
    spawn_thread(f)
        .recv_timeout(duration)
        .map_err(|_| TimeoutError::new())
}

pub fn with_timeout_until<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
    deadline: Instant,
) -> Result<T, TimeoutError> {
    with_timeout(f, deadline.saturating_duration_since(Instant::now()))
}

fn spawn_thread<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx
}
