use std::{
    fmt,
    future::poll_fn,
    mem::take,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, Weak},
    task::{Poll, Waker},
    time::Duration,
};

use derive_ex::Ex;
use futures::{executor::block_on, future::BoxFuture, FutureExt};
use slabmap::SlabMap;

use crate::{
    executor::ClaimSlot,
    utils::{
        lock,
        timer::{with_timeout_async, TimeoutError},
    },
    Spawn,
};

pub(crate) type Operation<T, E> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

type Observer<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send>;

/// A shared reference to one round of a [`CoalescingExecutor`](crate::CoalescingExecutor).
///
/// Every clone refers to the same computation and observes the same outcome. A handle does not
/// run anything by itself: the operation is scheduled by [`start`](Self::start) or by the first
/// [`wait`](Self::wait).
#[derive(Ex)]
#[derive_ex(Clone(bound()))]
pub struct Handle<T, E>(Arc<Computation<T, E>>);

pub(crate) struct Computation<T, E> {
    state: Mutex<ComputationState<T, E>>,
    operation: Operation<T, E>,
    spawner: Arc<dyn Spawn>,
    claim: Weak<ClaimSlot<T, E>>,
    name: Arc<str>,
}

struct ComputationState<T, E> {
    progress: Progress<T, E>,
    wakers: SlabMap<Waker>,
    observers: Vec<Observer<T, E>>,
}

enum Progress<T, E> {
    NotStarted,
    Running,
    Completed(Arc<Result<T, E>>),
    Panicked,
}

impl<T, E> Progress<T, E> {
    fn name(&self) -> &'static str {
        match self {
            Progress::NotStarted => "not started",
            Progress::Running => "running",
            Progress::Completed(_) => "completed",
            Progress::Panicked => "panicked",
        }
    }
}

impl<T, E> Handle<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub(crate) fn new(
        operation: Operation<T, E>,
        spawner: Arc<dyn Spawn>,
        claim: Weak<ClaimSlot<T, E>>,
        name: Arc<str>,
    ) -> Self {
        Self(Arc::new(Computation {
            state: Mutex::new(ComputationState {
                progress: Progress::NotStarted,
                wakers: SlabMap::new(),
                observers: Vec::new(),
            }),
            operation,
            spawner,
            claim,
            name,
        }))
    }

    /// Schedules the operation on the executor's spawner.
    ///
    /// Returns `true` if this call scheduled it, `false` if it was already started.
    pub fn start(&self) -> bool {
        {
            let mut s = lock(&self.0.state);
            if !matches!(s.progress, Progress::NotStarted) {
                return false;
            }
            s.progress = Progress::Running;
        }
        #[cfg(feature = "tracing")]
        tracing::trace!(executor = &*self.0.name, "round started");

        let this = self.0.clone();
        self.0.spawner.spawn(
            async move {
                let operation = this.operation.clone();
                let outcome = AssertUnwindSafe(async move { operation().await })
                    .catch_unwind()
                    .await;
                this.complete(outcome.ok());
            }
            .boxed(),
        );
        true
    }

    /// Waits for the outcome of this round, starting it if needed.
    ///
    /// Dropping the returned future only withdraws this caller; the round keeps running and
    /// other holders still receive the outcome.
    ///
    /// # Panics
    ///
    /// Panics if the operation panicked.
    pub async fn wait(&self) -> Result<T, E>
    where
        T: Clone,
        E: Clone,
    {
        self.start();
        let outcome = self.settled().await;
        (*outcome).clone()
    }

    /// Like [`wait`](Self::wait), but gives up after `duration`.
    pub async fn wait_timeout(&self, duration: Duration) -> Result<Result<T, E>, TimeoutError>
    where
        T: Clone,
        E: Clone,
    {
        with_timeout_async(self.wait(), duration).await
    }

    /// Blocks the current thread until the outcome is available, starting the round if needed.
    ///
    /// Deadlocks if the spawner can only make progress on the current thread, as a
    /// [`TaskQueue`](crate::TaskQueue) drained by the same thread does.
    pub fn block(&self) -> Result<T, E>
    where
        T: Clone,
        E: Clone,
    {
        block_on(self.wait())
    }

    pub fn block_timeout(&self, duration: Duration) -> Result<Result<T, E>, TimeoutError>
    where
        T: Clone,
        E: Clone,
    {
        block_on(self.wait_timeout(duration))
    }
}

impl<T, E> Handle<T, E> {
    /// Registers `f` to run once with the outcome of this round.
    ///
    /// Runs `f` immediately if the round has already completed, otherwise on the thread that
    /// completes it. If the operation panics, `f` is dropped without running. Does not start the
    /// round.
    pub fn on_complete(&self, f: impl FnOnce(&Result<T, E>) + Send + 'static) {
        let mut s = lock(&self.0.state);
        let completed = match &s.progress {
            Progress::Completed(outcome) => Some(outcome.clone()),
            Progress::Panicked => return,
            Progress::NotStarted | Progress::Running => None,
        };
        match completed {
            Some(outcome) => {
                drop(s);
                f(&outcome);
            }
            None => s.observers.push(Box::new(f)),
        }
    }

    /// Returns the outcome if the round has completed without panicking.
    pub fn outcome(&self) -> Option<Result<T, E>>
    where
        T: Clone,
        E: Clone,
    {
        match &lock(&self.0.state).progress {
            Progress::Completed(outcome) => Some((**outcome).clone()),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        !matches!(lock(&self.0.state).progress, Progress::NotStarted)
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            lock(&self.0.state).progress,
            Progress::Completed(_) | Progress::Panicked
        )
    }

    /// Returns `true` if both handles refer to the same round.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    async fn settled(&self) -> Arc<Result<T, E>> {
        let mut key = WakerKeyGuard::new(&self.0);
        poll_fn(|cx| {
            let mut s = lock(&self.0.state);
            let panicked = match &s.progress {
                Progress::Completed(outcome) => {
                    key.key = None;
                    return Poll::Ready(outcome.clone());
                }
                Progress::Panicked => true,
                Progress::NotStarted | Progress::Running => false,
            };
            if panicked {
                key.key = None;
                drop(s);
                panic!("coalesced operation panicked");
            }
            if let Some(key) = key.key {
                s.wakers[key].clone_from(cx.waker());
            } else {
                key.key = Some(s.wakers.insert(cx.waker().clone()));
            }
            Poll::Pending
        })
        .await
    }
}

impl<T, E> Computation<T, E> {
    /// Releases the claim and publishes the outcome in one step, then wakes waiters and runs
    /// observers.
    ///
    /// Lock order is claim, then state. No other path holds the state lock while taking the
    /// claim lock.
    fn complete(&self, outcome: Option<Result<T, E>>) {
        let outcome = outcome.map(Arc::new);
        let publish = || {
            let mut s = lock(&self.state);
            s.progress = match &outcome {
                Some(outcome) => Progress::Completed(outcome.clone()),
                None => Progress::Panicked,
            };
            (take(&mut s.wakers), take(&mut s.observers))
        };
        let (wakers, observers) = match self.claim.upgrade() {
            Some(claim) => {
                let published = claim.release_with(publish);
                #[cfg(feature = "tracing")]
                tracing::trace!(executor = &*self.name, "claim released");
                published
            }
            None => publish(),
        };
        #[cfg(feature = "tracing")]
        match &outcome {
            Some(outcome) => tracing::trace!(
                executor = &*self.name,
                failed = outcome.is_err(),
                "round completed"
            ),
            None => tracing::warn!(executor = &*self.name, "operation panicked"),
        }

        for (_, waker) in wakers {
            waker.wake();
        }
        if let Some(outcome) = &outcome {
            for f in observers {
                f(outcome);
            }
        }
    }
}

struct WakerKeyGuard<'a, T, E> {
    computation: &'a Computation<T, E>,
    key: Option<usize>,
}
impl<'a, T, E> WakerKeyGuard<'a, T, E> {
    fn new(computation: &'a Computation<T, E>) -> Self {
        Self {
            computation,
            key: None,
        }
    }
}
impl<T, E> Drop for WakerKeyGuard<'_, T, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            lock(&self.computation.state).wakers.remove(key);
        }
    }
}

impl<T, E> fmt::Debug for Handle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("executor", &self.0.name)
            .field("progress", &lock(&self.0.state).progress.name())
            .finish()
    }
}
