use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    mem::replace,
    sync::{Arc, Mutex},
};

use derive_ex::Ex;
use futures::FutureExt;

use crate::{handle::Operation, utils::lock, Handle, Spawn};

const DEFAULT_NAME: &str = "coalesced";

/// Runs an operation at most once at a time, sharing each run's outcome with every caller that
/// asked for it.
///
/// [`trigger`](Self::trigger) either claims a new round or returns the handle of the round that
/// is already claimed. A round stays claimed from the moment it is created, even before it has
/// been started, until its operation completes. Failures are not cached: once a failed round
/// completes, the next `trigger` runs the operation again.
///
/// Clones share the same claim.
#[derive(Ex)]
#[derive_ex(Clone(bound()))]
pub struct CoalescingExecutor<T, E> {
    operation: Operation<T, E>,
    spawner: Arc<dyn Spawn>,
    claim: Arc<ClaimSlot<T, E>>,
    name: Arc<str>,
}

pub(crate) struct ClaimSlot<T, E>(Mutex<Claim<T, E>>);

enum Claim<T, E> {
    Idle,
    Claimed(Handle<T, E>),
}

impl<T, E> ClaimSlot<T, E> {
    /// Resets the claim to idle and runs `publish` before any `trigger` can observe the reset.
    ///
    /// Only the claimed round calls this. `trigger` never returns a round whose outcome is
    /// already visible.
    pub(crate) fn release_with<R>(&self, publish: impl FnOnce() -> R) -> R {
        let mut claim = lock(&self.0);
        let released = replace(&mut *claim, Claim::Idle);
        debug_assert!(matches!(released, Claim::Claimed(_)));
        let value = publish();
        drop(claim);
        drop(released);
        value
    }
}

impl<T, E> CoalescingExecutor<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Coalesces a blocking operation. Each run occupies one task on `spawner`.
    pub fn new(
        operation: impl Fn() -> Result<T, E> + Send + Sync + 'static,
        spawner: impl Spawn,
    ) -> Self {
        Self::builder().build(operation, spawner)
    }

    /// Coalesces an asynchronous operation, polled on `spawner`.
    pub fn new_async<Fut>(
        operation: impl Fn() -> Fut + Send + Sync + 'static,
        spawner: impl Spawn,
    ) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::builder().build_async(operation, spawner)
    }

    pub fn builder() -> CoalescingExecutorBuilder<T, E> {
        CoalescingExecutorBuilder::new()
    }

    /// Returns the handle of the claimed round, claiming a new one if none is claimed.
    ///
    /// Never starts the round and never blocks on it.
    pub fn trigger(&self) -> Handle<T, E> {
        let mut claim = lock(&self.claim.0);
        if let Claim::Claimed(handle) = &*claim {
            return handle.clone();
        }
        let handle = Handle::new(
            self.operation.clone(),
            self.spawner.clone(),
            Arc::downgrade(&self.claim),
            self.name.clone(),
        );
        *claim = Claim::Claimed(handle.clone());
        #[cfg(feature = "tracing")]
        tracing::trace!(executor = &*self.name, "round claimed");
        handle
    }
}

impl<T, E> CoalescingExecutor<T, E> {
    /// Returns `true` while a round is claimed, whether or not it has started.
    pub fn is_claimed(&self) -> bool {
        matches!(*lock(&self.claim.0), Claim::Claimed(_))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T, E> fmt::Debug for CoalescingExecutor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingExecutor")
            .field("name", &self.name)
            .field("claimed", &self.is_claimed())
            .finish_non_exhaustive()
    }
}

/// Configures a [`CoalescingExecutor`] before it is created.
pub struct CoalescingExecutorBuilder<T, E> {
    name: Arc<str>,
    _phantom: PhantomData<fn() -> Result<T, E>>,
}

impl<T, E> CoalescingExecutorBuilder<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            name: DEFAULT_NAME.into(),
            _phantom: PhantomData,
        }
    }

    /// Sets the name reported by [`CoalescingExecutor::name`], `Debug` output and log events.
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    pub fn build(
        self,
        operation: impl Fn() -> Result<T, E> + Send + Sync + 'static,
        spawner: impl Spawn,
    ) -> CoalescingExecutor<T, E> {
        let operation = Arc::new(operation);
        self.finish(
            Arc::new(move || {
                let operation = operation.clone();
                async move { operation() }.boxed()
            }),
            spawner,
        )
    }

    pub fn build_async<Fut>(
        self,
        operation: impl Fn() -> Fut + Send + Sync + 'static,
        spawner: impl Spawn,
    ) -> CoalescingExecutor<T, E>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.finish(Arc::new(move || operation().boxed()), spawner)
    }

    fn finish(self, operation: Operation<T, E>, spawner: impl Spawn) -> CoalescingExecutor<T, E> {
        CoalescingExecutor {
            operation,
            spawner: Arc::new(spawner),
            claim: Arc::new(ClaimSlot(Mutex::new(Claim::Idle))),
            name: self.name,
        }
    }
}

impl<T, E> fmt::Debug for CoalescingExecutorBuilder<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingExecutorBuilder")
            .field("name", &self.name)
            .finish()
    }
}
