use std::{
    collections::VecDeque,
    fmt,
    mem::take,
    sync::{Arc, Mutex},
};

use futures::{
    executor::{block_on, ThreadPool},
    future::BoxFuture,
};

use crate::utils::lock;

/// An execution context that runs the work of a round.
///
/// Implementations must eventually poll every submitted task to completion and must never
/// drop one: a dropped task keeps its executor claimed forever.
pub trait Spawn: Send + Sync + 'static {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

impl Spawn for ThreadPool {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.spawn_ok(task);
    }
}

impl<S: Spawn + ?Sized> Spawn for Arc<S> {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        (**self).spawn(task);
    }
}

/// Adapts a closure into a [`Spawn`], for runtimes this crate knows nothing about.
///
/// ```ignore
/// let spawner = spawn_fn(|task| {
///     tokio::spawn(task);
/// });
/// ```
pub fn spawn_fn<F>(f: F) -> SpawnFn<F>
where
    F: Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
{
    SpawnFn(f)
}

#[derive(Clone, Copy)]
pub struct SpawnFn<F>(F);

impl<F> Spawn for SpawnFn<F>
where
    F: Fn(BoxFuture<'static, ()>) + Send + Sync + 'static,
{
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        (self.0)(task)
    }
}

/// A queue of tasks that only runs when told to.
///
/// Clones share the same queue. Useful to decide exactly when the work of a round happens.
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Arc<Mutex<VecDeque<BoxFuture<'static, ()>>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs queued tasks in submission order, including tasks queued while running, until the
    /// queue is empty. Returns the number of tasks run.
    ///
    /// Each task is driven to completion on the calling thread before the next one starts.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        loop {
            let tasks = take(&mut *lock(&self.tasks));
            if tasks.is_empty() {
                return count;
            }
            for task in tasks {
                block_on(task);
                count += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Spawn for TaskQueue {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        lock(&self.tasks).push_back(task);
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}
