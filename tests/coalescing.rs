use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Barrier, Mutex,
    },
    thread,
    time::Duration,
};

use coalescer::{utils::timer::timeout, CoalescingExecutor, Handle, TaskQueue};
use futures::executor::{block_on, ThreadPool};
use pretty_assertions::assert_eq;
use rstest::rstest;

#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn inc(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

fn counting(queue: &TaskQueue) -> (CoalescingExecutor<usize, String>, Counter) {
    let counter = Counter::default();
    let c = counter.clone();
    (
        CoalescingExecutor::new(move || Ok(c.inc()), queue.clone()),
        counter,
    )
}

/// An operation that blocks until the returned sender releases it, once per run.
fn gated(
    pool: ThreadPool,
) -> (
    CoalescingExecutor<usize, String>,
    Counter,
    mpsc::Sender<()>,
) {
    let counter = Counter::default();
    let c = counter.clone();
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let e = CoalescingExecutor::new(
        move || {
            let _ = gate.lock().unwrap().recv();
            Ok(c.inc())
        },
        pool,
    );
    (e, counter, release)
}

#[test]
fn nothing_runs_before_trigger() {
    let queue = TaskQueue::new();
    let (_e, counter) = counting(&queue);
    queue.run_until_idle();
    assert_eq!(counter.get(), 0);
}

#[test]
fn triggered_round_does_nothing_until_started() {
    let queue = TaskQueue::new();
    let (e, counter) = counting(&queue);

    let h = e.trigger();
    queue.run_until_idle();
    assert!(!h.is_started());
    assert!(!h.is_completed());
    assert_eq!(counter.get(), 0);
}

#[test]
fn triggers_while_ongoing_run_once() {
    let queue = TaskQueue::new();
    let (e, counter) = counting(&queue);

    for _ in 0..10 {
        e.trigger().start();
    }
    queue.run_until_idle();
    assert_eq!(counter.get(), 1);
}

#[rstest]
#[case(1)]
#[case(10)]
fn triggers_after_completion_run_again(#[case] rounds: usize) {
    let queue = TaskQueue::new();
    let (e, counter) = counting(&queue);

    for _ in 0..rounds {
        e.trigger().start();
        queue.run_until_idle();
    }
    assert_eq!(counter.get(), rounds);
}

#[test]
fn claim_is_released_after_completion() {
    let queue = TaskQueue::new();
    let (e, _) = counting(&queue);

    let first = e.trigger();
    first.start();
    queue.run_until_idle();
    assert!(!e.is_claimed());

    let second = e.trigger();
    assert!(e.is_claimed());
    assert!(!second.ptr_eq(&first));
}

#[test]
fn concurrent_triggers_share_one_round() {
    const CALLERS: usize = 16;
    let (e, counter, release) = gated(ThreadPool::new().unwrap());
    let barrier = Barrier::new(CALLERS);

    let handles: Vec<Handle<usize, String>> = thread::scope(|s| {
        let threads: Vec<_> = (0..CALLERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    let h = e.trigger();
                    h.start();
                    h
                })
            })
            .collect();
        threads.into_iter().map(|t| t.join().unwrap()).collect()
    });
    assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));

    release.send(()).unwrap();
    for h in &handles {
        assert_eq!(h.block(), Ok(1));
    }
    assert_eq!(counter.get(), 1);
    assert!(!e.is_claimed());
}

#[test]
fn failure_is_shared_by_all_callers() {
    let queue = TaskQueue::new();
    let prepared = Arc::new("Oops!".to_string());
    let e = CoalescingExecutor::new(
        {
            let prepared = prepared.clone();
            move || Err::<u32, _>(prepared.clone())
        },
        queue.clone(),
    );

    let handles: Vec<_> = (0..10).map(|_| e.trigger()).collect();
    for h in &handles {
        h.start();
    }
    queue.run_until_idle();

    let errors: Vec<Arc<String>> = handles
        .iter()
        .map(|h| block_on(h.wait()).unwrap_err())
        .collect();
    assert_eq!(errors.len(), 10);
    assert!(errors.iter().all(|err| Arc::ptr_eq(err, &prepared)));
    assert!(errors.iter().all(|err| **err == "Oops!"));
}

#[test]
fn failure_is_shared_across_threads() {
    let pool = ThreadPool::new().unwrap();
    let counter = Counter::default();
    let c = counter.clone();
    let (release, gate) = mpsc::channel::<()>();
    let gate = Mutex::new(gate);
    let e = CoalescingExecutor::new(
        move || {
            let _ = gate.lock().unwrap().recv();
            Err::<(), _>(format!("failure {}", c.inc()))
        },
        pool,
    );

    let handles: Vec<_> = (0..4).map(|_| e.trigger()).collect();
    handles[0].start();
    let errors: Vec<String> = thread::scope(|s| {
        let waiters: Vec<_> = handles
            .iter()
            .map(|h| s.spawn(move || h.block().unwrap_err()))
            .collect();
        release.send(()).unwrap();
        waiters.into_iter().map(|t| t.join().unwrap()).collect()
    });
    assert_eq!(errors, vec!["failure 1".to_string(); 4]);
    assert_eq!(counter.get(), 1);
}

#[test]
fn timed_out_caller_does_not_affect_others() {
    let queue = TaskQueue::new();
    let (e, _) = counting(&queue);

    let h = e.trigger();
    assert!(h.block_timeout(Duration::from_millis(50)).is_err());

    let same = e.trigger();
    assert!(same.ptr_eq(&h));
    same.start();
    queue.run_until_idle();
    assert_eq!(same.block(), Ok(1));
}

#[test]
fn timed_out_caller_does_not_affect_others_across_threads() {
    let (e, counter, release) = gated(ThreadPool::new().unwrap());

    let h = e.trigger();
    assert!(h.block_timeout(Duration::from_millis(20)).is_err());
    assert!(e.is_claimed());

    let other = e.trigger();
    release.send(()).unwrap();
    assert_eq!(other.block(), Ok(1));
    assert_eq!(h.outcome(), Some(Ok(1)));
    assert_eq!(counter.get(), 1);
}

#[test]
fn rounds_never_overlap() {
    #[timeout("30s")]
    fn run() {
        const CALLERS: usize = 8;
        const TRIGGERS: usize = 200;

        let running = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let runs = Counter::default();
        let e = CoalescingExecutor::new(
            {
                let running = running.clone();
                let overlaps = overlaps.clone();
                let runs = runs.clone();
                move || {
                    if running.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::yield_now();
                    let run = runs.inc();
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(run)
                }
            },
            ThreadPool::new().unwrap(),
        );

        thread::scope(|s| {
            for _ in 0..CALLERS {
                s.spawn(|| {
                    for _ in 0..TRIGGERS {
                        assert!(e.trigger().block().is_ok());
                    }
                });
            }
        });
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(runs.get() >= 1);
        assert!(runs.get() <= CALLERS * TRIGGERS);
        assert!(!e.is_claimed());
    }
    run();
}

#[test]
fn trigger_after_visible_outcome_starts_new_round() {
    #[timeout("30s")]
    fn run() {
        const CALLERS: usize = 4;
        const ROUNDS: usize = 500;

        let runs = Counter::default();
        let e = CoalescingExecutor::new(
            {
                let runs = runs.clone();
                move || Ok::<_, String>(runs.inc())
            },
            ThreadPool::new().unwrap(),
        );
        thread::scope(|s| {
            for _ in 0..CALLERS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        let h = e.trigger();
                        h.start();
                        while h.outcome().is_none() {
                            thread::yield_now();
                        }
                        let next = e.trigger();
                        assert!(!next.ptr_eq(&h));
                    }
                });
            }
        });
        let last = e.trigger();
        last.start();
        let last = last.block().unwrap();
        assert_eq!(last, runs.get());
    }
    run();
}

#[test]
fn waiters_receive_value_from_their_own_round() {
    let (e, _, release) = gated(ThreadPool::new().unwrap());

    let first = e.trigger();
    first.start();
    release.send(()).unwrap();
    assert_eq!(first.block(), Ok(1));

    let second = e.trigger();
    second.start();
    release.send(()).unwrap();
    assert_eq!(second.block(), Ok(2));
    assert_eq!(first.block(), Ok(1));
}
