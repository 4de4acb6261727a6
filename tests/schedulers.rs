//! Scheduler behaviour on a real multi-threaded runtime.
//!
//! Run with: `cargo test --test schedulers`

#[macro_use]
mod common;
use common::*;

use coopsync::runtime::yield_now;
use coopsync::scheduler::{
    BatchJobConfig, Cancel, ConcurrentJobConfig, ConcurrentQueue, DurableQueue, Identified,
    PoolScheduler, RetryPolicy, Scheduler, SchedulerExt, SerialQueue, Store,
};
use coopsync::sync::{Event, Fence};
use coopsync::{Cx, Error};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn serial_queue_is_fifo_and_exclusive() {
    init_test("serial_queue_is_fifo_and_exclusive");
    let rt = runtime(4);
    let queue = SerialQueue::new(rt.handle().spawner());
    let occupancy = Arc::new(Occupancy::default());
    let order = Arc::new(Mutex::new(Vec::new()));

    let tasks: Vec<_> = (0..30_usize)
        .map(|i| {
            let occupancy = Arc::clone(&occupancy);
            let order = Arc::clone(&order);
            rt.block_on(queue.submit((), move |_| {
                let occupancy = Arc::clone(&occupancy);
                let order = Arc::clone(&order);
                async move {
                    occupancy.enter();
                    yield_now().await;
                    order.lock().push(i);
                    occupancy.exit();
                    Ok(i)
                }
            }))
        })
        .collect();
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(rt.block_on(task), Ok(i));
    }

    assert_with_log!(occupancy.peak() == 1, "jobs at once", 1, occupancy.peak());
    assert_eq!(*order.lock(), (0..30).collect::<Vec<_>>());
    test_complete!("serial_queue_is_fifo_and_exclusive");
}

#[test]
fn concurrent_queue_respects_limit() {
    init_test("concurrent_queue_respects_limit");
    let rt = runtime(4);
    let queue = ConcurrentQueue::new(rt.handle().spawner(), 2);
    let occupancy = Arc::new(Occupancy::default());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let occupancy = Arc::clone(&occupancy);
            rt.block_on(queue.submit(ConcurrentJobConfig::default(), move |_| {
                let occupancy = Arc::clone(&occupancy);
                async move {
                    occupancy.enter();
                    for _ in 0..10 {
                        yield_now().await;
                    }
                    occupancy.exit();
                    Ok(())
                }
            }))
        })
        .collect();
    for task in tasks {
        assert_eq!(rt.block_on(task), Ok(()));
    }

    let peak = occupancy.peak();
    assert_with_log!(peak <= 2, "jobs at once", "<= 2", peak);
    test_complete!("concurrent_queue_respects_limit");
}

#[test]
fn barrier_job_overlaps_nothing() {
    init_test("barrier_job_overlaps_nothing");
    let rt = runtime(4);
    let queue = ConcurrentQueue::new(rt.handle().spawner(), 3);
    let occupancy = Arc::new(Occupancy::default());

    let configs = [false, false, false, true, false, false, true, false];
    let tasks: Vec<_> = configs
        .iter()
        .map(|&barrier| {
            let occupancy = Arc::clone(&occupancy);
            rt.block_on(queue.submit(ConcurrentJobConfig { barrier }, move |_| {
                let occupancy = Arc::clone(&occupancy);
                async move {
                    let entered_with = occupancy.enter();
                    let mut alone = entered_with == 1;
                    for _ in 0..10 {
                        yield_now().await;
                        alone &= occupancy.current() == 1;
                    }
                    occupancy.exit();
                    if barrier && !alone {
                        return Err(Error::failed("barrier overlapped another job"));
                    }
                    Ok(())
                }
            }))
        })
        .collect();
    for task in tasks {
        assert_eq!(rt.block_on(task), Ok(()));
    }
    assert!(occupancy.peak() <= 3);
    test_complete!("barrier_job_overlaps_nothing");
}

#[test]
fn cancelled_submission_never_starts() {
    init_test("cancelled_submission_never_starts");
    let rt = runtime(2);
    let queue = SerialQueue::new(rt.handle().spawner());
    let gate = Arc::new(Event::new());

    let blocker = {
        let gate = Arc::clone(&gate);
        rt.block_on(queue.submit((), move |cx| {
            let gate = Arc::clone(&gate);
            async move { gate.wait(&cx).await.map_err(Error::from) }
        }))
    };
    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    let queued = rt.block_on(queue.submit((), move |_| {
        flag.store(true, Ordering::SeqCst);
        async { Ok(()) }
    }));

    queued.cancel();
    assert!(queued.is_finished());
    rt.block_on(gate.signal(false));
    assert_eq!(rt.block_on(blocker), Ok(()));
    assert_eq!(rt.block_on(queued), Err(Error::Cancelled));

    // A later job proves the cancelled one was skipped, not still pending.
    assert_eq!(rt.block_on(queue.submit_and_wait((), |_| async { Ok(()) })), Ok(()));
    assert!(!started.load(Ordering::SeqCst));
    test_complete!("cancelled_submission_never_starts");
}

#[test]
fn cancel_after_completion_keeps_result() {
    init_test("cancel_after_completion_keeps_result");
    let rt = runtime(2);
    let pool = PoolScheduler::new(rt.handle().spawner());
    let mut task = rt.block_on(pool.submit((), |_| async { Ok("done") }));
    while !task.is_finished() {
        std::thread::yield_now();
    }
    task.cancel();
    task.cancel();
    assert_eq!(rt.block_on(&mut task), Ok("done"));
    test_complete!("cancel_after_completion_keeps_result");
}

#[test]
fn batching_over_serial_retries_in_place() {
    init_test("batching_over_serial_retries_in_place");
    let rt = runtime(2);
    let batching = SerialQueue::new(rt.handle().spawner()).batching(());
    let log = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicUsize::new(0));

    {
        let log = Arc::clone(&log);
        let attempts = Arc::clone(&attempts);
        let _ = rt.block_on(batching.schedule_fn(
            BatchJobConfig::new(RetryPolicy::Retry),
            move |_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                log.lock().push(format!("flaky#{attempt}"));
                async move {
                    if attempt < 2 {
                        Err(Error::failed("not yet"))
                    } else {
                        Ok(())
                    }
                }
            },
        ));
    }
    let last = {
        let log = Arc::clone(&log);
        rt.block_on(batching.submit(BatchJobConfig::default(), move |_| {
            log.lock().push("after".to_owned());
            async { Ok(()) }
        }))
    };

    assert_eq!(rt.block_on(last), Ok(()));
    assert_eq!(*log.lock(), ["flaky#0", "flaky#1", "flaky#2", "after"]);
    test_complete!("batching_over_serial_retries_in_place");
}

#[test]
fn cancel_all_resolves_work_queued_behind_a_stuck_job() {
    init_test("cancel_all_resolves_work_queued_behind_a_stuck_job");
    let rt = runtime(2);
    let serial = SerialQueue::new(rt.handle().spawner());
    let concurrent = ConcurrentQueue::new(rt.handle().spawner(), 1);
    let fence = Arc::new(Fence::new());
    let started = Arc::new(AtomicUsize::new(0));

    // Each queue's only slot is taken by a job that ignores its context.
    let stuck_job = |fence: &Arc<Fence>, started: &Arc<AtomicUsize>| {
        let fence = Arc::clone(fence);
        let started = Arc::clone(started);
        move |_cx: Cx| {
            started.fetch_add(1, Ordering::SeqCst);
            let fence = Arc::clone(&fence);
            async move { fence.wait(&Cx::new()).await.map_err(Error::from) }
        }
    };
    let serial_stuck = rt.block_on(serial.submit((), stuck_job(&fence, &started)));
    let concurrent_stuck = rt.block_on(
        concurrent.submit(ConcurrentJobConfig::default(), stuck_job(&fence, &started)),
    );
    while started.load(Ordering::SeqCst) < 2 {
        std::thread::yield_now();
    }

    let serial_queued = rt.block_on(serial.submit((), |_| async { Ok(()) }));
    let concurrent_queued =
        rt.block_on(concurrent.submit(ConcurrentJobConfig::default(), |_| async { Ok(()) }));
    serial.cancel_all();
    concurrent.cancel_all();

    let resolved = serial_queued.is_finished();
    assert_with_log!(resolved, "serial backlog resolved", true, resolved);
    assert!(concurrent_queued.is_finished());
    assert_eq!(rt.block_on(serial_queued), Err(Error::Cancelled));
    assert_eq!(rt.block_on(concurrent_queued), Err(Error::Cancelled));

    fence.signal(false);
    assert_eq!(rt.block_on(serial_stuck), Ok(()));
    assert_eq!(rt.block_on(concurrent_stuck), Ok(()));
    test_complete!("cancel_all_resolves_work_queued_behind_a_stuck_job");
}

#[test]
fn cancelled_handle_leaves_the_backlog() {
    init_test("cancelled_handle_leaves_the_backlog");
    let rt = runtime(2);
    let queue = ConcurrentQueue::new(rt.handle().spawner(), 1);
    let gate = Arc::new(Fence::new());
    let running = Arc::new(AtomicBool::new(false));
    let blocker = {
        let gate = Arc::clone(&gate);
        let running = Arc::clone(&running);
        rt.block_on(queue.submit(ConcurrentJobConfig::default(), move |_| {
            running.store(true, Ordering::SeqCst);
            let gate = Arc::clone(&gate);
            async move { gate.wait(&Cx::new()).await.map_err(Error::from) }
        }))
    };
    while !running.load(Ordering::SeqCst) {
        std::thread::yield_now();
    }
    let handle = rt.block_on(queue.schedule_fn(ConcurrentJobConfig::default(), |_| async {
        Err(Error::failed("must not run"))
    }));
    assert_eq!(queue.len(), 1);
    handle.cancel();
    assert!(queue.is_empty());

    gate.signal(false);
    assert_eq!(rt.block_on(blocker), Ok(()));
    test_complete!("cancelled_handle_leaves_the_backlog");
}

#[test]
fn retried_batch_job_reports_its_final_result() {
    init_test("retried_batch_job_reports_its_final_result");
    let rt = runtime(2);
    let batching = PoolScheduler::new(rt.handle().spawner()).batching(());
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&attempts);
    let result = rt.block_on(batching.submit_and_wait(
        BatchJobConfig::new(RetryPolicy::Retry),
        move |_| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(Error::failed("not yet"))
                } else {
                    Ok(attempt)
                }
            }
        },
    ));

    assert_with_log!(result == Ok(2), "task result", Ok::<usize, Error>(2), result);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    test_complete!("retried_batch_job_reports_its_final_result");
}

#[derive(Debug, Clone, PartialEq)]
struct Upload(u32);

impl Identified for Upload {
    type Id = u32;

    fn id(&self) -> u32 {
        self.0
    }
}

#[derive(Default, Clone)]
struct SharedStore(Arc<Mutex<Vec<Upload>>>);

impl Store<Upload> for SharedStore {
    fn load(&self) -> Vec<Upload> {
        self.0.lock().clone()
    }

    fn save(&self, items: &[Upload]) {
        *self.0.lock() = items.to_vec();
    }
}

#[test]
fn durable_queue_processes_and_forgets() {
    init_test("durable_queue_processes_and_forgets");
    let rt = runtime(2);
    let store = SharedStore::default();
    store.save(&[Upload(1)]);
    let processed = Arc::new(Mutex::new(Vec::new()));
    let cx = Cx::new();

    let sink = Arc::clone(&processed);
    let queue = rt
        .block_on(DurableQueue::new(
            &cx,
            store.clone(),
            SerialQueue::new(rt.handle().spawner()),
            move |item: Upload, _cx| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(item.0);
                    Ok(())
                }
            },
        ))
        .expect("open");
    rt.block_on(queue.append(&cx, Upload(2))).expect("append");

    while rt.block_on(queue.pending(&cx)) != Ok(0) {
        std::thread::yield_now();
    }
    assert_eq!(*processed.lock(), [1, 2]);
    assert!(store.load().is_empty());
    test_complete!("durable_queue_processes_and_forgets");
}

#[test]
fn handles_cancel_idempotently() {
    let rt = runtime(1);
    let queue = ConcurrentQueue::new(rt.handle().spawner(), 1);
    let handle = rt.block_on(queue.schedule_fn(ConcurrentJobConfig::BARRIER, |cx| async move {
        cx.cancelled().await;
        Ok(())
    }));
    handle.cancel();
    handle.cancel();
    assert_eq!(rt.block_on(queue.submit_and_wait(ConcurrentJobConfig::default(), |_| async { Ok(3) })), Ok(3));
}
