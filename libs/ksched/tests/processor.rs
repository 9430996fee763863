use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ksched::sync::{Mutex, SingleConsumerEvent};
use ksched::task::{self, CancellationReason, TaskState};
use ksched::{
    GlobalQueue, QueueStrategy, SpawnError, TaskProcessor, TaskProcessorConfig, WaitError,
    WorkStealing,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn processor<Q: QueueStrategy>(workers: usize) -> TaskProcessor<Q> {
    TaskProcessor::with_config(
        TaskProcessorConfig::default()
            .with_name("it")
            .with_worker_threads(workers),
    )
    .unwrap()
}

fn thousand_increments<Q: QueueStrategy>() {
    let processor = processor::<Q>(4);
    let counter: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));

    let handles: Vec<_> = (0..1000)
        .map(|_| {
            let counter = counter.clone();
            processor.spawn(async move {
                let mut guard = counter.lock().await;
                let value = *guard;
                // hold the lock across a suspension point so other tasks pile up behind it
                task::yield_now().await;
                *guard = value + 1;
            })
        })
        .collect();

    for handle in handles {
        handle.blocking_get().unwrap();
    }

    assert_eq!(*counter.lock_blocking(), 1000);
}

#[test]
fn thousand_tasks_work_stealing() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    thousand_increments::<WorkStealing>();
}

#[test]
fn thousand_tasks_global_queue() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    thousand_increments::<GlobalQueue>();
}

#[test]
fn every_task_runs_exactly_once() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor::<WorkStealing>(4);
    let runs = Arc::new(AtomicUsize::new(0));

    // a single spawner task puts everything in one local queue, the other workers have to steal
    let spawner = {
        let runs = runs.clone();
        let handle = processor.handle().clone();
        processor.spawn(async move {
            let children: Vec<_> = (0..10_000)
                .map(|_| {
                    let runs = runs.clone();
                    handle.spawn(async move {
                        runs.fetch_add(1, Ordering::Relaxed);
                    })
                })
                .collect();

            for child in children {
                child.join().await.unwrap();
            }
        })
    };

    spawner.blocking_get().unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 10_000);
}

#[test]
fn cancelled_task_reports_cancellation() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor::<WorkStealing>(2);
    let event = Arc::new(SingleConsumerEvent::new());

    let handle = {
        let event = event.clone();
        processor.spawn(async move {
            let res = event.wait().await;
            (res, task::current_cancellation_reason())
        })
    };

    // a task cancelled before its first poll is never polled at all
    while handle.state() != TaskState::Suspended {
        thread::yield_now();
    }

    handle.request_cancel();
    let (res, reason) = handle.blocking_get().unwrap();
    assert_eq!(res, Err(WaitError::Cancelled));
    assert_eq!(reason, Some(CancellationReason::User));
}

#[test]
fn task_deadline_interrupts_waits() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor::<WorkStealing>(2);
    let event = Arc::new(SingleConsumerEvent::new());

    let handle = {
        let event = event.clone();
        processor
            .builder()
            .name("deadline")
            .timeout(Duration::from_millis(20))
            .spawn(async move {
                let res = event.wait().await;
                (res, task::current_cancellation_reason())
            })
    };

    let (res, reason) = handle.blocking_get().unwrap();
    assert_eq!(res, Err(WaitError::Cancelled));
    assert_eq!(reason, Some(CancellationReason::Deadline));
}

#[test]
fn panics_are_delivered_to_the_handle() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor::<WorkStealing>(1);

    fn boom() {
        panic!("boom");
    }

    let err = processor
        .spawn(async { boom() })
        .blocking_join()
        .unwrap_err();
    assert!(err.is_panic());

    // the worker survived
    assert_eq!(processor.spawn(async { 1 }).blocking_get().unwrap(), 1);
}

#[test]
fn handle_outlives_processor() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor::<GlobalQueue>(1);
    let handle = processor.handle().clone();
    drop(processor);

    assert!(handle.is_closed());
    assert_eq!(handle.try_spawn(async {}).unwrap_err(), SpawnError::Closed);
}

#[test]
fn cancellation_blocker_outlives_its_processor() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor::<WorkStealing>(2);
    let blocker = processor
        .spawn(async { task::CancellationBlocker::new() })
        .blocking_get()
        .unwrap();

    // the task completed and its processor is gone, the blocker keeps the task allocated
    drop(processor);
    drop(blocker);
}

#[test]
fn shutdown_drops_queued_futures() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let processor = processor::<WorkStealing>(1);
    let dropped = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(SingleConsumerEvent::new());

    // nothing ever sends on the gate, every task stays suspended until the shutdown
    let blocker = {
        let gate = gate.clone();
        processor.spawn(async move {
            gate.wait().await.unwrap_err();
        })
    };

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let guard = DropCounter(dropped.clone());
            processor.spawn(async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            })
        })
        .collect();

    processor.shutdown();

    assert_eq!(dropped.load(Ordering::Relaxed), 16);
    for handle in handles {
        assert!(handle.blocking_join().unwrap_err().is_cancelled());
    }
    assert!(blocker.blocking_join().unwrap_err().is_cancelled());
}
