use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ksched::sync::{ConditionVariable, Mutex, Promise, SharedMutex};
use ksched::task::TaskState;
use ksched::{Deadline, TaskProcessor, TaskProcessorConfig, WaitError, WorkStealing};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn processor(workers: usize) -> TaskProcessor<WorkStealing> {
    TaskProcessor::with_config(
        TaskProcessorConfig::default()
            .with_name("sync")
            .with_worker_threads(workers),
    )
    .unwrap()
}

#[test]
fn try_lock_until_passed_deadline_on_locked_mutex() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(2);
    let mutex: Arc<Mutex<()>> = Arc::new(Mutex::new(()));
    let guard = mutex.lock_blocking();

    let start = Instant::now();
    let acquired = {
        let mutex = mutex.clone();
        processor
            .spawn(async move { mutex.try_lock_until(Deadline::passed()).await.is_some() })
            .blocking_get()
            .unwrap()
    };

    assert!(!acquired);
    assert!(start.elapsed() < Duration::from_secs(1));
    drop(guard);
}

#[test]
fn cancelled_lock_until_does_not_acquire() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(2);
    let mutex: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let guard = mutex.lock_blocking();

    let handle = {
        let mutex = mutex.clone();
        processor.spawn(async move {
            mutex
                .lock_until(Deadline::unreachable())
                .await
                .map(|mut guard| *guard += 1)
        })
    };

    while handle.state() != TaskState::Suspended {
        thread::yield_now();
    }
    handle.request_cancel();

    assert_eq!(handle.blocking_get().unwrap(), Err(WaitError::Cancelled));
    assert!(mutex.is_locked());
    drop(guard);
    assert_eq!(*mutex.lock_blocking(), 0);
}

#[test]
fn plain_lock_waits_through_cancellation() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(2);
    let mutex: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let guard = mutex.lock_blocking();

    let handle = {
        let mutex = mutex.clone();
        processor.spawn(async move {
            *mutex.lock().await += 1;
            ksched::task::is_cancel_requested()
        })
    };

    while handle.state() != TaskState::Suspended {
        thread::yield_now();
    }
    handle.request_cancel();

    // the wakeup caused by the request does not make `lock` give up
    thread::sleep(Duration::from_millis(20));
    assert!(!handle.is_finished());

    drop(guard);
    assert!(handle.blocking_get().unwrap());
    assert_eq!(*mutex.lock_blocking(), 1);
}

#[test]
fn lock_until_times_out() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(1);
    let mutex: Arc<Mutex<()>> = Arc::new(Mutex::new(()));
    let guard = mutex.lock_blocking();

    let res = {
        let mutex = mutex.clone();
        processor
            .spawn(async move {
                mutex
                    .lock_until(Deadline::from_duration(Duration::from_millis(20)))
                    .await
                    .map(drop)
            })
            .blocking_get()
            .unwrap()
    };

    assert_eq!(res, Err(WaitError::Timeout));
    drop(guard);
}

#[test]
fn condvar_ping_pong_loses_no_wakeups() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    const ROUNDS: usize = 2_000;
    const PLAYERS: usize = 4;

    let processor = processor(4);
    let state: Arc<(Mutex<usize>, ConditionVariable)> =
        Arc::new((Mutex::new(0), ConditionVariable::new()));

    let handles: Vec<_> = (0..PLAYERS)
        .map(|player| {
            let state = state.clone();
            processor.spawn(async move {
                let (mutex, condvar) = &*state;
                for round in 0..ROUNDS {
                    let turn = round * PLAYERS + player;
                    let guard = mutex.lock().await;
                    let (mut guard, ok) = condvar.wait_pred(guard, |next| *next == turn).await;
                    assert!(ok);
                    *guard += 1;
                    drop(guard);
                    condvar.notify_all();
                }
            })
        })
        .collect();

    for handle in handles {
        // a lost wakeup shows up as a timeout here instead of a hang
        processor
            .block_on(handle.wait_for(Duration::from_secs(60)))
            .unwrap();
        handle.blocking_get().unwrap();
    }

    assert_eq!(*state.0.lock_blocking(), ROUNDS * PLAYERS);
}

#[test]
fn shared_mutex_readers_share_writers_exclude() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(4);
    let lock = Arc::new(SharedMutex::new(Vec::<usize>::new()));

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let lock = lock.clone();
            processor.spawn(async move {
                let mut guard = lock.lock().await;
                guard.push(i);
            })
        })
        .collect();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let lock = lock.clone();
            processor.spawn(async move {
                let guard = lock.lock_shared().await;
                // a reader never observes a half-finished writer
                guard.len() <= 8
            })
        })
        .collect();

    for writer in writers {
        writer.blocking_get().unwrap();
    }
    for reader in readers {
        assert!(reader.blocking_get().unwrap());
    }

    let mut values = processor.block_on(async { lock.lock_shared().await.clone() });
    values.sort_unstable();
    assert_eq!(values, (0..8).collect::<Vec<_>>());
}

#[test]
fn promise_fulfilled_from_another_task() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(2);
    let mut promise = Promise::new();
    let mut future = promise.get_future().unwrap();

    let consumer = processor.spawn(async move { future.get().await });
    processor.spawn(async move {
        ksched::task::yield_now().await;
        promise.set_value(7_u32).unwrap();
    });

    assert_eq!(consumer.blocking_get().unwrap().unwrap(), 7);
}
