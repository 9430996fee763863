use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ksched::ev::{self, Event, EventKind, EventThreadPool, Poller, Timer};
use ksched::sync::SingleConsumerEvent;
use ksched::task::TaskState;
use ksched::{
    Deadline, EventThreadPoolConfig, TaskProcessor, TaskProcessorConfig, WaitError, WorkStealing,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

fn processor(workers: usize) -> TaskProcessor<WorkStealing> {
    TaskProcessor::with_config(
        TaskProcessorConfig::default()
            .with_name("ev")
            .with_worker_threads(workers),
    )
    .unwrap()
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    // Safety: `fds` is a valid array of two descriptors
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(ret, 0);
    // Safety: both descriptors were just opened
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

#[test]
fn timer_stopped_from_another_thread_never_fires() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let pool = EventThreadPool::new(&EventThreadPoolConfig::default().with_threads(2)).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    for i in 0..200 {
        let timer = {
            let fired = fired.clone();
            Timer::start(
                pool.next_thread(),
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
                // spread the deadlines around the moment `stop` runs
                Deadline::from_duration(Duration::from_micros(i % 50)),
            )
        };

        let after_stop = thread::spawn(move || {
            let mut timer = timer;
            timer.stop();
            assert!(!timer.is_valid());
            timer
        })
        .join()
        .unwrap();

        let seen = fired.load(Ordering::SeqCst);
        thread::sleep(Duration::from_micros(200));
        assert_eq!(fired.load(Ordering::SeqCst), seen, "timer fired after stop");
        drop(after_stop);
    }
}

#[test]
fn timer_fires_on_the_loop_thread() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let pool = EventThreadPool::new(
        &EventThreadPoolConfig::default()
            .with_name("timers")
            .with_threads(1),
    )
    .unwrap();
    let event = Arc::new(SingleConsumerEvent::new());

    let _timer = {
        let event = event.clone();
        Timer::start(
            pool.next_thread(),
            move || {
                assert_eq!(thread::current().name(), Some("timers-ev-0"));
                event.send();
            },
            Deadline::from_duration(Duration::from_millis(5)),
        )
    };

    futures::executor::block_on(event.wait_for(Duration::from_secs(5))).unwrap();
}

#[test]
fn sleep_in_a_task() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(2);
    let start = Instant::now();

    processor
        .spawn(async { ev::sleep(Duration::from_millis(30)).await })
        .blocking_get()
        .unwrap()
        .unwrap();

    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn cancelled_sleep_returns_early() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(2);
    let handle = processor.spawn(async { ev::sleep(Duration::from_secs(60)).await });

    while handle.state() != TaskState::Suspended {
        thread::yield_now();
    }
    let start = Instant::now();
    handle.request_cancel();

    assert_eq!(handle.blocking_get().unwrap(), Err(WaitError::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn poller_wakes_a_task() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(2);
    let (read, write) = pipe();
    let read_fd = read.as_raw_fd();

    let handle = processor.spawn(async move {
        let mut poller = Poller::new();
        poller.add_read(read_fd).unwrap();
        poller
            .next_event(Deadline::from_duration(Duration::from_secs(10)))
            .await
    });

    while handle.state() != TaskState::Suspended {
        thread::yield_now();
    }

    let byte = 1_u8;
    // Safety: writing one byte from a valid buffer
    let n = unsafe { libc::write(write.as_raw_fd(), (&raw const byte).cast(), 1) };
    assert_eq!(n, 1);

    let event = handle.blocking_get().unwrap().unwrap();
    assert_eq!(
        event,
        Event {
            fd: read_fd,
            kind: EventKind::Read
        }
    );
    drop(read);
}

#[test]
fn thread_control_runs_closures_on_the_loop() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let pool = EventThreadPool::default_pool();
    let control = pool.next_thread().clone();

    let inner = control.clone();
    let on_loop = control
        .run_in_ev_loop_sync(move || inner.is_in_ev_loop())
        .unwrap();
    assert!(on_loop);
    assert!(!control.is_in_ev_loop());
}

#[test]
fn poller_remove_in_a_task_does_not_wait_for_the_loop() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(1);
    let pool = EventThreadPool::new(&EventThreadPoolConfig::default().with_threads(1)).unwrap();
    let control = pool.next_thread().clone();
    let (read, write) = pipe();
    let read_fd = read.as_raw_fd();

    // keep the loop busy so nothing posted to it runs until we say so
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    control
        .run_in_ev_loop_async(move || {
            let _ = release_rx.recv();
        })
        .unwrap();

    let (done_tx, done_rx) = std::sync::mpsc::channel();
    let handle = processor.spawn({
        let control = control.clone();
        async move {
            let mut poller = Poller::with_thread_control(control);
            poller.add_read(read_fd).unwrap();
            poller.remove(read_fd).unwrap();
            done_tx.send(()).unwrap();
            poller
        }
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("remove waited for the event loop");

    // the same worker keeps running other tasks
    assert_eq!(processor.spawn(async { 7 }).blocking_get().unwrap(), 7);

    let byte = 1_u8;
    // Safety: writing one byte from a valid buffer
    let n = unsafe { libc::write(write.as_raw_fd(), (&raw const byte).cast(), 1) };
    assert_eq!(n, 1);
    release_tx.send(()).unwrap();

    let mut poller = handle.blocking_get().unwrap();
    // let the loop run the queued add/remove jobs and a poll round
    control.run_in_ev_loop_sync(|| ()).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(poller.next_event_noblock(), None);
    drop(read);
}

#[test]
fn run_in_ev_loop_from_a_task() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor(1);
    let pool = EventThreadPool::new(&EventThreadPoolConfig::default().with_threads(1)).unwrap();
    let control = pool.next_thread().clone();

    let on_loop = processor
        .spawn(async move {
            let inner = control.clone();
            control
                .run_in_ev_loop(move || inner.is_in_ev_loop())
                .await
        })
        .blocking_get()
        .unwrap()
        .unwrap();
    assert!(on_loop);
}
