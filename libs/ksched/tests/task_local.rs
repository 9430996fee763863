use std::sync::Once;

use ksched::task_local::{self, Inherited, Normal, Variable};
use ksched::{TaskProcessor, TaskProcessorConfig, WorkStealing};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

static REQUEST_ID: Variable<u64, Inherited> = Variable::new();
static SCRATCH: Variable<Vec<u8>, Normal> = Variable::new();

/// Every test in this binary goes through here before starting a processor, which seals the
/// registry.
fn processor() -> TaskProcessor<WorkStealing> {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        REQUEST_ID.register();
        SCRATCH.register();
    });

    TaskProcessor::with_config(
        TaskProcessorConfig::default()
            .with_name("locals")
            .with_worker_threads(2),
    )
    .unwrap()
}

#[test]
fn registry_is_sealed_by_the_first_processor() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let _processor = processor();
    assert!(task_local::is_sealed());
    assert!(REQUEST_ID.is_registered());

    static LATE: Variable<u8> = Variable::new();
    let res = std::panic::catch_unwind(|| LATE.register());
    assert!(res.is_err());
    assert!(!LATE.is_registered());
}

#[test]
fn children_inherit_only_inherited_values() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor();
    let handle = processor.handle().clone();

    let (child_id, child_scratch, parent_id) = processor
        .spawn(async move {
            REQUEST_ID.set(42);
            SCRATCH.set(vec![1, 2, 3]);

            let child = handle.spawn(async {
                let id = REQUEST_ID.get();
                // the child's copy is its own, writes don't leak back
                REQUEST_ID.with_mut(|id| *id += 1);
                (id, SCRATCH.get_optional())
            });

            let (child_id, child_scratch) = child.get().await.unwrap();
            (child_id, child_scratch, REQUEST_ID.get())
        })
        .blocking_get()
        .unwrap();

    assert_eq!(child_id, 42);
    assert_eq!(child_scratch, None);
    assert_eq!(parent_id, 42);
}

#[test]
fn values_do_not_leak_between_tasks() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor();

    processor
        .spawn(async {
            SCRATCH.set(vec![9]);
            ksched::task::yield_now().await;
            SCRATCH.with_mut(|scratch| scratch.push(10));
            assert_eq!(SCRATCH.get(), [9, 10]);
        })
        .blocking_get()
        .unwrap();

    let seen = processor
        .spawn(async { (SCRATCH.get_optional(), REQUEST_ID.get_optional()) })
        .blocking_get()
        .unwrap();
    assert_eq!(seen, (None, None));
}

#[test]
fn erase_removes_the_value() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .set_default();

    let processor = processor();

    let after = processor
        .spawn(async {
            REQUEST_ID.set(1);
            REQUEST_ID.erase();
            REQUEST_ID.get_optional()
        })
        .blocking_get()
        .unwrap();
    assert_eq!(after, None);
}
