//! Thread-based fan-out over independent per-entity operations.
//!
//! The engine applies the same operation to many VMs or networks at once.
//! Each task gets its own OS thread inside a [`std::thread::scope`], so
//! borrowed state may flow into the closures, and results come back in task
//! order. A panicking task is contained and reported as an error instead of
//! tearing down its siblings.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use tracing::debug;

use crate::error::{VirtlabError, VirtlabResult};

/// Run every task on its own thread and collect all results in task order.
///
/// All tasks run to completion even when some fail. A panic inside a task is
/// converted into [`VirtlabError::Internal`] for that slot only.
pub fn fan_out<T, F>(tasks: Vec<F>) -> Vec<VirtlabResult<T>>
where
    F: FnOnce() -> VirtlabResult<T> + Send,
    T: Send,
{
    if tasks.is_empty() {
        return Vec::new();
    }
    debug!(count = tasks.len(), "fanning out tasks");

    thread::scope(|scope| {
        let mut receivers = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (tx, rx) = mpsc::channel();
            scope.spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|_| {
                    Err(VirtlabError::Internal {
                        message: "fan-out worker panicked".into(),
                    })
                });
                // The receiver only disappears if the collecting loop itself
                // panicked, in which case nobody is left to care.
                let _ = tx.send(outcome);
            });
            receivers.push(rx);
        }

        receivers
            .into_iter()
            .map(|rx| {
                rx.recv().unwrap_or_else(|_| {
                    Err(VirtlabError::Internal {
                        message: "fan-out worker exited without a result".into(),
                    })
                })
            })
            .collect()
    })
}

/// Fan out and reduce to a single result: `Ok` with every value in task
/// order, or the first (by task order) error after all tasks have finished.
pub fn invoke_in_parallel<T, F>(tasks: Vec<F>) -> VirtlabResult<Vec<T>>
where
    F: FnOnce() -> VirtlabResult<T> + Send,
    T: Send,
{
    let mut values = Vec::new();
    for result in fan_out(tasks) {
        values.push(result?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn results_come_back_in_task_order() {
        let tasks: Vec<_> = (0..8u32)
            .map(|i| {
                move || {
                    // Later tasks finish earlier; ordering must not depend on
                    // completion time.
                    std::thread::sleep(std::time::Duration::from_millis(u64::from(8 - i)));
                    Ok(i * 10)
                }
            })
            .collect();

        let results = fan_out(tasks);
        let values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    fn failures_do_not_cancel_siblings() {
        let completed = std::sync::Arc::new(AtomicUsize::new(0));
        let (done_a, done_b) = (completed.clone(), completed.clone());
        let tasks: Vec<Box<dyn FnOnce() -> VirtlabResult<()> + Send>> = vec![
            Box::new(|| {
                Err(VirtlabError::Internal {
                    message: "first failure".into(),
                })
            }),
            Box::new(move || {
                done_a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Box::new(move || {
                done_b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ];

        let result = invoke_in_parallel(tasks);
        match result {
            Err(VirtlabError::Internal { message }) => assert_eq!(message, "first failure"),
            other => panic!("expected first error, got {other:?}"),
        }
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panic_is_contained() {
        let tasks: Vec<Box<dyn FnOnce() -> VirtlabResult<u8> + Send>> = vec![
            Box::new(|| panic!("worker bug")),
            Box::new(|| Ok(3)),
        ];

        let results = fan_out(tasks);
        assert!(matches!(
            results[0],
            Err(VirtlabError::Internal { .. })
        ));
        assert_eq!(*results[1].as_ref().unwrap(), 3);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let tasks: Vec<fn() -> VirtlabResult<()>> = Vec::new();
        assert!(fan_out(tasks).is_empty());
    }

    #[test]
    fn tasks_may_borrow_local_state() {
        let names = vec!["a".to_string(), "b".to_string()];
        let tasks: Vec<_> = names
            .iter()
            .map(|name| move || Ok(name.len()))
            .collect();
        let lengths = invoke_in_parallel(tasks).unwrap();
        assert_eq!(lengths, vec![1, 1]);
    }
}
