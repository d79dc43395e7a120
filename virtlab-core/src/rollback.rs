//! Scoped ledger of compensating actions.
//!
//! A multi-phase operation registers one undo action per completed phase;
//! if a later phase fails, the ledger unwinds last-registered-first and the
//! original error is what the caller sees. Undo failures during an unwind are
//! logged and swallowed, except that the first undo error of an *otherwise
//! successful* run is surfaced, so cleanup problems never go entirely silent.

use tracing::warn;

use crate::error::VirtlabResult;

type Undo = Box<dyn FnOnce() -> VirtlabResult<()> + Send>;

/// Ordered list of undo actions for one multi-phase operation.
///
/// Constructed by [`with_rollback`]; not meant to outlive the body closure.
pub struct RollbackLedger {
    undos: Vec<Undo>,
}

impl RollbackLedger {
    fn new() -> Self {
        Self { undos: Vec::new() }
    }

    /// Register an undo action. Actions registered with `add` unwind
    /// last-registered-first.
    pub fn add<F>(&mut self, undo: F)
    where
        F: FnOnce() -> VirtlabResult<()> + Send + 'static,
    {
        self.undos.push(Box::new(undo));
    }

    /// Register an undo action that unwinds *after* everything currently in
    /// the ledger, regardless of what gets registered later. Used for
    /// outermost cleanups such as removing a partially-created directory.
    pub fn add_first<F>(&mut self, undo: F)
    where
        F: FnOnce() -> VirtlabResult<()> + Send + 'static,
    {
        self.undos.insert(0, Box::new(undo));
    }

    /// Discard every registered undo action. Called once the operation has
    /// fully succeeded and the resources should be kept.
    pub fn clear(&mut self) {
        self.undos.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.undos.is_empty()
    }

    fn unwind(&mut self) -> Option<crate::error::VirtlabError> {
        let mut first_error = None;
        for undo in self.undos.drain(..).rev() {
            if let Err(err) = undo() {
                warn!("rollback action failed: {err}");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        first_error
    }
}

/// Run `body` with a fresh ledger.
///
/// On `Err` from `body`, all registered undo actions run and the body's error
/// is returned unchanged. On `Ok`, any undo actions still registered run as
/// deferred cleanup, and the first cleanup failure (if any) becomes the
/// result.
pub fn with_rollback<T, F>(body: F) -> VirtlabResult<T>
where
    F: FnOnce(&mut RollbackLedger) -> VirtlabResult<T>,
{
    let mut ledger = RollbackLedger::new();
    match body(&mut ledger) {
        Ok(value) => match ledger.unwind() {
            Some(err) => Err(err),
            None => Ok(value),
        },
        Err(err) => {
            ledger.unwind();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VirtlabError;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let log = log.clone();
            move |entry| log.lock().unwrap().push(entry)
        };
        (log, sink)
    }

    #[test]
    fn unwinds_in_reverse_order_and_preserves_original_error() {
        let (log, record) = recorder();
        let record_a = {
            let r = record.clone();
            move || {
                r("undo-a");
                Ok(())
            }
        };
        let record_b = {
            let r = record.clone();
            move || {
                r("undo-b");
                Ok(())
            }
        };

        let result: VirtlabResult<()> = with_rollback(|rollback| {
            rollback.add(record_a);
            rollback.add(record_b);
            Err(VirtlabError::Internal {
                message: "phase 3 failed".into(),
            })
        });

        assert!(matches!(result, Err(VirtlabError::Internal { .. })));
        assert_eq!(*log.lock().unwrap(), vec!["undo-b", "undo-a"]);
    }

    #[test]
    fn add_first_runs_last() {
        let (log, record) = recorder();
        let outer = {
            let r = record.clone();
            move || {
                r("outer");
                Ok(())
            }
        };
        let inner = {
            let r = record.clone();
            move || {
                r("inner");
                Ok(())
            }
        };

        let _: VirtlabResult<()> = with_rollback(|rollback| {
            rollback.add_first(outer);
            rollback.add(inner);
            Err(VirtlabError::Internal {
                message: "boom".into(),
            })
        });

        assert_eq!(*log.lock().unwrap(), vec!["inner", "outer"]);
    }

    #[test]
    fn undo_failure_never_masks_body_error() {
        let result: VirtlabResult<()> = with_rollback(|rollback| {
            rollback.add(|| {
                Err(VirtlabError::Internal {
                    message: "undo exploded".into(),
                })
            });
            Err(VirtlabError::Unsupported {
                operation: "the real failure".into(),
            })
        });

        match result {
            Err(VirtlabError::Unsupported { operation }) => {
                assert_eq!(operation, "the real failure")
            }
            other => panic!("expected the body error, got {other:?}"),
        }
    }

    #[test]
    fn undo_failure_surfaces_when_body_succeeded() {
        let result: VirtlabResult<u32> = with_rollback(|rollback| {
            rollback.add(|| {
                Err(VirtlabError::Internal {
                    message: "cleanup failed".into(),
                })
            });
            Ok(7)
        });

        assert!(matches!(result, Err(VirtlabError::Internal { .. })));
    }

    #[test]
    fn clear_keeps_resources() {
        let (log, record) = recorder();
        let undo = {
            let r = record.clone();
            move || {
                r("undo");
                Ok(())
            }
        };

        let result: VirtlabResult<()> = with_rollback(|rollback| {
            rollback.add(undo);
            rollback.clear();
            assert!(rollback.is_empty());
            Ok(())
        });

        assert!(result.is_ok());
        assert!(log.lock().unwrap().is_empty());
    }
}
