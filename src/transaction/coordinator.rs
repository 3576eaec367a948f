// ============================================================================
// Transaction Coordinator
// ============================================================================
//
// Runs steps strictly in order. When a step fails, every step that already
// succeeded is compensated in reverse order and the original error is
// returned untouched. Rollback failures are logged, never propagated.
// Once every step has succeeded each one is committed, which only clears
// rollback state; commit failures are logged too.
//
// This is compensation, not atomicity: a process crash between steps leaves
// whatever the completed steps did (plus any `.bak` files) on disk.
//
// ============================================================================

use super::step::Step;
use crate::core::Result;
use tracing::{Instrument, Level, event, info_span};

/// An ordered list of steps run as one unit.
pub struct Transaction<T> {
    label: String,
    steps: Vec<Box<dyn Step<T>>>,
}

impl<T: Send + 'static> Transaction<T> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step<S>(mut self, step: S) -> Self
    where
        S: Step<T> + 'static,
    {
        self.steps.push(Box::new(step));
        self
    }

    pub fn push(&mut self, step: Box<dyn Step<T>>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the steps and returns their results in order.
    pub async fn run(self) -> Result<Vec<T>> {
        let span = info_span!("transaction", label = %self.label, steps = self.steps.len());
        run_steps(self.steps).instrument(span).await
    }
}

/// Runs `steps` in order, compensating completed steps on failure.
pub async fn run_steps<T>(mut steps: Vec<Box<dyn Step<T>>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(steps.len());

    for index in 0..steps.len() {
        match steps[index].execute().await {
            Ok(value) => results.push(value),
            Err(err) => {
                event!(
                    Level::ERROR,
                    step = steps[index].name(),
                    index,
                    error = %err,
                    "transaction step failed, rolling back"
                );
                for done in steps[..index].iter_mut().rev() {
                    if let Err(rollback_err) = done.rollback().await {
                        event!(
                            Level::ERROR,
                            step = done.name(),
                            error = %rollback_err,
                            "rollback failed"
                        );
                    }
                }
                return Err(err);
            }
        }
    }

    for step in steps.iter_mut() {
        if let Err(err) = step.commit().await {
            event!(Level::WARN, step = step.name(), error = %err, "step commit failed");
        }
    }
    event!(Level::DEBUG, steps = results.len(), "transaction committed");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbError;
    use crate::transaction::FnStep;
    use std::sync::{Arc, Mutex};

    fn recording_step(
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> FnStep<&'static str> {
        let exec_log = log.clone();
        FnStep::new(
            name,
            move || {
                let log = exec_log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("exec:{}", name));
                    if fail {
                        Err(DbError::ValidationFailure(format!("{} failed", name)))
                    } else {
                        Ok(name)
                    }
                })
            },
            move || {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("undo:{}", name));
                    Ok(())
                })
            },
        )
    }

    #[tokio::test]
    async fn test_all_steps_commit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let results = Transaction::new("ok")
            .step(recording_step("a", log.clone(), false))
            .step(recording_step("b", log.clone(), false))
            .run()
            .await
            .unwrap();

        assert_eq!(results, vec!["a", "b"]);
        assert_eq!(*log.lock().unwrap(), vec!["exec:a", "exec:b"]);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = Transaction::new("partial")
            .step(recording_step("a", log.clone(), false))
            .step(recording_step("b", log.clone(), false))
            .step(recording_step("c", log.clone(), true))
            .step(recording_step("d", log.clone(), false))
            .run()
            .await
            .unwrap_err();

        assert_eq!(err, DbError::ValidationFailure("c failed".into()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["exec:a", "exec:b", "exec:c", "undo:b", "undo:a"]
        );
    }

    #[tokio::test]
    async fn test_empty_transaction() {
        let results = run_steps::<()>(Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }
}
