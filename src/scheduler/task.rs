use crate::error::Result;
use crate::storage::mvcc::{Incarnation, TxIndex};

use std::collections::BTreeSet;

/// The status of a task's current attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Waiting to be executed.
    Pending,
    /// Dispatched to an execution worker.
    Executing,
    /// Executed, and its writes published, but not yet known to be valid.
    Executed,
    /// Dispatched to a validation worker.
    Validating,
    /// Validated against the current state of all lower transactions.
    Validated,
    /// Failed validation. Its writes are estimates, and it will re-execute.
    Invalid,
    /// Read an estimate while executing. Its writes are estimates, and it
    /// will re-execute once its dependencies have.
    Aborted,
}

/// A transaction in a batch, tracking its current attempt. The attempt's read
/// set, write set and iterate set live in the multi-version store, keyed by
/// the task index.
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub index: TxIndex,
    pub incarnation: Incarnation,
    pub status: Status,
    /// Lower transactions whose estimates this task ran into.
    pub dependencies: BTreeSet<TxIndex>,
    /// The outcome of the latest executed attempt.
    pub result: Option<Result<Vec<u8>>>,
}

impl Task {
    pub fn new(index: TxIndex) -> Self {
        Self {
            index,
            incarnation: 0,
            status: Status::Pending,
            dependencies: BTreeSet::new(),
            result: None,
        }
    }

    /// Moves a failed attempt back to pending with a new incarnation. Does
    /// nothing for other statuses.
    pub fn reset(&mut self) {
        if matches!(self.status, Status::Invalid | Status::Aborted) {
            self.status = Status::Pending;
            self.incarnation += 1;
            self.result = None;
        }
    }

    /// Returns true if the task is pending and none of its dependencies are
    /// waiting to execute.
    pub fn is_eligible(&self, tasks: &[Task]) -> bool {
        self.status == Status::Pending
            && self.dependencies.iter().all(|d| {
                tasks.get(*d).map_or(true, |dep| {
                    !matches!(dep.status, Status::Pending | Status::Invalid | Status::Aborted)
                })
            })
    }

    /// Returns true if the task has executed and can be validated.
    pub fn is_executed(&self) -> bool {
        matches!(self.status, Status::Executed | Status::Validated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    use pretty_assertions::assert_eq;

    #[test]
    fn reset() {
        let mut task = Task::new(3);
        task.status = Status::Validated;
        task.reset();
        assert_eq!((task.status, task.incarnation), (Status::Validated, 0));

        task.status = Status::Invalid;
        task.result = Some(Err(Error::Application("overdraft".into())));
        task.reset();
        assert_eq!(
            (task.status, task.incarnation, task.result.clone()),
            (Status::Pending, 1, None)
        );

        task.status = Status::Aborted;
        task.reset();
        assert_eq!((task.status, task.incarnation), (Status::Pending, 2));
    }

    #[test]
    fn eligible() {
        let mut tasks: Vec<Task> = (0..3).map(Task::new).collect();
        tasks[2].dependencies.insert(0);
        assert!(tasks[0].is_eligible(&tasks));
        assert!(!tasks[2].is_eligible(&tasks));

        tasks[0].status = Status::Executed;
        assert!(tasks[2].is_eligible(&tasks));
        assert!(!tasks[0].is_eligible(&tasks));
        assert!(tasks[0].is_executed());
    }
}
