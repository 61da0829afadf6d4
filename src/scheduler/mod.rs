//! The scheduler executes an ordered batch of transactions in parallel on top
//! of a multi-version store, such that the committed result is the same as
//! executing them one at a time in order.
//!
//! It proceeds in rounds. Each round first executes every eligible pending
//! transaction on the execution pool, then validates every executed
//! transaction from the lowest one not yet known to be final on the validation
//! pool. Transactions that fail validation have their writes turned into
//! estimates and are re-executed in the next round with a new incarnation.
//! Transactions that ran into an estimate, either while executing or while
//! validating, wait for the estimate's writer to re-execute first.
//!
//! A transaction is final once it and every lower transaction validated in the
//! same round, since nothing below it can change anymore. When all are final,
//! the latest versions are written to the engine. If that hasn't happened
//! after a fixed number of rounds, the remaining transactions are executed
//! sequentially instead, which always succeeds.

mod pool;
mod task;

pub use pool::{CancelToken, Canceller};
pub use task::{Status, Task};

use crate::errdata;
use crate::errinput;
use crate::error::{Error, Result};
use crate::storage::mvcc::{Incarnation, MultiVersionStore, TxIndex, View};
use crate::storage::Engine;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// The maximum number of attempts per transaction in the sequential fallback.
/// Lower transactions are final at that point, so one re-execution suffices.
const SEQUENTIAL_ATTEMPTS: usize = 3;

/// A transaction. Given a view of the state as of its position in the batch,
/// it performs reads and writes via the view, and returns an output or an
/// application error.
///
/// Execution is speculative and may be repeated. Transactions must be
/// deterministic functions of what they read through the view, must propagate
/// view errors (typically with ?), and must not have other side effects.
pub trait Transaction<E: Engine>: Send + Sync {
    fn execute(&self, view: &mut View<E>) -> Result<Vec<u8>>;
}

impl<E, F> Transaction<E> for F
where
    E: Engine,
    F: Fn(&mut View<E>) -> Result<Vec<u8>> + Send + Sync,
{
    fn execute(&self, view: &mut View<E>) -> Result<Vec<u8>> {
        self(view)
    }
}

/// Scheduler configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The number of execution workers.
    pub workers: usize,
    /// The number of validation workers. Validation is cheaper than execution,
    /// and a round validates more transactions than it executes.
    pub validation_workers: usize,
    /// The number of rounds before falling back to sequential execution.
    pub max_iterations: usize,
}

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self { workers, validation_workers: 2 * workers, max_iterations: 10 }
    }
}

impl Config {
    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return errinput!("workers must be at least 1");
        }
        if self.validation_workers == 0 {
            return errinput!("validation_workers must be at least 1");
        }
        if self.max_iterations == 0 {
            return errinput!("max_iterations must be at least 1");
        }
        Ok(())
    }
}

/// The outcome of a transaction in a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct Receipt {
    /// The transaction's position in the batch.
    pub index: TxIndex,
    /// The incarnation whose outcome was committed.
    pub incarnation: Incarnation,
    /// The transaction's output, or its application error or panic.
    pub result: Result<Vec<u8>>,
}

/// Batch statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Parallel rounds.
    pub rounds: usize,
    /// Execution attempts, including aborted ones.
    pub executions: usize,
    /// Validations.
    pub validations: usize,
    /// Failed validations.
    pub conflicts: usize,
    /// Execution attempts aborted by an estimate.
    pub aborts: usize,
    /// Execution attempts that panicked.
    pub panics: usize,
    /// Whether the sequential fallback was used.
    pub synchronous: bool,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rounds={} executions={} validations={} conflicts={} aborts={} panics={} \
             synchronous={}",
            self.rounds,
            self.executions,
            self.validations,
            self.conflicts,
            self.aborts,
            self.panics,
            self.synchronous
        )
    }
}

/// The outcome of an execution attempt.
#[derive(Debug)]
enum Execution {
    /// The attempt ran to completion with the given result, and its writes
    /// were published.
    Completed(Result<Vec<u8>>),
    /// The attempt read an estimate written by the given transaction, and its
    /// writes were published as estimates.
    Aborted(TxIndex),
}

/// Executes batches of transactions against an engine.
pub struct Scheduler<E: Engine> {
    config: Config,
    engine: Arc<RwLock<E>>,
    cancel: CancelToken,
    stats: Mutex<Stats>,
}

impl<E: Engine> Scheduler<E> {
    /// Creates a new scheduler for the given engine.
    pub fn new(engine: E, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            engine: Arc::new(RwLock::new(engine)),
            cancel: CancelToken::never(),
            stats: Mutex::new(Stats::default()),
        })
    }

    /// Uses the given cancellation token for all batches.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the engine.
    pub fn engine(&self) -> &Arc<RwLock<E>> {
        &self.engine
    }

    /// Returns the statistics of the last batch.
    pub fn stats(&self) -> Stats {
        *self.stats.lock()
    }

    /// Executes a batch of transactions and commits their writes to the
    /// engine. Returns a receipt per transaction, in batch order. Application
    /// errors and panics are transaction outcomes, and don't fail the batch.
    /// If the batch errors, nothing is written to the engine.
    pub fn process_all<T: Transaction<E>>(&self, transactions: &[T]) -> Result<Vec<Receipt>> {
        let count = transactions.len();
        let store = Arc::new(MultiVersionStore::new(self.engine.clone()));
        let mut tasks: Vec<Task> = (0..count).map(Task::new).collect();
        let mut stats = Stats::default();

        // The lowest transaction that isn't final.
        let mut start = 0;
        while start < count {
            self.cancel.check()?;
            if stats.rounds >= self.config.max_iterations {
                warn!(
                    "No fixed point after {} rounds, executing txns {start}-{} sequentially",
                    stats.rounds,
                    count - 1
                );
                stats.synchronous = true;
                self.process_sequential(&store, transactions, &mut tasks, start, &mut stats)?;
                break;
            }
            stats.rounds += 1;

            for task in &mut tasks[start..] {
                task.reset();
            }
            let executed = self.execute_round(&store, transactions, &mut tasks, start, &mut stats)?;
            let validated = self.validate_round(&store, &mut tasks, start, &mut stats)?;
            debug!(
                "Round {}: executed {executed} and validated {validated} txns from {start}",
                stats.rounds
            );

            start = tasks.iter().position(|t| t.status != Status::Validated).unwrap_or(count);
        }

        let mut receipts = Vec::with_capacity(count);
        for task in tasks {
            let Some(result) = task.result else {
                return errdata!("txn {} has no result", task.index);
            };
            if let Err(err) = &result {
                if !err.is_deterministic() {
                    warn!("Txn {} failed with non-deterministic error: {err}", task.index);
                }
            }
            receipts.push(Receipt { index: task.index, incarnation: task.incarnation, result });
        }
        self.cancel.check()?;
        store.write_latest_to_store()?;

        info!("Processed {count} txns: {stats}");
        *self.stats.lock() = stats;
        Ok(receipts)
    }

    /// Executes all eligible pending tasks from start on the execution pool.
    /// Returns the number of executed tasks.
    fn execute_round<T: Transaction<E>>(
        &self,
        store: &Arc<MultiVersionStore<E>>,
        transactions: &[T],
        tasks: &mut [Task],
        start: TxIndex,
        stats: &mut Stats,
    ) -> Result<usize> {
        let jobs: Vec<(TxIndex, Incarnation)> = (start..tasks.len())
            .filter(|i| tasks[*i].is_eligible(tasks))
            .map(|i| (i, tasks[i].incarnation))
            .collect();
        for (index, _) in &jobs {
            tasks[*index].status = Status::Executing;
        }

        let results =
            pool::run(self.config.workers, jobs.clone(), &self.cancel, |(index, incarnation)| {
                Self::execute(store, &transactions[index], index, incarnation)
            })?;

        for ((index, _), result) in jobs.iter().zip(results) {
            match result {
                Ok(execution) => Self::apply_execution(&mut tasks[*index], execution, stats),
                Err(err) => {
                    error!("Failed executing txn {index}: {err}");
                    return Err(err);
                }
            }
        }
        Ok(jobs.len())
    }

    /// Validates all executed tasks from start on the validation pool. Returns
    /// the number of validated tasks.
    fn validate_round(
        &self,
        store: &Arc<MultiVersionStore<E>>,
        tasks: &mut [Task],
        start: TxIndex,
        stats: &mut Stats,
    ) -> Result<usize> {
        let jobs: Vec<TxIndex> = (start..tasks.len()).filter(|i| tasks[*i].is_executed()).collect();
        for index in &jobs {
            tasks[*index].status = Status::Validating;
        }

        let workers = self.config.validation_workers;
        let results = pool::run(workers, jobs.clone(), &self.cancel, |index| {
            store.validate_transaction_state(index)
        });
        let results = match results {
            Ok(results) => results,
            Err(err) => {
                for index in &jobs {
                    tasks[*index].status = Status::Executed;
                }
                return Err(err);
            }
        };

        // Apply all verdicts before failing on errors, restoring the status of
        // tasks whose validation failed.
        let mut failure = None;
        for (index, result) in jobs.iter().zip(results) {
            match result {
                Ok(verdict) => Self::apply_validation(store, &mut tasks[*index], verdict, stats),
                Err(err) => {
                    error!("Failed validating txn {index}: {err}");
                    tasks[*index].status = Status::Executed;
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(jobs.len()),
        }
    }

    /// Executes and validates the tasks from start one at a time, in order.
    /// Every lower task is final when a task executes, so it can't read
    /// estimates and validates on its first or second attempt.
    fn process_sequential<T: Transaction<E>>(
        &self,
        store: &Arc<MultiVersionStore<E>>,
        transactions: &[T],
        tasks: &mut [Task],
        start: TxIndex,
        stats: &mut Stats,
    ) -> Result<()> {
        for index in start..tasks.len() {
            self.cancel.check()?;
            let task = &mut tasks[index];
            for _ in 0..SEQUENTIAL_ATTEMPTS {
                task.reset();
                if !task.is_executed() {
                    task.status = Status::Executing;
                    let execution =
                        Self::execute(store, &transactions[index], index, task.incarnation)?;
                    Self::apply_execution(task, execution, stats);
                    if task.status == Status::Aborted {
                        continue;
                    }
                }
                task.status = Status::Validating;
                match store.validate_transaction_state(index) {
                    Ok(verdict) => Self::apply_validation(store, task, verdict, stats),
                    Err(err) => {
                        task.status = Status::Executed;
                        return Err(err);
                    }
                }
                if task.status == Status::Validated {
                    break;
                }
                // A conflict can't happen with final lower transactions, but
                // if it does, re-execute rather than waiting on them.
                if task.status == Status::Executed {
                    store.invalidate_writeset(index, task.incarnation);
                    task.status = Status::Invalid;
                }
            }
            if task.status != Status::Validated {
                return errdata!(
                    "txn {index} did not validate in {SEQUENTIAL_ATTEMPTS} sequential attempts"
                );
            }
        }
        Ok(())
    }

    /// Runs an execution attempt and publishes its writes. Panics in the
    /// transaction are recovered as Error::Panic outcomes. Runs on a worker.
    fn execute<T: Transaction<E>>(
        store: &Arc<MultiVersionStore<E>>,
        transaction: &T,
        index: TxIndex,
        incarnation: Incarnation,
    ) -> Result<Execution> {
        let (abort_tx, abort_rx) = crossbeam::channel::bounded(1);
        let mut view = View::new(index, incarnation, store.clone(), abort_tx);
        let result = catch_unwind(AssertUnwindSafe(|| transaction.execute(&mut view)))
            .unwrap_or_else(|panic| {
                let message = pool::panic_message(panic);
                debug!("Txn {index}.{incarnation} panicked: {message}");
                Err(Error::Panic(message))
            });

        // The abort signal is authoritative, even if the transaction swallowed
        // the abort error.
        if let Ok(abort) = abort_rx.try_recv() {
            view.write_estimates_to_multiversion_store();
            return Ok(Execution::Aborted(abort.dependency));
        }
        if let Err(Error::Abort(writer)) = result {
            view.write_estimates_to_multiversion_store();
            return Ok(Execution::Aborted(writer));
        }
        if result.is_err() {
            view.discard_writes();
        }
        view.write_to_multiversion_store();
        Ok(Execution::Completed(result))
    }

    /// Applies an execution outcome to its task.
    fn apply_execution(task: &mut Task, execution: Execution, stats: &mut Stats) {
        stats.executions += 1;
        match execution {
            Execution::Completed(result) => {
                if matches!(result, Err(Error::Panic(_))) {
                    stats.panics += 1;
                }
                task.status = Status::Executed;
                task.dependencies.clear();
                task.result = Some(result);
            }
            Execution::Aborted(dependency) => {
                let (index, incarnation) = (task.index, task.incarnation);
                debug!("Txn {index}.{incarnation} aborted, waiting for txn {dependency}");
                stats.aborts += 1;
                task.status = Status::Aborted;
                task.dependencies.insert(dependency);
                task.result = None;
            }
        }
    }

    /// Applies a validation verdict to its task. A task with estimate
    /// conflicts stays executed and is validated again next round. An invalid
    /// task has its writes turned into estimates.
    fn apply_validation(
        store: &MultiVersionStore<E>,
        task: &mut Task,
        (valid, conflicts): (bool, BTreeSet<TxIndex>),
        stats: &mut Stats,
    ) {
        stats.validations += 1;
        if valid {
            task.status = Status::Validated;
            return;
        }
        stats.conflicts += 1;
        if !conflicts.is_empty() {
            task.status = Status::Executed;
            task.dependencies.extend(conflicts);
            return;
        }
        store.invalidate_writeset(task.index, task.incarnation);
        task.status = Status::Invalid;
    }
}
