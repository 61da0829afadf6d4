use crate::error::{Error, Result};

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use log::error;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Cancels a batch. Cancellation is signalled by disconnecting the channel
/// shared with the CancelToken, so every worker selecting on it wakes up.
/// Dropping the Canceller also cancels.
pub struct Canceller {
    tx: Mutex<Option<Sender<()>>>,
}

/// Observes cancellation. Cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
}

impl Canceller {
    /// Creates a new canceller and its token.
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = crossbeam::channel::bounded(0);
        (Self { tx: Mutex::new(Some(tx)) }, CancelToken { rx })
    }

    /// Cancels, waking up all token holders. Idempotent.
    pub fn cancel(&self) {
        self.tx.lock().take();
    }
}

impl CancelToken {
    /// Returns a token that is never cancelled.
    pub fn never() -> Self {
        Self { rx: crossbeam::channel::never() }
    }

    /// Returns true if cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Errors with Error::Cancelled if cancelled.
    pub fn check(&self) -> Result<()> {
        match self.is_cancelled() {
            true => Err(Error::Cancelled),
            false => Ok(()),
        }
    }

    /// Returns a receiver that becomes ready (disconnected) on cancellation,
    /// for use in select!.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

/// Signals the completion of a job on the done channel exactly once. If the
/// job never signals, e.g. because the worker unwound past it, dropping the
/// completion signals a failure instead, so the collector never waits for a
/// job that won't report.
struct Completion<T> {
    id: usize,
    tx: Option<Sender<(usize, Result<T>)>>,
}

impl<T> Completion<T> {
    fn new(id: usize, tx: Sender<(usize, Result<T>)>) -> Self {
        Self { id, tx: Some(tx) }
    }

    fn signal(mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            if tx.try_send((self.id, result)).is_err() {
                error!("Failed to signal completion of job {}", self.id);
            }
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let err = Error::Panic(format!("job {} exited without completing", self.id));
            if tx.try_send((self.id, Err(err))).is_err() {
                error!("Failed to signal failure of job {}", self.id);
            }
        }
    }
}

/// Returns the message of a caught panic payload.
pub(super) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => String::from("unknown panic"),
        },
    }
}

/// Runs the given jobs on a pool of worker threads, and returns their results
/// in job order. Panics in the work function are caught and returned as
/// Error::Panic for that job. Errors with Error::Cancelled if the token is
/// cancelled before all jobs complete, in which case workers stop picking up
/// jobs, but finish the ones they're running.
pub(super) fn run<J, T, F>(
    workers: usize,
    jobs: Vec<J>,
    cancel: &CancelToken,
    work: F,
) -> Result<Vec<Result<T>>>
where
    J: Send,
    T: Send,
    F: Fn(J) -> Result<T> + Sync,
{
    cancel.check()?;
    let count = jobs.len();
    if count == 0 {
        return Ok(Vec::new());
    }
    let (work_tx, work_rx) = crossbeam::channel::unbounded::<(usize, J)>();
    let (done_tx, done_rx) = crossbeam::channel::bounded::<(usize, Result<T>)>(count);
    for job in jobs.into_iter().enumerate() {
        work_tx.send(job)?;
    }
    drop(work_tx);

    std::thread::scope(|s| {
        for _ in 0..workers.clamp(1, count) {
            let (work_rx, done_tx, work) = (work_rx.clone(), done_tx.clone(), &work);
            s.spawn(move || worker(work_rx, done_tx, cancel, work));
        }
        drop(done_tx);

        let mut results: Vec<Option<Result<T>>> = (0..count).map(|_| None).collect();
        for _ in 0..count {
            crossbeam::select! {
                recv(done_rx) -> done => match done {
                    Ok((id, result)) => results[id] = Some(result),
                    // Workers only exit early when cancelled.
                    Err(_) => {
                        cancel.check()?;
                        return Err(Error::IO("workers exited before completing all jobs".into()));
                    }
                },
                recv(cancel.receiver()) -> _ => return Err(Error::Cancelled),
            }
        }
        results
            .into_iter()
            .enumerate()
            .map(|(id, result)| match result {
                Some(result) => Ok(result),
                None => Err(Error::InvalidData(format!("job {id} did not complete"))),
            })
            .collect()
    })
}

/// A pool worker. Processes jobs until the work queue is drained or the
/// token is cancelled.
fn worker<J, T, F>(
    work_rx: Receiver<(usize, J)>,
    done_tx: Sender<(usize, Result<T>)>,
    cancel: &CancelToken,
    work: &F,
) where
    F: Fn(J) -> Result<T>,
{
    loop {
        crossbeam::select! {
            recv(work_rx) -> job => {
                let Ok((id, job)) = job else {
                    return;
                };
                let completion = Completion::new(id, done_tx.clone());
                let result = catch_unwind(AssertUnwindSafe(|| work(job)))
                    .unwrap_or_else(|panic| Err(Error::Panic(panic_message(panic))));
                completion.signal(result);
            }
            recv(cancel.receiver()) -> _ => return,
        }
    }
}
