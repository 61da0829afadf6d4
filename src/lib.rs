#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod encoding;
pub mod error;
pub mod scheduler;
pub mod storage;

pub use error::{Error, Result};
pub use scheduler::{CancelToken, Canceller, Config, Receipt, Scheduler, Stats, Transaction};
pub use storage::mvcc::View;
