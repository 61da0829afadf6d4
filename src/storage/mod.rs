pub mod debug;
pub mod engine;
mod memory;
pub mod mvcc;

pub use engine::{Engine, ScanIterator, Status};
pub use memory::Memory;
