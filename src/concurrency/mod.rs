//! Concurrency Primitives
//!
//! Every primitive here is a single atomic server-side script so that no
//! caller ever does a read-modify-write across two round-trips, and so the
//! counters hold across multiple server processes instead of living behind
//! an in-process mutex.

pub mod active;
pub mod lock;
pub mod queue;
pub mod sticky;

pub use active::ActiveConcurrency;
pub use lock::AccountLock;
pub use queue::QueueCounter;
pub use sticky::StickySessions;
