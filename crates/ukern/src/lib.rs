//! Cooperative, priority-scheduled fiber runtime.
//!
//! Fibers are realized as OS threads synchronized through a scheduler-owned
//! lock so that, per core, only one fiber's user code ever executes at a
//! time — see [`scheduler`] for the dispatch loop and [`fls`] for the
//! per-fiber state it tracks.

pub mod error;
pub mod fls;
pub mod scheduler;
pub mod time;

pub use error::{Error, Result};
pub use fls::{ActivityLevel, FiberRecord, FiberState, Priority, WaitReason};
pub use scheduler::UserScheduler;
