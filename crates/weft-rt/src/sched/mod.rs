//! Work-stealing scheduler for weft actors.
//!
//! A fixed pool of worker threads cooperatively executes actors drawn from
//! per-worker run queues, with stealing for load balance. The pool resizes
//! itself logically: idle workers park from the top of the index range down
//! to a configured floor, so the running workers are always the contiguous
//! prefix `[0, active_count)`. Worker 0 aggregates block announcements from
//! the pool and drives a token-stamped confirm/acknowledge handshake that
//! detects quiescence and terminates the runtime.
//!
//! ## Modules
//!
//! - `scheduler`: the shared global record, lifecycle and the public
//!   [`Scheduler`] handle.
//! - `worker`: the per-thread scheduling loop, steal loop, suspension and
//!   mute map.
//! - `msg`: cross-worker control messages.
//! - `asio` / `cpu`: external subsystem seams and CPU topology helpers.

pub mod asio;
pub(crate) mod cpu;
pub(crate) mod msg;
pub mod scheduler;
pub(crate) mod worker;

pub use asio::{AsioBackend, CycleDetector, NullAsio};
pub use scheduler::{ExternalCtx, Scheduler, SchedulerConfig, StartError};
pub use worker::{SchedCtx, SCHED_BATCH};
