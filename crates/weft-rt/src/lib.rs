//! weft-rt: an embeddable actor runtime scheduler.
//!
//! This crate provides the core scheduling machinery of an actor runtime: a
//! fixed pool of worker threads executing opaque actors with work stealing,
//! dynamic suspension of idle workers, distributed termination detection,
//! and per-worker backpressure that mutes senders of overloaded actors.
//!
//! Actor behaviour, mailboxes and overload policy live behind the
//! [`ActorBody`] seam; asynchronous I/O behind [`AsioBackend`]. The runtime
//! itself never inspects a message.
//!
//! ## Example
//!
//! ```no_run
//! use weft_rt::{Actor, ActorBody, ActorRef, SchedCtx, Scheduler, SchedulerConfig};
//!
//! struct Greeter;
//!
//! impl ActorBody for Greeter {
//!     fn run(&mut self, _ctx: &mut SchedCtx<'_>, _me: &ActorRef, _batch: u32) -> bool {
//!         println!("hello from a worker thread");
//!         false // done; deschedule
//!     }
//! }
//!
//! let sched = Scheduler::new(SchedulerConfig::default());
//! sched.schedule(Actor::new(Greeter));
//! // blocks until every actor is done and the runtime has quiesced
//! sched.start(false).unwrap();
//! ```

pub mod actor;
pub mod sched;

pub use actor::{Actor, ActorBody, ActorRef, FLAG_UNSCHEDULED};
pub use sched::{
    AsioBackend, CycleDetector, ExternalCtx, NullAsio, SchedCtx, Scheduler, SchedulerConfig,
    StartError, SCHED_BATCH,
};
