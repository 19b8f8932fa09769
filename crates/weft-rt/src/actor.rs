//! Actor handles and the execution-engine seam.
//!
//! The scheduler never looks inside an actor: it moves opaque handles between
//! run queues and hands them to the execution engine one batch at a time. The
//! handle carries the two pieces of state the scheduler itself owns:
//!
//! - the **mute counter**, raised while any scheduler holds the actor in a
//!   mute map (a muted actor must stay off every run queue), and
//! - the **flag set**, of which `FLAG_UNSCHEDULED` forbids re-scheduling the
//!   actor when it is unmuted.
//!
//! Everything else -- the mailbox, the behaviour, overload policy -- lives
//! behind the [`ActorBody`] trait.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sched::SchedCtx;

/// Flag forbidding re-scheduling of the actor when its mute count drops to
/// zero. Set by the engine for actors it has deliberately taken off the
/// run queues.
pub const FLAG_UNSCHEDULED: u32 = 1 << 0;

/// Shared, reference-counted actor handle.
pub type ActorRef = Arc<Actor>;

/// The execution engine contract.
///
/// `run` processes up to `batch` messages and reports whether the actor
/// should stay scheduled. The scheduler guarantees `run` is invoked by at
/// most one worker at a time.
pub trait ActorBody: Send {
    /// Run the actor for one timeslice. Returning `true` keeps the actor on
    /// the worker's run queue; returning `false` deschedules it until a new
    /// message (or an unmute) schedules it again.
    fn run(&mut self, ctx: &mut SchedCtx<'_>, me: &ActorRef, batch: u32) -> bool;

    /// Invoked when the actor's mute count returns to zero, before the
    /// scheduler re-queues it. Engines clear any internal muted state here.
    fn unmuted(&mut self) {}
}

/// An actor as the scheduler sees it: a mute counter, a flag set, and the
/// engine behaviour.
pub struct Actor {
    /// Number of mute-map entries currently holding this actor as a sender.
    /// Relaxed ordering suffices: a sender only ever sits in one scheduler's
    /// mute map, so all mutations come from a single thread at a time.
    muted: AtomicU64,

    /// Flag set; see [`FLAG_UNSCHEDULED`].
    flags: AtomicU32,

    /// The engine behaviour. Uncontended in steady state: an actor is on at
    /// most one queue, so only one worker can reach it.
    body: Mutex<Box<dyn ActorBody>>,
}

impl Actor {
    /// Wrap an engine behaviour into a schedulable handle.
    pub fn new(body: impl ActorBody + 'static) -> ActorRef {
        Arc::new(Actor {
            muted: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            body: Mutex::new(Box::new(body)),
        })
    }

    /// Current mute count.
    pub fn muted(&self) -> u64 {
        self.muted.load(Ordering::Relaxed)
    }

    pub(crate) fn mute_inc(&self) {
        self.muted.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the mute count, returning the new value.
    pub(crate) fn mute_dec(&self) -> u64 {
        let prev = self.muted.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "mute count underflow");
        prev - 1
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::Relaxed);
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }

    /// Identity key for mute-map bookkeeping.
    pub(crate) fn key(this: &ActorRef) -> ActorKey {
        ActorKey(Arc::as_ptr(this) as usize)
    }

    /// Run one timeslice through the engine seam.
    pub(crate) fn run(this: &ActorRef, ctx: &mut SchedCtx<'_>, batch: u32) -> bool {
        let mut body = this.body.lock();
        body.run(ctx, this, batch)
    }

    /// Tell the engine the actor is no longer muted.
    pub(crate) fn notify_unmuted(this: &ActorRef) {
        this.body.lock().unmuted();
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("muted", &self.muted.load(Ordering::Relaxed))
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pointer-identity key for an actor. Only meaningful while the `ActorRef`
/// it was taken from is still alive; the mute map keeps the referent alive
/// alongside every key it stores.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ActorKey(usize);

impl fmt::Debug for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorKey({:#x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
