//! Per-worker scheduling loop.
//!
//! Each worker thread owns one `Worker`: the writable half of its run queue,
//! the consuming half of its inbox, the mute map, and the quiescence
//! bookkeeping. The loop interleaves four duties:
//!
//! 1. drain the inbox and dispatch control messages,
//! 2. run the current actor for one batch through the engine seam,
//! 3. steal work when the local queue and inject queue are empty,
//! 4. announce blocks, suspend, or terminate when stealing keeps failing.
//!
//! Worker 0 doubles as the quiescence aggregator: it is the only recipient
//! of `Block`/`Unblock`/`Suspend` and the only driver of confirmation
//! rounds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_deque::Worker as LocalQueue;
use log::{debug, trace};
use parking_lot::MutexGuard;
use rustc_hash::FxHashMap;

use crate::actor::{Actor, ActorKey, ActorRef, FLAG_UNSCHEDULED};

use super::cpu;
use super::msg::SchedMsg;
use super::scheduler::Core;

/// Messages an actor may process per timeslice.
pub const SCHED_BATCH: u32 = 100;

/// How long a worker must fail to steal before announcing itself blocked.
/// Most steals succeed almost immediately; announcing earlier would flood
/// worker 0 with block/unblock pairs that delay real quiescence detection.
const BLOCK_GATE: Duration = Duration::from_millis(1);

/// State owned by one scheduler thread.
pub(crate) struct Worker {
    pub(crate) core: Arc<Core>,
    pub(crate) index: usize,

    /// Local run queue. The owner pushes and pops; peers steal-pop.
    pub(crate) queue: LocalQueue<ActorRef>,

    /// Consuming half of this worker's control-message inbox.
    pub(crate) inbox: Receiver<SchedMsg>,

    /// Overloaded receiver -> muted senders. Owner-only; senders held here
    /// are off every run queue until the receiver drains.
    pub(crate) mute_map: FxHashMap<ActorKey, FxHashMap<ActorKey, ActorRef>>,

    /// Workers currently announced as blocked. Meaningful on worker 0 only.
    pub(crate) block_count: u32,

    /// Confirmation round state. Meaningful on worker 0 only; advancing the
    /// token invalidates every ack still in flight.
    pub(crate) ack_token: u32,
    pub(crate) ack_count: u32,

    /// Mirror of the async-I/O subsystem's "has pending sources" state.
    pub(crate) asio_noisy: bool,

    /// Worker 0's view of whether the async-I/O subsystem has been halted.
    pub(crate) asio_stopped: bool,

    /// Set by a `Terminate` message; the loop exits at the next steal.
    pub(crate) terminate: bool,

    /// Steal cursor; walks downward through the active workers.
    pub(crate) last_victim: usize,
}

/// Scheduling context handed to an actor while it runs. Grants access to the
/// operations an engine may need mid-batch: scheduling onto the local queue,
/// muting a sender against an overloaded receiver, and broadcasting an
/// unmute once the receiver drains.
pub struct SchedCtx<'a> {
    worker: &'a mut Worker,
}

impl SchedCtx<'_> {
    /// Index of the executing worker.
    pub fn index(&self) -> i32 {
        self.worker.index as i32
    }

    pub fn active_count(&self) -> u32 {
        self.worker.core.active_count()
    }

    /// Schedule an actor onto this worker's run queue.
    pub fn schedule(&mut self, actor: ActorRef) {
        self.worker.queue.push(actor);
    }

    /// Record that `sender` overloaded `recv` and must be held off the run
    /// queues until `recv` drains.
    pub fn mute(&mut self, sender: &ActorRef, recv: &ActorRef) {
        self.worker.mute(sender, recv);
    }

    /// Tell every active worker that `recv` has drained and its muted
    /// senders may run again.
    pub fn start_global_unmute(&self, recv: &ActorRef) {
        self.worker
            .core
            .send_all_active(SchedMsg::UnmuteActor(Arc::clone(recv)));
    }
}

impl Worker {
    pub(crate) fn new(
        core: Arc<Core>,
        index: usize,
        queue: LocalQueue<ActorRef>,
        inbox: Receiver<SchedMsg>,
    ) -> Self {
        Worker {
            core,
            index,
            queue,
            inbox,
            mute_map: FxHashMap::default(),
            block_count: 0,
            ack_token: 0,
            ack_count: 0,
            asio_noisy: false,
            asio_stopped: false,
            terminate: false,
            last_victim: index,
        }
    }

    /// Thread entry point: pin, run to termination, drain the inbox.
    pub(crate) fn run_thread(mut self) {
        if let Some(cpu) = self.core.workers[self.index].cpu {
            cpu::pin_current(cpu);
        }
        trace!("scheduler {} running", self.index);
        self.run();
        // control messages sent after our terminate are dropped here rather
        // than left in a queue nobody will ever read
        while self.inbox.try_recv().is_ok() {}
        trace!("scheduler {} exited", self.index);
    }

    /// The scheduling loop. Returns when a steal round ends in termination.
    pub(crate) fn run(&mut self) {
        let mut actor = self.pop_global();

        loop {
            // a drained message may have unmuted an actor onto our queue
            if self.read_inbox() && actor.is_none() {
                actor = self.pop_global();
            }

            let current = match actor.take() {
                Some(actor) => actor,
                None => match self.steal() {
                    Some(actor) => actor,
                    None => {
                        debug_assert!(self.queue.pop().is_none());
                        return;
                    }
                },
            };

            // Holding muted actors means some receiver here is overloaded;
            // invite a sleeping worker to help with the load. Workers that
            // find nothing will simply go back to sleep.
            if !self.mute_map.is_empty() {
                self.core.maybe_wakeup(self.index as i32);
            }

            let reschedule = {
                let mut ctx = SchedCtx { worker: self };
                Actor::run(&current, &mut ctx, SCHED_BATCH)
            };

            // newly injected work gains latency over the local queue
            let next = self.pop_global();

            actor = if reschedule {
                if next.is_some() {
                    // someone is waiting; go to the back of the queue
                    self.queue.push(current);
                    next
                } else {
                    Some(current)
                }
            } else {
                next
            };
        }
    }

    /// Inject queue first, then the local queue.
    fn pop_global(&mut self) -> Option<ActorRef> {
        if let Some(actor) = self.core.inject_pop(&self.queue) {
            return Some(actor);
        }
        self.queue.pop()
    }

    // -----------------------------------------------------------------------
    // Inbox
    // -----------------------------------------------------------------------

    /// Drain every currently visible control message. Returns whether a
    /// drained message put work on the local run queue.
    pub(crate) fn read_inbox(&mut self) -> bool {
        let mut run_queue_changed = false;

        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                SchedMsg::Suspend => self.maybe_start_cnf_ack_cycle(),
                SchedMsg::Block => self.handle_block(),
                SchedMsg::Unblock => self.handle_unblock(),
                SchedMsg::Cnf(token) => {
                    // echo the token back; the sender's token bookkeeping
                    // decides whether this answer still counts
                    self.core.send(0, SchedMsg::Ack(token));
                }
                SchedMsg::Ack(token) => {
                    if token == self.ack_token {
                        self.ack_count += 1;
                    }
                }
                SchedMsg::Terminate => self.terminate = true,
                SchedMsg::UnmuteActor(actor) => {
                    if self.unmute_senders(&actor) {
                        run_queue_changed = true;
                    }
                }
                SchedMsg::NoisyAsio => self.asio_noisy = true,
                SchedMsg::UnnoisyAsio => self.asio_noisy = false,
            }
        }

        run_queue_changed
    }

    fn handle_block(&mut self) {
        self.block_count += 1;
        self.maybe_start_cnf_ack_cycle();
    }

    fn handle_unblock(&mut self) {
        // the runtime is in an invalid state without a running async-I/O
        // subsystem; restart it before any actor can run again
        if self.asio_stopped {
            self.core.asio.init(self.core.asio_cpu);
            self.asio_stopped = !self.core.asio.start();
        }
        assert!(!self.asio_stopped, "async-I/O subsystem failed to restart");

        // cancel the in-flight round: acks answering the old token no
        // longer prove anything
        self.block_count -= 1;
        self.ack_token += 1;
        self.ack_count = 0;
    }

    /// Open a confirmation round when every active worker has announced
    /// itself blocked.
    fn maybe_start_cnf_ack_cycle(&mut self) {
        use std::sync::atomic::Ordering;
        if self.core.detect_quiescence.load(Ordering::Relaxed)
            && self.block_count >= self.core.active_count()
        {
            // A worker can wake, shift the active count, and block a second
            // time; restarting the round keeps acks from the earlier shape
            // of the pool from satisfying this one.
            self.ack_token += 1;
            self.ack_count = 0;
            self.core.send_all_active(SchedMsg::Cnf(self.ack_token));
        }
    }

    /// Announce this worker as blocked.
    fn send_block(&mut self) {
        trace!("scheduler {} blocked", self.index);
        if self.index == 0 {
            self.handle_block();
        } else {
            self.core.send(0, SchedMsg::Block);
        }
    }

    /// Retract this worker's block announcement.
    fn send_unblock(&mut self) {
        trace!("scheduler {} unblocked", self.index);
        if self.index == 0 {
            self.handle_unblock();
        } else {
            self.core.send(0, SchedMsg::Unblock);
        }
    }

    // -----------------------------------------------------------------------
    // Quiescence
    // -----------------------------------------------------------------------

    /// Pump the termination protocol and back off the CPU. Returns `true`
    /// when this worker must exit its loop.
    ///
    /// The async-I/O subsystem is confirmed twice: once to stop it, and once
    /// more with it stopped, so an event published between the first round's
    /// completion and the stop cannot wake an actor after termination.
    fn quiescent(&mut self, tsc: Instant, tsc2: Instant) -> bool {
        if self.terminate {
            return true;
        }

        let active = self.core.active_count();
        if self.ack_count >= active {
            if self.asio_stopped {
                debug!("scheduler 0 broadcasting terminate");
                self.core.send_all(SchedMsg::Terminate);
                self.core.wake_suspended(self.index as i32);
                self.ack_token += 1;
                self.ack_count = 0;
            } else if self.core.asio.stop() {
                self.asio_stopped = true;
                self.ack_token += 1;
                self.ack_count = 0;
                self.core.send_all_active(SchedMsg::Cnf(self.ack_token));
            } else {
                // noisy sources remain; re-validate that every worker is
                // still blocked before trying the stop again
                trace!("async-I/O stop refused, rearming confirmation round");
                self.ack_token += 1;
                self.ack_count = 0;
                self.core.send_all_active(SchedMsg::Cnf(self.ack_token));
            }
        }

        cpu::pause(tsc, tsc2, self.core.use_yield);
        false
    }

    // -----------------------------------------------------------------------
    // Stealing
    // -----------------------------------------------------------------------

    /// Advance the steal cursor to the next victim, walking downward and
    /// wrapping inside the active prefix. Returns `None` once the cursor
    /// comes all the way around, which resets it to this worker.
    fn choose_victim(&mut self) -> Option<usize> {
        let mut victim = self.last_victim;

        loop {
            let active = self.core.active_count().max(1) as usize;

            victim = if victim == 0 { active - 1 } else { victim - 1 };

            if victim == self.last_victim || active == 1 {
                // full revolution without work
                self.last_victim = self.index;
                return None;
            }

            if victim == self.index {
                continue;
            }

            self.last_victim = victim;
            return Some(victim);
        }
    }

    /// Hunt for work until something turns up or the runtime terminates.
    ///
    /// Every miss also drains the inbox (an unmute can hand us our own
    /// work) and pumps the quiescence protocol. A full revolution of misses
    /// past [`BLOCK_GATE`] announces this worker blocked and, for the
    /// highest active worker, tries to suspend it. A block announcement is
    /// always paired with exactly one unblock before work is returned.
    fn steal(&mut self) -> Option<ActorRef> {
        let mut block_sent = false;
        let mut steal_attempts: u32 = 0;
        let tsc = Instant::now();

        let actor = loop {
            let victim = self.choose_victim();

            if let Some(actor) = self.core.inject_pop(&self.queue) {
                break actor;
            }
            if let Some(victim) = victim {
                if let Some(actor) = self.core.steal_from(victim) {
                    trace!("scheduler {} stole from scheduler {}", self.index, victim);
                    break actor;
                }
            }

            let tsc2 = Instant::now();

            if self.read_inbox() {
                // An unmuted actor landed on our own queue. Another worker
                // may have stolen it back already, so the pop has to be
                // re-checked.
                if let Some(actor) = self.pop_global() {
                    break actor;
                }
            }

            if self.quiescent(tsc, tsc2) {
                return None;
            }

            let active = self.core.active_count();
            // scaling is strictly last-in-first-out by index; a running
            // worker is always inside the active prefix
            debug_assert!(active as usize > self.index);

            if !block_sent {
                if steal_attempts < active {
                    steal_attempts += 1;
                } else if tsc2.duration_since(tsc) > BLOCK_GATE && self.mute_map.is_empty() {
                    let active = self.core.active_count();
                    if let Some(actor) =
                        self.perhaps_suspend(active, &mut block_sent, &mut steal_attempts)
                    {
                        break actor;
                    }
                    if !block_sent && !self.asio_noisy {
                        // with noisy sources pending this worker is idle but
                        // not blocked: an external event may still arrive
                        self.send_block();
                        block_sent = true;
                    }
                }
            } else if let Some(actor) =
                self.perhaps_suspend(active, &mut block_sent, &mut steal_attempts)
            {
                break actor;
            }
        };

        if block_sent {
            self.send_unblock();
        }
        Some(actor)
    }

    // -----------------------------------------------------------------------
    // Suspension
    // -----------------------------------------------------------------------

    /// Try to take this worker out of the active set.
    ///
    /// Only the highest active worker may park, only above the configured
    /// floor, and never while terminating. Worker 0 additionally requires
    /// noisy async-I/O -- with no external sources possible, it must stay up
    /// to drive termination, so it announces a block instead.
    fn perhaps_suspend(
        &mut self,
        active: u32,
        block_sent: &mut bool,
        steal_attempts: &mut u32,
    ) -> Option<ActorRef> {
        if self.index + 1 != active as usize || active <= self.core.min_active || self.terminate {
            return None;
        }

        let core = Arc::clone(&self.core);
        let guard = match core.count_lock.try_lock() {
            Some(guard) => guard,
            None => return None,
        };

        // the pool may have been resized between the check and the interlock
        let active = self.core.active_count();
        if self.index + 1 != active as usize || active <= self.core.min_active {
            return None;
        }

        let mut actor = None;
        if self.index > 0 || self.asio_noisy {
            if *block_sent {
                // retract the announcement first: suspension is accounted
                // through the active count, not the block count
                self.send_unblock();
                *block_sent = false;
            }
            actor = self.suspend(guard, active);
            // try every other worker again before parking a second time
            *steal_attempts = 0;
        } else {
            debug_assert_eq!(self.index, 0);
            debug_assert!(!self.asio_noisy);
            drop(guard);
            if !*block_sent {
                self.send_block();
                *block_sent = true;
            }
        }

        actor
    }

    /// Park until the active count rises above this worker's index.
    ///
    /// Must be entered with the count interlock held; the condvar wait
    /// releases it while parked. Worker 0 re-checks the inject queue and its
    /// inbox on every pass so an async-I/O event racing the park is never
    /// lost, and it restores `active >= 1` on the way out when it leaves
    /// with work (or with the noise gone).
    fn suspend(&mut self, mut guard: MutexGuard<'_, ()>, expected_active: u32) -> Option<ActorRef> {
        use std::sync::atomic::Ordering;

        let count = self.core.active_count();
        debug_assert_eq!(count, expected_active);
        self.core.active.store(count - 1, Ordering::Relaxed);

        // Announce only after the decrement: were worker 0 to process this
        // before the count dropped, it could compare the block count against
        // the stale count and miss a quiescence that is already here.
        if self.index != 0 {
            self.core.send(0, SchedMsg::Suspend);
        }
        trace!("scheduler {} suspending, {} active", self.index, count - 1);

        let mut actor = None;
        while self.core.active_count() as usize <= self.index {
            if self.index == 0 {
                actor = self.core.inject_pop_one();
                if actor.is_some() {
                    break;
                }
                if self.read_inbox() {
                    // an unmute scheduled local work; it may already have
                    // been stolen back, so the pop is verified
                    actor = self.pop_global();
                    if actor.is_some() {
                        break;
                    }
                }
                if !self.asio_noisy {
                    break;
                }
            }
            self.core.workers[self.index].sleep.wait(&mut guard);
        }

        if self.index == 0 && (actor.is_some() || !self.asio_noisy) {
            // leaving with work in hand: there must be at least one worker
            // allowed to run it
            if self.core.active_count() == 0 {
                self.core.active.store(1, Ordering::Relaxed);
            }
        }

        drop(guard);
        trace!("scheduler {} resumed", self.index);
        actor
    }

    // -----------------------------------------------------------------------
    // Mute map
    // -----------------------------------------------------------------------

    /// Hold `sender` out of scheduling until `recv` drains.
    ///
    /// A sender only ever sits in a single worker's mute map, so the relaxed
    /// counter update cannot race another mutation.
    pub(crate) fn mute(&mut self, sender: &ActorRef, recv: &ActorRef) {
        assert!(
            !Arc::ptr_eq(sender, recv),
            "an actor cannot overload itself"
        );

        let senders = self.mute_map.entry(Actor::key(recv)).or_default();
        if !senders.contains_key(&Actor::key(sender)) {
            senders.insert(Actor::key(sender), Arc::clone(sender));
            sender.mute_inc();
        }
    }

    /// Drop this worker's mute entry for `actor`, rescheduling any sender
    /// whose mute count reached zero. Returns whether the local run queue
    /// gained work.
    pub(crate) fn unmute_senders(&mut self, actor: &ActorRef) -> bool {
        let mut rescheduled = 0usize;

        if let Some(senders) = self.mute_map.remove(&Actor::key(actor)) {
            let mut needs_unmuting = Vec::new();
            for (_, muted) in senders {
                if muted.mute_dec() == 0 {
                    needs_unmuting.push(muted);
                }
            }

            for to_unmute in needs_unmuting {
                if !to_unmute.has_flag(FLAG_UNSCHEDULED) {
                    Actor::notify_unmuted(&to_unmute);
                    self.queue.push(Arc::clone(&to_unmute));
                    rescheduled += 1;
                }
                // the sender may itself be a receiver key in other workers'
                // mute maps; each hop strictly shrinks total map population,
                // so the cascade terminates
                self.core
                    .send_all_active(SchedMsg::UnmuteActor(to_unmute));
            }
        }

        rescheduled > 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
