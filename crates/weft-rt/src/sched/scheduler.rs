//! Global scheduler state and lifecycle.
//!
//! One [`Core`] record exists per scheduler instance. Everything a worker
//! shares with its peers lives here: the stealer halves of the run queues,
//! the inbox senders, the sleep objects, the global inject queue and the
//! active-count interlock. External threads attach to the record through
//! [`ExternalCtx`] rather than process-wide statics, so multiple scheduler
//! instances can coexist in one process.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as LocalQueue};
use crossbeam_utils::CachePadded;
use log::debug;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::actor::ActorRef;

use super::asio::{AsioBackend, CycleDetector, NullAsio};
use super::cpu;
use super::msg::SchedMsg;
use super::worker::Worker;

/// Scheduler initialization parameters.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Worker thread count; 0 means one per schedulable core.
    pub threads: usize,
    /// Use pause hints instead of yielding to the OS in the steal backoff.
    pub noyield: bool,
    /// Skip pinning worker threads to cores.
    pub nopin: bool,
    /// Pin the async-I/O subsystem to its own core.
    pub pinasio: bool,
    /// Floor for the active worker count; capped at `threads`.
    pub min_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            threads: 0,
            noyield: false,
            nopin: false,
            pinasio: false,
            min_threads: 0,
        }
    }
}

/// Failure starting the scheduler, surfaced to the embedder.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("async-I/O backend refused to start")]
    AsioStart,
    #[error("failed to spawn a scheduler thread: {0}")]
    Thread(#[from] io::Error),
}

/// The parts of a worker its peers may touch: steal from its queue, send to
/// its inbox, signal its sleep object. Padded to keep neighbouring workers
/// off each other's cache lines.
pub(crate) struct WorkerShared {
    pub(crate) stealer: Stealer<ActorRef>,
    pub(crate) inbox: Sender<SchedMsg>,
    pub(crate) sleep: Condvar,
    pub(crate) cpu: Option<core_affinity::CoreId>,
}

/// Global scheduler record, shared by all workers of one instance.
pub(crate) struct Core {
    pub(crate) workers: Vec<CachePadded<WorkerShared>>,

    /// Global queue for actors scheduled from threads without a worker.
    pub(crate) inject: Injector<ActorRef>,

    /// Number of workers currently permitted to run. A worker at index `i`
    /// runs only while `active > i`; suspended workers are exactly the
    /// indices at or above it. Writes happen under `count_lock`.
    pub(crate) active: AtomicU32,

    /// Floor below which the active count is never reduced.
    pub(crate) min_active: u32,

    /// When false (library embedding), termination is never initiated.
    pub(crate) detect_quiescence: AtomicBool,

    /// Interlock serializing every mutation of `active`. Sleep condvars
    /// pair with this mutex; a suspending worker holds it across the wait.
    pub(crate) count_lock: Mutex<()>,

    pub(crate) use_yield: bool,
    pub(crate) asio: Box<dyn AsioBackend>,
    pub(crate) asio_cpu: Option<usize>,
    pub(crate) cycle: Option<Box<dyn CycleDetector>>,
}

impl Core {
    pub(crate) fn worker_count(&self) -> u32 {
        self.workers.len() as u32
    }

    pub(crate) fn active_count(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn send(&self, to: usize, msg: SchedMsg) {
        // A send can only fail once the recipient has exited and dropped its
        // inbox, at which point the message no longer matters.
        let _ = self.workers[to].inbox.send(msg);
    }

    pub(crate) fn send_all_active(&self, msg: SchedMsg) {
        for to in 0..self.active_count() as usize {
            self.send(to, msg.clone());
        }
    }

    pub(crate) fn send_all(&self, msg: SchedMsg) {
        for to in 0..self.workers.len() {
            self.send(to, msg.clone());
        }
    }

    /// Pop from the inject queue, batching spillover into `local`.
    pub(crate) fn inject_pop(&self, local: &LocalQueue<ActorRef>) -> Option<ActorRef> {
        loop {
            match self.inject.steal_batch_and_pop(local) {
                Steal::Success(actor) => return Some(actor),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Pop a single actor from the inject queue without touching any local
    /// queue. Used by worker 0's pre-park check.
    pub(crate) fn inject_pop_one(&self) -> Option<ActorRef> {
        loop {
            match self.inject.steal() {
                Steal::Success(actor) => return Some(actor),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Steal-pop from a victim's local queue.
    pub(crate) fn steal_from(&self, victim: usize) -> Option<ActorRef> {
        loop {
            match self.workers[victim].stealer.steal() {
                Steal::Success(actor) => return Some(actor),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Signal every worker below `upto` except the caller, three times over.
    /// Redundant signals are cheap; a missed one could strand a worker that
    /// raced its active-count check against the park.
    pub(crate) fn ping_sleeping(&self, upto: u32, current: i32) {
        for _ in 0..3 {
            for i in 0..upto as usize {
                if i as i32 != current {
                    self.workers[i].sleep.notify_one();
                }
            }
        }
    }

    /// Wake one additional worker if any are suspended.
    pub(crate) fn maybe_wakeup(&self, current: i32) {
        let count = self.worker_count();
        if self.active_count() < count {
            if let Some(guard) = self.count_lock.try_lock() {
                // the count may have changed between the check and the lock
                let mut active = self.active_count();
                if active < count {
                    active += 1;
                    self.active.store(active, Ordering::Relaxed);
                }
                drop(guard);
                self.ping_sleeping(active, current);
            }
        }
    }

    /// Keep attempting wakeups while the entire pool is parked.
    pub(crate) fn maybe_wakeup_if_all_asleep(&self, current: i32) {
        while self.active_count() == 0 {
            self.maybe_wakeup(current);
        }
    }

    /// Raise the active count to the full pool and signal everyone. Used on
    /// termination broadcast.
    pub(crate) fn wake_suspended(&self, current: i32) {
        let count = self.worker_count();
        while self.active_count() < count {
            let guard = self.count_lock.lock();
            if self.active_count() < count {
                self.active.store(count, Ordering::Relaxed);
            }
            drop(guard);
            self.ping_sleeping(count, current);
        }
    }

    /// Wake path for the inject queue: recover a fully parked pool, then
    /// invite one more worker for the new work.
    pub(crate) fn wake_for_inject(&self, current: i32) {
        self.maybe_wakeup_if_all_asleep(current);
        self.maybe_wakeup(current);
    }
}

/// Handle owning one scheduler instance.
///
/// Workers are allocated once at construction and joined at shutdown;
/// suspension is logical (parking on the sleep object), never teardown.
pub struct Scheduler {
    pub(crate) core: Arc<Core>,
    pub(crate) slots: Mutex<Vec<Option<Worker>>>,
    pub(crate) handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler with the default (null) async-I/O backend and no
    /// cycle detector.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_hooks(config, Box::new(NullAsio::new()), None)
    }

    /// Build a scheduler around external subsystems.
    pub fn with_hooks(
        config: SchedulerConfig,
        asio: Box<dyn AsioBackend>,
        cycle: Option<Box<dyn CycleDetector>>,
    ) -> Self {
        let threads = if config.threads == 0 {
            cpu::count()
        } else {
            config.threads
        };
        let min_active = config.min_threads.min(threads) as u32;
        let (cpus, asio_cpu) = cpu::assign(threads, config.nopin, config.pinasio);

        let mut shared = Vec::with_capacity(threads);
        let mut owned = Vec::with_capacity(threads);
        for cpu in cpus {
            let queue = LocalQueue::new_fifo();
            let (tx, rx) = crossbeam_channel::unbounded();
            shared.push(CachePadded::new(WorkerShared {
                stealer: queue.stealer(),
                inbox: tx,
                sleep: Condvar::new(),
                cpu,
            }));
            owned.push((queue, rx));
        }

        let core = Arc::new(Core {
            workers: shared,
            inject: Injector::new(),
            active: AtomicU32::new(threads as u32),
            min_active,
            detect_quiescence: AtomicBool::new(false),
            count_lock: Mutex::new(()),
            use_yield: !config.noyield,
            asio,
            asio_cpu,
            cycle,
        });
        core.asio.init(asio_cpu);

        let slots = owned
            .into_iter()
            .enumerate()
            .map(|(index, (queue, inbox))| Some(Worker::new(Arc::clone(&core), index, queue, inbox)))
            .collect();

        Scheduler {
            core,
            slots: Mutex::new(slots),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker threads.
    ///
    /// With `library == false` the runtime owns the program: quiescence
    /// detection is enabled and the call blocks until the program terminates.
    /// With `library == true` the call returns immediately and termination is
    /// initiated later by [`stop`](Self::stop).
    pub fn start(&self, library: bool) -> Result<(), StartError> {
        if !self.core.asio.start() {
            return Err(StartError::AsioStart);
        }
        self.core
            .detect_quiescence
            .store(!library, Ordering::Relaxed);

        {
            let mut slots = self.slots.lock();
            let mut handles = self.handles.lock();
            debug!("starting {} scheduler threads", slots.len());
            for index in 0..slots.len() {
                let worker = slots[index].take().expect("scheduler already started");
                let handle = std::thread::Builder::new()
                    .name(format!("weft-sched-{index}"))
                    .spawn(move || worker.run_thread())?;
                handles.push(handle);
            }
        }

        if !library {
            self.join_workers();
        }
        Ok(())
    }

    /// Force quiescence detection on and block until the runtime terminates.
    pub fn stop(&self) {
        self.core.detect_quiescence.store(true, Ordering::Relaxed);
        // Every worker may have announced itself blocked while detection was
        // still off; nudge worker 0 into re-evaluating the block count and
        // make sure it is awake to do so.
        self.core.send(0, SchedMsg::Suspend);
        self.core.maybe_wakeup_if_all_asleep(-1);
        self.core.maybe_wakeup(-1);
        self.join_workers();
    }

    fn join_workers(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(cycle) = &self.core.cycle {
            cycle.terminate();
        }
        debug!("scheduler threads joined");
    }

    /// Schedule an actor from outside any worker thread: push it on the
    /// inject queue and wake a worker for it.
    pub fn schedule(&self, actor: ActorRef) {
        self.core.inject.push(actor);
        self.core.wake_for_inject(-1);
    }

    /// Attach the calling thread to this scheduler so it may inject work.
    /// Dropping the context unregisters the thread.
    pub fn register_thread(&self) -> ExternalCtx {
        ExternalCtx {
            core: Arc::clone(&self.core),
        }
    }

    /// Tell every worker the async-I/O subsystem has pending external
    /// sources.
    pub fn noisy_asio(&self) {
        self.core.send_all(SchedMsg::NoisyAsio);
    }

    /// Tell every worker the async-I/O subsystem has no pending external
    /// sources.
    pub fn unnoisy_asio(&self) {
        self.core.send_all(SchedMsg::UnnoisyAsio);
    }

    /// Total worker count.
    pub fn cores(&self) -> usize {
        self.core.workers.len()
    }

    /// Number of workers currently permitted to run.
    pub fn active_count(&self) -> u32 {
        self.core.active_count()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("cores", &self.core.workers.len())
            .field("active", &self.core.active_count())
            .field("min_active", &self.core.min_active)
            .finish()
    }
}

/// Context for a thread that does not own a worker. Holds the scheduler
/// record, not a thread-local, so several scheduler instances can be driven
/// from one thread.
pub struct ExternalCtx {
    core: Arc<Core>,
}

impl ExternalCtx {
    /// Schedule an actor through the inject queue.
    pub fn schedule(&self, actor: ActorRef) {
        self.core.inject.push(actor);
        self.core.wake_for_inject(-1);
    }

    /// Externally registered threads have no worker index.
    pub fn index(&self) -> i32 {
        -1
    }

    pub fn active_count(&self) -> u32 {
        self.core.active_count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorBody, ActorRef};
    use crate::sched::SchedCtx;

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config(threads: usize, min_threads: usize) -> SchedulerConfig {
        SchedulerConfig {
            threads,
            min_threads,
            nopin: true,
            ..SchedulerConfig::default()
        }
    }

    /// Stable thread identifier using Hash of ThreadId.
    fn thread_id_hash() -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish()
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    /// Runs `reschedules + 1` times, recording every run.
    struct CountingBody {
        runs: Arc<AtomicU64>,
        threads_seen: Arc<parking_lot::Mutex<HashSet<u64>>>,
        reschedules: u32,
    }

    impl ActorBody for CountingBody {
        fn run(&mut self, _ctx: &mut SchedCtx<'_>, _me: &ActorRef, _batch: u32) -> bool {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.threads_seen.lock().insert(thread_id_hash());
            if self.reschedules == 0 {
                false
            } else {
                self.reschedules -= 1;
                true
            }
        }
    }

    /// Reschedules forever until the stop flag is raised.
    struct LooperBody {
        stop: Arc<AtomicBool>,
        runs: Arc<AtomicU64>,
    }

    impl ActorBody for LooperBody {
        fn run(&mut self, _ctx: &mut SchedCtx<'_>, _me: &ActorRef, _batch: u32) -> bool {
            self.runs.fetch_add(1, Ordering::SeqCst);
            !self.stop.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_trivial_quiescence() {
        init_logging();
        let sched = Scheduler::new(config(2, 1));
        sched.start(false).unwrap();
        // all threads joined; the handle reports the full pool as woken by
        // the termination broadcast
        assert_eq!(sched.cores(), 2);
    }

    #[test]
    fn test_single_actor_completes() {
        init_logging();
        let runs = Arc::new(AtomicU64::new(0));
        let threads_seen = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let sched = Scheduler::new(config(2, 1));
        sched.schedule(Actor::new(CountingBody {
            runs: Arc::clone(&runs),
            threads_seen: Arc::clone(&threads_seen),
            reschedules: 0,
        }));
        sched.start(false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_steal_distributes_across_threads() {
        init_logging();
        let num_actors: u64 = 1000;
        let runs_each: u64 = 6;

        let runs = Arc::new(AtomicU64::new(0));
        let threads_seen = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        // min_threads == threads disables downsizing for the whole run
        let sched = Scheduler::new(config(4, 4));
        for _ in 0..num_actors {
            sched.schedule(Actor::new(CountingBody {
                runs: Arc::clone(&runs),
                threads_seen: Arc::clone(&threads_seen),
                reschedules: (runs_each - 1) as u32,
            }));
        }
        sched.start(false).unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), num_actors * runs_each);
        // work stealing is best-effort; require spread, not balance
        let seen = threads_seen.lock();
        assert!(
            seen.len() >= 2,
            "expected work on at least 2 threads, got {}",
            seen.len()
        );
    }

    #[test]
    fn test_min_threads_equals_threads() {
        init_logging();
        let runs = Arc::new(AtomicU64::new(0));
        let threads_seen = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let sched = Scheduler::new(config(2, 2));
        for _ in 0..10 {
            sched.schedule(Actor::new(CountingBody {
                runs: Arc::clone(&runs),
                threads_seen: Arc::clone(&threads_seen),
                reschedules: 0,
            }));
        }
        sched.start(false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_single_thread_quiesces() {
        init_logging();
        let runs = Arc::new(AtomicU64::new(0));
        let threads_seen = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let sched = Scheduler::new(config(1, 1));
        sched.schedule(Actor::new(CountingBody {
            runs: Arc::clone(&runs),
            threads_seen: Arc::clone(&threads_seen),
            reschedules: 3,
        }));
        sched.start(false).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_library_mode_stops_on_demand() {
        init_logging();
        let runs = Arc::new(AtomicU64::new(0));
        let threads_seen = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let sched = Scheduler::new(config(2, 1));
        sched.start(true).unwrap();

        sched.schedule(Actor::new(CountingBody {
            runs: Arc::clone(&runs),
            threads_seen: Arc::clone(&threads_seen),
            reschedules: 0,
        }));
        assert!(wait_until(Duration::from_secs(10), || {
            runs.load(Ordering::SeqCst) == 1
        }));

        // workers are idle but the runtime must not have terminated
        sched.stop();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mute_unmute_roundtrip() {
        init_logging();

        /// Overloads the receiver on its first run, then records completion
        /// once the unmute brings it back.
        struct SenderBody {
            recv: ActorRef,
            done: Arc<AtomicU64>,
            sent: bool,
        }
        impl ActorBody for SenderBody {
            fn run(&mut self, ctx: &mut SchedCtx<'_>, me: &ActorRef, _batch: u32) -> bool {
                if !self.sent {
                    self.sent = true;
                    ctx.mute(me, &self.recv);
                } else {
                    self.done.fetch_add(1, Ordering::SeqCst);
                }
                false
            }
        }

        /// Drains immediately and lifts the backpressure.
        struct ReceiverBody {
            sender_slot: Arc<parking_lot::Mutex<Option<ActorRef>>>,
            observed_muted: Arc<AtomicU64>,
        }
        impl ActorBody for ReceiverBody {
            fn run(&mut self, ctx: &mut SchedCtx<'_>, me: &ActorRef, _batch: u32) -> bool {
                if let Some(sender) = self.sender_slot.lock().as_ref() {
                    self.observed_muted
                        .store(sender.muted(), Ordering::SeqCst);
                }
                ctx.start_global_unmute(me);
                false
            }
        }

        let sender_slot = Arc::new(parking_lot::Mutex::new(None));
        let observed_muted = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicU64::new(0));

        let recv = Actor::new(ReceiverBody {
            sender_slot: Arc::clone(&sender_slot),
            observed_muted: Arc::clone(&observed_muted),
        });
        let sender = Actor::new(SenderBody {
            recv: Arc::clone(&recv),
            done: Arc::clone(&done),
            sent: false,
        });
        *sender_slot.lock() = Some(Arc::clone(&sender));

        // one worker makes the interleaving deterministic: sender mutes,
        // receiver drains and broadcasts, sender is rescheduled and finishes
        let sched = Scheduler::new(config(1, 1));
        sched.schedule(Arc::clone(&sender));
        sched.schedule(Arc::clone(&recv));
        sched.start(false).unwrap();

        assert_eq!(observed_muted.load(Ordering::SeqCst), 1);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(sender.muted(), 0);
    }

    #[test]
    fn test_dynamic_shrink_then_wake_on_inject() {
        init_logging();
        let stop = Arc::new(AtomicBool::new(false));
        let runs_a = Arc::new(AtomicU64::new(0));
        let runs_b = Arc::new(AtomicU64::new(0));

        let sched = Scheduler::new(config(4, 1));
        sched.schedule(Actor::new(LooperBody {
            stop: Arc::clone(&stop),
            runs: Arc::clone(&runs_a),
        }));
        sched.start(true).unwrap();

        // one looping actor cannot keep four workers busy; the pool shrinks
        // to the floor with the idle three parked
        assert!(
            wait_until(Duration::from_secs(10), || sched.active_count() == 1),
            "active count stayed at {}",
            sched.active_count()
        );

        // a new actor injected from a registered external thread raises the
        // active count and resumes a parked worker
        let ctx = sched.register_thread();
        assert_eq!(ctx.index(), -1);
        ctx.schedule(Actor::new(LooperBody {
            stop: Arc::clone(&stop),
            runs: Arc::clone(&runs_b),
        }));
        assert!(
            wait_until(Duration::from_secs(5), || sched.active_count() >= 2),
            "no worker resumed for injected work"
        );
        assert!(wait_until(Duration::from_secs(10), || {
            runs_b.load(Ordering::SeqCst) > 0
        }));

        stop.store(true, Ordering::SeqCst);
        sched.stop();
        assert!(runs_a.load(Ordering::SeqCst) > 0);
        assert!(runs_b.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_cycle_detector_runs_once_at_shutdown() {
        init_logging();
        struct Recorder(Arc<AtomicU64>);
        impl CycleDetector for Recorder {
            fn terminate(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let calls = Arc::new(AtomicU64::new(0));
        let sched = Scheduler::with_hooks(
            config(2, 1),
            Box::new(NullAsio::new()),
            Some(Box::new(Recorder(Arc::clone(&calls)))),
        );
        sched.start(false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // a later stop() finds no threads to join and must not re-run it
        sched.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refusing_asio_fails_start() {
        struct RefusingAsio;
        impl AsioBackend for RefusingAsio {
            fn init(&self, _cpu: Option<usize>) {}
            fn start(&self) -> bool {
                false
            }
            fn stop(&self) -> bool {
                true
            }
        }

        let sched = Scheduler::with_hooks(config(1, 1), Box::new(RefusingAsio), None);
        assert!(matches!(sched.start(false), Err(StartError::AsioStart)));
    }

    #[test]
    fn test_config_resolves_thread_count() {
        let sched = Scheduler::new(SchedulerConfig {
            threads: 0,
            nopin: true,
            ..SchedulerConfig::default()
        });
        assert!(sched.cores() >= 1);
        assert_eq!(sched.active_count() as usize, sched.cores());

        // min_threads is clamped to the thread count
        let sched = Scheduler::new(config(2, 8));
        assert_eq!(sched.core.min_active, 2);
    }
}
