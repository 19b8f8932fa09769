//! External subsystem seams: async I/O and the cycle detector.
//!
//! The scheduler coordinates with an asynchronous I/O backend during
//! quiescence detection: a backend with pending external sources ("noisy")
//! refuses to stop, which re-arms the confirmation round. Embedders plug a
//! real backend in through [`AsioBackend`]; [`NullAsio`] is the default for
//! programs with no external event sources.

/// Asynchronous I/O backend contract.
///
/// Implementations must be cheap to call from worker 0's steal loop:
/// `stop` is polled while the runtime is deciding whether to terminate.
pub trait AsioBackend: Send + Sync {
    /// One-shot initialization. `cpu` is a core hint when I/O pinning was
    /// requested at scheduler init.
    fn init(&self, cpu: Option<usize>);

    /// Start the backend. Returning `false` aborts scheduler start.
    fn start(&self) -> bool;

    /// Halt the backend. Returning `false` means noisy sources remain and
    /// the runtime must not terminate yet.
    fn stop(&self) -> bool;
}

/// Backend for programs with no external event sources: always starts,
/// always stops.
#[derive(Debug, Default)]
pub struct NullAsio;

impl NullAsio {
    pub fn new() -> Self {
        NullAsio
    }
}

impl AsioBackend for NullAsio {
    fn init(&self, _cpu: Option<usize>) {}

    fn start(&self) -> bool {
        true
    }

    fn stop(&self) -> bool {
        true
    }
}

/// Cycle detector termination hook, invoked exactly once during shutdown
/// after all worker threads have joined.
pub trait CycleDetector: Send + Sync {
    fn terminate(&self);
}
