//! Control messages exchanged between scheduler threads.
//!
//! Every worker owns a single-consumer inbox; any thread may send into it.
//! Messages carry scheduling control only, never actor messages -- those go
//! through the engine's mailboxes.

use crate::actor::ActorRef;

/// A cross-worker control message.
///
/// `Block`, `Unblock` and `Suspend` are only ever addressed to worker 0,
/// which aggregates the block count and drives the quiescence protocol.
#[derive(Clone, Debug)]
pub(crate) enum SchedMsg {
    /// Sender has no work and found none to steal.
    Block,
    /// Sender found work again; cancels any in-flight confirmation round.
    Unblock,
    /// "Are you still blocked?" -- recipient echoes `Ack` with the token.
    Cnf(u32),
    /// Echo of `Cnf`; counted by worker 0 iff the token is current.
    Ack(u32),
    /// Recipient exits its run loop.
    Terminate,
    /// A non-zero worker parked itself; worker 0 re-evaluates quiescence.
    Suspend,
    /// Recipient drains its mute-map entry for this actor.
    UnmuteActor(ActorRef),
    /// The async-I/O subsystem has pending external sources.
    NoisyAsio,
    /// The async-I/O subsystem has no pending external sources.
    UnnoisyAsio,
}
