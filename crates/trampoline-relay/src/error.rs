//! Internal, programmer-facing faults. These never cross the wire as BOLT-4 messages — they
//! indicate a bug in this crate or in the embedding node, not sender or downstream misbehaviour,
//! and are always logged at `error!` level rather than translated.
//!
//! Kept distinct from the external collaborator traits, which are all infallible from this
//! crate's point of view: every downstream call either succeeds or is idempotently retried by
//! the collaborator itself, so there is no `Result` boundary for these faults to cross.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay instance already dispatched an outgoing payment")]
    AlreadyDispatched,
    #[error("relay instance is terminal and cannot accept further transitions")]
    Terminal,
    #[error("no upstream HTLCs to settle")]
    EmptyUpstreamSet,
}
