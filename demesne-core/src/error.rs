//! The protocol fault taxonomy.
//!
//! Every error a farm can answer with, and every failure marker the villein
//! side can report, is one of these values. Farm-side handlers respond
//! synchronously with a typed [`Fault`] — no error is silently dropped on
//! that side. Villein-side coordination code never raises on a per-branch
//! failure; it records the [`Fault`] inline in the gathered result so the
//! caller can decide whether a partial batch is acceptable.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A protocol-level failure, carried on the wire in error responses.
///
/// [`Fault::Timeout`] is the one member that is never produced by a farm:
/// it is minted villein-side when a caller-supplied deadline elapses before
/// a correlated response arrives.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    /// A required field was missing or unparseable.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// The referenced VM does not exist on the receiving farm.
    #[error("vm not found")]
    VmNotFound,

    /// The referenced job does not exist on the referenced VM.
    #[error("job not found")]
    JobNotFound,

    /// The referenced farm is not known to the messaging layer.
    #[error("farm not found")]
    FarmNotFound,

    /// The farm is already hosting its maximum number of live VMs.
    #[error("farm capacity exceeded")]
    CapacityExceeded,

    /// A farm secret was supplied and did not match.
    #[error("wrong farm secret")]
    WrongSecret,

    /// The evaluation engine rejected or failed on the expression.
    #[error("evaluation error: {0}")]
    EvaluationError(String),

    /// No response arrived within the caller's deadline.
    #[error("timed out waiting for a response")]
    Timeout,
}

impl Fault {
    /// Whether this fault was produced by the coordination layer rather
    /// than by the remote farm.
    pub fn is_local(&self) -> bool {
        matches!(self, Fault::Timeout | Fault::FarmNotFound)
    }
}
