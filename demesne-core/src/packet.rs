//! Wire protocol types.
//!
//! Every exchange is a single [`Envelope`] carrying either a [`Request`] or
//! a [`Response`]. The correlation id travels unchanged from a request to
//! its response; the villein's correlation layer uses it to resolve the
//! pending slot the request registered. Dispatch on the farm side is a
//! single match over the request kind — one arm per operation.
use serde::{Deserialize, Serialize};

use crate::{
    binding::{BindingValue, Bindings},
    cloud::PeerId,
    error::Fault,
    job::{JobId, JobStatus},
};

/// A VM's identity, unique within its farm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmId(String);

impl VmId {
    pub fn fresh() -> Self {
        Self(crate::fresh_token("vm", 12))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a response to the request that provoked it. Unique per
/// requesting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

/// The management operation a `ManageBindings` request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingsOp {
    /// Read the current values of the named bindings. Strictly
    /// non-mutating; values supplied alongside the names are ignored.
    Get,
    /// Overwrite the named bindings, creating names that do not exist yet.
    Set,
}

/// An inbound request, one variant per farm operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    SpawnVm {
        language: String,
    },
    SubmitJob {
        vm_id: VmId,
        job_id: JobId,
        expression: String,
        secret: Option<String>,
    },
    PingJob {
        vm_id: VmId,
        /// Absent id is answered with [`Fault::MalformedPacket`].
        job_id: Option<JobId>,
    },
    AbortJob {
        vm_id: VmId,
        job_id: JobId,
    },
    ManageBindings {
        vm_id: VmId,
        op: BindingsOp,
        bindings: Bindings,
    },
    TerminateVm {
        vm_id: VmId,
    },
}

impl Request {
    /// The request kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::SpawnVm { .. } => "spawn_vm",
            Request::SubmitJob { .. } => "submit_job",
            Request::PingJob { .. } => "ping_job",
            Request::AbortJob { .. } => "abort_job",
            Request::ManageBindings { .. } => "manage_bindings",
            Request::TerminateVm { .. } => "terminate_vm",
        }
    }
}

/// A farm's answer to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    VmSpawned {
        vm_id: VmId,
    },
    JobOutcome {
        job_id: JobId,
        status: JobStatus,
        result: Option<BindingValue>,
    },
    Bindings {
        bindings: Bindings,
    },
    Ack,
    Error(Fault),
}

/// Either side of an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Request(Request),
    Response(Response),
}

/// One message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The sending peer; responses are delivered back to it.
    pub from: PeerId,
    pub correlation: CorrelationId,
    pub payload: Payload,
}
