//! Villein-side handles on remote farms and VMs.
//!
//! A proxy holds the remote's address plus whatever the villein has been
//! told about it; it never caches remote state beyond the last explicit
//! answer. Proxies hash and compare by remote identity so they can key the
//! sets and maps the coordination patterns gather into.
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::{
    binding::{BindingValue, Bindings},
    cloud::{PeerId, Presence},
    error::Fault,
    farm::VmStatus,
    job::{JobId, JobStatus},
    packet::{BindingsOp, Request, Response, VmId},
    villein::Villein,
};

/// The villein's view of one job: the expression it sent and the outcome
/// the farm (or the local deadline) assigned to it.
#[derive(Debug, Clone)]
pub struct JobStruct {
    pub job_id: JobId,
    pub expression: String,
    pub status: JobStatus,
    pub result: Option<BindingValue>,
    pub fault: Option<Fault>,
}

impl JobStruct {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            job_id: JobId::fresh(),
            expression: expression.into(),
            status: JobStatus::Pending,
            result: None,
            fault: None,
        }
    }

    pub fn was_successful(&self) -> bool {
        self.status == JobStatus::Success
    }

    fn resolve(&mut self, status: JobStatus, result: Option<BindingValue>) {
        self.status = status;
        self.result = result;
    }

    fn resolve_fault(&mut self, fault: Fault) {
        self.status = match fault {
            Fault::Timeout => JobStatus::Timeout,
            _ => JobStatus::Error,
        };
        self.fault = Some(fault);
    }
}

/// A handle on a remote farm.
#[derive(Clone)]
pub struct FarmProxy {
    villein: Villein,
    presence: Presence,
}

impl FarmProxy {
    pub(crate) fn new(villein: Villein, presence: Presence) -> Self {
        Self { villein, presence }
    }

    pub fn peer(&self) -> &PeerId {
        &self.presence.peer
    }

    /// The last announcement this proxy was built or refreshed from.
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn free_slots(&self) -> usize {
        self.presence.free_slots
    }

    pub(crate) fn refresh(&mut self, presence: Presence) {
        self.presence = presence;
    }

    /// Ask the farm for a new VM speaking `language`.
    ///
    /// A refusal (capacity, unsupported language) comes back as the farm's
    /// typed fault; a missing or silent farm as a local one.
    pub async fn spawn_vm(&self, language: &str, deadline: Duration) -> Result<VmProxy, Fault> {
        let response = self
            .villein
            .request(
                self.peer(),
                Request::SpawnVm {
                    language: language.to_string(),
                },
                deadline,
            )
            .await?;
        match response {
            Response::VmSpawned { vm_id } => Ok(VmProxy::new(
                self.villein.clone(),
                self.peer().clone(),
                vm_id,
            )),
            Response::Error(fault) => Err(fault),
            other => Err(unexpected(&other)),
        }
    }
}

impl PartialEq for FarmProxy {
    fn eq(&self, other: &Self) -> bool {
        self.presence.peer == other.presence.peer
    }
}

impl Eq for FarmProxy {}

impl std::hash::Hash for FarmProxy {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.presence.peer.hash(state);
    }
}

impl std::fmt::Debug for FarmProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmProxy")
            .field("peer", &self.presence.peer)
            .field("free_slots", &self.presence.free_slots)
            .finish()
    }
}

/// A handle on one VM hosted by a remote farm.
///
/// Carries the optional farm secret to attach to job submissions, and a
/// display-only record of the VM's last observed status.
#[derive(Clone)]
pub struct VmProxy {
    villein: Villein,
    farm: PeerId,
    vm_id: VmId,
    secret: Option<String>,
    last_status: Arc<RwLock<VmStatus>>,
}

impl VmProxy {
    pub(crate) fn new(villein: Villein, farm: PeerId, vm_id: VmId) -> Self {
        Self {
            villein,
            farm,
            vm_id,
            secret: None,
            last_status: Arc::new(RwLock::new(VmStatus::Started)),
        }
    }

    pub fn farm(&self) -> &PeerId {
        &self.farm
    }

    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }

    /// Attach a farm secret to every subsequent job submission.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// The last status observed through this proxy. Informational only.
    pub fn last_status(&self) -> VmStatus {
        match self.last_status.read() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn note_status(&self, status: VmStatus) {
        if let Ok(mut last) = self.last_status.write() {
            *last = status;
        }
    }

    /// Submit `job` for evaluation and wait for its outcome, at most
    /// `deadline` long.
    ///
    /// Never returns an error: every failure mode, including the deadline
    /// elapsing, is recorded inline on the returned job so batch callers
    /// can gather mixed outcomes.
    pub async fn submit_job(&self, mut job: JobStruct, deadline: Duration) -> JobStruct {
        let request = Request::SubmitJob {
            vm_id: self.vm_id.clone(),
            job_id: job.job_id.clone(),
            expression: job.expression.clone(),
            secret: self.secret.clone(),
        };
        match self.villein.request(&self.farm, request, deadline).await {
            Ok(Response::JobOutcome { status, result, .. }) => {
                self.note_status(VmStatus::Idle);
                job.resolve(status, result);
            }
            Ok(Response::Error(fault)) => job.resolve_fault(fault),
            Ok(other) => job.resolve_fault(unexpected(&other)),
            Err(fault) => {
                debug!(vm = %self.vm_id, job = %job.job_id, %fault, "submission unresolved");
                job.resolve_fault(fault);
            }
        }
        job
    }

    /// Look up the current status of a previously submitted job.
    pub async fn ping_job(&self, job_id: &JobId, deadline: Duration) -> Result<JobStatus, Fault> {
        let request = Request::PingJob {
            vm_id: self.vm_id.clone(),
            job_id: Some(job_id.clone()),
        };
        match self.villein.request(&self.farm, request, deadline).await? {
            Response::JobOutcome { status, .. } => Ok(status),
            Response::Error(fault) => Err(fault),
            other => Err(unexpected(&other)),
        }
    }

    /// Ask the farm to abort a job. Best-effort for a running job; a
    /// pending job is removed from the queue.
    pub async fn abort_job(&self, job_id: &JobId, deadline: Duration) -> Result<(), Fault> {
        let request = Request::AbortJob {
            vm_id: self.vm_id.clone(),
            job_id: job_id.clone(),
        };
        match self.villein.request(&self.farm, request, deadline).await? {
            Response::Ack => Ok(()),
            Response::Error(fault) => Err(fault),
            other => Err(unexpected(&other)),
        }
    }

    /// Overwrite the named bindings on the remote VM.
    pub async fn set_bindings(&self, bindings: Bindings, deadline: Duration) -> Result<(), Fault> {
        let request = Request::ManageBindings {
            vm_id: self.vm_id.clone(),
            op: BindingsOp::Set,
            bindings,
        };
        match self.villein.request(&self.farm, request, deadline).await? {
            Response::Ack => Ok(()),
            Response::Error(fault) => Err(fault),
            other => Err(unexpected(&other)),
        }
    }

    /// Read the current values of the named bindings.
    pub async fn get_bindings(
        &self,
        names: impl IntoIterator<Item = String>,
        deadline: Duration,
    ) -> Result<Bindings, Fault> {
        let request = Request::ManageBindings {
            vm_id: self.vm_id.clone(),
            op: BindingsOp::Get,
            bindings: names
                .into_iter()
                .map(|name| (name, BindingValue::Empty))
                .collect(),
        };
        match self.villein.request(&self.farm, request, deadline).await? {
            Response::Bindings { bindings } => Ok(bindings),
            Response::Error(fault) => Err(fault),
            other => Err(unexpected(&other)),
        }
    }

    /// Terminate the VM and wait for the acknowledgement.
    pub async fn terminate(&self, deadline: Duration) -> Result<(), Fault> {
        let request = Request::TerminateVm {
            vm_id: self.vm_id.clone(),
        };
        match self.villein.request(&self.farm, request, deadline).await? {
            Response::Ack => {
                self.note_status(VmStatus::Terminated);
                Ok(())
            }
            Response::Error(fault) => Err(fault),
            other => Err(unexpected(&other)),
        }
    }

    /// Terminate without waiting; used when tearing down a whole batch.
    pub async fn fire_terminate(&self) {
        self.note_status(VmStatus::Terminated);
        self.villein
            .fire(
                &self.farm,
                Request::TerminateVm {
                    vm_id: self.vm_id.clone(),
                },
            )
            .await;
    }
}

impl PartialEq for VmProxy {
    fn eq(&self, other: &Self) -> bool {
        self.farm == other.farm && self.vm_id == other.vm_id
    }
}

impl Eq for VmProxy {}

impl std::hash::Hash for VmProxy {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.farm.hash(state);
        self.vm_id.hash(state);
    }
}

impl std::fmt::Debug for VmProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmProxy")
            .field("farm", &self.farm)
            .field("vm_id", &self.vm_id)
            .finish()
    }
}

/// A response variant the request never provokes from a conforming farm.
fn unexpected(response: &Response) -> Fault {
    Fault::MalformedPacket(format!("unexpected response: {response:?}"))
}
