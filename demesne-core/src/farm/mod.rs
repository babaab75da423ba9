//! The farm: dispatcher and lifecycle authority for a bounded pool of VMs.
//!
//! A [`Farm`] owns its VMs outright — arena-style, the map entry is the VM —
//! and turns every inbound request packet into a checked mutation of VM and
//! job state. Correctness checks (lookup validity, capacity, authorization)
//! run before any side effect; every external request is answered
//! synchronously with a typed result or [`Fault`].
//!
//! # Concurrency
//!
//! Each inbound packet is handled on its own task. The VM map is guarded by
//! a read-mostly [`RwLock`]; each VM sits behind its own [`Mutex`], so an
//! evaluation blocks further requests against that VM (jobs within one VM
//! execute in submission order) but never other VMs or the farm's
//! administrative operations. Evaluations run on the blocking thread pool,
//! never on a runtime worker. Abort signals for running jobs live outside
//! the VM locks, so an abort request can reach a busy VM.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, instrument, Instrument};

use crate::{
    binding::Bindings,
    cloud::{Cloud, PeerId, PeerKind, Presence},
    config::Config,
    engine::{AbortSignal, EngineRegistry},
    error::Fault,
    job::{Job, JobId},
    packet::{BindingsOp, Envelope, Payload, Request, Response, VmId},
};

pub mod vm;

pub use vm::{Vm, VmStatus};

/// Host process managing a bounded pool of VMs.
///
/// Cheaply cloneable; clones share the same state. The farm announces its
/// availability on the presence feed whenever it starts and whenever a VM
/// is spawned or terminated.
#[derive(Clone)]
pub struct Farm {
    inner: Arc<FarmInner>,
}

struct FarmInner {
    id: PeerId,
    secret: Option<String>,
    capacity: usize,
    engines: EngineRegistry,
    cloud: Arc<dyn Cloud>,
    vms: RwLock<HashMap<VmId, Arc<Mutex<Vm>>>>,
    /// Abort signals of currently running jobs, reachable without the
    /// owning VM's lock.
    running: DashMap<JobId, AbortSignal>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Farm {
    /// Bind a fresh farm to the cloud, announce it, and start serving
    /// inbound packets.
    pub async fn start(
        cloud: Arc<dyn Cloud>,
        config: &Config,
        engines: EngineRegistry,
    ) -> Result<Self> {
        let id = PeerId::fresh("farm");
        let inbox = cloud.bind(&id).await?;

        let farm = Self {
            inner: Arc::new(FarmInner {
                id,
                secret: config.farm_secret.clone(),
                capacity: config.vm_capacity,
                engines,
                cloud,
                vms: RwLock::new(HashMap::new()),
                running: DashMap::new(),
                listener: std::sync::Mutex::new(None),
            }),
        };

        farm.announce_availability().await;

        // The listener holds only a weak handle so dropping the last `Farm`
        // clone tears the loop down via `FarmInner::drop`.
        let weak = Arc::downgrade(&farm.inner);
        let handle = tokio::spawn(Self::serve(weak, inbox));
        if let Ok(mut listener) = farm.inner.listener.lock() {
            *listener = Some(handle);
        }

        Ok(farm)
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of live VMs.
    pub async fn vm_count(&self) -> usize {
        self.inner.vms.read().await.len()
    }

    async fn serve(inner: std::sync::Weak<FarmInner>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        // One logical task per inbound packet; per-VM locks do the
        // serialization.
        while let Some(envelope) = inbox.recv().await {
            let Some(inner) = inner.upgrade() else { break };
            let farm = Farm { inner };
            tokio::spawn(async move { farm.handle_envelope(envelope).await });
        }
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let Payload::Request(request) = envelope.payload else {
            debug!(from = %envelope.from, "discarding non-request packet");
            return;
        };

        let span = debug_span!("dispatch", kind = request.kind(), from = %envelope.from);
        let response = self.dispatch(request).instrument(span).await;

        let reply = Envelope {
            from: self.inner.id.clone(),
            correlation: envelope.correlation,
            payload: Payload::Response(response),
        };
        if let Err(e) = self.inner.cloud.deliver(&envelope.from, reply).await {
            error!(to = %envelope.from, "failed to deliver response: {e}");
        }
    }

    /// Turn one request into one response. A single match, one arm per
    /// operation; faults become typed error responses.
    #[instrument(skip_all, fields(kind = request.kind()), level = "debug")]
    pub async fn dispatch(&self, request: Request) -> Response {
        let result = match request {
            Request::SpawnVm { language } => {
                self.spawn_vm(&language)
                    .await
                    .map(|vm_id| Response::VmSpawned { vm_id })
            }
            Request::SubmitJob {
                vm_id,
                job_id,
                expression,
                secret,
            } => self.submit_job(&vm_id, job_id, expression, secret).await,
            Request::PingJob { vm_id, job_id } => self.ping_job(&vm_id, job_id).await,
            Request::AbortJob { vm_id, job_id } => {
                self.abort_job(&vm_id, &job_id).await.map(|()| Response::Ack)
            }
            Request::ManageBindings {
                vm_id,
                op,
                bindings,
            } => self.manage_bindings(&vm_id, op, bindings).await,
            // An externally requested termination is acknowledged; the
            // administrative path (`Farm::terminate_vm`) stays silent.
            Request::TerminateVm { vm_id } => {
                self.terminate_vm(&vm_id).await.map(|()| Response::Ack)
            }
        };

        result.unwrap_or_else(Response::Error)
    }

    /// Create a VM if capacity allows, and advertise the updated
    /// availability.
    pub async fn spawn_vm(&self, language: &str) -> Result<VmId, Fault> {
        let engine = self.inner.engines.get(language).ok_or_else(|| {
            Fault::EvaluationError(format!("no engine for language '{language}'"))
        })?;

        let vm_id = {
            let mut vms = self.inner.vms.write().await;
            if vms.len() >= self.inner.capacity {
                return Err(Fault::CapacityExceeded);
            }
            let vm_id = VmId::fresh();
            let vm = Vm::new(vm_id.clone(), language, engine);
            vms.insert(vm_id.clone(), Arc::new(Mutex::new(vm)));
            vm_id
        };

        debug!(%vm_id, language, "vm spawned");
        self.announce_availability().await;
        Ok(vm_id)
    }

    async fn submit_job(
        &self,
        vm_id: &VmId,
        job_id: JobId,
        expression: String,
        secret: Option<String>,
    ) -> Result<Response, Fault> {
        // Authorization before any side effect. A submission carrying no
        // secret is admitted; one carrying a mismatched secret is refused.
        if let (Some(expected), Some(given)) = (&self.inner.secret, &secret) {
            if expected != given {
                return Err(Fault::WrongSecret);
            }
        }

        let vm = self.vm(vm_id).await?;
        let mut vm = vm.lock().await;
        if vm.status() == VmStatus::Terminated {
            return Err(Fault::VmNotFound);
        }

        vm.enqueue(Job::new(job_id.clone(), expression));

        let abort = AbortSignal::new();
        self.inner.running.insert(job_id.clone(), abort.clone());
        vm.run_next(&abort).await;
        self.inner.running.remove(&job_id);

        let job = vm.job(&job_id).ok_or(Fault::JobNotFound)?;
        match job.error() {
            Some(fault) => Err(fault.clone()),
            None => Ok(Response::JobOutcome {
                job_id,
                status: job.status(),
                result: job.result().cloned(),
            }),
        }
    }

    async fn ping_job(&self, vm_id: &VmId, job_id: Option<JobId>) -> Result<Response, Fault> {
        let job_id =
            job_id.ok_or_else(|| Fault::MalformedPacket("ping without a job id".into()))?;

        let vm = self.vm(vm_id).await?;
        let vm = vm.lock().await;
        let job = vm.job(&job_id).ok_or(Fault::JobNotFound)?;
        Ok(Response::JobOutcome {
            job_id,
            status: job.status(),
            result: job.result().cloned(),
        })
    }

    /// Best-effort abort: a running job is signalled without touching the
    /// (held) VM lock; a pending job is flipped directly.
    async fn abort_job(&self, vm_id: &VmId, job_id: &JobId) -> Result<(), Fault> {
        // Existence check first, without waiting on the VM's own lock.
        {
            let vms = self.inner.vms.read().await;
            if !vms.contains_key(vm_id) {
                return Err(Fault::VmNotFound);
            }
        }

        if let Some(abort) = self.inner.running.get(job_id) {
            abort.cancel();
            return Ok(());
        }

        let vm = self.vm(vm_id).await?;
        let mut vm = vm.lock().await;
        if vm.abort_pending(job_id) {
            Ok(())
        } else {
            // Terminal or unknown: nothing left to abort.
            Err(Fault::JobNotFound)
        }
    }

    async fn manage_bindings(
        &self,
        vm_id: &VmId,
        op: BindingsOp,
        supplied: Bindings,
    ) -> Result<Response, Fault> {
        let vm = self.vm(vm_id).await?;
        let mut vm = vm.lock().await;
        if vm.status() == VmStatus::Terminated {
            return Err(Fault::VmNotFound);
        }

        match op {
            // Strictly a query: supplied values are ignored, absent names
            // read as empty.
            BindingsOp::Get => {
                let bindings = supplied
                    .names()
                    .map(|name| (name.to_string(), vm.bindings().get(name)))
                    .collect();
                Ok(Response::Bindings { bindings })
            }
            BindingsOp::Set => {
                vm.bindings_mut().merge(supplied);
                Ok(Response::Ack)
            }
        }
    }

    /// Remove a VM, discarding its queue and bindings. Administrative
    /// termination: emits no outward packet. The dispatcher wraps this same
    /// path in an acknowledgment for externally requested terminations.
    pub async fn terminate_vm(&self, vm_id: &VmId) -> Result<(), Fault> {
        let vm = {
            let mut vms = self.inner.vms.write().await;
            vms.remove(vm_id).ok_or(Fault::VmNotFound)?
        };
        vm.lock().await.terminate();

        debug!(%vm_id, "vm terminated");
        self.announce_availability().await;
        Ok(())
    }

    async fn vm(&self, vm_id: &VmId) -> Result<Arc<Mutex<Vm>>, Fault> {
        let vms = self.inner.vms.read().await;
        vms.get(vm_id).cloned().ok_or(Fault::VmNotFound)
    }

    async fn announce_availability(&self) {
        let live = self.inner.vms.read().await.len();
        let free_slots = self.inner.capacity.saturating_sub(live);
        self.inner.cloud.announce(Presence {
            peer: self.inner.id.clone(),
            kind: PeerKind::Farm,
            available: free_slots > 0,
            free_slots,
        });
    }
}

impl Drop for FarmInner {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding::BindingValue,
        cloud::InMemoryCloud,
        job::JobStatus,
        packet::CorrelationId,
    };

    async fn farm() -> (Farm, Arc<InMemoryCloud>) {
        let cloud = Arc::new(InMemoryCloud::default());
        let farm = Farm::start(cloud.clone(), &Config::default(), EngineRegistry::with_defaults())
            .await
            .unwrap();
        (farm, cloud)
    }

    async fn farm_with(config: Config) -> Farm {
        let cloud = Arc::new(InMemoryCloud::default());
        Farm::start(cloud, &config, EngineRegistry::with_defaults())
            .await
            .unwrap()
    }

    fn submit(vm_id: &VmId, expression: &str) -> Request {
        Request::SubmitJob {
            vm_id: vm_id.clone(),
            job_id: JobId::fresh(),
            expression: expression.into(),
            secret: None,
        }
    }

    #[tokio::test]
    async fn submit_evaluates_and_answers_result() {
        let (farm, _) = farm().await;
        let vm_id = farm.spawn_vm("calc").await.unwrap();

        match farm.dispatch(submit(&vm_id, "20 + 52;")).await {
            Response::JobOutcome { status, result, .. } => {
                assert_eq!(status, JobStatus::Success);
                assert_eq!(result.unwrap().to_string(), "72");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_expression_faults_but_vm_survives() {
        let (farm, _) = farm().await;
        let vm_id = farm.spawn_vm("calc").await.unwrap();

        match farm.dispatch(submit(&vm_id, "buh+2sdf;==")).await {
            Response::Error(Fault::EvaluationError(_)) => {}
            other => panic!("unexpected response: {other:?}"),
        }

        // The VM is still usable for subsequent jobs.
        match farm.dispatch(submit(&vm_id, "1 + 1")).await {
            Response::JobOutcome { status, .. } => assert_eq!(status, JobStatus::Success),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_distinguishes_malformed_from_unknown() {
        let (farm, _) = farm().await;
        let vm_id = farm.spawn_vm("calc").await.unwrap();

        let missing_id = Request::PingJob {
            vm_id: vm_id.clone(),
            job_id: None,
        };
        match farm.dispatch(missing_id).await {
            Response::Error(Fault::MalformedPacket(_)) => {}
            other => panic!("unexpected response: {other:?}"),
        }

        let unknown = Request::PingJob {
            vm_id,
            job_id: Some(JobId::new("test")),
        };
        match farm.dispatch(unknown).await {
            Response::Error(Fault::JobNotFound) => {}
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminate_removes_vm_and_poisons_its_id() {
        let (farm, _) = farm().await;
        let vm_id = farm.spawn_vm("calc").await.unwrap();
        let before = farm.vm_count().await;

        match farm.dispatch(Request::TerminateVm { vm_id: vm_id.clone() }).await {
            Response::Ack => {}
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(farm.vm_count().await, before - 1);

        match farm.dispatch(submit(&vm_id, "1")).await {
            Response::Error(Fault::VmNotFound) => {}
            other => panic!("unexpected response: {other:?}"),
        }
        match farm.dispatch(Request::TerminateVm { vm_id }).await {
            Response::Error(Fault::VmNotFound) => {}
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn binding_mutations_from_jobs_are_visible_to_get() {
        let (farm, _) = farm().await;
        let vm_id = farm.spawn_vm("calc").await.unwrap();

        let mut initial = Bindings::new();
        initial.set("name", BindingValue::Str("Peter".into()));
        let set = Request::ManageBindings {
            vm_id: vm_id.clone(),
            op: BindingsOp::Set,
            bindings: initial,
        };
        assert!(matches!(farm.dispatch(set).await, Response::Ack));

        match farm
            .dispatch(submit(&vm_id, "full_name = name + ' the Ploughman'"))
            .await
        {
            Response::JobOutcome { status, .. } => assert_eq!(status, JobStatus::Success),
            other => panic!("unexpected response: {other:?}"),
        }

        // Get is strictly non-mutating; the supplied value must be ignored.
        let mut query = Bindings::new();
        query.set("full_name", BindingValue::Str("ignored".into()));
        let get = Request::ManageBindings {
            vm_id: vm_id.clone(),
            op: BindingsOp::Get,
            bindings: query,
        };
        match farm.dispatch(get).await {
            Response::Bindings { bindings } => {
                assert_eq!(
                    bindings.get("full_name"),
                    BindingValue::Str("Peter the Ploughman".into())
                );
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_on_absent_name_is_empty_not_an_error() {
        let (farm, _) = farm().await;
        let vm_id = farm.spawn_vm("calc").await.unwrap();

        let mut query = Bindings::new();
        query.set("nobody", BindingValue::Empty);
        let get = Request::ManageBindings {
            vm_id,
            op: BindingsOp::Get,
            bindings: query,
        };
        match farm.dispatch(get).await {
            Response::Bindings { bindings } => {
                assert_eq!(bindings.get("nobody"), BindingValue::Empty)
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let farm = farm_with(Config {
            vm_capacity: 2,
            ..Default::default()
        })
        .await;

        farm.spawn_vm("calc").await.unwrap();
        farm.spawn_vm("calc").await.unwrap();
        assert_eq!(farm.spawn_vm("calc").await, Err(Fault::CapacityExceeded));

        // Terminating one frees a slot again.
        let vm_id = {
            let vms = farm.inner.vms.read().await;
            vms.keys().next().cloned().unwrap()
        };
        farm.terminate_vm(&vm_id).await.unwrap();
        assert!(farm.spawn_vm("calc").await.is_ok());
    }

    #[tokio::test]
    async fn mismatched_secret_is_refused_missing_secret_is_admitted() {
        let farm = farm_with(Config {
            farm_secret: Some("swordfish".into()),
            ..Default::default()
        })
        .await;
        let vm_id = farm.spawn_vm("calc").await.unwrap();

        let wrong = Request::SubmitJob {
            vm_id: vm_id.clone(),
            job_id: JobId::fresh(),
            expression: "1".into(),
            secret: Some("guess".into()),
        };
        match farm.dispatch(wrong).await {
            Response::Error(Fault::WrongSecret) => {}
            other => panic!("unexpected response: {other:?}"),
        }

        match farm.dispatch(submit(&vm_id, "1")).await {
            Response::JobOutcome { .. } => {}
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn administrative_termination_is_silent_external_is_acknowledged() {
        let cloud = Arc::new(InMemoryCloud::default());
        let farm = Farm::start(
            cloud.clone(),
            &Config::default(),
            EngineRegistry::with_defaults(),
        )
        .await
        .unwrap();

        let observer = PeerId::fresh("villein");
        let mut inbox = cloud.bind(&observer).await.unwrap();

        let first = farm.spawn_vm("calc").await.unwrap();
        let second = farm.spawn_vm("calc").await.unwrap();

        // External request: exactly one acknowledgment lands in the
        // requester's mailbox.
        cloud
            .deliver(
                farm.id(),
                Envelope {
                    from: observer.clone(),
                    correlation: CorrelationId(7),
                    payload: Payload::Request(Request::TerminateVm { vm_id: first }),
                },
            )
            .await
            .unwrap();
        let reply = inbox.recv().await.unwrap();
        assert_eq!(reply.correlation, CorrelationId(7));
        assert!(matches!(reply.payload, Payload::Response(Response::Ack)));

        // Administrative shutdown: no packet at all.
        farm.terminate_vm(&second).await.unwrap();
        assert!(inbox.try_recv().is_err());
        assert_eq!(farm.vm_count().await, 0);
    }

    // Deliberately single-threaded: a long evaluation must not occupy the
    // runtime worker, or nothing below the first sleep would ever run.
    #[tokio::test]
    async fn abort_reaches_a_running_job_and_the_farm_stays_responsive() {
        let (farm, _) = farm().await;
        let vm_id = farm.spawn_vm("calc").await.unwrap();
        let job_id = JobId::fresh();

        // A scan this wide runs for minutes unless aborted.
        let submission = tokio::spawn({
            let farm = farm.clone();
            let request = Request::SubmitJob {
                vm_id: vm_id.clone(),
                job_id: job_id.clone(),
                expression: "primes(2, 4000000000)".into(),
                secret: None,
            };
            async move { farm.dispatch(request).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        // Farm administration keeps answering while the job runs.
        farm.spawn_vm("calc").await.unwrap();

        match farm.dispatch(Request::AbortJob { vm_id, job_id }).await {
            Response::Ack => {}
            other => panic!("unexpected response: {other:?}"),
        }

        match submission.await.unwrap() {
            Response::JobOutcome { status, .. } => assert_eq!(status, JobStatus::Aborted),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_language_is_refused_at_spawn() {
        let (farm, _) = farm().await;
        assert!(matches!(
            farm.spawn_vm("befunge").await,
            Err(Fault::EvaluationError(_))
        ));
        assert_eq!(farm.vm_count().await, 0);
    }
}
