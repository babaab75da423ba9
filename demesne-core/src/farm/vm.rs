//! The VM state machine.
//!
//! A [`Vm`] is a sandboxed execution context: one binding table, one ordered
//! job queue, one status. It is owned exclusively by its farm, which
//! serializes all access behind a per-VM lock — a binding mutation made by
//! one job's evaluation is therefore visible, atomically, to the next
//! request against the same VM.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    binding::Bindings,
    engine::{AbortSignal, EvalError, Evaluator},
    error::Fault,
    job::{Job, JobId, JobStatus},
    packet::VmId,
};

/// Lifecycle states of a VM.
///
/// `Started → Idle ⇄ Busy → Terminated`; `Terminated` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStatus {
    Started,
    Idle,
    Busy,
    Terminated,
}

pub struct Vm {
    id: VmId,
    language: String,
    engine: Arc<dyn Evaluator>,
    status: VmStatus,
    bindings: Bindings,
    /// Submission order of not-yet-executed jobs.
    queue: VecDeque<JobId>,
    /// Every job this VM has ever accepted, for ping lookups.
    jobs: HashMap<JobId, Job>,
}

impl Vm {
    pub fn new(id: VmId, language: impl Into<String>, engine: Arc<dyn Evaluator>) -> Self {
        Self {
            id,
            language: language.into(),
            engine,
            status: VmStatus::Started,
            bindings: Bindings::new(),
            queue: VecDeque::new(),
            jobs: HashMap::new(),
        }
    }

    pub fn id(&self) -> &VmId {
        &self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn status(&self) -> VmStatus {
        self.status
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn bindings_mut(&mut self) -> &mut Bindings {
        &mut self.bindings
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Accept a job onto the queue. The VM is busy while the queue is
    /// non-empty.
    pub fn enqueue(&mut self, job: Job) {
        self.queue.push_back(job.id().clone());
        self.jobs.insert(job.id().clone(), job);
        self.status = VmStatus::Busy;
    }

    /// Execute the next pending job in submission order.
    ///
    /// The evaluation itself runs on the blocking thread pool so it never
    /// stalls the async runtime; the caller keeps this VM locked while
    /// awaiting, which is what serializes jobs within one VM.
    ///
    /// Returns the id of the job that ran, or `None` if the queue held no
    /// pending job.
    pub async fn run_next(&mut self, abort: &AbortSignal) -> Option<JobId> {
        let id = loop {
            let id = self.queue.pop_front()?;
            if self
                .jobs
                .get(&id)
                .is_some_and(|job| job.status() == JobStatus::Pending)
            {
                break id;
            }
        };

        let expression = {
            let job = self.jobs.get_mut(&id)?;
            job.start();
            job.expression().to_string()
        };

        let engine = self.engine.clone();
        let abort = abort.clone();
        let mut bindings = std::mem::take(&mut self.bindings);
        let evaluation = tokio::task::spawn_blocking(move || {
            let outcome = engine.evaluate(&expression, &mut bindings, &abort);
            (outcome, bindings)
        })
        .await;

        let outcome = match evaluation {
            Ok((outcome, bindings)) => {
                self.bindings = bindings;
                outcome
            }
            // The engine panicked, taking the bindings with it.
            Err(_) => Err(EvalError::failed("evaluation panicked")),
        };

        if let Some(job) = self.jobs.get_mut(&id) {
            match outcome {
                Ok(value) => job.succeed(value),
                Err(EvalError::Aborted) => {
                    job.abort();
                }
                Err(EvalError::Failed(detail)) => job.fail(Fault::EvaluationError(detail)),
            }
        }

        if self.queue.is_empty() {
            self.status = VmStatus::Idle;
        }
        Some(id)
    }

    /// Abort a job that is still pending on the queue. Returns whether the
    /// transition applied.
    pub fn abort_pending(&mut self, id: &JobId) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) if job.status() == JobStatus::Pending => job.abort(),
            _ => false,
        }
    }

    /// Terminal transition; discards the queue and bindings.
    pub fn terminate(&mut self) {
        self.status = VmStatus::Terminated;
        self.queue.clear();
        self.bindings = Bindings::new();
    }
}
