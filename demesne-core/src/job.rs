//! The job lifecycle state machine.
//!
//! A [`Job`] is one expression-evaluation request/response unit. It is
//! created when a submit request is accepted, advances through
//! [`JobStatus::Pending`] and [`JobStatus::Running`], and is immutable once
//! it reaches a terminal state (except for read access).
use serde::{Deserialize, Serialize};

use crate::{binding::BindingValue, error::Fault};

/// A job's correlation identity, unique within its VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh id.
    pub fn fresh() -> Self {
        Self(crate::fresh_token("job", 12))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a job.
///
/// `Timeout` is only ever assigned by a caller whose deadline elapsed; a
/// farm never moves a job there itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Error,
    Aborted,
    Timeout,
}

impl JobStatus {
    /// Terminal states admit no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// A single expression-evaluation request with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    expression: String,
    status: JobStatus,
    result: Option<BindingValue>,
    error: Option<Fault>,
}

impl Job {
    pub fn new(id: JobId, expression: impl Into<String>) -> Self {
        Self {
            id,
            expression: expression.into(),
            status: JobStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn result(&self) -> Option<&BindingValue> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&Fault> {
        self.error.as_ref()
    }

    /// Pending → Running. A no-op from any other state.
    pub fn start(&mut self) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
        }
    }

    /// Running/Pending → Success, recording the result value.
    pub fn succeed(&mut self, value: BindingValue) {
        if !self.status.is_terminal() {
            self.status = JobStatus::Success;
            self.result = Some(value);
        }
    }

    /// Running/Pending → Error, recording the fault.
    pub fn fail(&mut self, fault: Fault) {
        if !self.status.is_terminal() {
            self.status = JobStatus::Error;
            self.error = Some(fault);
        }
    }

    /// Pending/Running → Aborted. Returns whether the transition applied.
    pub fn abort(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Aborted;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(JobId::fresh(), "1 + 1")
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = job();
        assert_eq!(job.status(), JobStatus::Pending);
        job.start();
        assert_eq!(job.status(), JobStatus::Running);
        job.succeed(BindingValue::Int(2));
        assert_eq!(job.status(), JobStatus::Success);
        assert_eq!(job.result(), Some(&BindingValue::Int(2)));
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut job = job();
        job.start();
        job.fail(Fault::EvaluationError("bad".into()));
        assert_eq!(job.status(), JobStatus::Error);

        // None of these may dislodge a terminal state.
        job.succeed(BindingValue::Int(2));
        job.start();
        assert!(!job.abort());
        assert_eq!(job.status(), JobStatus::Error);
        assert!(job.result().is_none());
    }

    #[test]
    fn abort_applies_to_pending_and_running_only() {
        let mut pending = job();
        assert!(pending.abort());
        assert_eq!(pending.status(), JobStatus::Aborted);

        let mut running = job();
        running.start();
        assert!(running.abort());
        assert_eq!(running.status(), JobStatus::Aborted);
    }
}
