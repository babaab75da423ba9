//! The expression-evaluation capability boundary.
//!
//! Evaluation is an external collaborator: the core hands an engine an
//! expression, the VM's binding table and a cooperative abort signal, and
//! gets back a value or an [`EvalError`]. One engine exists per supported
//! language; a VM's declared language tag selects the variant through an
//! [`EngineRegistry`] — never by inheritance.
//!
//! Binding mutations made by an expression (assignments) are applied
//! directly to the table the engine is handed, so they are visible,
//! atomically, to the next request against the same VM.
use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::binding::{BindingValue, Bindings};

/// Cooperative cancellation for a running evaluation. Best-effort: engines
/// poll it at their own granularity.
pub type AbortSignal = CancellationToken;

/// An engine-side evaluation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The abort signal fired mid-evaluation.
    #[error("evaluation aborted")]
    Aborted,
    /// The expression was rejected or failed, with engine-supplied detail.
    #[error("{0}")]
    Failed(String),
}

impl EvalError {
    pub fn failed(detail: impl Into<String>) -> Self {
        EvalError::Failed(detail.into())
    }
}

/// One scripting language's evaluation capability.
pub trait Evaluator: Send + Sync {
    /// Evaluate `expression` against `bindings`, applying any assignments
    /// the expression makes. Checks `abort` at engine-defined points.
    fn evaluate(
        &self,
        expression: &str,
        bindings: &mut Bindings,
        abort: &AbortSignal,
    ) -> Result<BindingValue, EvalError>;
}

/// Maps language tags to engines.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn Evaluator>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in engine registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("calc", Arc::new(calc::Calc));
        registry
    }

    pub fn register(&mut self, language: impl Into<String>, engine: Arc<dyn Evaluator>) {
        self.engines.insert(language.into(), engine);
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn Evaluator>> {
        self.engines.get(language).cloned()
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }
}

pub mod calc;

pub use calc::Calc;
