//! Stage pipeline orchestration.
//!
//! An [`Orchestrator`] runs an ordered list of [`StageDefinition`]s against a
//! caller-supplied context: each stage races its timeout, retries with linear
//! backoff, records a [`StageResult`], and may be checked by a gate. Rejected
//! gates on recoverable stages are offered to a [`GateRecovery`] handler.
//! Lifecycle hooks feed event streams and job-progress bridges.

pub mod engine;
pub mod events;
pub mod hooks;
pub mod progress;
pub mod stage;
pub mod workflow;

pub use engine::{GateRecovery, Orchestrator, PipelineRun, Recovery, RunStatus};
pub use events::{EventBridge, EventEmitter, PipelineEvent};
pub use hooks::{CompositeHooks, NoopHooks, PipelineHooks};
pub use progress::{MemoryProgressStore, Notifier, ProgressBridge, ProgressStore};
pub use stage::{
    FnBody, FnGate, GateResult, StageBody, StageDefinition, StageFuture, StageGate, StagePolicy,
    StageResult, StageResults,
};
pub use workflow::{Workflow, WorkflowRegistry};
