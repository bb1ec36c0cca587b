//! Stage definitions, gates, and recorded stage results.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use mender_types::{Outcome, Question, Result, StageStatus};

/// Boxed future returned by closure-based stage bodies.
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// StageBody / StageGate traits
// ---------------------------------------------------------------------------

/// The work a stage performs against the shared run context.
#[async_trait]
pub trait StageBody<C: Send + Sync>: Send + Sync {
    /// Run the stage once. `results` holds every earlier stage's result.
    async fn execute(&self, ctx: &C, results: &StageResults) -> Result<Outcome>;
}

/// Post-stage check deciding whether the pipeline may continue.
#[async_trait]
pub trait StageGate<C: Send + Sync>: Send + Sync {
    async fn check(&self, result: &StageResult, ctx: &C) -> GateResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub can_proceed: bool,
    pub reason: Option<String>,
}

impl GateResult {
    pub fn pass() -> Self {
        Self {
            can_proceed: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            can_proceed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Adapter turning a closure into a [`StageBody`].
pub struct FnBody<F>(F);

#[async_trait]
impl<C, F> StageBody<C> for FnBody<F>
where
    C: Send + Sync,
    F: for<'a> Fn(&'a C, &'a StageResults) -> StageFuture<'a> + Send + Sync,
{
    async fn execute(&self, ctx: &C, results: &StageResults) -> Result<Outcome> {
        (self.0)(ctx, results).await
    }
}

/// Adapter turning a synchronous predicate into a [`StageGate`].
pub struct FnGate<F>(F);

#[async_trait]
impl<C, F> StageGate<C> for FnGate<F>
where
    C: Send + Sync,
    F: Fn(&StageResult, &C) -> GateResult + Send + Sync,
{
    async fn check(&self, result: &StageResult, ctx: &C) -> GateResult {
        (self.0)(result, ctx)
    }
}

// ---------------------------------------------------------------------------
// StageDefinition
// ---------------------------------------------------------------------------

/// Timeout and retry policy of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePolicy {
    pub timeout: Duration,
    pub retries: usize,
    /// Attempt `n` waits `retry_delay * n` before the next try.
    pub retry_delay: Duration,
    /// Gate failures may be handed to the orchestrator's recovery handler.
    pub recoverable: bool,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retries: 0,
            retry_delay: Duration::from_millis(1000),
            recoverable: false,
        }
    }
}

/// Static definition of one pipeline stage.
pub struct StageDefinition<C: Send + Sync> {
    pub id: String,
    pub name: String,
    pub policy: StagePolicy,
    pub(crate) body: Box<dyn StageBody<C>>,
    pub(crate) gate: Option<Box<dyn StageGate<C>>>,
}

impl<C: Send + Sync + 'static> StageDefinition<C> {
    pub fn new(id: impl Into<String>, name: impl Into<String>, body: impl StageBody<C> + 'static) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            policy: StagePolicy::default(),
            body: Box::new(body),
            gate: None,
        }
    }

    /// Build a stage from a closure returning a boxed future:
    /// `StageDefinition::from_fn("fetch", "Fetch", |ctx, _| Box::pin(async move { .. }))`.
    pub fn from_fn<F>(id: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(&'a C, &'a StageResults) -> StageFuture<'a> + Send + Sync + 'static,
    {
        Self::new(id, name, FnBody(f))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.policy.retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.policy.retry_delay = delay;
        self
    }

    pub fn recoverable(mut self) -> Self {
        self.policy.recoverable = true;
        self
    }

    pub fn gate(mut self, gate: impl StageGate<C> + 'static) -> Self {
        self.gate = Some(Box::new(gate));
        self
    }

    pub fn gate_fn<F>(self, f: F) -> Self
    where
        F: Fn(&StageResult, &C) -> GateResult + Send + Sync + 'static,
    {
        self.gate(FnGate(f))
    }
}

// ---------------------------------------------------------------------------
// StageResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,
    pub status: StageStatus,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<Question>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempts: usize,
}

impl StageResult {
    pub(crate) fn from_outcome(
        stage_id: &str,
        outcome: Outcome,
        started_at: DateTime<Utc>,
        duration: Duration,
        attempts: usize,
    ) -> Self {
        let (status, data, error, questions) = match outcome {
            Outcome::Completed { data } => (StageStatus::Completed, Some(data), None, Vec::new()),
            Outcome::Failed { error } => (StageStatus::Failed, None, Some(error), Vec::new()),
            Outcome::PausedForInput { questions } => (StageStatus::Paused, None, None, questions),
        };
        Self {
            stage_id: stage_id.to_string(),
            status,
            data,
            error,
            questions,
            started_at,
            completed_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            attempts,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }

    /// Deserialize `data` into `T`. `Ok(None)` when the stage produced no data.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.data {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }
}

/// Stage results of one run, keyed by stage id, iterated in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageResults {
    order: Vec<String>,
    by_id: HashMap<String, StageResult>,
}

impl StageResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the result for its stage id. Replacing keeps the
    /// original position.
    pub fn insert(&mut self, result: StageResult) {
        if !self.by_id.contains_key(&result.stage_id) {
            self.order.push(result.stage_id.clone());
        }
        self.by_id.insert(result.stage_id.clone(), result);
    }

    pub fn get(&self, stage_id: &str) -> Option<&StageResult> {
        self.by_id.get(stage_id)
    }

    pub(crate) fn get_mut(&mut self, stage_id: &str) -> Option<&mut StageResult> {
        self.by_id.get_mut(stage_id)
    }

    /// Typed view of a stage's data.
    pub fn data<T: DeserializeOwned>(&self, stage_id: &str) -> Result<Option<T>> {
        match self.get(stage_id) {
            Some(result) => result.data_as(),
            None => Ok(None),
        }
    }

    pub fn contains(&self, stage_id: &str) -> bool {
        self.by_id.contains_key(stage_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageResult> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn stage_ids(&self) -> Vec<String> {
        self.order.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
