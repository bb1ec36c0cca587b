//! Lifecycle hooks fired by the orchestrator.
//!
//! Hooks are best effort: the orchestrator logs a failing hook and carries on.

use std::sync::Arc;

use async_trait::async_trait;

use mender_types::{MenderError, Question, Result};

use crate::stage::{StageResult, StageResults};

#[async_trait]
pub trait PipelineHooks: Send + Sync {
    async fn on_run_start(&self, _run_id: &str, _stage_names: &[String]) -> Result<()> {
        Ok(())
    }

    async fn on_stage_start(&self, _run_id: &str, _stage: &str) -> Result<()> {
        Ok(())
    }

    async fn on_stage_complete(&self, _run_id: &str, _stage: &str, _result: &StageResult) -> Result<()> {
        Ok(())
    }

    async fn on_run_complete(&self, _run_id: &str, _results: &StageResults) -> Result<()> {
        Ok(())
    }

    async fn on_run_fail(&self, _run_id: &str, _error: &MenderError, _results: &StageResults) -> Result<()> {
        Ok(())
    }

    async fn on_run_paused(&self, _run_id: &str, _stage: &str, _questions: &[Question]) -> Result<()> {
        Ok(())
    }
}

pub struct NoopHooks;

impl PipelineHooks for NoopHooks {}

/// Fans every hook out to several bridges in registration order.
///
/// All bridges are called even if one fails; the first error is returned.
#[derive(Default, Clone)]
pub struct CompositeHooks {
    hooks: Vec<Arc<dyn PipelineHooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hooks: Arc<dyn PipelineHooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

fn first_error(outcomes: Vec<Result<()>>) -> Result<()> {
    outcomes.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
}

#[async_trait]
impl PipelineHooks for CompositeHooks {
    async fn on_run_start(&self, run_id: &str, stage_names: &[String]) -> Result<()> {
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for h in &self.hooks {
            outcomes.push(h.on_run_start(run_id, stage_names).await);
        }
        first_error(outcomes)
    }

    async fn on_stage_start(&self, run_id: &str, stage: &str) -> Result<()> {
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for h in &self.hooks {
            outcomes.push(h.on_stage_start(run_id, stage).await);
        }
        first_error(outcomes)
    }

    async fn on_stage_complete(&self, run_id: &str, stage: &str, result: &StageResult) -> Result<()> {
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for h in &self.hooks {
            outcomes.push(h.on_stage_complete(run_id, stage, result).await);
        }
        first_error(outcomes)
    }

    async fn on_run_complete(&self, run_id: &str, results: &StageResults) -> Result<()> {
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for h in &self.hooks {
            outcomes.push(h.on_run_complete(run_id, results).await);
        }
        first_error(outcomes)
    }

    async fn on_run_fail(&self, run_id: &str, error: &MenderError, results: &StageResults) -> Result<()> {
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for h in &self.hooks {
            outcomes.push(h.on_run_fail(run_id, error, results).await);
        }
        first_error(outcomes)
    }

    async fn on_run_paused(&self, run_id: &str, stage: &str, questions: &[Question]) -> Result<()> {
        let mut outcomes = Vec::with_capacity(self.hooks.len());
        for h in &self.hooks {
            outcomes.push(h.on_run_paused(run_id, stage, questions).await);
        }
        first_error(outcomes)
    }
}
