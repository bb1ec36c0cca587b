//! Named workflows: reusable stage lists looked up by name.

use std::collections::HashMap;
use std::sync::Arc;

use mender_types::{MenderError, Result};

use crate::engine::Orchestrator;
use crate::stage::{StageDefinition, StageResults};

/// A named, reusable list of stages over context `C`.
pub trait Workflow<C: Send + Sync>: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Build a fresh set of stage definitions for one run.
    fn stages(&self) -> Vec<StageDefinition<C>>;
}

/// Registry of workflows keyed by name.
pub struct WorkflowRegistry<C: Send + Sync> {
    workflows: HashMap<String, Arc<dyn Workflow<C>>>,
}

impl<C: Send + Sync> Default for WorkflowRegistry<C> {
    fn default() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }
}

impl<C: Send + Sync> WorkflowRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow; a later registration under the same name wins.
    pub fn register(&mut self, workflow: impl Workflow<C> + 'static) {
        let name = workflow.name().to_string();
        if self.workflows.insert(name.clone(), Arc::new(workflow)).is_some() {
            tracing::debug!(workflow = %name, "Replaced workflow registration");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow<C>>> {
        self.workflows.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stages(&self, name: &str) -> Result<Vec<StageDefinition<C>>> {
        self.get(name)
            .map(|w| w.stages())
            .ok_or_else(|| MenderError::UnknownWorkflow(name.to_string()))
    }

    /// Run the named workflow on `orchestrator`.
    pub async fn run(&self, name: &str, orchestrator: &Orchestrator<C>) -> Result<StageResults> {
        let stages = self.stages(name)?;
        tracing::info!(workflow = %name, stages = stages.len(), "Running workflow");
        orchestrator.execute(&stages).await
    }
}
