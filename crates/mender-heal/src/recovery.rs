//! Wires the self-heal engine into the orchestrator as a gate-failure handler.

use std::sync::Arc;

use async_trait::async_trait;

use mender_pipeline::{GateRecovery, Recovery, StageResults};
use mender_types::StageStatus;

use crate::checkpoint::CheckpointId;
use crate::engine::SelfHealEngine;
use crate::fix::GranularFix;

/// What the heal engine needs from a run context.
pub struct HealRequest<'a> {
    pub safe_head: &'a CheckpointId,
    pub fixes: &'a [Box<dyn GranularFix>],
}

/// Run contexts that can be healed.
pub trait Healable: Send + Sync {
    fn heal_request(&self) -> HealRequest<'_>;
}

/// [`GateRecovery`] that heals the workspace when the verify stage's gate fails.
///
/// The heal result replaces the stage's data. Recovery always counts as handled
/// so reporting stages still run; the stage is marked completed only when the
/// workspace actually healed, failed otherwise.
pub struct HealRecovery {
    engine: Arc<SelfHealEngine>,
    stage_id: String,
}

impl HealRecovery {
    pub fn new(engine: Arc<SelfHealEngine>) -> Self {
        Self {
            engine,
            stage_id: "verify".into(),
        }
    }

    /// Only recover gate failures of `stage_id` (default `verify`).
    pub fn for_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = stage_id.into();
        self
    }
}

#[async_trait]
impl<C: Healable> GateRecovery<C> for HealRecovery {
    async fn on_gate_failure(
        &self,
        stage_id: &str,
        reason: &str,
        ctx: &C,
        _results: &StageResults,
    ) -> Recovery {
        if stage_id != self.stage_id {
            return Recovery::unhandled();
        }
        tracing::info!(stage = stage_id, reason, "Verification failed, starting self-heal");

        let request = ctx.heal_request();
        let healed = self.engine.heal(request.safe_head, request.fixes).await;
        let rolled_back = healed.rolled_back();
        let status = if healed.healed() {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };

        let replacement = match serde_json::to_value(&healed) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Could not serialize heal result");
                None
            }
        };

        Recovery {
            handled: true,
            replacement,
            status: Some(status),
            rolled_back,
        }
    }
}
