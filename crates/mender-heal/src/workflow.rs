//! The verify-and-heal workflow: apply fixes, verify, report.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mender_pipeline::{GateResult, Orchestrator, StageDefinition, StageResults, Workflow};
use mender_types::{Outcome, Result};

use crate::checkpoint::CheckpointId;
use crate::engine::{SelfHealEngine, SelfHealResult, Verification};
use crate::fix::{FixResult, GranularFix};
use crate::recovery::{HealRecovery, HealRequest, Healable};

/// Run context of a verify-and-heal pipeline.
pub struct HealContext {
    pub engine: Arc<SelfHealEngine>,
    pub safe_head: CheckpointId,
    pub fixes: Vec<Box<dyn GranularFix>>,
}

impl Healable for HealContext {
    fn heal_request(&self) -> HealRequest<'_> {
        HealRequest {
            safe_head: &self.safe_head,
            fixes: &self.fixes,
        }
    }
}

impl HealContext {
    /// An orchestrator over this context with heal recovery on the verify stage.
    pub fn into_orchestrator(self) -> Orchestrator<HealContext> {
        let recovery = Arc::new(HealRecovery::new(self.engine.clone()));
        Orchestrator::new(self).with_recovery(recovery)
    }
}

/// Data of the `verify` stage: a plain check, or the heal result that replaced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerifyData {
    Healed(SelfHealResult),
    Checked(Verification),
}

/// Data of the `report` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealReport {
    pub build_passed: bool,
    pub tests_passed: bool,
    pub healed: bool,
    pub rolled_back: bool,
    pub summary: String,
}

impl HealReport {
    fn from_verify(data: &VerifyData) -> Self {
        match data {
            VerifyData::Checked(v) => Self {
                build_passed: v.build_passed,
                tests_passed: v.tests_passed,
                healed: false,
                rolled_back: false,
                summary: format!(
                    "Verification passed without healing: build {}, tests {}\n",
                    if v.build_passed { "passed" } else { "failed" },
                    if v.tests_passed { "passed" } else { "failed" }
                ),
            },
            VerifyData::Healed(h) => Self {
                build_passed: h.build_passed,
                tests_passed: h.tests_passed,
                healed: h.healed(),
                rolled_back: h.rolled_back(),
                summary: h.summary(),
            },
        }
    }
}

pub struct VerifyAndHeal;

impl VerifyAndHeal {
    pub const NAME: &'static str = "verify-and-heal";
}

fn apply_stage() -> StageDefinition<HealContext> {
    StageDefinition::from_fn("apply", "Apply Fixes", |ctx: &HealContext, _| {
        Box::pin(async move {
            let mut applied: Vec<FixResult> = Vec::with_capacity(ctx.fixes.len());
            for fix in &ctx.fixes {
                let result = match fix.apply(ctx.engine.base()).await {
                    Ok(r) => r,
                    Err(e) => FixResult::failed(fix.as_ref(), e.to_string()),
                };
                tracing::info!(fix = fix.id(), success = result.success, "Fix applied");
                applied.push(result);
            }
            Outcome::completed(applied)
        })
    })
}

fn verify_stage() -> StageDefinition<HealContext> {
    StageDefinition::from_fn("verify", "Verify", |ctx: &HealContext, _| {
        Box::pin(async move {
            let v = ctx.engine.verify().await?;
            Outcome::completed(v)
        })
    })
    .recoverable()
    .gate_fn(|result, _| match result.data_as::<Verification>() {
        Ok(Some(v)) if v.passed() => GateResult::pass(),
        Ok(Some(v)) if !v.build_passed => GateResult::reject("build failed"),
        Ok(Some(_)) => GateResult::reject("tests failed"),
        Ok(None) => GateResult::reject(result.error.clone().unwrap_or_else(|| "no verification result".into())),
        Err(e) => GateResult::reject(format!("unreadable verification result: {e}")),
    })
}

fn report_stage() -> StageDefinition<HealContext> {
    StageDefinition::from_fn("report", "Report", |_: &HealContext, results: &StageResults| {
        Box::pin(async move {
            let data: Option<VerifyData> = results.data("verify")?;
            let report = match data {
                Some(data) => HealReport::from_verify(&data),
                None => HealReport {
                    build_passed: false,
                    tests_passed: false,
                    healed: false,
                    rolled_back: false,
                    summary: "No verification result recorded\n".into(),
                },
            };
            Outcome::completed(report)
        })
    })
}

impl Workflow<HealContext> for VerifyAndHeal {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Apply fixes, verify build and tests, heal on failure, report"
    }

    fn stages(&self) -> Vec<StageDefinition<HealContext>> {
        vec![apply_stage(), verify_stage(), report_stage()]
    }
}

/// Run verify-and-heal on `ctx` and return the final report.
pub async fn run_verify_and_heal(ctx: HealContext) -> Result<(HealReport, StageResults)> {
    let orchestrator = ctx.into_orchestrator();
    let results = orchestrator.execute(&VerifyAndHeal.stages()).await?;
    let report = results.data::<HealReport>("report")?.unwrap_or_else(|| HealReport {
        build_passed: false,
        tests_passed: false,
        healed: false,
        rolled_back: false,
        summary: "Report stage produced no data\n".into(),
    });
    Ok((report, results))
}
