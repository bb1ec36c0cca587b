//! Self-healing for workspaces whose verification failed.
//!
//! [`SelfHealEngine`] resets to a known-good checkpoint, re-applies fixes one
//! at a time behind snapshots, runs a bounded diagnostics-driven repair loop,
//! and never leaves the tree in an unverified state. [`HealRecovery`] plugs it
//! into the orchestrator as the verify stage's gate-failure handler.

pub mod checkpoint;
pub mod diagnostics;
pub mod engine;
pub mod executor;
pub mod fix;
pub mod fixer;
pub mod recovery;
pub mod workflow;

pub use checkpoint::{CheckpointId, CheckpointStore, GitCheckpointStore};
pub use diagnostics::{parse_build_errors, BuildDiagnostics, Diagnostic};
pub use engine::{HealConfig, HealIteration, SelfHealEngine, SelfHealResult, Verification};
pub use executor::{shell_quote, CommandExecutor, ExecResult, LocalExecutor};
pub use fix::{load_fixes, FixResult, FixSpec, GranularFix, PatchFix, WriteFileFix};
pub use fixer::{fix_files_in_parallel, CommandFileFixer, FileFixer, FixOutcome};
pub use recovery::{HealRecovery, HealRequest, Healable};
pub use workflow::{run_verify_and_heal, HealContext, HealReport, VerifyAndHeal, VerifyData};
