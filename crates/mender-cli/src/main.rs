//! CLI binary for verifying and healing workspaces.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use mender_heal::{
    load_fixes, parse_build_errors, CheckpointId, CommandExecutor, CommandFileFixer, FileFixer,
    FixOutcome, GitCheckpointStore, GranularFix, HealConfig, HealContext, HealRecovery,
    LocalExecutor, SelfHealEngine, VerifyAndHeal,
};
use mender_pipeline::{CompositeHooks, EventBridge, Orchestrator, PipelineEvent, WorkflowRegistry};
use mender_resilience::{Resilience, ResilienceConfig};

#[derive(Parser)]
#[command(name = "mender", version, about = "Verify a workspace and heal it when the build breaks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply fixes, verify, heal on failure, and report
    Run {
        #[command(flatten)]
        heal: HealArgs,

        /// Workflow to run
        #[arg(long, default_value = VerifyAndHeal::NAME)]
        workflow: String,
    },

    /// Run the self-heal loop directly against a safe head
    Heal {
        #[command(flatten)]
        heal: HealArgs,
    },

    /// Parse build output and list errors per file
    Diagnose {
        /// File with build output (default: stdin)
        input: Option<PathBuf>,

        /// Only show the N files with the most errors
        #[arg(long)]
        top: Option<usize>,
    },

    /// Show circuit breaker and rate limit settings per service
    Services {
        /// Resilience config JSON
        config: PathBuf,
    },
}

#[derive(Args)]
struct HealArgs {
    /// Workspace root (a git work tree)
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Heal config JSON (build/test commands, timeouts, limits)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fixes JSON: an array of patch or write fixes
    #[arg(short, long)]
    fixes: Option<PathBuf>,

    /// Known-good revision (default: current HEAD)
    #[arg(long)]
    safe_head: Option<String>,

    /// Build command, overrides the config
    #[arg(long)]
    build: Option<String>,

    /// Test command, overrides the config
    #[arg(long, conflicts_with = "no_tests")]
    test: Option<String>,

    /// Skip tests entirely
    #[arg(long)]
    no_tests: bool,

    /// File fixer command template; `{file}` and `{errors}` are substituted
    #[arg(long)]
    fixer: Option<String>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Run { heal, workflow } => cmd_run(&heal, &workflow).await?,
        Commands::Heal { heal } => cmd_heal(&heal).await?,
        Commands::Diagnose { input, top } => cmd_diagnose(input.as_deref(), top)?,
        Commands::Services { config } => cmd_services(&config)?,
    }

    Ok(())
}

/// Fixer used when no command is configured: every file fix fails.
struct NoFixer;

#[async_trait]
impl FileFixer for NoFixer {
    async fn fix_file(&self, path: &str, _errors: &[String], _base: &Path) -> FixOutcome {
        FixOutcome::failed(format!("no fixer configured for {path}"))
    }
}

struct Setup {
    ctx: HealContext,
    json: bool,
}

async fn setup(args: &HealArgs) -> anyhow::Result<Setup> {
    let workdir = std::fs::canonicalize(&args.workdir)?;
    let mut config = match &args.config {
        Some(path) => HealConfig::load(path)?,
        None => HealConfig::default(),
    };
    if let Some(build) = &args.build {
        config.build_command = build.clone();
    }
    if let Some(test) = &args.test {
        config.test_command = Some(test.clone());
    }
    if args.no_tests {
        config.test_command = None;
    }

    let exec: Arc<dyn CommandExecutor> = Arc::new(LocalExecutor::new(&workdir));
    let store = GitCheckpointStore::new(exec.clone());
    let safe_head = match &args.safe_head {
        Some(rev) => CheckpointId::commit(rev.clone()),
        None => store.current_head().await?,
    };
    let fixes: Vec<Box<dyn GranularFix>> = match &args.fixes {
        Some(path) => load_fixes(&std::fs::read_to_string(path)?, exec.clone())?,
        None => Vec::new(),
    };
    let fixer: Arc<dyn FileFixer> = match &args.fixer {
        Some(template) => Arc::new(CommandFileFixer::new(exec.clone(), template.clone())),
        None => Arc::new(NoFixer),
    };

    println!("Workspace: {}", workdir.display());
    println!("Safe head: {safe_head}");
    println!("Build: {}", config.build_command);
    println!(
        "Tests: {}",
        config.test_command.as_deref().unwrap_or("(none)")
    );
    println!("Fixes: {}", fixes.len());
    tracing::debug!(?config, "Heal config");

    let engine = Arc::new(SelfHealEngine::new(
        workdir,
        config,
        exec,
        Arc::new(store),
        fixer,
    ));
    Ok(Setup {
        ctx: HealContext {
            engine,
            safe_head,
            fixes,
        },
        json: args.json,
    })
}

async fn cmd_run(args: &HealArgs, workflow: &str) -> anyhow::Result<()> {
    let Setup { ctx, json } = setup(args).await?;

    let mut registry = WorkflowRegistry::new();
    registry.register(VerifyAndHeal);

    let events = EventBridge::default();
    let mut rx = events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PipelineEvent::StageStarted { stage, .. }) => println!("-> {stage}"),
                Ok(PipelineEvent::StageCompleted {
                    stage,
                    status,
                    duration_ms,
                    ..
                }) => println!("   {stage}: {status} ({duration_ms}ms)"),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    let recovery = Arc::new(HealRecovery::new(ctx.engine.clone()));
    let orchestrator = Orchestrator::new(ctx)
        .with_recovery(recovery)
        .with_hooks(Arc::new(CompositeHooks::new().with(Arc::new(events))));
    let outcome = registry.run(workflow, &orchestrator).await;
    // dropping the orchestrator closes the event channel
    drop(orchestrator);
    let _ = printer.await;

    let results = outcome?;
    let report: Option<mender_heal::HealReport> = results.data("report")?;
    match report {
        Some(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
        Some(report) => {
            println!();
            print!("{}", report.summary);
            if !(report.build_passed && report.tests_passed) {
                anyhow::bail!("workspace is not passing");
            }
        }
        None => println!("No report produced"),
    }
    Ok(())
}

async fn cmd_heal(args: &HealArgs) -> anyhow::Result<()> {
    let Setup { ctx, json } = setup(args).await?;

    let result = ctx.engine.heal(&ctx.safe_head, &ctx.fixes).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        print!("{}", result.summary());
        if !result.build_passed {
            println!("\nBuild output:\n{}", result.build_output);
        }
    }
    if !result.healed() {
        anyhow::bail!("workspace was not healed");
    }
    Ok(())
}

fn cmd_diagnose(input: Option<&Path>, top: Option<usize>) -> anyhow::Result<()> {
    let output = match input {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let diagnostics = parse_build_errors(&output);
    if diagnostics.is_empty() {
        println!("No errors found");
        return Ok(());
    }

    let files = diagnostics.worst_files(top.unwrap_or(usize::MAX));
    println!(
        "{} errors in {} files",
        diagnostics.error_count(),
        diagnostics.by_file.len()
    );
    for (file, errors) in files {
        println!("\n{file} ({})", errors.len());
        for error in errors {
            println!("  {error}");
        }
    }
    Ok(())
}

fn cmd_services(path: &Path) -> anyhow::Result<()> {
    let config = ResilienceConfig::load(path)?;
    let resilience = Resilience::from_config(&config)?;

    println!(
        "Default breaker: {} failures, reset after {}ms, {} half-open request(s)",
        config.breaker.failure_threshold,
        config.breaker.reset_timeout.as_millis(),
        config.breaker.half_open_requests
    );

    let mut names: Vec<&String> = config.services.keys().collect();
    names.sort();
    for name in names {
        println!("\n{name}");
        if let Some(overrides) = config.services.get(name).and_then(|s| s.breaker.as_ref()) {
            println!("  breaker: {}", serde_json::to_string(overrides)?);
        }
        match resilience.limiter.status(name) {
            Some(status) => println!(
                "  rate limit: {}/min{}, strategy {:?}",
                status.requests_per_minute,
                status
                    .requests_per_day
                    .map(|d| format!(", {d}/day"))
                    .unwrap_or_default(),
                status.strategy
            ),
            None => println!("  rate limit: none"),
        }
    }
    Ok(())
}
