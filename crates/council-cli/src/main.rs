//! Council CLI
//!
//! Runs a flow of command-line AI agents, one step feeding the next.

mod audit;
mod console;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use council_core::config::{ResolvedFlowConfig, load_flow_steps, resolve_flow_config};
use council_core::prerequisites::{BinaryStatus, evaluate_prerequisites, missing_binaries};
use council_core::{Limits, Step};
use council_engine::{ExecError, NoFeedback, PipelineEngine, ProcessRunner, RunStatus};

use crate::audit::TracingAuditSink;
use crate::console::ConsoleUi;

/// Multi-agent pipeline runner.
#[derive(Debug, Parser)]
#[command(name = "council", version, about)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the flow with a prompt
    Run(RunArgs),
    /// Check that every agent binary the flow needs is available
    Doctor {
        /// Flow file to use instead of the default search order
        #[arg(long)]
        flow_config: Option<String>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Flow file to use instead of the default search order
    #[arg(long)]
    flow_config: Option<String>,

    /// Do not pause for feedback after each step
    #[arg(long)]
    no_feedback: bool,

    /// The request handed to the first step
    prompt: String,
}

/// A flow ready to run.
struct PreparedFlow {
    limits: Limits,
    resolved: ResolvedFlowConfig,
    steps: Vec<Step>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    council_core::tracing_init::init_tracing("council=info", cli.log_json);

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Doctor { flow_config } => doctor(flow_config.as_deref()),
    }
}

#[allow(clippy::print_stderr)]
async fn run(args: RunArgs) -> Result<ExitCode> {
    let flow = match prepare_flow(args.flow_config.as_deref()) {
        Ok(flow) => flow,
        Err(e) => return Ok(setup_failure(&e)),
    };
    info!(
        source = %flow.resolved.source,
        path = ?flow.resolved.path,
        steps = flow.steps.len(),
        "Flow loaded"
    );

    let runner = Arc::new(ProcessRunner::new(flow.limits));
    let ui = Arc::new(ConsoleUi::new());
    let engine = match PipelineEngine::new(flow.steps, Arc::clone(&runner), ui.clone(), flow.limits)
    {
        Ok(engine) => engine,
        Err(e) => return Ok(setup_failure(&e)),
    };
    let engine = engine
        .with_audit(Arc::new(TracingAuditSink))
        .with_flow_source(flow.resolved.source.as_str(), flow.resolved.path);
    let engine = if args.no_feedback {
        engine.with_feedback(Arc::new(NoFeedback))
    } else {
        engine.with_feedback(ui)
    };

    let interrupt = Arc::clone(&runner);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the run");
            interrupt.request_cancel();
        }
    });

    let report = engine.run(&args.prompt).await;
    ctrl_c.abort();

    info!(
        run_id = %report.run_id,
        status = %report.status,
        executed = report.executed_steps,
        successful = report.successful_steps,
        duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
        "Run finished"
    );
    if report.status == RunStatus::Aborted {
        eprintln!("Run aborted.");
    }
    Ok(exit_code(report.exit_code()))
}

/// Resolve limits and the flow file, then refuse to start if any agent
/// binary is missing.
fn prepare_flow(cli_path: Option<&str>) -> Result<PreparedFlow, ExecError> {
    let limits = Limits::from_env()?;
    let resolved = resolve_flow_config(cli_path)?;
    let steps = load_flow_steps(&resolved)?;

    let statuses = evaluate_prerequisites(&steps);
    warn_world_writable(&statuses);
    let missing = missing_binaries(&statuses);
    if !missing.is_empty() {
        return Err(ExecError::InvalidConfiguration(format!(
            "Required agent binaries not found on PATH: {}",
            missing.join(", ")
        )));
    }

    Ok(PreparedFlow {
        limits,
        resolved,
        steps,
    })
}

fn warn_world_writable(statuses: &[BinaryStatus]) {
    for status in statuses.iter().filter(|s| s.is_world_writable_location) {
        warn!(
            binary = %status.binary,
            path = status.resolved.as_deref().unwrap_or_default(),
            "Agent binary lives in a world-writable directory"
        );
    }
}

#[allow(clippy::print_stdout)]
fn doctor(cli_path: Option<&str>) -> Result<ExitCode> {
    let resolved = resolve_flow_config(cli_path)?;
    let steps = load_flow_steps(&resolved)?;
    let statuses = evaluate_prerequisites(&steps);

    match &resolved.path {
        Some(path) => println!("Flow: {} ({})", path.display(), resolved.source),
        None => println!("Flow: built-in ({})", resolved.source),
    }
    println!("Steps: {}", steps.len());
    for status in &statuses {
        let mark = if status.is_available { "ok" } else { "MISSING" };
        let location = status.resolved.as_deref().unwrap_or("-");
        let note = if status.is_world_writable_location {
            "  (world-writable directory)"
        } else {
            ""
        };
        println!("  {mark:<8} {:<10} {location}{note}", status.binary);
    }

    if missing_binaries(&statuses).is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Report a failure that happened before the run started.
#[allow(clippy::print_stderr)]
fn setup_failure(err: &ExecError) -> ExitCode {
    error!(error = %err, "Flow could not be prepared");
    eprintln!("Error: {err}");
    exit_code(err.exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
