//! Agentrun - workflow orchestration for agent workers.
//!
//! Parses a requirements document, plans a task graph over the worker
//! roster and runs it, writing a report and checkpoints along the way.

#![allow(clippy::single_match_else)]

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agentrun::core::{Config, ExecutionMode};
use agentrun::workflow::{
    describe_plan, execution_waves, CascadeDecision, CheckpointManager, CompletionTracker,
    EngineHandle, EventSubscription, EventType, ParsedRequirements, PerformanceHistory,
    PlanBuilder, RequirementParser, WorkflowEngine, WorkflowReport, WorkflowState,
};

/// Adaptive workflow orchestration for agent workers
#[derive(Parser)]
#[command(name = "agentrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (overrides AGENTRUN_CONFIG and ./agentrun.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and run a workflow
    Run {
        /// Requirements file (YAML, JSON or TOML)
        #[arg(required_unless_present = "resume_from_checkpoint")]
        requirements: Option<PathBuf>,

        /// Continue an interrupted workflow from a checkpoint file
        #[arg(long, conflicts_with = "requirements")]
        resume_from_checkpoint: Option<PathBuf>,

        /// Maximum number of concurrently running tasks
        #[arg(short = 'p', long, env = "AGENTRUN_MAX_PARALLEL")]
        max_parallel: Option<usize>,

        /// Directory for report.json
        #[arg(short, long, default_value = "agentrun-out")]
        output_dir: PathBuf,

        /// Execution mode (simulated, live)
        #[arg(short, long)]
        mode: Option<ExecutionMode>,

        /// Directory for checkpoint files
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// What to do when failures cascade
        #[arg(long, value_enum, default_value_t = CascadeMode::Prompt)]
        on_cascade: CascadeMode,

        /// Do not read or update worker performance history
        #[arg(long)]
        no_history: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check a requirements file and its dependency graph without running it
    Validate {
        /// Requirements file (YAML, JSON or TOML)
        requirements: PathBuf,
    },

    /// Print the task graph for a requirements file
    Plan {
        /// Requirements file (YAML, JSON or TOML)
        requirements: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Summarize a checkpoint file
    Inspect {
        /// Checkpoint file
        checkpoint: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Answer given when a failure cascade pauses the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CascadeMode {
    Continue,
    Skip,
    Abort,
    /// Ask on the terminal (continue when stdin is not a terminal)
    Prompt,
}

struct RunArgs {
    requirements: Option<PathBuf>,
    resume_from_checkpoint: Option<PathBuf>,
    max_parallel: Option<usize>,
    output_dir: PathBuf,
    mode: Option<ExecutionMode>,
    checkpoint_dir: Option<PathBuf>,
    on_cascade: CascadeMode,
    no_history: bool,
    format: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            requirements,
            resume_from_checkpoint,
            max_parallel,
            output_dir,
            mode,
            checkpoint_dir,
            on_cascade,
            no_history,
            format,
        } => cmd_run(
            RunArgs {
                requirements,
                resume_from_checkpoint,
                max_parallel,
                output_dir,
                mode,
                checkpoint_dir,
                on_cascade,
                no_history,
                format,
            },
            config_path,
        ),
        Commands::Validate { requirements } => {
            cmd_validate(&requirements, config_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Plan { requirements, format } => {
            cmd_plan(&requirements, &format, config_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Inspect { checkpoint, format } => {
            cmd_inspect(&checkpoint, &format, config_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            cmd_completions(shell);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load configuration"),
    }
}

fn parse_requirements(path: &Path, config: &Config) -> Result<ParsedRequirements> {
    let parser = RequirementParser::new()
        .with_known_workers(config.worker_roster().into_iter().map(|w| w.id));
    Ok(parser.parse_file(path)?)
}

/// Plan and run a workflow, or resume one.
fn cmd_run(args: RunArgs, config_path: Option<&Path>) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(n) = args.max_parallel {
        config.engine.max_parallel = n;
    }
    if let Some(mode) = args.mode {
        config.engine.mode = mode;
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint.dir = Some(dir.display().to_string());
    } else if let Some(resume) = &args.resume_from_checkpoint {
        // Keep writing next to the checkpoint we resume from
        if let Some(parent) = resume.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.checkpoint.dir = Some(parent.display().to_string());
        }
        if let Some(name) = resume.file_name() {
            config.checkpoint.file_name = name.to_string_lossy().into_owned();
        }
    }

    let history_path = if args.no_history { None } else { PerformanceHistory::default_path() };
    let mut history = match history_path.as_deref().map(PerformanceHistory::load).transpose() {
        Ok(history) => history.unwrap_or_default(),
        Err(err) => {
            tracing::warn!(error = %err, "Ignoring unreadable performance history");
            PerformanceHistory::new()
        }
    };

    let mut builder = WorkflowEngine::builder(config.clone()).history(history.clone());
    if let Some(manager) = CheckpointManager::from_config(&config.checkpoint) {
        builder = builder.checkpoints(manager);
    }
    let engine = builder.build()?;

    match (&args.resume_from_checkpoint, &args.requirements) {
        (Some(path), _) => engine
            .resume(path)
            .with_context(|| format!("cannot resume from {}", path.display()))?,
        (None, Some(path)) => engine.plan(parse_requirements(path, &config)?)?,
        (None, None) => bail!("a requirements file or --resume-from-checkpoint is required"),
    }

    let json = args.format == "json";
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let handle = engine.handle();
        let interrupt = handle.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nAborting, giving running tasks a moment to stop...");
            interrupt.abort();
        })
        .context("failed to install Ctrl-C handler")?;

        let printer = tokio::spawn(follow_events(engine.subscribe(), handle, args.on_cascade, json));
        let report = engine.run().await?;
        let _ = tokio::time::timeout(Duration::from_secs(2), printer).await;
        Ok::<_, anyhow::Error>(report)
    })?;

    if let Some(path) = history_path {
        history.record_workflow(&engine.snapshot());
        if let Err(err) = history.save(&path) {
            tracing::warn!(error = %err, "Failed to save performance history");
        }
    }

    let report_path = report
        .write_json(&args.output_dir)
        .with_context(|| format!("failed to write report to {}", args.output_dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.to_summary_string());
        if let Some(checkpoint) = &report.checkpoint {
            println!("Checkpoint: {}", checkpoint.display());
        }
        println!("Report: {}", report_path.display());
    }

    Ok(exit_code(&report))
}

fn exit_code(report: &WorkflowReport) -> ExitCode {
    ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1))
}

/// Print progress and answer cascade pauses until the workflow ends.
///
/// Pauses are also polled for, so a cascade event lost to a lagging
/// subscription still gets an answer.
async fn follow_events(mut events: EventSubscription, handle: EngineHandle, on_cascade: CascadeMode, quiet: bool) {
    let mut answered = None;
    let mut poll = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                if !quiet {
                    eprintln!("[{:>4}] {}", event.sequence_number, event.summary());
                }
                match event.event_type {
                    EventType::CascadeDetected => answer_cascade(&handle, on_cascade, &mut answered).await,
                    EventType::WorkflowTerminal => break,
                    _ => {}
                }
            }
            _ = poll.tick() => answer_cascade(&handle, on_cascade, &mut answered).await,
        }
    }
}

/// Answer the pending cascade pause unless it was answered already.
async fn answer_cascade(handle: &EngineHandle, on_cascade: CascadeMode, answered: &mut Option<usize>) {
    let Some(pause) = handle.pending_cascade() else { return };
    if *answered == Some(pause) {
        return;
    }
    *answered = Some(pause);
    let decision = match on_cascade {
        CascadeMode::Continue => CascadeDecision::Continue,
        CascadeMode::Skip => CascadeDecision::Skip,
        CascadeMode::Abort => CascadeDecision::Abort,
        CascadeMode::Prompt => tokio::task::spawn_blocking(prompt_cascade_decision)
            .await
            .unwrap_or(CascadeDecision::Continue),
    };
    handle.decide(decision);
}

fn prompt_cascade_decision() -> CascadeDecision {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        tracing::warn!("Failure cascade with no terminal to ask, continuing");
        return CascadeDecision::Continue;
    }
    loop {
        eprint!("Too many tasks are failing. [c]ontinue, [s]kip remaining, [a]bort? ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return CascadeDecision::Abort,
            Ok(_) => match line.parse() {
                Ok(decision) => return decision,
                Err(err) => eprintln!("{err}"),
            },
        }
    }
}

fn build_plan(path: &Path, config: &Config) -> Result<WorkflowState> {
    let parsed = parse_requirements(path, config)?;
    let state = PlanBuilder::from_config(config).build(parsed)?;
    Ok(state)
}

/// Parse and plan without running anything.
fn cmd_validate(path: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let state = build_plan(path, &config)?;
    let waves = execution_waves(&state.tasks).len();
    println!(
        "{} is valid: {} requirements, {} tasks, {} waves",
        path.display(),
        state.requirements.len(),
        state.tasks.len(),
        waves
    );
    Ok(())
}

/// Print the planned task graph.
fn cmd_plan(path: &Path, format: &str, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let state = build_plan(path, &config)?;
    match format {
        "json" => {
            let plan = serde_json::json!({
                "requirements": state.requirements,
                "tasks": state.tasks,
                "waves": execution_waves(&state.tasks),
            });
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        _ => print!("{}", describe_plan(&state)),
    }
    Ok(())
}

/// Summarize a checkpoint file.
fn cmd_inspect(path: &Path, format: &str, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let checkpoint = CheckpointManager::load_from(path)
        .with_context(|| format!("cannot read checkpoint {}", path.display()))?;
    let tracker = CompletionTracker::new(config.completion);
    let report = WorkflowReport::from_state(&checkpoint.state, &tracker, Duration::ZERO, Some(path.to_path_buf()));

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            println!(
                "Checkpoint {} (schema {}, saved {}, sequence {}, {} events)",
                path.display(),
                checkpoint.schema_version,
                checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S UTC"),
                checkpoint.state.sequence_number,
                checkpoint.events.len()
            );
            print!("{}", report.to_summary_string());
        }
    }
    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "agentrun", &mut io::stdout());
}
