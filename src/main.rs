//! Tierform CLI entrypoint.
//!
//! This is the main entrypoint for the tierform command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tierform::cli::{Cli, Commands, GraphFormat, LogFormat, OutputFormatter, StateCommands};
use tierform::config::{ConfigParser, ConfigValidator, PlanConfig, StateBackend, find_config_file};
use tierform::error::{Result, TierformError};
use tierform::planner::{DependencyGraph, OutputResolver, Plan};
use tierform::provider::{self, Provider};
use tierform::reconciler::{Reconciler, RunReport};
use tierform::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point. Returns whether the command succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| true),
        Commands::Validate { warnings } => cmd_validate(config, warnings),
        Commands::Graph { format } => cmd_graph(config, format, &formatter).map(|()| true),
        Commands::Plan { destroy, detailed } => cmd_plan(config, destroy, detailed, &formatter).await.map(|()| true),
        Commands::Apply { yes, targets } => cmd_apply(config, yes, &targets, &formatter).await,
        Commands::Destroy { yes, targets } => cmd_destroy(config, yes, &targets, &formatter).await,
        Commands::Output { name } => cmd_output(config, name.as_deref(), &formatter).await.map(|()| true),
        Commands::Status { detailed } => cmd_status(config, detailed, &formatter).await.map(|()| true),
        Commands::State { command } => cmd_state(config, command, &formatter).await.map(|()| true),
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Tierform project in: {}", path.display());

    let config_path = path.join("tierform.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Plan file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/tierform.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Tierform")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env if you use the http provider");
    eprintln!("  2. Edit tierform.yaml to declare your resources");
    eprintln!("  3. Run 'tierform validate' to check the plan");
    eprintln!("  4. Run 'tierform plan' to see what will be created");
    eprintln!("  5. Run 'tierform apply' to realize it");

    Ok(())
}

/// Validate the plan file.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool) -> Result<bool> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating plan: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    if !result.is_valid() {
        eprintln!("Plan is invalid ({} error(s)):", result.error_count());
        for error in &result.errors {
            eprintln!("  - {error}");
        }
        return Ok(false);
    }

    // Graph construction catches cycles and dangling references
    let plan = Plan::from_config(&config)?;
    let graph = DependencyGraph::from_plan(&plan)?;

    eprintln!("Plan is valid!");
    if show_warnings && result.warning_count() > 0 {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nPlan summary:");
    eprintln!("  Project: {}", plan.project());
    eprintln!("  Environment: {}", plan.environment());
    eprintln!("  Resources: {}", plan.len());
    eprintln!("  Dependencies: {}", graph.edge_count());
    eprintln!("  Outputs: {}", plan.outputs().len());
    eprintln!("  Plan hash: {}", plan.hash().get(..12).unwrap_or(plan.hash()));

    Ok(true)
}

/// Show the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>, format: GraphFormat, formatter: &OutputFormatter) -> Result<()> {
    let (_config, plan) = load_plan(config_path)?;
    let graph = DependencyGraph::from_plan(&plan)?;
    println!("{}", formatter.format_graph(&graph, format));
    Ok(())
}

/// Show what an apply or destroy would do.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    destroy: bool,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, plan) = load_plan(config_path)?;
    let store = build_store(&config, config_path).await?;
    let provider = build_provider(&config, &plan, &CancellationToken::new())?;

    let reconciler = Reconciler::new(&plan, &store, provider);
    let diff = reconciler.preview(destroy).await?;

    println!("{}", formatter.format_diff(&diff, detailed));
    Ok(())
}

/// Realize the plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    targets: &[String],
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, plan) = load_plan(config_path)?;
    let store = build_store(&config, config_path).await?;
    let cancel = cancel_on_ctrl_c();
    let provider = build_provider(&config, &plan, &cancel)?;

    let reconciler = Reconciler::new(&plan, &store, provider)
        .with_engine(config.engine.clone())
        .with_cancellation(cancel);

    let diff = reconciler.preview(false).await?;
    if !diff.has_changes() && targets.is_empty() {
        eprintln!("No changes to apply.");
        return Ok(true);
    }

    eprintln!("{}", formatter.format_diff(&diff, false));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(true);
    }

    let report = reconciler.apply(targets).await?;
    Ok(print_report(&report, formatter))
}

/// Destroy recorded resources.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    targets: &[String],
    formatter: &OutputFormatter,
) -> Result<bool> {
    let (config, plan) = load_plan(config_path)?;
    let store = build_store(&config, config_path).await?;
    let cancel = cancel_on_ctrl_c();
    let provider = build_provider(&config, &plan, &cancel)?;

    let reconciler = Reconciler::new(&plan, &store, provider)
        .with_engine(config.engine.clone())
        .with_cancellation(cancel);

    let diff = reconciler.preview(true).await?;
    if diff.deletes == 0 {
        eprintln!("No resources to destroy.");
        return Ok(true);
    }

    eprintln!("The following resources will be destroyed:");
    for resource in diff.actionable_diffs() {
        eprintln!("  {resource}");
    }

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destroy cancelled.");
        return Ok(true);
    }

    let report = reconciler.destroy(targets).await?;
    Ok(print_report(&report, formatter))
}

/// Print resolved outputs.
async fn cmd_output(config_path: Option<&PathBuf>, name: Option<&str>, formatter: &OutputFormatter) -> Result<()> {
    let (config, plan) = load_plan(config_path)?;
    let store = build_store(&config, config_path).await?;
    let provider = build_provider(&config, &plan, &CancellationToken::new())?;

    let state = Reconciler::new(&plan, &store, provider)
        .load_state()
        .await?
        .unwrap_or_else(|| tierform::state::StateSnapshot::new(plan.project(), plan.environment()));
    let resolver = OutputResolver::new(&plan);

    match name {
        Some(name) => {
            let value = resolver.resolve_named(name, &state)?;
            println!("{}", formatter.format_output_value(&value));
        }
        None => {
            let resolved = resolver.resolve_available(&state);
            for error in &resolved.errors {
                warn!("{error}");
            }
            println!("{}", formatter.format_outputs(&resolved.values));
        }
    }

    Ok(())
}

/// Show recorded resource status.
async fn cmd_status(config_path: Option<&PathBuf>, detailed: bool, formatter: &OutputFormatter) -> Result<()> {
    let (config, plan) = load_plan(config_path)?;
    let store = build_store(&config, config_path).await?;
    let provider = build_provider(&config, &plan, &CancellationToken::new())?;

    match Reconciler::new(&plan, &store, provider).load_state().await? {
        Some(state) => println!("{}", formatter.format_status(&state, detailed)),
        None => eprintln!("No state found. Run 'tierform apply' first."),
    }

    Ok(())
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (config, _plan) = load_plan(config_path)?;
    let store = build_store(&config, config_path).await?;
    debug!(backend = store.backend_type(), "State backend ready");

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                let lock = store.get_lock_info().await?;
                println!("{}", formatter.format_state(&state, lock.as_ref()));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::List => {
            if let Some(state) = store.load().await? {
                for id in state.resource_ids() {
                    println!("{id}");
                }
            }
        }
        StateCommands::Unlock { lock_id, force } => match store.get_lock_info().await? {
            None => eprintln!("State is not locked."),
            Some(lock) if force => {
                store.release_lock(&lock.lock_id).await?;
                eprintln!("State forcefully unlocked (was held by {}).", lock.holder);
            }
            Some(lock) => match lock_id {
                Some(id) if id == lock.lock_id => {
                    store.release_lock(&id).await?;
                    eprintln!("State unlocked.");
                }
                Some(id) => eprintln!("Lock ID {id} does not match the current lock {}.", lock.lock_id),
                None => eprintln!("Please provide --lock-id or use --force"),
            },
        },
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the plan file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Creates a parser rooted at the plan file's directory.
fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(config_dir(config_file))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads, validates and builds the plan.
fn load_plan(config_path: Option<&PathBuf>) -> Result<(PlanConfig, Plan)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading plan from: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        debug!("Plan warning: {warning}");
    }

    let plan = Plan::from_config(&config)?;
    Ok((config, plan))
}

/// Creates the state store selected by the plan.
async fn build_store(config: &PlanConfig, config_path: Option<&PathBuf>) -> Result<Box<dyn StateStore>> {
    let state_store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let config_file = resolve_config_path(config_path)?;
            let base = config_dir(&config_file);
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base.join(STATE_DIR), |p| base.join(p));
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| TierformError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await)
        }
    };

    Ok(state_store)
}

/// Creates the provider selected by the plan.
fn build_provider(config: &PlanConfig, plan: &Plan, cancel: &CancellationToken) -> Result<Arc<dyn Provider>> {
    provider::from_config(&config.provider, plan.region(), cancel)
}

/// Returns a token that is cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, waiting for in-flight operations to stop");
            token.cancel();
        }
    });
    cancel
}

/// Prompts on stderr and compares the answer.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Prints a run report and returns whether the run succeeded.
fn print_report(report: &RunReport, formatter: &OutputFormatter) -> bool {
    println!("{}", formatter.format_report(report));
    if report.execution.cancelled {
        eprintln!("Run cancelled. Re-run the same command to resume.");
    }
    report.success()
}
