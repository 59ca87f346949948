//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the `converge` command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use halldyll_converge::address::ResourceAddress;
use halldyll_converge::cli::{
    Cli, Commands, ConsoleHook, LogFormat, OutputFormat, OutputFormatter, RunArgs, StateCommands,
};
use halldyll_converge::config::{
    ConfigParser, ConfigValidator, DeployConfig, StateBackend, find_config_file,
};
use halldyll_converge::engine::CancelSignal;
use halldyll_converge::error::{ConvergeError, Result};
use halldyll_converge::orchestrator::{Orchestrator, RunOptions};
use halldyll_converge::planner::PlanMode;
use halldyll_converge::provider::ProviderRegistry;
use halldyll_converge::state::{LocalStateStore, S3StateStore, StateStore};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Whether the command reached the state it was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

impl From<bool> for Outcome {
    fn from(success: bool) -> Self {
        if success { Self::Success } else { Self::Failure }
    }
}

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::Failure) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over the verbosity flag when set.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<Outcome> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { destroy, run } => {
            let orchestrator = load_orchestrator(config_path, cli.output).await?;
            cmd_plan(&orchestrator, destroy, &run, &formatter).await
        }
        Commands::Apply { yes, run } => {
            let orchestrator = load_orchestrator(config_path, cli.output).await?;
            cmd_apply(&orchestrator, yes, &run, &formatter).await
        }
        Commands::Destroy { yes, run } => {
            let orchestrator = load_orchestrator(config_path, cli.output).await?;
            cmd_destroy(&orchestrator, yes, &run, &formatter).await
        }
        Commands::Refresh => {
            let orchestrator = load_orchestrator(config_path, cli.output).await?;
            let cancel = interruptible();
            let report = orchestrator.refresh(&cancel).await?;
            emit(&formatter.format_refresh(&report))?;
            Ok(Outcome::from(report.errors.is_empty()))
        }
        Commands::Drift => {
            let orchestrator = load_orchestrator(config_path, cli.output).await?;
            let cancel = interruptible();
            let report = orchestrator.drift(&cancel).await?;
            emit(&formatter.format_drift(&report))?;
            Ok(Outcome::from(report.is_converged()))
        }
        Commands::Import { address, id } => {
            let orchestrator = load_orchestrator(config_path, cli.output).await?;
            cmd_import(&orchestrator, &address, &id, &formatter).await
        }
        Commands::State { command } => {
            let orchestrator = load_orchestrator(config_path, cli.output).await?;
            cmd_state(&orchestrator, command, &formatter).await
        }
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<Outcome> {
    info!("Initializing new converge project in: {}", path.display());

    let config_path = path.join("converge.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(Outcome::Failure);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let config_template = include_str!("../templates/converge.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".converge") {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# Converge local state")?;
            writeln!(file, ".converge/")?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".converge/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit converge.yaml to declare your resources");
    eprintln!("  2. Run 'converge validate' to check your configuration");
    eprintln!("  3. Run 'converge plan' to see what would change");
    eprintln!("  4. Run 'converge apply' to converge");

    Ok(Outcome::Success)
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<Outcome> {
    let (config_file, parser) = config_parser(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let config = parser.load_with_env(&config_file)?;
    let result = ConfigValidator::new().check(&config);

    emit(&formatter.format_validation(&result, show_warnings))?;
    if result.errors.is_empty() {
        eprintln!("\nConfiguration summary:");
        eprintln!("  Project: {}", config.project.name);
        eprintln!("  Environment: {}", config.project.environment);
        eprintln!("  Resources: {}", config.resources.len());
        eprintln!("  Data sources: {}", config.data.len());
        eprintln!("  Modules: {}", config.modules.len());
    }

    Ok(Outcome::from(result.errors.is_empty()))
}

/// Show what a run would change.
async fn cmd_plan(
    orchestrator: &Orchestrator,
    destroy: bool,
    run: &RunArgs,
    formatter: &OutputFormatter,
) -> Result<Outcome> {
    let mode = if destroy { PlanMode::Destroy } else { PlanMode::Apply };
    let cancel = interruptible();
    let plan = orchestrator.plan(mode, &run_options(run), &cancel).await?;

    emit(&formatter.format_plan(&plan))?;
    Ok(Outcome::from(plan.passes_guardrails()))
}

/// Converge towards the configuration.
async fn cmd_apply(
    orchestrator: &Orchestrator,
    auto_approve: bool,
    run: &RunArgs,
    formatter: &OutputFormatter,
) -> Result<Outcome> {
    let options = run_options(run);

    if !auto_approve {
        let preview = orchestrator.plan(PlanMode::Apply, &options, &CancelSignal::new()).await?;
        eprintln!("{}", formatter.format_plan(&preview));

        if !preview.has_changes() {
            return Ok(Outcome::Success);
        }
        if !preview.passes_guardrails() {
            return Ok(Outcome::Failure);
        }
        if !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return Ok(Outcome::Success);
        }
    }

    let cancel = interruptible();
    let report = orchestrator.apply(&options, &cancel).await?;
    emit(&formatter.format_report(&report))?;

    Ok(Outcome::from(report.is_success()))
}

/// Destroy every recorded instance.
async fn cmd_destroy(
    orchestrator: &Orchestrator,
    auto_approve: bool,
    run: &RunArgs,
    formatter: &OutputFormatter,
) -> Result<Outcome> {
    let options = run_options(run);

    if !auto_approve {
        let preview = orchestrator.plan(PlanMode::Destroy, &options, &CancelSignal::new()).await?;
        eprintln!("{}", formatter.format_plan(&preview));

        if !preview.has_changes() {
            eprintln!("Nothing to destroy.");
            return Ok(Outcome::Success);
        }
        if !preview.passes_guardrails() {
            return Ok(Outcome::Failure);
        }
        if !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
            eprintln!("Destruction cancelled.");
            return Ok(Outcome::Success);
        }
    }

    let cancel = interruptible();
    let report = orchestrator.destroy(&options, &cancel).await?;
    emit(&formatter.format_report(&report))?;

    Ok(Outcome::from(report.is_success()))
}

/// Adopt an existing object.
async fn cmd_import(
    orchestrator: &Orchestrator,
    address: &ResourceAddress,
    id: &str,
    formatter: &OutputFormatter,
) -> Result<Outcome> {
    let cancel = interruptible();
    let report = orchestrator.import(address, id, &cancel).await?;
    emit(&formatter.format_state_report(&report))?;
    Ok(Outcome::Success)
}

/// State management commands.
async fn cmd_state(
    orchestrator: &Orchestrator,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<Outcome> {
    match command {
        StateCommands::Show => match orchestrator.show().await? {
            Some(state) => emit(&formatter.format_state(&state))?,
            None => eprintln!("No state found."),
        },
        StateCommands::List => {
            if let Some(state) = orchestrator.show().await? {
                emit(&formatter.format_state_list(&state))?;
            }
        }
        StateCommands::Rm { addresses } => {
            let report = orchestrator.state_rm(&addresses).await?;
            emit(&formatter.format_state_report(&report))?;
        }
        StateCommands::Lock => {
            let lock = orchestrator.lock_info().await?;
            emit(&formatter.format_lock(lock.as_ref()))?;
        }
        StateCommands::Unlock { lock_id } => {
            orchestrator.force_unlock(&lock_id).await?;
            eprintln!("State unlocked.");
        }
    }

    Ok(Outcome::Success)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// A cancel signal wired to Ctrl-C.
///
/// The first interrupt stops dispatching new work; the second aborts
/// operations still in flight.
fn interruptible() -> CancelSignal {
    let cancel = CancelSignal::new();
    let signal = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, waiting for in-flight operations. Press Ctrl-C again to abort them.");
        signal.soft_cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received, aborting in-flight operations");
            signal.hard_cancel();
        }
    });

    cancel
}

fn run_options(run: &RunArgs) -> RunOptions {
    RunOptions {
        refresh: run.refresh,
        replace: run.replace.clone(),
    }
}

/// Resolves the configuration file and a parser rooted next to it.
fn config_parser(config_path: Option<&Path>) -> Result<(PathBuf, ConfigParser)> {
    let config_file = config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))?;
    let base = config_file.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;
    Ok((config_file, parser))
}

/// Loads the configuration and builds an orchestrator over its state backend.
async fn load_orchestrator(config_path: Option<&Path>, output: OutputFormat) -> Result<Orchestrator> {
    let (config_file, parser) = config_parser(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    let base = config_file.parent().unwrap_or_else(|| Path::new("."));
    let store = state_store(&config, base).await?;
    debug!("Using {} state at {}", store.backend_type(), store.location());

    let orchestrator = Orchestrator::new(config, ProviderRegistry::with_builtin(), store);
    Ok(match output {
        OutputFormat::Text => orchestrator.with_hook(Arc::new(ConsoleHook)),
        OutputFormat::Json => orchestrator,
    })
}

/// Creates the state store the configuration asks for.
async fn state_store(config: &DeployConfig, base: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => match config.state.path.as_deref() {
            Some(path) => Arc::new(LocalStateStore::with_state_path(base.join(path))),
            None => Arc::new(LocalStateStore::with_base_dir(base.join(".converge"))),
        },
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| ConvergeError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Arc::new(S3StateStore::new(bucket, prefix, region).await)
        }
    };
    Ok(store)
}
