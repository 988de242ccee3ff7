//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trendradar_core::{
    Collaborators, PipelineRun, ProgressReporter, RunOptions, RunStatus, SharedState,
    load_snapshot, run_pipeline,
};
use trendradar_shared::{
    API_KEY_FALLBACK_ENVS, AppConfig, RunConfig, config_file_path, init_config, load_config,
    load_config_from,
};
use trendradar_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// TrendRadar: collect trending headlines, analyse them, and publish a report.
#[derive(Parser)]
#[command(
    name = "trendradar",
    version,
    about = "Collect trending headlines, analyse them with a language model, and render a report.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.trendradar/trendradar.toml).
    #[arg(long, env = "TRENDRADAR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline once: collect, analyse, discuss, report.
    Run {
        /// Output directory (overrides `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Only collect from these platform ids (repeatable).
        #[arg(short, long = "platform")]
        platforms: Vec<String>,

        /// Skip merging and recording item history.
        #[arg(long)]
        no_history: bool,

        /// Continue from a state snapshot written by an earlier run.
        #[arg(long)]
        resume: Option<PathBuf>,
    },

    /// Past runs recorded in the run database.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Inspect a state snapshot.
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Cached model completions.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Run history subcommands.
#[derive(Subcommand)]
pub(crate) enum RunsAction {
    /// List the most recent runs.
    List {
        /// Output directory holding the run database.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Maximum number of runs to show.
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Snapshot subcommands.
#[derive(Subcommand)]
pub(crate) enum SnapshotAction {
    /// Summarise a `state_<stamp>.json` file.
    Show {
        /// Snapshot path.
        path: PathBuf,

        /// Print the raw JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
}

/// Completion cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Drop cached completions for the configured model endpoint.
    Clear {
        /// Output directory holding the run database.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Drop completions for every endpoint.
        #[arg(long)]
        all: bool,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show resolved configuration.
    Show,
    /// Validate the configuration without running anything.
    Validate,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "trendradar=info",
        1 => "trendradar=debug",
        _ => "trendradar=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            out,
            platforms,
            no_history,
            resume,
        } => {
            cmd_run(
                config_path,
                out.as_deref(),
                &platforms,
                no_history,
                resume.as_deref(),
            )
            .await
        }
        Command::Runs { action } => match action {
            RunsAction::List { out, limit } => {
                cmd_runs_list(config_path, out.as_deref(), limit).await
            }
        },
        Command::Snapshot { action } => match action {
            SnapshotAction::Show { path, json } => cmd_snapshot_show(&path, json),
        },
        Command::Cache { action } => match action {
            CacheAction::Clear { out, all } => cmd_cache_clear(config_path, out.as_deref(), all).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(force),
            ConfigAction::Show => cmd_config_show(config_path),
            ConfigAction::Validate => cmd_config_validate(config_path),
        },
    }
}

fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn load_run_config(path: Option<&Path>, out: Option<&Path>) -> Result<RunConfig> {
    let app = load_app_config(path)?;
    let mut config = RunConfig::from_app(&app)?;
    if let Some(out) = out {
        config.output_dir = out.to_path_buf();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: Option<&Path>,
    out: Option<&Path>,
    platforms: &[String],
    no_history: bool,
    resume: Option<&Path>,
) -> Result<()> {
    let app = load_app_config(config_path)?;
    let mut config = RunConfig::from_app(&app)?;
    if let Some(out) = out {
        config.output_dir = out.to_path_buf();
    }
    config.restrict_platforms(platforms)?;

    if config.model.api_key.is_none() {
        return Err(eyre!(
            "no API key found: set {} (or one of {})",
            app.llm.api_key_env,
            API_KEY_FALLBACK_ENVS.join(", ")
        ));
    }

    let resume = match resume {
        Some(path) => Some(load_snapshot(path)?),
        None => None,
    };

    let collaborators = Collaborators::live(&config)?;
    let options = RunOptions {
        use_history: !no_history,
        resume,
    };

    info!(
        platforms = config.platforms.len(),
        personas = config.personas.len(),
        model = %config.model.model,
        out = %config.output_dir.display(),
        "starting trendradar run"
    );

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let reporter = CliProgress::new();
    let result = run_pipeline(&config, collaborators, options, &cancel, &reporter).await;
    reporter.finish();
    let run = result?;

    print_summary(&run);

    match &run.outcome.status {
        RunStatus::Completed | RunStatus::Degraded => Ok(()),
        RunStatus::Aborted { stage, error } => {
            Err(eyre!("run aborted in stage '{stage}': {error}"))
        }
        RunStatus::Cancelled { stage } => Err(eyre!(
            "run cancelled{}",
            stage
                .as_deref()
                .map(|s| format!(" during stage '{s}'"))
                .unwrap_or_default()
        )),
    }
}

fn print_summary(run: &PipelineRun) {
    let state = &run.outcome.state;
    println!();
    println!("  Run {}: {}", state.run_id(), run.outcome.status.as_str());
    println!(
        "  Items:   {}",
        state.raw_items().map_or(0, <[_]>::len)
    );
    println!(
        "  Topics:  {}",
        state.analysis().map_or(0, |a| a.analyzed().count())
    );
    println!(
        "  Panel:   {} statements",
        state.discussion().map_or(0, |d| d.statements.len())
    );
    if let Some(path) = &run.artifacts.report {
        println!("  Report:  {}", path.display());
    }
    println!("  State:   {}", run.artifacts.snapshot.display());
    println!(
        "  Time:    {:.1}s",
        run.outcome.elapsed.as_secs_f64()
    );
    print_stage_errors(state);
    println!();
}

fn print_stage_errors(state: &SharedState) {
    if state.stage_errors().is_empty() {
        return;
    }
    println!("  Errors:");
    for (stage, entry) in state.stage_errors() {
        if let Some(detail) = &entry.detail {
            println!("    {stage}: {detail}");
        }
        for (unit, error) in &entry.units {
            println!("    {stage}/{unit}: {error}");
        }
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn stage_started(&self, stage: &str) {
        self.spinner.set_message(format!("{stage}..."));
    }

    fn unit_finished(&self, stage: &str, unit: &str, ok: bool) {
        let mark = if ok { "ok" } else { "failed" };
        self.spinner.set_message(format!("{stage}: {unit} {mark}"));
    }

    fn stage_finished(&self, stage: &str, ok: bool) {
        let mark = if ok { "✓" } else { "✗" };
        self.spinner.println(format!("  {mark} {stage}"));
    }
}

// ---------------------------------------------------------------------------
// runs / snapshot
// ---------------------------------------------------------------------------

async fn cmd_runs_list(config_path: Option<&Path>, out: Option<&Path>, limit: usize) -> Result<()> {
    let config = load_run_config(config_path, out)?;
    let storage = Storage::open_readonly(&config.database_path()).await?;
    let runs = storage.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs recorded in {}", config.output_dir.display());
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:>6} {:>6}",
        "RUN", "STARTED", "STATUS", "ITEMS", "TOPICS"
    );
    for run in runs {
        println!(
            "{:<38} {:<20} {:<10} {:>6} {:>6}",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.status,
            run.item_count,
            run.topic_count,
        );
        if let Some(error) = &run.error {
            println!("    {error}");
        }
    }
    Ok(())
}

fn cmd_snapshot_show(path: &Path, json: bool) -> Result<()> {
    let state = load_snapshot(path)?;
    if json {
        println!("{}", state.to_snapshot_json()?);
        return Ok(());
    }

    println!("Run:       {}", state.run_id());
    if let Some(previous) = state.resumed_from() {
        println!("Resumed:   from {previous}");
    }
    println!(
        "Started:   {}",
        state.started_at().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("Completed: {}", state.completed_stages().join(" → "));
    println!("Items:     {}", state.raw_items().map_or(0, <[_]>::len));
    if let Some(analysis) = state.analysis() {
        println!(
            "Topics:    {} ({} of {} batches failed)",
            analysis.analyzed().count(),
            analysis.batches_failed.len(),
            analysis.batches_total
        );
    }
    if let Some(discussion) = state.discussion() {
        println!(
            "Panel:     {} statements{}",
            discussion.statements.len(),
            if discussion.degraded { " (degraded)" } else { "" }
        );
    }
    if let Some(report) = state.report() {
        println!(
            "Report:    {} sections{}",
            report.document.sections.len(),
            if report.degraded { " (degraded)" } else { "" }
        );
    }
    print_stage_errors(&state);
    Ok(())
}

// ---------------------------------------------------------------------------
// cache
// ---------------------------------------------------------------------------

async fn cmd_cache_clear(config_path: Option<&Path>, out: Option<&Path>, all: bool) -> Result<()> {
    let config = load_run_config(config_path, out)?;
    let storage = Storage::open(&config.database_path()).await?;
    let removed = clear_cache(&storage, &config, all).await?;
    if all {
        println!("Removed {removed} cached completions");
    } else {
        println!(
            "Removed {removed} cached completions for {}",
            config.model.base_url
        );
    }
    Ok(())
}

/// Completions are cached per endpoint, so without `all` only the
/// configured endpoint's entries go.
async fn clear_cache(storage: &Storage, config: &RunConfig, all: bool) -> Result<u64> {
    let scope = (!all).then_some(config.model.base_url.as_str());
    let removed = storage.invalidate_llm_cache(scope).await?;
    info!(removed, all, "completion cache cleared");
    Ok(removed)
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(force: bool) -> Result<()> {
    let path = init_config(force)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load_app_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn cmd_config_validate(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    let config = load_run_config(config_path, None)?;

    println!("Config OK: {}", path.display());
    println!("  Platforms: {}", config.platforms.len());
    println!("  Personas:  {}", config.personas.len());
    println!("  Model:     {} @ {}", config.model.model, config.model.base_url);
    println!("  Output:    {}", config.output_dir.display());
    if config.model.api_key.is_none() {
        println!("  Warning:   no API key in the environment; `run` will refuse to start");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "trendradar",
            "-vv",
            "run",
            "--platform",
            "weibo",
            "--platform",
            "zhihu",
            "--no-history",
            "--out",
            "/tmp/out",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Run {
                out,
                platforms,
                no_history,
                resume,
            } => {
                assert_eq!(out, Some(PathBuf::from("/tmp/out")));
                assert_eq!(platforms, vec!["weibo", "zhihu"]);
                assert!(no_history);
                assert!(resume.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cache_clear_flags_parse() {
        let cli = Cli::try_parse_from(["trendradar", "cache", "clear", "--all", "--out", "/tmp/out"])
            .unwrap();
        match cli.command {
            Command::Cache {
                action: CacheAction::Clear { out, all },
            } => {
                assert_eq!(out, Some(PathBuf::from("/tmp/out")));
                assert!(all);
            }
            _ => panic!("expected cache clear"),
        }
    }

    #[tokio::test]
    async fn clearing_the_cache_keeps_other_endpoints_unless_all() {
        let mut config = RunConfig::from_app(&AppConfig::default()).unwrap();
        config.output_dir = std::env::temp_dir().join(format!("tr_cli_cache_{}", std::process::id()));
        let storage = Storage::open(&config.database_path()).await.unwrap();
        let endpoint = config.model.base_url.clone();
        storage.set_llm_cache(&endpoint, "h1", "m", "one").await.unwrap();
        storage.set_llm_cache(&endpoint, "h2", "m", "two").await.unwrap();
        storage
            .set_llm_cache("https://other.example/v1", "h1", "m", "three")
            .await
            .unwrap();

        assert_eq!(clear_cache(&storage, &config, false).await.unwrap(), 2);
        assert!(storage.get_llm_cache(&endpoint, "h1", "m").await.unwrap().is_none());
        assert_eq!(clear_cache(&storage, &config, true).await.unwrap(), 1);

        let _ = std::fs::remove_dir_all(&config.output_dir);
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from([
            "trendradar",
            "config",
            "validate",
            "--config",
            "custom.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(
            cli.command,
            Command::Config {
                action: ConfigAction::Validate
            }
        ));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["trendradar", "--log-format", "xml", "run"]).is_err());
    }
}
