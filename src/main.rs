//! stackclaw: declarative resource graphs
//!
//! Usage:
//!   stackclaw plan    -s stack.yaml              → show what apply would do
//!   stackclaw apply   -s stack.yaml -c key=value → converge resources to the stack
//!   stackclaw destroy -s stack.yaml              → delete everything in state
//!   stackclaw version                            → show version
//!
//! Exit codes: 0 success, 1 a node failed or the run was cancelled,
//! 2 the stack is invalid.

use clap::{Parser, Subcommand};
use stackclaw::commands::{self, Workspace, EXIT_FAILED, EXIT_INVALID, EXIT_OK};
use stackclaw::config::{init_tracing, StackclawConfig};
use stackclaw::format::{format_plan, format_report, FormatOptions};
use stackclaw_graph::ResourceGraph;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "stackclaw",
    about = "Declarative resource graphs: plan, apply, destroy",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Stack file (YAML or JSON)
    #[arg(short, long, global = true, default_value = "stack.yaml")]
    stack: PathBuf,

    /// Stack config override, key=value (repeatable)
    #[arg(short = 'c', long = "config", global = true)]
    config: Vec<String>,

    /// Path to stackclaw config file (TOML)
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    /// State file (overrides [state] path)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Max provider operations in flight
    #[arg(short = 'j', long, global = true)]
    parallelism: Option<usize>,

    /// Per-operation timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Write logs to a file (in addition to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    /// Show every property in plans
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the planned actions without calling any provider
    Plan,
    /// Apply the stack
    Apply {
        /// Do not print resource outputs
        #[arg(long, default_value_t = false)]
        no_outputs: bool,
    },
    /// Delete every resource recorded in state
    Destroy,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("stackclaw v{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(EXIT_INVALID);
        }
    };
    let guard = init_tracing(&config.log);

    let code = match run(&cli, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FAILED
        }
    };
    drop(guard);
    std::process::exit(code);
}

/// Config file, then command line flags on top.
fn load_config(cli: &Cli) -> anyhow::Result<StackclawConfig> {
    let mut config = match &cli.config_file {
        Some(path) => StackclawConfig::load_required(path)?,
        None => StackclawConfig::load(&StackclawConfig::default_path()),
    };
    if let Some(path) = &cli.state {
        config.state.path = Some(path.clone());
    }
    if let Some(n) = cli.parallelism {
        config.engine.parallelism = n;
    }
    if let Some(secs) = cli.timeout {
        config.engine.timeout_secs = secs;
    }
    if let Some(path) = &cli.log_file {
        config.log.file = Some(path.clone());
    }
    if cli.log_json {
        config.log.json = true;
    }
    Ok(config)
}

async fn run(cli: &Cli, config: &StackclawConfig) -> anyhow::Result<i32> {
    let ws = match Workspace::open(&cli.stack, &cli.config, config) {
        Ok(ws) => ws,
        Err(e) => return Ok(invalid(&e)),
    };
    tracing::info!(
        stack = %ws.ctx.stack,
        run_id = %ws.ctx.run_id,
        state = %ws.state_path.display(),
        "workspace opened"
    );

    let store = ws.store();
    let mut opts = FormatOptions {
        verbose: cli.verbose,
        ..Default::default()
    };

    match &cli.command {
        Commands::Plan => {
            let planned = match commands::plan(&ws, &store).await {
                Ok(p) => p,
                Err(e) if e.is_validation() => return Ok(invalid(&e)),
                Err(e) => return Err(e.into()),
            };
            print!("{}", format_plan(&ws.ctx, &planned.graph, &planned.plan, &opts));
            Ok(EXIT_OK)
        }
        Commands::Apply { no_outputs } => {
            opts.show_outputs = !no_outputs;
            watch_interrupt(&ws);
            let planned = match commands::plan(&ws, &store).await {
                Ok(p) => p,
                Err(e) if e.is_validation() => return Ok(invalid(&e)),
                Err(e) => return Err(e.into()),
            };
            print!("{}", format_plan(&ws.ctx, &planned.graph, &planned.plan, &opts));

            let providers = Arc::new(ws.providers());
            let report = commands::apply(&ws, &store, providers, &planned).await?;
            finish(&ws, &planned.graph, &report, &opts).await
        }
        Commands::Destroy => {
            watch_interrupt(&ws);
            let providers = Arc::new(ws.providers());
            let report = commands::destroy(&ws, &store, providers).await?;
            finish(&ws, &ResourceGraph::default(), &report, &opts).await
        }
        Commands::Version => Ok(EXIT_OK),
    }
}

async fn finish(
    ws: &Workspace,
    graph: &ResourceGraph,
    report: &stackclaw_engine::ApplyReport,
    opts: &FormatOptions,
) -> anyhow::Result<i32> {
    print!("{}", format_report(report, graph, opts));
    match commands::record_run(&ws.state_path, &report.manifest).await {
        Ok(path) => tracing::debug!("run manifest written to {}", path.display()),
        Err(e) => tracing::warn!("failed to write run manifest: {}", e),
    }
    Ok(commands::exit_code(report))
}

fn invalid(e: &stackclaw_core::Error) -> i32 {
    eprintln!("Error: {}", e);
    if e.is_validation() {
        EXIT_INVALID
    } else {
        EXIT_FAILED
    }
}

/// First Ctrl-C stops admitting new work; in-flight operations finish.
fn watch_interrupt(ws: &Workspace) {
    let token = ws.ctx.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, waiting for in-flight operations");
            token.cancel();
        }
    });
}
