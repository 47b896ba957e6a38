//! `drover` CLI entry-point.
//!
//! Available sub-commands:
//! - `make`     : bring targets up to date.
//! - `outdated` : list targets that `make` would rebuild, and why.
//! - `validate` : check a plan and print its build order.
//! - `deps`     : show the analyzed dependencies of a target.
//! - `show`     : print the cached value of a target.
//! - `clean`    : drop targets from the cache.
//! - `times`    : build times of cached targets.
//! - `progress` : per-target status of the latest (or a given) run.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cache::CachePool;
use engine::config::CONFIG_FILE;
use engine::{inspect, DependencyGraph, EngineConfig, Plan, PlanExecutor};
use workers::ShellWorker;

#[derive(Parser)]
#[command(
    name = "drover",
    about = "Reproducible, incremental builds for command pipelines",
    version
)]
struct Cli {
    /// Plan file (`.toml`, or `.json`).
    #[arg(long, global = true, env = "DROVER_PLAN", default_value = "drover_plan.toml")]
    plan: PathBuf,

    /// Engine configuration file; a missing file means defaults.
    #[arg(long, global = true, env = "DROVER_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Cache directory (overrides the configuration file).
    #[arg(long, global = true, env = "DROVER_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Maximum number of concurrent builds.
    #[arg(short = 'j', long, global = true, env = "DROVER_JOBS")]
    jobs: Option<usize>,

    /// Keep building independent targets after a failure.
    #[arg(short = 'k', long, global = true)]
    keep_going: bool,

    /// Print reports as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (`-v` debug, `-vv` trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build outdated targets (all of them when none are named).
    Make { targets: Vec<String> },
    /// List outdated targets without building anything.
    Outdated,
    /// Validate the plan and print the build order.
    Validate,
    /// Show what a target depends on.
    Deps { target: String },
    /// Write the cached value of a target to stdout.
    Show { target: String },
    /// Remove targets from the cache (all of them when none are named).
    Clean { targets: Vec<String> },
    /// Print how long each cached target took to build.
    Times,
    /// Print the status of every target of a run.
    Progress {
        /// Run id; defaults to the latest run.
        #[arg(long)]
        run: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    debug!(?config, "configuration loaded");

    match &cli.command {
        Command::Make { targets } => {
            let plan = load_plan(&cli.plan)?;
            let pool = open_cache(&config).await?;
            let worker = Arc::new(ShellWorker::new(config.shell.clone()));
            let executor = PlanExecutor::new(pool, worker, config);

            // The report is printed for failed runs too; the exit status
            // carries the failure.
            let report = executor.build_targets(&plan, targets).await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "built {}, up to date {}, failed {}, cancelled {}",
                    report.built.len(),
                    report.skipped.len(),
                    report.failed.len(),
                    report.cancelled.len()
                );
                for (target, message) in &report.failed {
                    println!("  failed {target}: {message}");
                }
            }
            if !report.is_success() {
                bail!("{} target(s) failed", report.failed.len());
            }
        }
        Command::Outdated => {
            let plan = load_plan(&cli.plan)?;
            let pool = open_cache(&config).await?;
            let worker = ShellWorker::new(config.shell.clone());

            let outdated = inspect::outdated(&pool, &worker, &config, &plan).await?;
            if cli.json {
                print_json(&outdated)?;
            } else if outdated.is_empty() {
                println!("all targets are up to date");
            } else {
                for target in &outdated {
                    let reasons: Vec<String> = target.reasons.iter().map(ToString::to_string).collect();
                    println!("{}: {}", target.name, reasons.join("; "));
                }
            }
        }
        Command::Validate => {
            let plan = load_plan(&cli.plan)?;
            let graph = DependencyGraph::build(&plan)?;
            if cli.json {
                print_json(&graph.order())?;
            } else {
                println!("✅ Plan is valid. Build order: {:?}", graph.order());
            }
        }
        Command::Deps { target } => {
            let plan = load_plan(&cli.plan)?;
            let deps = inspect::deps_target(&plan, target)?;
            if cli.json {
                print_json(&deps)?;
            } else {
                let line = |label: &str, items: &std::collections::BTreeSet<String>| {
                    let items: Vec<&str> = items.iter().map(String::as_str).collect();
                    println!("{label:<10} {}", items.join(", "));
                };
                line("targets", &deps.targets);
                line("imports", &deps.imports);
                line("files in", &deps.files_in);
                line("files out", &deps.files_out);
            }
        }
        Command::Show { target } => {
            let pool = open_cache(&config).await?;
            let value = inspect::read_target(&pool, target).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&value).context("cannot write to stdout")?;
            stdout.flush().context("cannot write to stdout")?;
        }
        Command::Clean { targets } => {
            let pool = open_cache(&config).await?;
            let removed = inspect::clean(&pool, &config.cache_path(), targets).await?;
            if cli.json {
                print_json(&removed)?;
            } else {
                println!("removed {} target(s)", removed.len());
            }
        }
        Command::Times => {
            let pool = open_cache(&config).await?;
            let times = inspect::build_times(&pool).await?;
            if cli.json {
                print_json(&times)?;
            } else {
                for t in &times {
                    println!("{:<30} {:>10.3}s  {}", t.name, t.elapsed.as_secs_f64(), t.built_at.to_rfc3339());
                }
            }
        }
        Command::Progress { run } => {
            let pool = open_cache(&config).await?;
            let statuses = inspect::progress(&pool, *run).await?;
            if cli.json {
                print_json(&statuses)?;
            } else {
                for (target, status) in &statuses {
                    println!("{target:<30} {status}");
                }
            }
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `-v` flags pick the level. Logs go to stderr.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::load(&cli.config)
        .with_context(|| format!("cannot load configuration {}", cli.config.display()))?;
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs;
    }
    config.keep_going |= cli.keep_going;
    Ok(config)
}

fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    let plan = Plan::load(path).with_context(|| format!("cannot load plan {}", path.display()))?;
    info!(targets = plan.targets.len(), imports = plan.imports.len(), "plan loaded");
    Ok(plan)
}

async fn open_cache(config: &EngineConfig) -> anyhow::Result<CachePool> {
    let dir = config.cache_path();
    cache::pool::open(&dir)
        .await
        .with_context(|| format!("cannot open cache {}", dir.display()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
