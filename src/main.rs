//! rtlforge CLI - design plan orchestrator

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::warn;

use rtlforge::bus::{channel_bus, AmqpTaskBus, MockWorker};
use rtlforge::orchestrator::RunSummary;
use rtlforge::{Config, Dag, DesignContext, ForgeError, Orchestrator, TaskMemory};

#[derive(Parser)]
#[command(name = "rtlforge")]
#[command(about = "rtlforge - orchestrate agent pipelines from design plan to verified RTL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BusKind {
    /// AMQP broker (production)
    Amqp,
    /// In-memory bus with a mock worker (dry run, no broker needed)
    Mock,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator over a frozen plan
    Run {
        /// Path to design_context.json
        #[arg(long, default_value = "design_context.json")]
        design: PathBuf,

        /// Path to dag.json
        #[arg(long, default_value = "dag.json")]
        dag: PathBuf,

        /// Transport to use
        #[arg(long, value_enum, default_value = "amqp")]
        bus: BusKind,
    },

    /// Validate plan documents without touching the broker
    Validate {
        /// Path to design_context.json
        #[arg(long, default_value = "design_context.json")]
        design: PathBuf,

        /// Path to dag.json
        #[arg(long, default_value = "dag.json")]
        dag: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let exit = match cli.command {
        Commands::Run { design, dag, bus } => run_plan(&design, &dag, bus).await,
        Commands::Validate { design, dag } => validate_plan(&design, &dag),
    };

    match exit {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn run_plan(design_path: &Path, dag_path: &Path, bus_kind: BusKind) -> Result<i32> {
    let config = Config::from_env();
    let design = DesignContext::load(design_path).context("loading design context")?;
    let dag = Dag::load(dag_path, &design).context("loading dag")?;

    println!(
        "{} {} node(s), artifacts at {}, memory at {}",
        "→".cyan(),
        dag.len(),
        config.artifacts_root.display().to_string().cyan(),
        config.task_memory_root.display().to_string().cyan()
    );

    let summary = match bus_kind {
        BusKind::Amqp => run_over_amqp(&config, &design, dag_path).await?,
        BusKind::Mock => run_over_mock(&config, &design, dag).await?,
    };

    println!("{}", summary.render());
    Ok(if summary.is_success() { 0 } else { 1 })
}

/// Run against the broker, reconnecting with exponential backoff on a lost
/// connection. Each attempt reloads the DAG and task memory, so completed
/// stages are never re-published after a reconnect.
async fn run_over_amqp(
    config: &Config,
    design: &DesignContext,
    dag_path: &Path,
) -> Result<RunSummary> {
    let mut backoff = Duration::from_millis(500);
    loop {
        let bus = AmqpTaskBus::connect_with_backoff(
            &config.broker_url,
            config.prefetch,
            config.confirm_timeout,
            config.reconnect_ceiling,
        )
        .await
        .context("connecting to broker")?;
        let dag = Dag::load(dag_path, design).context("loading dag")?;
        let memory = TaskMemory::open(&config.task_memory_root, &config.artifacts_root)
            .context("opening task memory")?;

        let mut orchestrator =
            Orchestrator::new(Arc::new(bus), dag, design.clone(), memory, config.clone());
        match orchestrator.run().await {
            Ok(summary) => return Ok(summary),
            Err(ForgeError::Transport(e)) if backoff <= config.reconnect_ceiling => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "broker connection lost, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(anyhow::Error::from(e).context("orchestration failed")),
        }
    }
}

async fn run_over_mock(config: &Config, design: &DesignContext, dag: Dag) -> Result<RunSummary> {
    let memory = TaskMemory::open(&config.task_memory_root, &config.artifacts_root)
        .context("opening task memory")?;
    let (bus, handle) = channel_bus();
    let worker = tokio::spawn(MockWorker::new(handle).run());

    let mut orchestrator =
        Orchestrator::new(Arc::new(bus), dag, design.clone(), memory, config.clone());
    let summary = orchestrator.run().await.context("orchestration failed")?;
    worker.abort();
    Ok(summary)
}

fn validate_plan(design_path: &Path, dag_path: &Path) -> Result<i32> {
    let design = DesignContext::load(design_path).context("loading design context")?;
    let dag = Dag::load(dag_path, &design).context("loading dag")?;

    println!(
        "{} plan valid: {} node(s), design hash {}",
        "✓".green().bold(),
        dag.len(),
        design.design_context_hash
    );
    Ok(0)
}
