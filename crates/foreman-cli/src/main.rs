//! `foreman`: plan a requirements document into tasks and drive them
//! through generation, review and version control.

mod stdin_intervention;

use clap::{Parser, Subcommand};
use foreman_agent::{build_backend, build_vcs, BackendKind};
use foreman_core::intervention::{FixedActionChannel, InterventionChannel};
use foreman_orchestrator::{
    BaselineReviewer, ForemanConfig, Orchestrator, OutlinePlanner, PlanFile, Planner,
    RunContext, RunReport,
};
use foreman_session::RunStore;
use std::path::PathBuf;
use std::sync::Arc;
use stdin_intervention::StdinInterventionChannel;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "foreman", about = "Foreman — autonomous development orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "foreman.toml")]
    config: PathBuf,

    /// Human-readable logs and report instead of JSON
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a requirements document
    Run {
        /// Requirements outline file (bulleted markdown or plain text), or
        /// `-` to read it from stdin
        #[arg(required_unless_present_any = ["plan", "text"])]
        requirements: Option<PathBuf>,
        /// Requirements given inline instead of a file
        #[arg(long, conflicts_with = "requirements", allow_hyphen_values = true)]
        text: Option<String>,
        /// Explicit TOML plan instead of planning the requirements
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Directory generated files are written into (overrides config)
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Concurrent task slots (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Code-generation backend: claude-code, command or dry-run
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Ask on the terminal when a task needs a decision
        #[arg(long)]
        interactive: bool,
    },
    /// Show the report of a finished run
    Report {
        /// Run identifier
        run_id: String,
    },
    /// List recorded runs, oldest first
    Runs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    }

    let mut config = ForemanConfig::load(Some(&cli.config))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {e}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            requirements,
            text,
            plan,
            workspace,
            concurrency,
            backend,
            interactive,
        } => {
            if let Some(workspace) = workspace {
                config.workspace_dir = workspace;
            }
            if let Some(slots) = concurrency {
                config.orchestrator.slots = slots;
            }
            if let Some(kind) = backend {
                config.backend.kind = kind;
            }
            config.validate()?;

            let tasks = match plan {
                Some(plan) => PlanFile::load(&plan).await?.into_tasks()?,
                None => {
                    let text = read_requirements(requirements, text).await?;
                    OutlinePlanner::new().plan(&text)?
                }
            };
            info!(tasks = tasks.len(), "Plan ready");

            let report = run(config, tasks, interactive).await?;
            print_report(&report, cli.pretty)?;
            std::process::exit(report.exit_code());
        }
        Commands::Report { run_id } => {
            let store = RunStore::new(&config.data_dir).await?;
            let report: RunReport = store
                .load_report(&run_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No report for run '{run_id}'"))?;
            print_report(&report, cli.pretty)?;
        }
        Commands::Runs => {
            let store = RunStore::new(&config.data_dir).await?;
            let runs = store.list_runs().await?;
            if runs.is_empty() {
                println!("No runs recorded under {}", config.data_dir.display());
            }
            for run_id in runs {
                println!("{run_id}");
            }
        }
    }

    Ok(())
}

async fn run(
    config: ForemanConfig,
    tasks: Vec<foreman_orchestrator::Task>,
    interactive: bool,
) -> anyhow::Result<RunReport> {
    let ctx = RunContext::persistent(config).await?;
    let config = Arc::clone(&ctx.config);

    let backend = build_backend(&config.backend)?;
    if !backend.health_check().await {
        warn!(backend = backend.name(), "Backend health check failed, continuing with fallbacks");
    }
    let vcs = build_vcs(&config.vcs, &config.workspace_dir)?;
    let reviewer = Arc::new(BaselineReviewer::new(config.review.weights.clone()));
    let intervention: Arc<dyn InterventionChannel> = if interactive {
        Arc::new(StdinInterventionChannel::new(config.intervention.default_action))
    } else {
        Arc::new(FixedActionChannel::new(config.intervention.default_action))
    };

    let orchestrator = Orchestrator::new(ctx, backend, vcs, reviewer, intervention)?;
    info!(run_id = orchestrator.run_id(), "Starting run");

    let evaluator = orchestrator.evaluator();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after in-flight backend calls");
            evaluator.request_stop();
        }
    });

    Ok(orchestrator.run(tasks).await?)
}

/// Inline text wins; `-` reads stdin; anything else is a file path.
async fn read_requirements(path: Option<PathBuf>, text: Option<String>) -> anyhow::Result<String> {
    if let Some(text) = text {
        return Ok(text);
    }
    let Some(path) = path else {
        anyhow::bail!("either <requirements>, --text or --plan is required");
    };
    if path.as_os_str() == "-" {
        let mut text = String::new();
        tokio::io::stdin().read_to_string(&mut text).await?;
        return Ok(text);
    }
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read requirements '{}': {e}", path.display()))
}

fn print_report(report: &RunReport, pretty: bool) -> anyhow::Result<()> {
    if pretty {
        print!("{}", report.summary());
    } else {
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_run_accepts_inline_text() {
        let cli = Cli::try_parse_from(["foreman", "run", "--text", "- Add parser"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Run { text: Some(ref t), requirements: None, .. } if t == "- Add parser"
        ));
    }

    #[test]
    fn test_run_needs_some_requirements() {
        assert!(Cli::try_parse_from(["foreman", "run"]).is_err());
        assert!(Cli::try_parse_from(["foreman", "run", "reqs.md", "--text", "x"]).is_err());
        assert!(Cli::try_parse_from(["foreman", "run", "--plan", "plan.toml"]).is_ok());
        assert!(Cli::try_parse_from(["foreman", "run", "-"]).is_ok());
    }

    #[tokio::test]
    async fn test_read_requirements_sources() {
        let inline = read_requirements(None, Some("- Add parser".into())).await.unwrap();
        assert_eq!(inline, "- Add parser");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reqs.md");
        std::fs::write(&path, "- Add formatter\n").unwrap();
        let from_file = read_requirements(Some(path), None).await.unwrap();
        assert_eq!(from_file, "- Add formatter\n");

        let missing = read_requirements(Some(dir.path().join("nope.md")), None).await;
        assert!(missing.unwrap_err().to_string().contains("Failed to read requirements"));
    }
}
