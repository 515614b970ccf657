mod config;

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use config::{CrewforgeConfig, Planner};
use crewforge_agent::{build_executor, profile_for, ExecutorBackend};
use crewforge_core::Role;
use crewforge_orchestrator::{
    Agent, Coordinator, ExecutorPlanDecomposer, ProjectSpec, RunReport, RunStatus, TaskStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crewforge", about = "crewforge: multi-agent task coordination")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "crewforge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose a project and run it to completion
    Run {
        #[command(flatten)]
        project: ProjectArgs,
        /// Directory for generated deliverables (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Skip the Claude Code backend
        #[arg(long)]
        fallback: bool,
        /// Run deadline in seconds (overrides config)
        #[arg(long)]
        timeout: Option<u64>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the task graph a project decomposes into, without running it
    Plan {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// List the default agents and their capability tags
    Agents,
}

#[derive(Args)]
struct ProjectArgs {
    /// Main objective of the project
    description: String,
    /// Functional requirement (repeatable)
    #[arg(short, long = "requirement")]
    requirements: Vec<String>,
    /// Constraint applied to every task (repeatable)
    #[arg(long = "constraint")]
    constraints: Vec<String>,
    /// Expected output file (repeatable)
    #[arg(short, long = "deliverable")]
    deliverables: Vec<String>,
    /// Decomposition strategy (overrides config)
    #[arg(long, value_enum)]
    planner: Option<Planner>,
}

impl ProjectArgs {
    fn to_project(&self) -> ProjectSpec {
        ProjectSpec::new(&self.description)
            .with_requirements(self.requirements.iter().cloned())
            .with_constraints(self.constraints.iter().cloned())
            .with_deliverables(self.deliverables.iter().cloned())
    }
}

fn build_coordinator(config: &CrewforgeConfig, planner: Planner) -> Coordinator {
    let executor = build_executor(&config.executor);
    let coordinator = Coordinator::new(config.coordinator.clone(), executor.clone());
    match planner {
        Planner::Keyword => coordinator,
        Planner::Executor => coordinator.with_decomposer(Arc::new(ExecutorPlanDecomposer::new(
            executor,
            config.coordinator.task_timeout().unwrap_or(Duration::from_secs(300)),
        ))),
    }
}

fn print_report(report: &RunReport) {
    println!("{}", report.summary);
    println!();
    for task in &report.tasks {
        let role = task.role_tag.map_or("any", Role::as_tag);
        let agent = task.assigned_agent.as_deref().unwrap_or("-");
        println!("  [{}] {} ({role}, agent: {agent})", task.status, task.description);
        if let Some(error) = task.result.as_ref().and_then(|r| r.error.as_ref()) {
            println!("      {error}");
        }
    }
    if !report.artifacts.is_empty() {
        println!("\nArtifacts:");
        for artifact in &report.artifacts {
            match &artifact.file_path {
                Some(path) => println!("  {path}"),
                None => println!("  ({:?}, {} bytes)", artifact.kind, artifact.content.len()),
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = CrewforgeConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Run {
            project,
            output,
            fallback,
            timeout,
            json,
        } => {
            if let Some(output) = output {
                config.executor.output_dir = output;
            }
            if fallback {
                config.executor.backend = ExecutorBackend::Fallback;
            }
            if let Some(timeout) = timeout {
                config.coordinator.run_timeout_secs = timeout;
            }
            let planner = project.planner.unwrap_or(config.planner);

            let coordinator = build_coordinator(&config, planner);
            coordinator.start_system();
            let run_id = coordinator.submit_project_task(project.to_project()).await?;
            info!(run_id = %run_id, "Run submitted");

            // The dispatcher enforces the run deadline; the wait only needs slack.
            let wait = config.coordinator.run_timeout() + Duration::from_secs(5);
            let status = tokio::select! {
                status = coordinator.wait_for_completion(run_id, wait) => status?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(run_id = %run_id, "Interrupted, stopping run");
                    coordinator.stop_system().await;
                    coordinator.run_status(run_id).await?
                }
            };
            coordinator.stop_system().await;

            let report = coordinator.run_report(run_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
                let metrics = coordinator.get_performance_metrics().await;
                println!(
                    "\nCompletion rate: {:.0}%  Messages: {}  Retries: {}",
                    metrics.completion_rate * 100.0,
                    metrics.total_messages,
                    metrics.total_retries
                );
            }

            if status != RunStatus::Completed {
                bail!("run {run_id} finished with status {status}");
            }
            let unfinished = report
                .tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Completed)
                .count();
            if unfinished > 0 {
                bail!("{unfinished} task(s) did not complete");
            }
        }
        Commands::Plan { project } => {
            let planner = project.planner.unwrap_or(config.planner);
            let coordinator = build_coordinator(&config, planner);
            let graph = coordinator.plan(&project.to_project()).await?;
            let tasks = graph.tasks();

            println!("Plan ({} tasks):", tasks.len());
            for (i, task) in tasks.iter().enumerate() {
                let role = task.role_tag.map_or("any", Role::as_tag);
                let deps: Vec<String> = task
                    .dependencies
                    .iter()
                    .filter_map(|d| tasks.iter().position(|t| t.id == *d))
                    .map(|n| format!("#{}", n + 1))
                    .collect();
                println!("  #{} [{role}] {}", i + 1, task.description);
                if !deps.is_empty() {
                    println!("      after {}", deps.join(", "));
                }
                if !task.deliverables.is_empty() {
                    println!("      deliverables: {}", task.deliverables.join(", "));
                }
            }
        }
        Commands::Agents => {
            println!("Default agents:");
            for role in Role::ALL {
                let agent = Agent::for_role(role);
                let tags: Vec<&str> = agent.capability_tags.iter().map(String::as_str).collect();
                println!("  {} ({})", agent.id, role);
                println!("    tags: {}", tags.join(", "));
                println!("    tools: {}", profile_for(role).allowed_tools.join(", "));
            }
        }
    }

    Ok(())
}
