mod checkpoint_store;
mod io;
mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowcore_ai::AiServiceManager;
use flowcore_config::ConfigStore;
use flowcore_executor::{ExecutorOptions, TaskExecutor};
use flowcore_mcp::{McpFacade, McpServerConfig};
use flowcore_observability::{canonical_logs_dir_from_root, init_logging};
use flowcore_providers::ProviderRegistry;
use flowcore_runtime::{RunnerOptions, WorkflowRunner};
use flowcore_types::{ExecutionContext, ProjectInfo, Task};

use checkpoint_store::FileCheckpointStore;
use io::{CliInputProvider, CliOutputProvider, NullMcpTransport, ShellScriptExecutor};
use progress::ConsoleProgressSink;

#[derive(Parser, Debug)]
#[command(name = "flowcore-engine")]
#[command(about = "Drives a task graph through the Workflow Execution Core")]
struct Cli {
    /// Defaults to `.flowcore` in the current directory.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Topologically sorts `tasks_file` into stages without executing anything.
    Plan { tasks_file: PathBuf },
    /// Runs the workflow described by `tasks_file` end to end.
    Run {
        tasks_file: PathBuf,
        #[arg(long)]
        workflow_id: String,
        #[arg(long, default_value_t = 1)]
        project_id: i64,
        #[arg(long, default_value_t = 3)]
        parallelism: usize,
        #[arg(long)]
        no_checkpoint: bool,
    },
    /// Resumes a workflow from its latest checkpoint.
    Resume {
        tasks_file: PathBuf,
        #[arg(long)]
        workflow_id: String,
        #[arg(long, default_value_t = 1)]
        project_id: i64,
        #[arg(long, default_value_t = 3)]
        parallelism: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = cli.state_dir.unwrap_or_else(|| PathBuf::from(".flowcore"));
    let _logging_guard = init_logging(&canonical_logs_dir_from_root(&state_dir), 14)
        .context("failed to initialize logging")?;

    match cli.command {
        Command::Plan { tasks_file } => run_plan(&tasks_file).await,
        Command::Run {
            tasks_file,
            workflow_id,
            project_id,
            parallelism,
            no_checkpoint,
        } => {
            run_workflow(
                &state_dir,
                &tasks_file,
                workflow_id,
                project_id,
                parallelism,
                !no_checkpoint,
                false,
            )
            .await
        }
        Command::Resume {
            tasks_file,
            workflow_id,
            project_id,
            parallelism,
        } => {
            run_workflow(
                &state_dir,
                &tasks_file,
                workflow_id,
                project_id,
                parallelism,
                true,
                true,
            )
            .await
        }
    }
}

async fn load_tasks(path: &PathBuf) -> anyhow::Result<Vec<Task>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading task file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing task file {}", path.display()))
}

async fn run_plan(tasks_file: &PathBuf) -> anyhow::Result<()> {
    let tasks = load_tasks(tasks_file).await?;
    let plan = flowcore_planner::plan(&tasks).map_err(|err| anyhow::anyhow!(err.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_workflow(
    state_dir: &PathBuf,
    tasks_file: &PathBuf,
    workflow_id: String,
    project_id: i64,
    parallelism: usize,
    checkpoint: bool,
    resume: bool,
) -> anyhow::Result<()> {
    let tasks = load_tasks(tasks_file).await?;

    let config_store = ConfigStore::new(state_dir.join("config.json"), None)
        .await
        .context("loading workflow config")?;
    let workflow_config = config_store.get().await;

    let providers = ProviderRegistry::new(workflow_config.clone().into());

    let mcp = Arc::new(McpFacade::new(Arc::new(NullMcpTransport)));
    if !workflow_config.mcp_servers.is_empty() {
        let servers: Vec<McpServerConfig> = workflow_config
            .mcp_servers
            .iter()
            .cloned()
            .map(Into::into)
            .collect();
        mcp.set_runtime_servers(servers).await;
    }

    let ai = AiServiceManager::new(providers, mcp);
    let executor = Arc::new(TaskExecutor::new(
        ai,
        Arc::new(ShellScriptExecutor),
        Arc::new(CliInputProvider),
        Arc::new(CliOutputProvider),
    ));

    let checkpoint_store = Arc::new(FileCheckpointStore::new(state_dir.join("checkpoints")));
    let runner = WorkflowRunner::new(executor, checkpoint_store)
        .with_progress_sink(Arc::new(ConsoleProgressSink));

    let runner_options = RunnerOptions {
        parallelism,
        checkpoint,
        base_executor_options: ExecutorOptions::default(),
    };

    let project = ProjectInfo {
        title: format!("project-{project_id}"),
        ..ProjectInfo::default()
    };

    let result = if resume {
        runner
            .resume(&workflow_id, &tasks, Some(project), runner_options)
            .await
            .map_err(|err| anyhow::anyhow!(err.to_string()))?
    } else {
        let mut ctx = ExecutionContext::new(workflow_id.clone(), project_id);
        ctx.budget = workflow_config.budget.as_ref().and_then(|b| b.to_runtime_budget());
        runner
            .run(workflow_id, &tasks, Some(project), ctx, runner_options)
            .await
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
