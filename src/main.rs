use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::stdout;

use flowrun::api::FlowService;
use flowrun::config::Config;
use flowrun::engine::{FlowRunRequest, JsonLinesStream};
use flowrun::id::Id;
use flowrun::shutdown::ShutdownSignal;
use flowrun::storage::SqliteStorage;
use flowrun::{metrics, telemetry};

#[derive(Parser)]
#[command(name = "flowrun")]
#[command(about = "Run workflow graphs against live HTTP endpoints", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to <config dir>/flowrun/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a simplified workspace YAML file
    Import {
        /// Path to the YAML file
        file: PathBuf,
    },
    /// Export a stored workspace as simplified YAML
    Export {
        /// Workspace name or ID
        workspace: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List stored workspaces
    Workspaces,
    /// Run a flow, streaming node states to stdout as JSON lines
    Run {
        /// Flow ID
        flow: Id,
        /// Environment ID
        #[arg(short, long)]
        env: Option<Id>,
        /// Print Prometheus metrics to stderr when the run ends
        #[arg(long)]
        metrics: bool,
    },
    /// Show the latest state of every node of a flow
    Nodes {
        /// Flow ID
        flow: Id,
    },
    /// Show the recorded executions of a node, latest first
    Executions {
        /// Node ID
        node: Id,
        /// Maximum rows to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    telemetry::init_tracing(&config.logging)?;

    let service = FlowService::new(open_storage(&config)?, &config);

    match cli.command {
        Commands::Import { file } => cmd_import(&service, &file).await?,
        Commands::Export { workspace, output } => {
            cmd_export(&service, &workspace, output.as_deref()).await?
        }
        Commands::Workspaces => cmd_workspaces(&service).await?,
        Commands::Run { flow, env, metrics } => cmd_run(&service, flow, env, metrics).await?,
        Commands::Nodes { flow } => cmd_nodes(&service, flow).await?,
        Commands::Executions { node, limit } => cmd_executions(&service, node, limit).await?,
    }

    Ok(())
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<SqliteStorage>> {
    let path = config.database_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Arc::new(SqliteStorage::open_with_config(
        &path,
        &config.storage,
    )?))
}

async fn cmd_import(service: &FlowService, file: &Path) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let yaml = std::fs::read_to_string(file)?;
    let imported = service.import_yaml(&yaml).await?;

    println!("✓ Workspace '{}' imported", imported.name);
    println!("  ID: {}", imported.workspace_id);
    println!();
    println!("{:<30} {:<28}", "FLOW", "ID");
    println!("{}", "-".repeat(58));
    for (name, id) in &imported.flows {
        println!("{:<30} {:<28}", name, id);
    }
    Ok(())
}

async fn cmd_export(
    service: &FlowService,
    workspace: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let yaml = service.export_yaml(workspace).await?;
    match output {
        Some(path) => {
            std::fs::write(path, yaml)?;
            println!("✓ Exported '{}' to {}", workspace, path.display());
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

async fn cmd_workspaces(service: &FlowService) -> anyhow::Result<()> {
    let workspaces = service.storage().list_workspaces().await?;
    if workspaces.is_empty() {
        println!("No workspaces found.");
        println!();
        println!("Import one with: flowrun import <file.yaml>");
        return Ok(());
    }

    println!("{:<30} {:<28} {:<20}", "NAME", "ID", "UPDATED");
    println!("{}", "-".repeat(78));
    for ws in workspaces {
        println!(
            "{:<30} {:<28} {:<20}",
            ws.name,
            ws.id,
            ws.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_run(
    service: &FlowService,
    flow: Id,
    env: Option<Id>,
    print_metrics: bool,
) -> anyhow::Result<()> {
    if print_metrics {
        metrics::init_metrics()?;
    }

    let shutdown = ShutdownSignal::new();
    shutdown.listen();

    let mut request = FlowRunRequest::new(flow);
    if let Some(env) = env {
        request = request.with_environment(env);
    }

    let result = service
        .flow_run_adhoc(
            request,
            Box::new(JsonLinesStream::new(stdout())),
            shutdown.token(),
        )
        .await;

    if print_metrics {
        eprint!("{}", metrics::render_metrics());
    }

    let summary = result?;
    eprintln!(
        "✓ Flow finished: {} ({} items streamed, {}ms)",
        summary.outcome.as_str(),
        summary.streamed,
        summary.duration_ms
    );
    Ok(())
}

async fn cmd_nodes(service: &FlowService, flow: Id) -> anyhow::Result<()> {
    let nodes = service.node_list(flow).await?;
    println!("{:<28} {:<12}", "NODE", "STATE");
    println!("{}", "-".repeat(40));
    for item in nodes.items {
        println!("{:<28} {:<12}", item.node_id, format!("{:?}", item.state).to_uppercase());
    }
    Ok(())
}

async fn cmd_executions(service: &FlowService, node: Id, limit: usize) -> anyhow::Result<()> {
    let executions = service.node_execution_list(node).await?;
    if executions.items.is_empty() {
        println!("No executions recorded for node {}.", node);
        return Ok(());
    }

    println!(
        "{:<28} {:<30} {:<10} {:<25}",
        "EXECUTION", "NAME", "STATE", "COMPLETED"
    );
    println!("{}", "-".repeat(95));
    for item in executions.items.into_iter().take(limit) {
        println!(
            "{:<28} {:<30} {:<10} {:<25}",
            item.id,
            item.name,
            format!("{:?}", item.state).to_uppercase(),
            item.completed_at.as_deref().unwrap_or("-")
        );
        if let Some(error) = &item.error {
            println!("  error: {}", error);
        }
    }
    Ok(())
}
