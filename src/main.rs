use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trellis_core::config::{home_dir, EngineConfig};
use trellis_core::filter::NodeFilter;
use trellis_core::status::Status;
use trellis_core::types::NodeExecution;
use trellis_engine::{ExecutionTree, NodeExecutionService};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Inspect and recover plan executions")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the node tree of a plan execution
    Tree {
        plan_execution_id: String,
        /// Include superseded retry attempts
        #[arg(long)]
        all: bool,
    },
    /// Print one node execution as JSON
    Show { id: String },
    /// Mark every QUEUED or RUNNING node of a plan execution as ERRORED
    ErrorOut { plan_execution_id: String },
    /// Mark nodes DISCONTINUING: the given ones, or every active leaf
    Discontinue {
        plan_execution_id: String,
        /// Node execution ids to discontinue (repeatable)
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Leaf statuses eligible when no --node is given (repeatable)
        #[arg(long = "status")]
        statuses: Vec<Status>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, source) = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    match source {
        Some(path) => info!(path = %path.display(), "Loaded config"),
        None => info!("No config file found, using defaults"),
    }

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let service = NodeExecutionService::from_config(&config)?;

    match cli.command {
        Commands::Tree {
            plan_execution_id,
            all,
        } => {
            let nodes = if all {
                service.fetch_all(&plan_execution_id).await?
            } else {
                service.find(&NodeFilter::plan(&plan_execution_id)).await?
            };
            if nodes.is_empty() {
                println!("No node executions for plan execution {}", plan_execution_id);
                return Ok(());
            }
            let tree = ExecutionTree::build(nodes);
            print_tree(&tree);
        }
        Commands::Show { id } => {
            let node = service.get(&id).await?;
            println!("{}", serde_json::to_string_pretty(&node)?);
        }
        Commands::ErrorOut { plan_execution_id } => {
            let changed = service.error_out_active_nodes(&plan_execution_id).await?;
            println!("{} node execution(s) marked ERRORED", changed);
        }
        Commands::Discontinue {
            plan_execution_id,
            nodes,
            statuses,
        } => {
            let changed = if nodes.is_empty() {
                service
                    .mark_all_leaves_discontinuing(&plan_execution_id, &statuses)
                    .await?
            } else {
                service
                    .mark_leaves_discontinuing(&plan_execution_id, &nodes)
                    .await?
            };
            println!("{} node execution(s) marked DISCONTINUING", changed);
        }
        Commands::Config => {}
    }

    Ok(())
}

/// The config at `path`, else `~/.trellis/config.toml`, else defaults.
fn load_config(path: &Path) -> anyhow::Result<(EngineConfig, Option<PathBuf>)> {
    if path.exists() {
        return Ok((EngineConfig::load(path)?, Some(path.to_path_buf())));
    }
    if let Some(home) = home_dir() {
        let home_config = home.join(".trellis").join("config.toml");
        if home_config.exists() {
            return Ok((EngineConfig::load(&home_config)?, Some(home_config)));
        }
    }
    Ok((EngineConfig::default(), None))
}

fn print_tree(tree: &ExecutionTree) {
    let mut stack: Vec<(&NodeExecution, usize)> = tree.roots().map(|n| (n, 0)).collect();
    stack.reverse();
    while let Some((node, depth)) = stack.pop() {
        println!("{}{}", "  ".repeat(depth), describe(node));
        let children: Vec<&NodeExecution> = tree.children(&node.id).collect();
        stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
    }
}

fn describe(node: &NodeExecution) -> String {
    let mut line = format!(
        "{} [{}] {:?} {}",
        node.identifier(),
        node.status,
        node.category(),
        node.id
    );
    if let Some(start) = node.start_ts {
        let end = node.end_ts.unwrap_or_else(chrono::Utc::now);
        let secs = (end - start).num_milliseconds() as f64 / 1000.0;
        line.push_str(&format!(" {:.1}s", secs));
    }
    if !node.timeout_instance_ids.is_empty() {
        line.push_str(&format!(" timeouts={}", node.timeout_instance_ids.len()));
    }
    if node.old_retry {
        line.push_str(" (superseded)");
    }
    line
}
