//! appdeckd: application template lifecycle daemon.
//!
//! `appdeckd serve` runs the admin API and the per-node health monitors.
//! The `template` and `node` subcommands edit the state database directly
//! and must not be used while a daemon holds the same database open.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use appdeck_core::DaemonConfig;
use appdeck_core::config::LogConfig;

mod admin;
mod serve;

#[derive(Parser)]
#[command(
    name = "appdeckd",
    about = "appdeck: application template lifecycle daemon",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to appdeckd.toml (defaults apply when omitted).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the storage data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the admin API server and health monitors.
    Serve {
        /// Address to listen on, e.g. 0.0.0.0:8480.
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Manage templates in the state database.
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    /// Manage target nodes in the state database.
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Import a template.toml manifest.
    Import {
        path: PathBuf,
        /// Mark the imported version as the latest of its name.
        #[arg(long)]
        latest: bool,
        /// Overwrite an existing version that no instance references yet.
        #[arg(long)]
        replace: bool,
    },
    /// List templates, optionally only the versions of one name.
    List {
        #[arg(short, long)]
        name: Option<String>,
        /// Output format: text or json.
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Make a template version the latest of its name.
    SetLatest { id: String },
    /// Enable or disable provisioning from a template version.
    Enable {
        id: String,
        #[arg(long)]
        off: bool,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Register a node, or update the host of an existing one.
    Register { id: String, host: String },
    /// List registered nodes.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    init_tracing(&config.log);

    match cli.command {
        Command::Serve { listen } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            serve::run(config).await
        }
        Command::Template { action } => {
            let state = admin::open_store(&config)?;
            match action {
                TemplateAction::Import {
                    path,
                    latest,
                    replace,
                } => {
                    let template = admin::import_template(&state, &path, latest, replace)?;
                    println!("imported {}", template.id);
                }
                TemplateAction::List { name, format } => {
                    let templates = admin::list_templates(&state, name.as_deref())?;
                    match format.as_str() {
                        "json" => println!("{}", serde_json::to_string_pretty(&templates)?),
                        _ => print!("{}", admin::format_templates(&templates)),
                    }
                }
                TemplateAction::SetLatest { id } => {
                    let template = state.set_latest_version(&id)?;
                    println!("{} is now the latest {}", template.id, template.name);
                }
                TemplateAction::Enable { id, off } => {
                    let template = state.set_template_enabled(&id, !off)?;
                    let verb = if template.enabled { "enabled" } else { "disabled" };
                    println!("{} {verb}", template.id);
                }
            }
            Ok(())
        }
        Command::Node { action } => {
            let state = admin::open_store(&config)?;
            match action {
                NodeAction::Register { id, host } => {
                    let node = state.register_node(&id, &host)?;
                    println!("registered {} ({})", node.id, node.host);
                }
                NodeAction::List => {
                    for node in state.list_nodes()? {
                        println!("{}\t{}\t{:?}", node.id, node.host, node.status);
                    }
                }
            }
            Ok(())
        }
    }
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
