//! agentmesh - operator CLI for the agent mesh runtime
//!
//! Usage:
//!   agentmesh serve --config mesh.toml  -> serve the triple store over HTTP
//!   agentmesh query --endpoint URL 'SELECT ...'  -> query a remote store
//!   agentmesh validate workflow.yaml  -> check a workflow definition
//!   agentmesh dump-config  -> print the default config

use agentmesh_core::config::MeshConfig;
use agentmesh_kg::{Query, RemoteStore, TripleStore};
use agentmesh_workflow::{check_structure, Submission, WorkflowDefinition};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "agentmesh",
    about = "Multi-agent orchestration runtime: operator tools",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the mesh config file (TOML)
    #[arg(short, long, global = true, default_value = "agentmesh.toml")]
    config: PathBuf,

    /// Write logs to a file (in addition to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the in-process triple store over HTTP
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:7878")]
        addr: SocketAddr,
    },
    /// Run a query against a remote triple store endpoint
    Query {
        /// Base URL of the store endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:7878")]
        endpoint: String,
        /// Query text, e.g. 'SELECT ?s WHERE { ?s a <mesh:Image> }'
        query: String,
    },
    /// Check a workflow definition (JSON or YAML) without running it
    Validate {
        file: PathBuf,
    },
    /// Print the default configuration
    DumpConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref());

    match cli.command {
        Commands::Serve { addr } => {
            let config = MeshConfig::load(&cli.config);
            let store = agentmesh_kg::open_store(&config.store).await?;
            agentmesh_kg::server::serve(store, addr).await?;
        }
        Commands::Query { endpoint, query } => {
            let config = MeshConfig::load(&cli.config);
            let store = RemoteStore::new(endpoint);
            let query = Query::parse(&query)?;
            let rows = store.execute_query(&query, Some(config.store.query_timeout())).await?;
            for row in &rows {
                let cells: Vec<String> = row.0.iter().map(|(k, v)| format!("?{}={}", k, v)).collect();
                println!("{}", cells.join("  "));
            }
            eprintln!("{} row(s)", rows.len());
        }
        Commands::Validate { file } => {
            let def = WorkflowDefinition::load(&file)?;
            let (graph, violations) = check_structure(&def);
            if violations.is_empty() {
                println!("{}: {} steps, ok", def.id, graph.len());
            } else {
                let report = Submission::Rejected { violations };
                println!("{}", serde_json::to_string_pretty(&report)?);
                std::process::exit(1);
            }
        }
        Commands::DumpConfig => {
            println!("{}", MeshConfig::default().to_toml());
        }
    }

    Ok(())
}

fn init_tracing(log_file: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "agentmesh=info,tower_http=info".into());
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    let Some(path) = log_file else {
        registry.init();
        return None;
    };
    let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));
    let name = path.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "agentmesh.log".into());
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    registry
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Some(guard)
}
