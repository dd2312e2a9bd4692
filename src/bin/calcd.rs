//! calcd CLI — run the orchestrator, run an agent, or submit work.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use calcd::config::Config;
use calcd::dispatch::Dispatcher;
use calcd::liveness::LivenessMonitor;
use calcd::model::CostTable;
use calcd::rpc::HttpWorkerClient;
use calcd::server::{self, AppState};
use calcd::storage::Storage;
use calcd::worker::{self, AgentOptions};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "calcd", about = "Distributed arithmetic evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator daemon
    Serve,
    /// Run a worker (agent) process
    Agent {
        /// Owner identity this worker evaluates for
        #[arg(long)]
        owner: String,
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8081")]
        bind: SocketAddr,
        /// Endpoint advertised to the orchestrator (defaults to --bind)
        #[arg(long)]
        endpoint: Option<String>,
        /// Orchestrator base URL
        #[arg(long, default_value = "http://127.0.0.1:8079")]
        orchestrator: String,
    },
    /// Submit an expression to a running orchestrator
    Submit {
        /// The infix expression, e.g. "3+4*2"
        expression: String,
        /// Owner identity
        #[arg(long)]
        owner: String,
        /// Orchestrator base URL
        #[arg(long, default_value = "http://127.0.0.1:8079")]
        orchestrator: String,
        /// Cost of '+' in milliseconds
        #[arg(long, default_value_t = 0)]
        add: u64,
        /// Cost of '-' in milliseconds
        #[arg(long, default_value_t = 0)]
        sub: u64,
        /// Cost of '*' in milliseconds
        #[arg(long, default_value_t = 0)]
        mul: u64,
        /// Cost of '/' in milliseconds
        #[arg(long, default_value_t = 0)]
        div: u64,
        /// Cost of '^' in milliseconds
        #[arg(long, default_value_t = 0)]
        pow: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Agent {
            owner,
            bind,
            endpoint,
            orchestrator,
        } => {
            let opts = AgentOptions {
                bind_addr: bind,
                endpoint: endpoint.unwrap_or_else(|| bind.to_string()),
                owner,
                orchestrator_url: orchestrator,
                heartbeat_interval: config.heartbeat_interval,
            };
            worker::run(opts).await?;
            Ok(())
        }
        Command::Submit {
            expression,
            owner,
            orchestrator,
            add,
            sub,
            mul,
            div,
            pow,
        } => {
            let costs = CostTable {
                add,
                sub,
                mul,
                div,
                pow,
            };
            cmd_submit(&orchestrator, &expression, &owner, costs).await
        }
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let mut store = Storage::open(&config.database_path)?;

    // A previous run may have died mid-dispatch; free those rows before
    // accepting any traffic.
    let (jobs, workers) = store.with_transaction(|ctx| ctx.recover_interrupted())?;
    if jobs > 0 || workers > 0 {
        info!(jobs, workers, "reset rows interrupted by a previous run");
    }

    let storage = Arc::new(Mutex::new(store));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&storage),
        HttpWorkerClient::new(),
        config.rpc_timeout,
    ));
    let liveness = Arc::new(LivenessMonitor::new(
        Arc::clone(&storage),
        config.liveness_timeout,
    ));

    // Periodic sweep, independent of heartbeat traffic.
    let sweeper = Arc::clone(&liveness);
    tokio::spawn(sweeper.run(config.sweep_interval));

    let monitor = Arc::clone(&liveness);
    let shutdown = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        monitor.shutdown();
    };

    let state = AppState {
        dispatcher,
        liveness,
        storage,
    };
    server::serve(config.bind_addr, state, shutdown).await?;
    Ok(())
}

async fn cmd_submit(
    orchestrator: &str,
    expression: &str,
    owner: &str,
    costs: CostTable,
) -> anyhow::Result<()> {
    let response = reqwest::Client::new()
        .post(format!("{orchestrator}/api/calculate"))
        .json(&serde_json::json!({
            "expression": expression,
            "owner": owner,
            "costs": costs,
        }))
        .send()
        .await?;

    if response.status().is_success() {
        let body: serde_json::Value = response.json().await?;
        println!("{expression} = {}", body["result"]);
    } else {
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        anyhow::bail!(
            "submission failed ({status}): {}",
            body["message"].as_str().unwrap_or("unknown error")
        );
    }
    Ok(())
}
