use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use hyper::{Body, Client, Method, Request};
use log::{error, info};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ballot::election::{LeaderElection, NodeState};
use ballot::network::{serve, ClusterView, HttpPeerClient, LivenessProber, PeerClient};
use ballot::Config;

#[derive(Parser)]
#[command(name = "ballot")]
#[command(about = "Round-robin leader election over JSON/HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a cluster node
    Node(NodeArgs),

    /// Query or poke a running node over HTTP
    Admin {
        #[command(subcommand)]
        cmd: AdminCmd,

        /// Node HTTP address, e.g. 127.0.0.1:8080
        #[arg(long, global = true, default_value = "127.0.0.1:8080")]
        http: String,
    },
}

#[derive(clap::Args)]
struct NodeArgs {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on; also decides this node's id
    #[arg(short, long)]
    port: Option<u16>,

    /// Comma-separated base URLs of every node, this one included
    #[arg(long, value_delimiter = ',')]
    hosts: Option<Vec<String>>,

    #[arg(long)]
    min_await_secs: Option<u64>,

    #[arg(long)]
    max_await_secs: Option<u64>,

    #[arg(long)]
    heartbeat_interval_secs: Option<u64>,

    /// Interval between liveness probes of the peers
    #[arg(long)]
    probe_interval_ms: Option<u64>,

    /// Timeout of a single peer call
    #[arg(long)]
    rpc_timeout_ms: Option<u64>,
}

impl NodeArgs {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(bind) = self.bind {
            cfg.bind = bind;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(hosts) = self.hosts {
            cfg.hosts = hosts;
        }
        if let Some(v) = self.min_await_secs {
            cfg.min_await_secs = v;
        }
        if let Some(v) = self.max_await_secs {
            cfg.max_await_secs = v;
        }
        if let Some(v) = self.heartbeat_interval_secs {
            cfg.heartbeat_interval_secs = v;
        }
        if let Some(v) = self.probe_interval_ms {
            cfg.probe_interval_ms = v;
        }
        if let Some(v) = self.rpc_timeout_ms {
            cfg.rpc_timeout_ms = v;
        }
        Ok(cfg)
    }
}

#[derive(Subcommand)]
enum AdminCmd {
    /// Show id, term, leadership and fault flags
    Status,
    /// Print whether the node currently leads
    Leader,
    /// List every configured server
    Servers,
    /// List the peers the node currently sees as reachable
    AvailableServers,
    /// Show the fault flags
    Faults,
    /// Enable a fault: LOST_CONNECTION, INVALID_RESPONSE or INFINITE_REPLIES
    EnableFault { name: String },
    /// Disable a fault
    DisableFault { name: String },
    /// Force an election round on the node
    Candidate,
}

impl AdminCmd {
    fn route(&self) -> (Method, String) {
        match self {
            AdminCmd::Status => (Method::GET, "/status".to_string()),
            AdminCmd::Leader => (Method::GET, "/leader".to_string()),
            AdminCmd::Servers => (Method::GET, "/servers".to_string()),
            AdminCmd::AvailableServers => (Method::GET, "/available-servers".to_string()),
            AdminCmd::Faults => (Method::GET, "/error-status/statuses".to_string()),
            AdminCmd::EnableFault { name } => {
                (Method::POST, format!("/error-status/enable/{name}"))
            }
            AdminCmd::DisableFault { name } => {
                (Method::POST, format!("/error-status/disable/{name}"))
            }
            AdminCmd::Candidate => (Method::POST, "/leaderElection/candidate".to_string()),
        }
    }
}

async fn admin_call(host_port: &str, method: Method, path: &str) -> anyhow::Result<String> {
    let req = Request::builder()
        .method(method)
        .uri(format!("http://{host_port}{path}"))
        .body(Body::empty())?;
    let resp = Client::new()
        .request(req)
        .await
        .with_context(|| format!("failed to reach {host_port}"))?;
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body()).await?;
    let body = String::from_utf8_lossy(&bytes).to_string();
    if !status.is_success() {
        bail!("{path} returned {status}: {body}");
    }
    if body.is_empty() {
        Ok(status.to_string())
    } else {
        Ok(body)
    }
}

fn init_logging() {
    // env_logger and LogTracer both claim the `log` facade, so only one of
    // them may be installed.
    if let Ok(path) = std::env::var("BALLOT_LOG_FILE") {
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}; logging to stderr"),
        }
        builder.init();
        return;
    }

    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(true);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

async fn run_node(cfg: Config) -> anyhow::Result<()> {
    let listen_addr = cfg.listen_addr()?;
    let hosts = cfg.effective_hosts();
    let (cluster, reachability) = ClusterView::from_hosts(cfg.port, &hosts)?;
    info!(
        "Starting ballot node {} on {listen_addr} with {} configured servers",
        cluster.self_id(),
        cluster.peer_count()
    );

    let state = NodeState::new(cluster.self_id(), cluster.peer_count()).shared();
    let client: Arc<dyn PeerClient> =
        Arc::new(HttpPeerClient::new(Arc::clone(&state), cfg.rpc_timeout()));

    let prober = LivenessProber::new(
        reachability,
        Arc::clone(&client),
        cfg.probe_interval(),
        cfg.rpc_timeout(),
    );
    tokio::spawn(prober.run());

    let node = Arc::new(LeaderElection::with_state(
        cfg.election_config(),
        cluster,
        client,
        state,
    ));

    let listener = std::net::TcpListener::bind(listen_addr)
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    listener.set_nonblocking(true)?;

    node.start().await;

    info!("HTTP server listening on {listen_addr}");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
        }
    };
    let served = serve(listener, Arc::clone(&node), shutdown).await;
    node.shutdown().await;
    served.context("HTTP server error")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Node(args) => run_node(args.into_config()?).await?,
        Command::Admin { cmd, http } => {
            let (method, path) = cmd.route();
            let body = admin_call(&http, method, &path).await?;
            println!("{body}");
        }
    }

    Ok(())
}
