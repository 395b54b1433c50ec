//! # TraceWire CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Start a server
//! tracewire server -b 0.0.0.0:9428 --flush-size 500
//!
//! # Check a server is alive
//! tracewire ping 127.0.0.1:9428 -c 3
//!
//! # Ship one trace
//! tracewire send 127.0.0.1:9428 threads 42 -t long_avg
//! ```
//!
//! Flags override the matching `TRACEWIRE_*` environment variables.

use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use tracewire_agent::AgentConfig;
use tracewire_cli::commands;
use tracewire_server::ServerConfig;
use tracewire_trace::MetricType;

#[derive(FromArgs)]
/// TraceWire - agent/server trace transport
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Server(ServerArgs),
    Ping(PingArgs),
    Send(SendArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "server")]
/// start a TraceWire server
struct ServerArgs {
    /// address to bind to (default from TRACEWIRE_BIND, else 0.0.0.0:9428)
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// prefix of the session ids handed to agents
    #[argh(option)]
    route: Option<String>,

    /// queued traces that trigger a batch flush
    #[argh(option)]
    flush_size: Option<usize>,

    /// milliseconds between timed batch flushes
    #[argh(option)]
    flush_interval_ms: Option<u64>,

    /// deliver batches to endpoints in parallel
    #[argh(switch)]
    multithreaded: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "ping")]
/// handshake with a server and measure PING round trips
struct PingArgs {
    /// server address, host:port
    #[argh(positional)]
    server: String,

    /// number of PINGs to send
    #[argh(option, short = 'c', default = "1")]
    count: u32,

    /// synchronous operation timeout in milliseconds
    #[argh(option)]
    timeout_ms: Option<u64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "send")]
/// ship a single trace to a server
struct SendArgs {
    /// server address, host:port
    #[argh(positional)]
    server: String,

    /// metric name, qualified with the host and agent id
    #[argh(positional)]
    name: String,

    /// value as JSON, or a plain string
    #[argh(positional)]
    value: String,

    /// metric type, e.g. long_avg or string
    #[argh(option, short = 't', default = "MetricType::LongAvg")]
    metric_type: MetricType,

    /// host reported in the handshake
    #[argh(option)]
    host: Option<String>,

    /// agent id reported in the handshake
    #[argh(option)]
    agent_id: Option<String>,
}

impl ServerArgs {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(route) = self.route {
            config.route = route;
        }
        if let Some(flush_size) = self.flush_size {
            config.flush_size = flush_size;
        }
        if let Some(ms) = self.flush_interval_ms {
            config.flush_interval = Duration::from_millis(ms);
        }
        config.multithreaded |= self.multithreaded;
        config
    }
}

fn agent_config(server: String, host: Option<String>, agent_id: Option<String>) -> AgentConfig {
    let mut config = AgentConfig::from_env().with_server(server);
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(agent_id) = agent_id {
        config.agent_id = agent_id;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default to INFO, RUST_LOG overrides
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Server(args) => commands::run_server(args.into_config()).await,
        Commands::Ping(args) => {
            let mut config = agent_config(args.server, None, None);
            if let Some(ms) = args.timeout_ms {
                config.operation_timeout = Duration::from_millis(ms);
            }
            commands::run_ping(config, args.count).await.map(|_| ())
        }
        Commands::Send(args) => {
            let config = agent_config(args.server, args.host, args.agent_id);
            let value = commands::parse_value(&args.value);
            commands::run_send(config, &args.name, args.metric_type, value)
                .await
                .map(|_| ())
        }
    }
}
