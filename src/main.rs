mod api;
mod client;
mod commands;
mod config;
mod constants;
mod discovery;
mod error;
mod events;
mod keystore;
mod message;
mod node;
mod poller;
mod propagation;
mod registry;
mod signature;
mod store;

use clap::{Parser, Subcommand};
use commands::Context;
use config::Settings;
use discovery::{Ipv4Net, ScanOptions};
use message::ReachPolicy;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "federation-node", author, version, about = constants::TAGLINE)]
struct Cli {
    #[arg(short, long, global = true, default_value = constants::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Self-register, then run the HTTP API with the poll and purge loops
    Serve,
    /// Node management
    Node {
        #[command(subcommand)]
        action: NodeCmd,
    },
}

#[derive(Subcommand)]
enum NodeCmd {
    /// Enroll this node with the configured upstream using a signed token
    Register { token: String },
    /// Print a curl command that registers this node with <upstream>
    #[command(alias = "register_curl")]
    RegisterCurl {
        upstream: String,
        /// Fetch identity and signature from a running node instead of the local store
        #[arg(long)]
        local_base: Option<String>,
        #[arg(long)]
        token: Option<String>,
    },
    /// Scan the LAN for other nodes and record them as peers
    Discover {
        /// IPv4 networks in CIDR form (default: local /24)
        #[arg(long, value_delimiter = ',')]
        interfaces: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        ports: Vec<u16>,
        /// Per-host timeout in seconds
        #[arg(long, default_value_t = constants::DISCOVERY_TIMEOUT_SECS)]
        timeout: u64,
        #[arg(long, default_value_t = constants::DISCOVERY_MAX_HOSTS)]
        max_hosts: usize,
    },
    /// List known nodes
    Peers,
    /// Fetch /nodes/info from every known node
    Check,
    /// Change how this node treats another node
    Relation { uuid: Uuid, relation: String },
    /// Exit non-zero unless the local node and its keypair are consistent
    Ready,
    /// Originate a message from this node
    Send {
        subject: String,
        body: String,
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        feature: Option<String>,
        #[arg(long)]
        node: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("❌ {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::load(&cli.config)?;
    let ctx = Context::open(settings)?;

    match cli.cmd {
        Cmd::Serve => serve(ctx).await?,
        Cmd::Node { action } => match action {
            NodeCmd::Register { token } => {
                let enrolled = commands::register(&ctx, &token).await?;
                println!(
                    "registered as {} (created={}), upstream [{}] {} trusted={}",
                    enrolled.response.uuid,
                    enrolled.response.created,
                    enrolled.upstream.hostname,
                    enrolled.upstream.uuid,
                    enrolled.upstream.trusted
                );
            }
            NodeCmd::RegisterCurl {
                upstream,
                local_base,
                token,
            } => {
                let token = token.unwrap_or_else(|| Uuid::new_v4().to_string());
                let cmd =
                    commands::register_curl(&ctx, &upstream, local_base.as_deref(), &token).await?;
                println!("{}", cmd);
            }
            NodeCmd::Discover {
                interfaces,
                ports,
                timeout,
                max_hosts,
            } => {
                let mut opts = ScanOptions {
                    networks: interfaces
                        .iter()
                        .map(|i| Ipv4Net::parse(i))
                        .collect::<Result<_, _>>()?,
                    timeout: Duration::from_secs(timeout),
                    max_hosts,
                    ..Default::default()
                };
                if !ports.is_empty() {
                    opts.ports = ports;
                }
                println!("{}", commands::discover(&ctx, &opts).await?);
            }
            NodeCmd::Peers => println!("{}", commands::peers(&ctx).await?),
            NodeCmd::Check => {
                let rows = commands::check(&ctx).await?;
                println!("{}", commands::check_table(&rows));
            }
            NodeCmd::Relation { uuid, relation } => {
                println!("{}", commands::set_relation(&ctx, &uuid, &relation).await?)
            }
            NodeCmd::Ready => println!("{}", commands::ready(&ctx).await?),
            NodeCmd::Send {
                subject,
                body,
                role,
                feature,
                node,
            } => {
                let reach = ReachPolicy { role, feature, node };
                let accepted = commands::send(&ctx, &subject, &body, reach).await?;
                println!(
                    "message {} complete={}",
                    accepted.message.uuid, accepted.message.complete
                );
            }
        },
    }
    Ok(())
}

async fn serve(ctx: Context) -> anyhow::Result<()> {
    constants::print_banner();
    tokio::spawn(events::run_update_log(ctx.registry.events().subscribe()));
    let local = ctx.registry.register_self(&ctx.settings, &ctx.keystore).await?;
    let fed = &ctx.settings.federation;

    tokio::spawn(poller::run_poll_loop(
        ctx.engine.clone(),
        ctx.client.clone(),
        Duration::from_secs(fed.poll_interval_secs.max(1)),
    ));
    tokio::spawn(poller::run_purge_loop(
        ctx.engine.clone(),
        Duration::from_secs(fed.purge_interval_secs.max(1)),
    ));

    let addr = format!("{}:{}", ctx.settings.node.bind, ctx.settings.node.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("🚀 [{}] {} listening on http://{}", local.hostname, local.uuid, addr);

    axum::serve(listener, api::router(ctx.app_state()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("🛑 shutting down");
        })
        .await?;
    Ok(())
}
