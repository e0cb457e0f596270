//! Standalone node binary: binds the reference TCP transport, optionally
//! registers with an in-memory directory, and serves the tunnel RPC.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clusterlink::directory::{Directory, InMemoryDirectory, DEFAULT_RENEW_SLACK, DEFAULT_TTL};
use clusterlink::node::{Node, NodeConfig};
use clusterlink::transport::tcp::TcpAcceptor;
use clusterlink::tunnel::server::TunnelService;
use clusterlink::tunnel::proto::tunnel_server::TunnelServer;
use tonic::transport::Server as TonicServer;
use tracing::info;

const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
struct Cli {
    /// Address the client-facing TCP listener binds to.
    #[arg(long, default_value = "0.0.0.0:7000")]
    listen: SocketAddr,

    /// Address the tunnel RPC server binds to.
    #[arg(long, default_value = "0.0.0.0:7001")]
    rpc_listen: SocketAddr,

    /// This node's address, as advertised to the rest of the cluster.
    /// Required to participate in cross-node forwarding.
    #[arg(long)]
    node_address: Option<String>,

    /// Idle timeout, in seconds, before a quiet session is closed.
    #[arg(long, default_value_t = 15)]
    idle_timeout_secs: u64,

    /// Hard cap on concurrent sessions (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Run with the in-memory reference directory instead of single-node
    /// mode. Only useful for local multi-node experiments: a real
    /// deployment supplies its own `Directory`.
    #[arg(long)]
    with_in_memory_directory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = NodeConfig::default()
        .idle_timeout(Duration::from_secs(cli.idle_timeout_secs))
        .limit(cli.limit)
        .on_connect(|id| info!(id, "session connected"))
        .on_close(|id| info!(id, "session closed"))
        .on_error(|id, err| tracing::warn!(id, %err, "session error"));

    if cli.with_in_memory_directory {
        let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
        let node_address = cli
            .node_address
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--node-address is required with a directory configured"))?;
        config = config
            .directory(directory)
            .node_address(node_address)
            .directory_ttl(DEFAULT_TTL)
            .renew_slack(DEFAULT_RENEW_SLACK);
    }

    let acceptor = TcpAcceptor::bind(cli.listen).await?;
    let node = Node::new(Box::new(acceptor), config);

    let rpc_registry = node.registry().clone();
    let rpc_listen = cli.rpc_listen;
    tokio::spawn(async move {
        let service = TunnelService::new(rpc_registry, CORE_VERSION);
        info!(%rpc_listen, "tunnel RPC server listening");
        if let Err(err) = TonicServer::builder()
            .add_service(TunnelServer::new(service))
            .serve(rpc_listen)
            .await
        {
            tracing::error!(%err, "tunnel RPC server exited");
        }
    });

    info!(listen = %cli.listen, "node starting");
    node.run().await?;
    Ok(())
}
