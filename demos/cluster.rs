//! Two-node cluster demo, both nodes in one process, sharing an
//! in-memory directory (a stand-in for a real TTL-keyed store).
//!
//! Node A listens for clients on 127.0.0.1:7000 and serves its tunnel RPC
//! on 127.0.0.1:7001; node B mirrors that on 7010/7011. A client connected
//! to either node can reach a client connected to the other purely by ID
//! — the dispatcher consults the shared directory and forwards over the
//! tunnel RPC on a local miss.

use std::sync::Arc;
use std::time::Duration;

use clusterlink::dispatcher::Dispatcher;
use clusterlink::directory::{Directory, InMemoryDirectory, DEFAULT_RENEW_SLACK, DEFAULT_TTL};
use clusterlink::node::{Node, NodeConfig};
use clusterlink::transport::tcp::TcpAcceptor;
use clusterlink::tunnel::proto::tunnel_server::TunnelServer;
use clusterlink::tunnel::server::TunnelService;
use tokio::sync::OnceCell;
use tonic::transport::Server as TonicServer;

const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

struct NodeSpec {
    name: &'static str,
    client_addr: &'static str,
    rpc_addr: &'static str,
}

async fn spawn_node(spec: NodeSpec, directory: Arc<dyn Directory>) -> anyhow::Result<Node> {
    let dispatcher_cell: Arc<OnceCell<Dispatcher>> = Arc::new(OnceCell::new());
    let hook_cell = dispatcher_cell.clone();
    let name = spec.name;

    let config = NodeConfig::default()
        .idle_timeout(Duration::from_secs(30))
        .node_address(spec.rpc_addr)
        .directory(directory)
        .directory_ttl(DEFAULT_TTL)
        .renew_slack(DEFAULT_RENEW_SLACK)
        .on_connect(move |id| println!("[{name}] connected: {id}"))
        .on_close(move |id| println!("[{name}] closed: {id}"))
        .on_message(move |_from, data| {
            let Some(sep) = data.iter().position(|&b| b == b'|') else {
                return Ok(());
            };
            let to = String::from_utf8_lossy(&data[..sep]).to_string();
            let payload = data[sep + 1..].to_vec();
            let dispatcher = hook_cell.get().expect("dispatcher set before accept loop starts").clone();
            tokio::spawn(async move {
                if let Err(err) = dispatcher.send(&to, &payload).await {
                    eprintln!("delivery to {to} failed: {err}");
                }
            });
            Ok(())
        });

    let acceptor = TcpAcceptor::bind(spec.client_addr).await?;
    let node = Node::new(Box::new(acceptor), config);
    if dispatcher_cell.set(node.dispatcher().clone()).is_err() {
        panic!("set exactly once before run");
    }

    let rpc_registry = node.registry().clone();
    let rpc_addr = spec.rpc_addr.parse()?;
    tokio::spawn(async move {
        let service = TunnelService::new(rpc_registry, CORE_VERSION);
        if let Err(err) = TonicServer::builder()
            .add_service(TunnelServer::new(service))
            .serve(rpc_addr)
            .await
        {
            eprintln!("[{name}] tunnel RPC server exited: {err}");
        }
    });

    println!(
        "[{}] clients on {}, tunnel RPC on {}",
        spec.name, spec.client_addr, spec.rpc_addr
    );
    Ok(node)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let directory: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());

    let node_a = spawn_node(
        NodeSpec {
            name: "A",
            client_addr: "127.0.0.1:7000",
            rpc_addr: "127.0.0.1:7001",
        },
        directory.clone(),
    )
    .await?;

    let node_b = spawn_node(
        NodeSpec {
            name: "B",
            client_addr: "127.0.0.1:7010",
            rpc_addr: "127.0.0.1:7011",
        },
        directory,
    )
    .await?;

    let run_a = tokio::spawn(async move { node_a.run().await });
    let run_b = tokio::spawn(async move { node_b.run().await });

    run_a.await??;
    run_b.await??;
    Ok(())
}
