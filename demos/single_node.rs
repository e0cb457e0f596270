//! Single-node demo: one TCP-backed node, no directory, no cluster.
//!
//! Messages are `to|payload` (an ASCII `|` separator) — purely a demo
//! wire convention, not part of the fabric itself. Connect two clients,
//! each sending its own ID as the handshake frame, then send
//! `other-id|hello` from one to reach the other.

use std::sync::Arc;
use std::time::Duration;

use clusterlink::dispatcher::Dispatcher;
use clusterlink::node::{Node, NodeConfig};
use clusterlink::transport::tcp::TcpAcceptor;
use tokio::sync::OnceCell;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // The on_message hook needs a `Dispatcher`, which only exists once the
    // `Node` has been built from this very config — filled in right after
    // `Node::new` returns, well before any session can reach `run`.
    let dispatcher_cell: Arc<OnceCell<Dispatcher>> = Arc::new(OnceCell::new());
    let hook_cell = dispatcher_cell.clone();

    let config = NodeConfig::default()
        .idle_timeout(Duration::from_secs(30))
        .on_connect(|id| println!("connected: {id}"))
        .on_close(|id| println!("closed: {id}"))
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

    let acceptor = TcpAcceptor::bind("127.0.0.1:7000").await?;
    let node = Node::new(Box::new(acceptor), config);
    if dispatcher_cell.set(node.dispatcher().clone()).is_err() {
        panic!("set exactly once before run");
    }

    println!("single-node demo listening on 127.0.0.1:7000");
    node.run().await?;
    Ok(())
}
