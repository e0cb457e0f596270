//! A clustered message-routing fabric for long-lived client sessions,
//! addressed by logical client ID and routed across nodes regardless of
//! which one currently holds the destination session.

pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod node;
pub mod pubsub;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;
pub mod tunnel;

pub use directory::{Directory, InMemoryDirectory};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use node::{Node, NodeConfig};
pub use registry::Registry;
pub use session::{Hooks, SessionHandle};
pub use stream::Stream;
