use thiserror::Error;

/// Error kinds produced by the fabric.
///
/// Callers match on kind, not message: [`Error::ConnectionNotFound`] and
/// [`Error::ConnectionClosed`] in particular are part of the public
/// contract, not incidental detail.
#[derive(Debug, Error)]
pub enum Error {
    /// No session for the destination ID exists, locally or anywhere in the
    /// cluster (or the remote node reported the same).
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// A write was attempted on a session whose liveness flag is not-alive.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The idle-timeout watchdog elapsed before any activity.
    #[error("connection timed out: {0}")]
    ConnectionTimeout(String),

    /// The stream read or wrote and failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The directory backing store could not be reached or returned an
    /// unexpected result.
    #[error("directory error: {0}")]
    Directory(String),

    /// A tunnel RPC failed (peer unreachable, transport error, or a
    /// non-well-known status from the peer).
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    /// Failed to dial or reuse a channel to a peer node.
    #[error("rpc transport error: {0}")]
    RpcTransport(#[from] tonic::transport::Error),

    /// The user-supplied `on_message` hook returned an error.
    #[error("hook error: {0}")]
    Hook(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
