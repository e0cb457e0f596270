//! The abstract bidirectional message-oriented stream a session is built on.
//!
//! Framing, authentication, and the HTTP upgrade handshake are the
//! transport adapter's responsibility, not the fabric's — see
//! [`crate::transport`] for a reference implementation over a plain TCP
//! socket.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::Result;

/// One live client connection, as seen by the session controller.
///
/// Any transport that can hand back whole messages (not raw bytes) and
/// supports a cooperative close satisfies this trait. First-message
/// authentication — extracting the client ID — is the transport's job; by
/// the time a `Stream` reaches the fabric, `id()` must already be settled.
///
/// Methods take `&self`, not `&mut self`: a session hands its stream out to
/// both its own reader task and any number of external writers behind a
/// shared `Arc`, so implementations own whatever locking `read`/`write`
/// need internally (the session does not serialize writes on their
/// behalf — the stream is the seat of truth for final ordering).
#[async_trait]
pub trait Stream: Send + Sync + 'static {
    /// The logical client ID this stream is bound to.
    fn id(&self) -> &str;

    /// Read one message. Returns `Ok(None)` on a clean EOF (peer closed
    /// without a protocol error). Only the session's reader task calls
    /// this.
    async fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Write one message.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Close the underlying transport. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Transport-level metadata collected during the handshake (headers,
    /// query parameters, whatever the adapter captured).
    fn metadata(&self) -> &HashMap<String, Vec<String>>;
}
