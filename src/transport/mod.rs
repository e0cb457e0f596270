//! Transport adapters: concrete [`crate::stream::Stream`] implementations
//! and the [`Acceptor`] contract the accept loop pulls from.
//!
//! Framing, the handshake, and first-message authentication all live here,
//! deliberately outside the fabric core — see spec.md's scope note that the
//! wire transport itself is an external collaborator.

pub mod tcp;

use async_trait::async_trait;

use crate::error::Result;
use crate::stream::Stream;

/// Source of incoming sessions for the accept loop. Generalizes the
/// teacher's raw `TcpListener::accept` into something any transport
/// adapter (TCP, WebSocket upgrade, QUIC, ...) can implement.
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// Accept and fully authenticate one incoming session. By the time
    /// this returns `Ok`, the returned stream's `id()` must already be
    /// settled.
    async fn accept(&mut self) -> Result<Box<dyn Stream>>;
}
