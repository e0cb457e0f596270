//! Reference transport: a length-prefixed message stream over a plain TCP
//! socket, with the client ID read as the very first frame.
//!
//! Grounded on the teacher's `Connection<S>` (`connection.rs`): a
//! `BufWriter`-wrapped stream plus a read loop that buffers until a full
//! frame is available. The framing itself is generalized from RESP to a
//! plain 4-byte big-endian length prefix, since the fabric's `Stream`
//! contract only needs whole opaque messages, not a structured protocol.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};

use super::Acceptor;
use crate::error::{Error, Result};
use crate::stream::Stream;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Binds a TCP listener and performs the client-ID handshake on each
/// accepted socket before handing the session to the accept loop.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(Error::Io)?;
        Ok(Self { listener })
    }

    /// The address actually bound, useful when `bind` was given port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("bound listener has a local address")
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Box<dyn Stream>> {
        let (socket, peer_addr) = self.listener.accept().await.map_err(Error::Io)?;
        let stream = TcpMessageStream::handshake(socket, peer_addr).await?;
        Ok(Box::new(stream))
    }
}

/// A single session's stream: the first frame the peer ever sends is
/// treated as its client ID, everything after that is opaque payload.
pub struct TcpMessageStream {
    id: String,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<BufWriter<OwnedWriteHalf>>,
    metadata: HashMap<String, Vec<String>>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl TcpMessageStream {
    async fn handshake(socket: TcpStream, peer_addr: SocketAddr) -> Result<Self> {
        socket.set_nodelay(true).ok();
        let (read_half, write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);

        let id_bytes = read_frame(&mut reader).await?.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "peer closed before sending a client ID",
            ))
        })?;
        let id = String::from_utf8(id_bytes)
            .map_err(|err| Error::Io(std::io::Error::new(ErrorKind::InvalidData, err)))?;

        let mut metadata = HashMap::new();
        metadata.insert("peer_addr".to_string(), vec![peer_addr.to_string()]);

        Ok(Self {
            id,
            reader: Mutex::new(reader),
            writer: Mutex::new(BufWriter::new(write_half)),
            metadata,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        })
    }
}

#[async_trait]
impl Stream for TcpMessageStream {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        // A half-closed write side (this side's `close()`) doesn't make
        // the peer's socket EOF on its own, so a pending local read has to
        // be raced against the close signal directly rather than relying
        // on the OS to unblock it.
        let notified = self.closed_notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            frame = read_frame(&mut *reader) => frame,
            _ = notified => Ok(None),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, data).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(Error::Io)
    }

    fn metadata(&self) -> &HashMap<String, Vec<String>> {
        &self.metadata
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::Io(err)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame length {len} exceeds maximum of {MAX_FRAME_LEN}"),
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(Error::Io)?;
    Ok(Some(data))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer
        .write_u32(data.len() as u32)
        .await
        .map_err(Error::Io)?;
    writer.write_all(data).await.map_err(Error::Io)?;
    writer.flush().await.map_err(Error::Io)
}
