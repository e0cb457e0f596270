//! The RPC client pool: a concurrent `node_address -> channel` cache.
//!
//! Grounded on the original source's `tunnel.go::_tunnelWriterFactory` (a
//! `sync.Map` keyed by host, dialing lazily on miss) and translated to the
//! registry's own `RwLock<HashMap<...>>` idiom rather than pulling in a
//! separate concurrent-map crate. `Channel::connect_lazy` gives the
//! "discard on failure, redial on next use" behavior for free: a broken
//! lazy channel just errors on the next call, and that error is what
//! triggers this pool to evict and redial.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use super::is_not_found_status;
use super::proto::tunnel_client::TunnelClient;
use super::proto::{GetVersionRequest, SendMessageRequest};
use crate::error::{Error, Result};

pub struct Pool {
    channels: RwLock<HashMap<String, Channel>>,
    connect_timeout: Duration,
}

impl Pool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            connect_timeout,
        }
    }

    fn channel_for(&self, node_address: &str) -> Result<Channel> {
        if let Some(channel) = self.channels.read().unwrap().get(node_address) {
            return Ok(channel.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{node_address}"))?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint.connect_lazy();

        self.channels
            .write()
            .unwrap()
            .insert(node_address.to_string(), channel.clone());
        Ok(channel)
    }

    fn evict(&self, node_address: &str) {
        self.channels.write().unwrap().remove(node_address);
    }

    /// Forward `data` to `id` on the node at `node_address`, dialing (or
    /// reusing) the cached channel. A remote
    /// [`CLIENT_CONNECTION_NOT_FOUND`] maps back to
    /// [`Error::ConnectionNotFound`] so the caller sees the same shape of
    /// error whether the miss was local or remote.
    pub async fn send_message(&self, node_address: &str, id: &str, data: Vec<u8>) -> Result<()> {
        let channel = self.channel_for(node_address)?;
        let mut client = TunnelClient::new(channel);

        match client
            .send_message(SendMessageRequest {
                to: id.to_string(),
                data,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(status) if is_not_found_status(&status) => {
                Err(Error::ConnectionNotFound(id.to_string()))
            }
            Err(status) => {
                self.evict(node_address);
                Err(Error::Rpc(status))
            }
        }
    }

    /// Probe a peer's running version, used for compatibility checks.
    pub async fn get_version(&self, node_address: &str) -> Result<String> {
        let channel = self.channel_for(node_address)?;
        let mut client = TunnelClient::new(channel);
        match client.get_version(GetVersionRequest {}).await {
            Ok(response) => Ok(response.into_inner().version),
            Err(status) => {
                self.evict(node_address);
                Err(Error::Rpc(status))
            }
        }
    }
}
