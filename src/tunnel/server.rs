//! The RPC server side: accepts a forwarded `SendMessage` and writes
//! straight to the local registry. Never re-forwards — that's what keeps
//! forwarding depth at exactly one hop.

use tonic::{Request, Response, Status};

use super::not_found_status;
use super::proto::tunnel_server::Tunnel;
use super::proto::{
    GetVersionRequest, GetVersionResponse, SendMessageRequest, SendMessageResponse,
};
use crate::error::Error;
use crate::registry::Registry;

pub struct TunnelService {
    registry: Registry,
    version: String,
}

impl TunnelService {
    pub fn new(registry: Registry, version: impl Into<String>) -> Self {
        Self {
            registry,
            version: version.into(),
        }
    }
}

#[tonic::async_trait]
impl Tunnel for TunnelService {
    async fn send_message(
        &self,
        request: Request<SendMessageRequest>,
    ) -> Result<Response<SendMessageResponse>, Status> {
        let request = request.into_inner();
        let session = self
            .registry
            .lookup(&request.to)
            .ok_or_else(|| not_found_status(&request.to))?;

        session.write(&request.data).await.map_err(to_status)?;
        Ok(Response::new(SendMessageResponse {}))
    }

    async fn get_version(
        &self,
        _request: Request<GetVersionRequest>,
    ) -> Result<Response<GetVersionResponse>, Status> {
        Ok(Response::new(GetVersionResponse {
            version: self.version.clone(),
        }))
    }
}

fn to_status(err: Error) -> Status {
    match err {
        Error::ConnectionNotFound(id) => not_found_status(&id),
        Error::ConnectionClosed(id) => {
            Status::failed_precondition(format!("connection closed: {id}"))
        }
        other => Status::internal(other.to_string()),
    }
}
