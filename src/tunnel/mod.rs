//! Node-to-node RPC: forwards a message to whichever peer the directory
//! says owns the destination session. Strictly one hop — the receiving
//! node answers from its own local registry only, never re-consulting its
//! directory, which bounds forwarding depth and rules out routing loops.

pub mod pool;
pub mod server;

/// Generated from `proto/tunnel.proto` by `build.rs`.
pub mod proto {
    tonic::include_proto!("tunnel");
}

/// Application-level status code layered on top of the transport-level
/// gRPC code, matching the original source's
/// `core.ErrClientConnectionNotFound` numeric exactly. gRPC's standard
/// codes have no room for domain-specific values, so the code travels as a
/// `{code}:` prefix on the status message and is parsed back out by the
/// client side.
pub const CLIENT_CONNECTION_NOT_FOUND: i32 = 10001;

pub(crate) fn not_found_status(id: &str) -> tonic::Status {
    tonic::Status::new(
        tonic::Code::NotFound,
        format!("{CLIENT_CONNECTION_NOT_FOUND}:connection not found: {id}"),
    )
}

pub(crate) fn is_not_found_status(status: &tonic::Status) -> bool {
    status.code() == tonic::Code::NotFound
        && status
            .message()
            .starts_with(&format!("{CLIENT_CONNECTION_NOT_FOUND}:"))
}
