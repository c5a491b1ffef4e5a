//! The `Transport` seam (section 2.1): the abstract boundary below the call
//! layer and above real HTTP/2 framing.
//!
//! HTTP/2 framing, HPACK, TLS and connection pooling are explicitly out of
//! scope (section 1). Everything above this trait — codec, metadata,
//! batches, the call state machine, the dispatcher, the stream executor,
//! retry/hedging, the server pump, and interceptors — is production code
//! shared with tests; only the `Transport` implementation differs between a
//! real HTTP/2 binding (not part of this crate) and the in-memory fake used
//! by `grpc-core/tests/support`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::batch::OperationBatch;
use crate::error::RpcError;
use crate::metadata::Metadata;

/// One frame a `Transport` stream yields to its owner.
#[derive(Debug, Clone)]
pub enum Frame {
    InitialMetadata(Metadata),
    Message(Bytes),
    /// The peer has finished sending messages (half-close on their side).
    EndOfStream,
    Status {
        code: crate::error::Code,
        message: String,
        trailers: Metadata,
    },
}

/// An owning handle to one bidirectional HTTP/2-equivalent stream.
///
/// A production binding drives HPACK/framing/TLS underneath this trait; the
/// call layer only ever sees `OperationBatch` submission and `Frame` arrival.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a batch of operations. Resolves once the transport has
    /// accepted (not necessarily completed) the batch; per-operation
    /// results surface later as `Frame`s from `recv_frame` plus the
    /// dispatcher's completion callback for the batch's tag.
    async fn submit(&self, batch: OperationBatch) -> Result<(), RpcError>;

    /// Await the next frame arriving on this stream, or `None` once the
    /// stream is fully closed (trailers observed and the wire is idle).
    async fn recv_frame(&self) -> Option<Frame>;

    /// Abort the stream, e.g. in response to cancellation or a deadline.
    /// Idempotent.
    async fn close(&self);
}

/// Accepts new inbound streams on the server side. A production binding
/// wraps an HTTP/2 listener; tests use an in-memory channel-backed
/// implementation (`grpc-core/tests/support`).
#[async_trait]
pub trait TransportListener: Send + Sync {
    type Stream: Transport;

    /// The path (`/<service>/<method>`) the incoming stream was opened
    /// against, alongside the stream itself.
    async fn accept(&self) -> Option<(String, Self::Stream)>;
}

/// Opens a fresh `Transport` stream for one call attempt.
///
/// A `Call` owns exactly one stream (section 4.4), so a client that issues
/// more than one call, or retries/hedges a single call across several
/// attempts, needs a new stream each time rather than reusing one. `Dialer`
/// is the client-side counterpart to `TransportListener`: an `RpcChannel`
/// holds one `Dialer` for a destination and opens one stream per attempt
/// against it.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn open(&self, method_path: &str) -> Result<Arc<dyn Transport>, RpcError>;
}
