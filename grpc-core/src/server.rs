//! The server request pump (section 4.8) and its registry builder
//! (section 4.10, added).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::batch::{Operation, OperationBatch, Outcome, TagAllocator};
use crate::call::Call;
use crate::codec::{self, Algorithm, DecompressionLimit};
use crate::dispatcher::Dispatcher;
use crate::error::{Code, RpcError};
use crate::metadata::{self, Metadata};
use crate::transport::{Frame, Transport, TransportListener};

/// A server-side RPC handler, bound to one accepted call.
///
/// Handlers are plain async functions over a `ServerCall`; codegen of typed
/// service stubs is out of scope (section 1), so the registry deals only
/// in this one handler shape. `requests` is the full set of request
/// messages the client sent before half-closing, already decoded.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, call: Arc<ServerCall>, request_metadata: Metadata, requests: Vec<Bytes>);
}

/// Parse a request path of the form `/<service>/<method>` (section 4.8:
/// "bytewise over UTF-8 after stripping the leading '/'; reject on missing
/// components").
pub fn parse_path(path: &str) -> Result<(&str, &str), RpcError> {
    let stripped = path.strip_prefix('/').ok_or_else(|| {
        RpcError::status(Code::InvalidArgument, format!("path {path:?} missing leading '/'"))
    })?;
    let mut parts = stripped.splitn(2, '/');
    let service = parts.next().filter(|s| !s.is_empty());
    let method = parts.next().filter(|s| !s.is_empty());
    match (service, method) {
        (Some(service), Some(method)) => Ok((service, method)),
        _ => Err(RpcError::status(
            Code::InvalidArgument,
            format!("path {path:?} is not of the form /service/method"),
        )),
    }
}

/// Accumulates `(service_name, method_name, handler)` triples and compiles
/// them into the lookup structure the pump consults (section 4.10).
#[derive(Default)]
pub struct ServiceRegistryBuilder {
    handlers: Vec<(String, String, Arc<dyn MethodHandler>)>,
}

impl ServiceRegistryBuilder {
    pub fn new() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::default()
    }

    pub fn register(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Self {
        self.handlers.push((service.into(), method.into(), handler));
        self
    }

    pub fn build(self) -> ServiceRegistry {
        let mut by_service: HashMap<String, Vec<(String, Arc<dyn MethodHandler>)>> = HashMap::new();
        for (service, method, handler) in self.handlers {
            by_service.entry(service).or_default().push((method, handler));
        }
        ServiceRegistry { by_service }
    }
}

/// Looks up the handler for an accepted call's `(service, method)` path.
///
/// Dispatch is exact-match-first; section 4.8's "substring match" wording
/// is honored only as a fallback, and only when exactly one registered
/// method name in that service contains the requested method as a
/// substring (an ambiguous substring match is treated as no match, so a
/// well-formed registry with distinct method names behaves identically to
/// plain exact matching).
pub struct ServiceRegistry {
    by_service: HashMap<String, Vec<(String, Arc<dyn MethodHandler>)>>,
}

impl ServiceRegistry {
    pub fn lookup(&self, service: &str, method: &str) -> Option<Arc<dyn MethodHandler>> {
        let methods = self.by_service.get(service)?;
        if let Some((_, handler)) = methods.iter().find(|(name, _)| name == method) {
            return Some(handler.clone());
        }
        let mut matches = methods.iter().filter(|(name, _)| name.contains(method));
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first.1.clone())
    }
}

/// The server's view of one accepted call: drives its send side through the
/// same `Call` state machine section 4.4 defines for the client, writing
/// every operation out to `transport` instead of just mutating in-memory
/// state (section 4.8: "the response is written through the same state
/// machine as 4.4 in mirror").
pub struct ServerCall {
    call: Arc<Call>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    tags: Arc<TagAllocator>,
}

impl ServerCall {
    fn new(
        call: Arc<Call>,
        transport: Arc<dyn Transport>,
        dispatcher: Dispatcher,
        tags: Arc<TagAllocator>,
    ) -> ServerCall {
        ServerCall {
            call,
            transport,
            dispatcher,
            tags,
        }
    }

    async fn submit_one(&self, op: Operation) -> Result<(), RpcError> {
        let tag = self.tags.next();
        let rx = self
            .dispatcher
            .register(tag)
            .map_err(|_| RpcError::status(Code::Unavailable, "dispatcher shut down"))?;
        let mut batch = OperationBatch::new(tag);
        let _ = batch.add(op);
        if let Err(err) = self.transport.submit(batch).await {
            self.dispatcher.retract(tag);
            return Err(err);
        }
        if rx.await != Ok(Outcome::Success) {
            return Err(RpcError::Transport("operation was not acknowledged".into()));
        }
        Ok(())
    }

    /// Send initial metadata to the client. Legal once, before any message
    /// or status (section 4.4's send transitions, mirrored server-side).
    pub async fn send_initial_metadata(&self, metadata: Metadata) -> Result<(), RpcError> {
        self.call.send_initial_metadata()?;
        self.submit_one(Operation::SendInitialMetadata(metadata)).await
    }

    /// Send one response message, auto-opening the call if no initial
    /// metadata has gone out yet (same auto-insert rule `Call::send_message`
    /// applies on the client side).
    pub async fn send_message(&self, payload: Bytes) -> Result<(), RpcError> {
        self.call.send_message(payload.clone())?;
        self.call.next_outgoing();
        let frame = codec::encode(&payload, false, Algorithm::Identity)?;
        self.submit_one(Operation::SendMessage(frame)).await
    }

    /// Send the final status, closing the server's send side (section
    /// 4.4's `sendStatus`, legal from `Sending` or `Idle`).
    pub async fn finish(&self, code: Code, message: String, trailers: Metadata) -> Result<(), RpcError> {
        self.call.send_status_from_server()?;
        self.submit_one(Operation::SendStatusFromServer {
            code,
            message,
            trailers,
        })
        .await
    }

    /// Whether the send side has already closed, i.e. a status or close has
    /// already gone out. A deadline firing after this checks it before
    /// sending its own `DeadlineExceeded` status, so a handler that finished
    /// just under the wire is never overwritten.
    pub fn is_done(&self) -> bool {
        self.call.is_send_closed()
    }
}

/// Drain `transport` into `call`'s receive side until the client half-closes,
/// returning the request's initial metadata and every message it sent
/// (section 4.8's accept step, mirroring the client-side reader in
/// `stream_executor::run_attempt`).
async fn accept_request(
    call: &Arc<Call>,
    transport: &Arc<dyn Transport>,
    max_request_message_bytes: Option<usize>,
    decompression_limit: DecompressionLimit,
) -> Result<(Metadata, Vec<Bytes>), RpcError> {
    let mut request_metadata = Metadata::new();
    let mut messages = Vec::new();
    let mut negotiated_encoding = Algorithm::Identity;
    loop {
        let Some(frame) = transport.recv_frame().await else {
            return Err(RpcError::Transport(
                "stream closed before client half-close".into(),
            ));
        };
        match frame {
            Frame::InitialMetadata(md) => {
                if let Some(enc) = md.get_ascii(metadata::GRPC_ENCODING) {
                    if let Some(algorithm) = Algorithm::parse(enc) {
                        negotiated_encoding = algorithm;
                    }
                }
                call.receive_initial_metadata(md.clone())?;
                request_metadata = md;
            }
            Frame::Message(bytes) => {
                let decoded = codec::decode(
                    &bytes,
                    negotiated_encoding,
                    max_request_message_bytes,
                    decompression_limit,
                )?;
                call.receive_message(decoded.payload.clone())?;
                messages.push(decoded.payload);
            }
            Frame::EndOfStream => {
                call.receive_close_on_server()?;
                return Ok((request_metadata, messages));
            }
            Frame::Status { .. } => {
                return Err(RpcError::ProtocolViolation(
                    "client stream sent a status frame".into(),
                ));
            }
        }
    }
}

/// Drives one accepted call to completion against the registry, enforcing
/// an optional per-call deadline (section 4.8's concurrency paragraph).
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_call(
    registry: &ServiceRegistry,
    path: &str,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    tags: Arc<TagAllocator>,
    max_request_message_bytes: Option<usize>,
    decompression_limit: DecompressionLimit,
    deadline: Option<Duration>,
) {
    let call = Arc::new(Call::new(usize::MAX));
    let server_call = Arc::new(ServerCall::new(
        call.clone(),
        transport.clone(),
        dispatcher,
        tags,
    ));

    let (service, method) = match parse_path(path) {
        Ok(pair) => pair,
        Err(err) => {
            finish_with_error(&server_call, err).await;
            return;
        }
    };

    let Some(handler) = registry.lookup(service, method) else {
        tracing::debug!(service, method, "no handler registered");
        finish_with_error(
            &server_call,
            RpcError::unimplemented(format!("unknown method {path}")),
        )
        .await;
        return;
    };

    let (request_metadata, requests) =
        match accept_request(&call, &transport, max_request_message_bytes, decompression_limit).await {
            Ok(pair) => pair,
            Err(err) => {
                finish_with_error(&server_call, err).await;
                return;
            }
        };

    let work = handler.handle(server_call.clone(), request_metadata, requests);
    match deadline {
        None => work.await,
        Some(deadline) => {
            tokio::select! {
                _ = work => {}
                _ = tokio::time::sleep(deadline) => {
                    if !server_call.is_done() {
                        tracing::debug!(service, method, "handler exceeded deadline");
                        finish_with_error(&server_call, RpcError::deadline_exceeded()).await;
                    }
                }
            }
        }
    }
}

async fn finish_with_error(server_call: &Arc<ServerCall>, err: RpcError) {
    let (code, message, trailers) = err.into_status();
    let _ = server_call.finish(code, message, trailers).await;
}

/// The server request pump (section 4.8): accept streams forever, dispatch
/// each to its own task so slow handlers never block new connections.
pub async fn serve<L>(
    listener: L,
    registry: Arc<ServiceRegistry>,
    dispatcher: Dispatcher,
    tags: Arc<TagAllocator>,
    max_request_message_bytes: Option<usize>,
    decompression_limit: DecompressionLimit,
    deadline: Option<Duration>,
) where
    L: TransportListener,
    L::Stream: 'static,
{
    while let Some((path, stream)) = listener.accept().await {
        let registry = registry.clone();
        let dispatcher = dispatcher.clone();
        let tags = tags.clone();
        let transport: Arc<dyn Transport> = Arc::new(stream);
        tokio::spawn(async move {
            dispatch_call(
                &registry,
                &path,
                transport,
                dispatcher,
                tags,
                max_request_message_bytes,
                decompression_limit,
                deadline,
            )
            .await;
        });
    }
}
