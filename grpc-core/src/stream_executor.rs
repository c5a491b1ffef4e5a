//! The single-attempt stream executor (section 4.6): runs one attempt of an
//! RPC end-to-end over a `Transport`, bridging the message codec and
//! operation batches into an async message stream bounded by a deadline.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::batch::{Operation, OperationBatch, Outcome, TagAllocator};
use crate::call::Call;
use crate::codec::{self, Algorithm, DecompressionLimit};
use crate::dispatcher::Dispatcher;
use crate::error::{Code, RpcError};
use crate::metadata::{self, Metadata};
use crate::transport::{Frame, Transport};

/// What the caller supplies to run one attempt.
pub struct Request {
    pub method_path: String,
    pub initial_metadata: Metadata,
    /// Outbound message payloads, already protobuf/opaque-encoded; the
    /// executor only frames and compresses them.
    pub messages: Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin>,
    pub deadline: Option<Instant>,
    pub send_compression: Option<Algorithm>,
    pub accept_encodings: Vec<Algorithm>,
    pub max_request_message_bytes: Option<usize>,
    pub max_response_message_bytes: Option<usize>,
    pub decompression_limit: DecompressionLimit,
    /// Cancelled by the caller to abort this attempt (section 4.4's
    /// cancellation requirement); shared across every attempt of the same
    /// call so cancelling once stops retries/hedging too.
    pub cancel: CancellationToken,
}

/// The result of a finished attempt: either a full response or a failure
/// that the outer retry/hedging executor may classify as retryable.
pub struct Response {
    pub initial_metadata: Metadata,
    pub messages: mpsc::UnboundedReceiver<Bytes>,
    pub status_code: Code,
    pub status_message: String,
    pub trailers: Metadata,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status_code.is_ok()
    }
}

// Unbounded: `run_attempt` only hands `Response` to its caller after the
// reader task has already observed the trailing status, so nothing drains
// this queue while the attempt is still in flight. A bounded channel here
// deadlocks the reader against a receiver nobody holds yet.

/// Run one attempt against `transport`. Spawns a writer task (encodes and
/// sends the request's message stream) and a reader task (decodes frames
/// into the caller's response queue), per section 4.6's algorithm.
pub async fn run_attempt(
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    tags: Arc<TagAllocator>,
    mut request: Request,
) -> Response {
    let mut initial = request.initial_metadata.copy();
    if let Some(algorithm) = request.send_compression {
        let _ = initial.insert(metadata::GRPC_ENCODING, algorithm.as_str());
    }
    if !request.accept_encodings.is_empty() {
        let joined = request
            .accept_encodings
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let _ = initial.insert(metadata::GRPC_ACCEPT_ENCODING, joined);
    }
    if let Some(deadline) = request.deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let _ = initial.insert(metadata::GRPC_TIMEOUT, format_grpc_timeout(remaining));
    }

    // Drive every operation this attempt performs through a `Call` (section
    // 4.4), the same state machine the teacher's connection driver enforces
    // around a tonic call: the send queue's capacity is unbounded here
    // because the writer below pops a message back off immediately after
    // enqueuing it, rather than buffering ahead of the wire.
    let call = Arc::new(Call::new(usize::MAX));
    if let Err(err) = call.send_initial_metadata() {
        return failure_response(err);
    }

    let open_tag = tags.next();
    let open_rx = match dispatcher.register(open_tag) {
        Ok(rx) => rx,
        Err(_) => {
            return failure_response(RpcError::status(Code::Unavailable, "dispatcher shut down"))
        }
    };
    let mut open_batch = OperationBatch::new(open_tag);
    let _ = open_batch.add(Operation::SendInitialMetadata(initial));
    if let Err(err) = transport.submit(open_batch).await {
        dispatcher.retract(open_tag);
        return failure_response(err);
    }
    if open_rx.await != Ok(Outcome::Success) {
        return failure_response(RpcError::Transport(
            "initial metadata send was not acknowledged".into(),
        ));
    }

    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    let send_compression = request.send_compression;
    let max_request_message_bytes = request.max_request_message_bytes;

    let writer_transport = transport.clone();
    let writer_dispatcher = dispatcher.clone();
    let writer_tags = tags.clone();
    let writer_call = call.clone();
    let writer = tokio::spawn(async move {
        use futures_util::StreamExt;
        while let Some(payload) = request.messages.next().await {
            if let Some(max) = max_request_message_bytes {
                if payload.len() > max {
                    return Err(RpcError::ResourceExceeded(format!(
                        "outbound message of {} bytes exceeds max of {max} bytes",
                        payload.len()
                    )));
                }
            }
            writer_call.send_message(payload.clone())?;
            writer_call.next_outgoing();
            let algorithm = send_compression.unwrap_or(Algorithm::Identity);
            let frame = match codec::encode(&payload, send_compression.is_some(), algorithm) {
                Ok(frame) => frame,
                Err(err) => return Err(err),
            };
            let tag = writer_tags.next();
            let rx = match writer_dispatcher.register(tag) {
                Ok(rx) => rx,
                Err(_) => return Err(RpcError::status(Code::Unavailable, "dispatcher shut down")),
            };
            let mut batch = OperationBatch::new(tag);
            let _ = batch.add(Operation::SendMessage(frame));
            if let Err(err) = writer_transport.submit(batch).await {
                writer_dispatcher.retract(tag);
                return Err(err);
            }
            if rx.await != Ok(Outcome::Success) {
                return Err(RpcError::Transport("message send was not acknowledged".into()));
            }
        }
        writer_call.send_close_from_client()?;
        let tag = writer_tags.next();
        let rx = writer_dispatcher
            .register(tag)
            .map_err(|_| RpcError::status(Code::Unavailable, "dispatcher shut down"))?;
        let mut batch = OperationBatch::new(tag);
        let _ = batch.add(Operation::SendCloseFromClient);
        writer_transport.submit(batch).await?;
        let _ = rx.await;
        Ok(())
    });

    let max_response_message_bytes = request.max_response_message_bytes;
    let decompression_limit = request.decompression_limit;
    let reader_transport = transport.clone();
    let reader_call = call.clone();
    let reader = tokio::spawn(async move {
        let mut initial_metadata = None;
        let mut negotiated_encoding = Algorithm::Identity;
        loop {
            let Some(frame) = reader_transport.recv_frame().await else {
                return Err(RpcError::Transport("stream closed before status".into()));
            };
            match frame {
                Frame::InitialMetadata(md) => {
                    if let Some(enc) = md.get_ascii(metadata::GRPC_ENCODING) {
                        if let Some(algorithm) = Algorithm::parse(enc) {
                            negotiated_encoding = algorithm;
                        }
                    }
                    reader_call.receive_initial_metadata(md.clone())?;
                    initial_metadata = Some(md);
                }
                Frame::Message(bytes) => {
                    let decoded = codec::decode(
                        &bytes,
                        negotiated_encoding,
                        max_response_message_bytes,
                        decompression_limit,
                    )?;
                    reader_call.receive_message(decoded.payload.clone())?;
                    if resp_tx.send(decoded.payload).is_err() {
                        return Err(RpcError::cancelled("caller dropped response stream"));
                    }
                }
                Frame::EndOfStream => {}
                Frame::Status {
                    code,
                    message,
                    trailers,
                } => {
                    reader_call.receive_status_on_client(code, message.clone(), trailers.clone())?;
                    return Ok((
                        initial_metadata.unwrap_or_default(),
                        code,
                        message,
                        trailers,
                    ));
                }
            }
        }
    });

    let deadline_guard = async {
        if let Some(deadline) = request.deadline {
            tokio::time::sleep_until(deadline).await;
            true
        } else {
            std::future::pending::<()>().await;
            false
        }
    };

    tokio::select! {
        timed_out = deadline_guard => {
            if timed_out {
                tracing::debug!(method = %request.method_path, "deadline exceeded, closing attempt");
                transport.close().await;
                writer.abort();
                reader.abort();
                return failure_response(RpcError::deadline_exceeded());
            }
            unreachable!("deadline_guard only resolves true")
        }
        _ = request.cancel.cancelled() => {
            tracing::debug!(method = %request.method_path, "cancelled, closing attempt");
            transport.close().await;
            writer.abort();
            reader.abort();
            failure_response(RpcError::cancelled("call cancelled"))
        }
        reader_result = reader => {
            let _ = writer.await;
            match reader_result {
                Ok(Ok((initial_metadata, code, message, trailers))) => Response {
                    initial_metadata,
                    messages: resp_rx,
                    status_code: code,
                    status_message: message,
                    trailers,
                },
                Ok(Err(err)) => failure_response(err),
                Err(_) => failure_response(RpcError::status(Code::Internal, "reader task panicked")),
            }
        }
    }
}

pub(crate) fn failure_response(err: RpcError) -> Response {
    let (code, message, trailers) = err.into_status();
    let (_tx, rx) = mpsc::unbounded_channel();
    Response {
        initial_metadata: Metadata::new(),
        messages: rx,
        status_code: code,
        status_message: message,
        trailers,
    }
}

/// Render a duration as a `grpc-timeout` value: an integer plus a unit
/// suffix, smallest unit that keeps the integer under 1e8 as gRPC requires.
fn format_grpc_timeout(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 100_000_000 {
        format!("{micros}u")
    } else {
        let millis = d.as_millis();
        if millis < 100_000_000 {
            format!("{millis}m")
        } else {
            format!("{}S", d.as_secs())
        }
    }
}

/// Adapter so `Request.messages` can be built from a `ReceiverStream`
/// without callers needing to name the concrete stream type.
pub fn messages_from_channel(rx: mpsc::Receiver<Bytes>) -> Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin> {
    Box::new(ReceiverStream::new(rx))
}
