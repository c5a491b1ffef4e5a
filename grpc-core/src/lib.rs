//! Core gRPC runtime: message framing, metadata, the operation-batch and
//! call state machine, completion dispatch, single-attempt streaming
//! execution, retry/hedging, the server request pump, and the interceptor
//! pipeline.
//!
//! HTTP/2 framing, TLS, connection pooling, and protobuf code generation
//! are out of scope; this crate is generic over the [`transport::Transport`]
//! seam that a production binding implements.

pub mod batch;
pub mod call;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod interceptor;
pub mod metadata;
pub mod retry;
pub mod server;
pub mod stream_executor;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::batch::TagAllocator;
use crate::codec::{Algorithm, DecompressionLimit};
use crate::dispatcher::Dispatcher;
use crate::error::RpcError;
use crate::interceptor::InterceptorPipeline;
use crate::metadata::Metadata;
use crate::retry::{ExecutionPolicy, RequestTemplate, RetryThrottle};
use crate::stream_executor::{self, Request, Response};
use crate::transport::Dialer;

pub use crate::error::{Code, Result};

/// The options record threaded through every call-construction function
/// (section 6's "Programmatic surface").
#[derive(Clone)]
pub struct RpcOptions {
    pub timeout: Option<Duration>,
    pub wait_for_ready: Option<bool>,
    pub max_request_message_bytes: Option<usize>,
    pub max_response_message_bytes: Option<usize>,
    pub compression: Option<Algorithm>,
    pub accept_encodings: Vec<Algorithm>,
    pub decompression_limit: DecompressionLimit,
    pub execution_policy: ExecutionPolicy,
    /// Lets a caller cancel this call (section 4.4): clone the token before
    /// passing `options` in, then call `.cancel()` on the clone from
    /// wherever the call is being awaited concurrently (e.g. a spawned
    /// task). Defaults to a token nothing else holds, i.e. never cancelled.
    pub cancel: CancellationToken,
}

impl Default for RpcOptions {
    fn default() -> Self {
        RpcOptions {
            timeout: None,
            wait_for_ready: None,
            max_request_message_bytes: None,
            max_response_message_bytes: None,
            compression: None,
            accept_encodings: vec![Algorithm::Identity],
            decompression_limit: DecompressionLimit::default(),
            execution_policy: ExecutionPolicy::None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Shared handle an embedder constructs once per destination and reuses
/// across calls: the dialer, the completion dispatcher, the tag allocator,
/// and (if retry/hedging is configured) the throttle.
///
/// The channel holds a [`Dialer`] rather than a single open `Transport`
/// because a `Call` owns exactly one stream (section 4.4): every call, and
/// every retried or hedged attempt of a call, opens its own stream.
///
/// `dispatcher` is passed in rather than spawned here because a production
/// `Transport` implementation drives completions itself (it calls
/// `dispatcher.complete(tag, outcome)` once the wire actually acknowledges
/// a batch) and therefore must share the very same `Dispatcher` instance
/// the channel registers tags against.
pub struct RpcChannel {
    dialer: Arc<dyn Dialer>,
    dispatcher: Dispatcher,
    tags: Arc<TagAllocator>,
    throttle: Arc<RetryThrottle>,
    interceptors: InterceptorPipeline,
}

impl RpcChannel {
    pub fn new(dialer: Arc<dyn Dialer>, dispatcher: Dispatcher) -> RpcChannel {
        RpcChannel {
            dialer,
            dispatcher,
            tags: Arc::new(TagAllocator::new()),
            throttle: Arc::new(RetryThrottle::default()),
            interceptors: InterceptorPipeline::new(),
        }
    }

    /// Declare the interceptor chain this channel runs before every call's
    /// metadata is handed to the execution policy (section 4.9: "constructed
    /// at client/server init by iterating the declared interceptors in
    /// order").
    pub fn with_interceptors(mut self, interceptors: InterceptorPipeline) -> Self {
        self.interceptors = interceptors;
        self
    }

    fn deadline(&self, options: &RpcOptions) -> Option<Instant> {
        options.timeout.map(|d| Instant::now() + d)
    }

    fn template(&self, method_path: &str, initial_metadata: Metadata, options: &RpcOptions) -> RequestTemplate {
        RequestTemplate {
            method_path: method_path.to_string(),
            initial_metadata,
            send_compression: options.compression,
            accept_encodings: options.accept_encodings.clone(),
            max_request_message_bytes: options.max_request_message_bytes,
            max_response_message_bytes: options.max_response_message_bytes,
            decompression_limit: options.decompression_limit,
            cancel: options.cancel.clone(),
        }
    }

    /// Run `messages` under this channel's configured execution policy,
    /// producing the attempt(s)' aggregated `Response` (section 6's four
    /// canonical RPC shapes all bottom out here; they differ only in how
    /// the caller constructs `messages` and consumes the response stream).
    async fn execute(
        &self,
        method_path: &str,
        initial_metadata: Metadata,
        messages: Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin>,
        options: &RpcOptions,
    ) -> Response {
        let deadline = self.deadline(options);
        let initial_metadata = match crate::server::parse_path(method_path) {
            Ok((service, method)) => {
                self.interceptors
                    .apply_metadata(service, method, initial_metadata)
                    .await
            }
            Err(_) => initial_metadata,
        };
        let template = self.template(method_path, initial_metadata, options);
        match options.execution_policy.clone() {
            ExecutionPolicy::None => {
                let transport = match self.dialer.open(method_path).await {
                    Ok(transport) => transport,
                    Err(err) => return stream_executor::failure_response(err),
                };
                let request = build_single_attempt_request(&template, deadline, messages);
                stream_executor::run_attempt(
                    transport,
                    self.dispatcher.clone(),
                    self.tags.clone(),
                    request,
                )
                .await
            }
            ExecutionPolicy::Retry(policy) => {
                retry::run_retry(
                    self.dialer.clone(),
                    self.dispatcher.clone(),
                    self.tags.clone(),
                    template,
                    messages,
                    policy,
                    self.throttle.clone(),
                    deadline,
                )
                .await
            }
            ExecutionPolicy::Hedging(policy) => {
                retry::run_hedging(
                    self.dialer.clone(),
                    self.dispatcher.clone(),
                    self.tags.clone(),
                    Arc::new(template),
                    messages,
                    policy,
                    self.throttle.clone(),
                    deadline,
                )
                .await
            }
        }
    }

    /// Unary: one request message, one response message.
    pub async fn unary(
        &self,
        method_path: &str,
        initial_metadata: Metadata,
        request: Bytes,
        options: &RpcOptions,
    ) -> Result<(Metadata, Bytes, Metadata)> {
        let messages = single_message_stream(request);
        let mut response = self.execute(method_path, initial_metadata, messages, &options).await;
        if !response.status_code.is_ok() {
            return Err(RpcError::status_with_trailers(
                response.status_code,
                response.status_message,
                response.trailers,
            ));
        }
        let payload = response.messages.recv().await.unwrap_or_default();
        Ok((response.initial_metadata, payload, response.trailers))
    }

    /// Client-streaming: many request messages, one response message.
    pub async fn client_streaming(
        &self,
        method_path: &str,
        initial_metadata: Metadata,
        requests: Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin>,
        options: &RpcOptions,
    ) -> Result<(Metadata, Bytes, Metadata)> {
        let mut response = self.execute(method_path, initial_metadata, requests, &options).await;
        if !response.status_code.is_ok() {
            return Err(RpcError::status_with_trailers(
                response.status_code,
                response.status_message,
                response.trailers,
            ));
        }
        let payload = response.messages.recv().await.unwrap_or_default();
        Ok((response.initial_metadata, payload, response.trailers))
    }

    /// Server-streaming: one request message, many response messages.
    pub async fn server_streaming(
        &self,
        method_path: &str,
        initial_metadata: Metadata,
        request: Bytes,
        options: &RpcOptions,
    ) -> Result<Response> {
        let messages = single_message_stream(request);
        let response = self.execute(method_path, initial_metadata, messages, &options).await;
        if !response.status_code.is_ok() {
            return Err(RpcError::status_with_trailers(
                response.status_code,
                response.status_message,
                response.trailers,
            ));
        }
        Ok(response)
    }

    /// Bidirectional-streaming: many request messages, many response
    /// messages, concurrently.
    pub async fn bidi_streaming(
        &self,
        method_path: &str,
        initial_metadata: Metadata,
        requests: Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin>,
        options: &RpcOptions,
    ) -> Response {
        self.execute(method_path, initial_metadata, requests, &options).await
    }
}

fn single_message_stream(payload: Bytes) -> Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin> {
    Box::new(tokio_stream::once(payload))
}

fn build_single_attempt_request(
    template: &RequestTemplate,
    deadline: Option<Instant>,
    messages: Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin>,
) -> Request {
    Request {
        method_path: template.method_path.clone(),
        initial_metadata: template.initial_metadata.copy(),
        messages,
        deadline,
        send_compression: template.send_compression,
        accept_encodings: template.accept_encodings.clone(),
        max_request_message_bytes: template.max_request_message_bytes,
        max_response_message_bytes: template.max_response_message_bytes,
        decompression_limit: template.decompression_limit,
        cancel: template.cancel.clone(),
    }
}
