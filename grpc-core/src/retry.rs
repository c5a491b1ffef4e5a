//! Retry and hedging execution (section 4.7): the hard part. Schedules
//! attempts against a single-attempt `stream_executor::run_attempt`,
//! multiplexes one request producer across attempts via a `BroadcastBuffer`,
//! and coordinates with a process-local `RetryThrottle`.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::batch::TagAllocator;
use crate::codec::{Algorithm, DecompressionLimit};
use crate::dispatcher::Dispatcher;
use crate::error::Code;
use crate::metadata::{self, Metadata};
use crate::stream_executor::{self, Request, Response};
use crate::transport::{Dialer, Transport};

/// How a call should be executed: a single attempt, sequential retries, or
/// concurrent hedged attempts (section 6's `executionPolicy`).
#[derive(Debug, Clone)]
pub enum ExecutionPolicy {
    None,
    Retry(RetryPolicy),
    Hedging(HedgingPolicy),
}

/// Configuration for sequential retry (section 4.7.2).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub non_fatal_status_codes: HashSet<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            non_fatal_status_codes: [Code::Unavailable].into_iter().collect(),
        }
    }
}

/// Configuration for hedging (section 4.7.1).
#[derive(Debug, Clone)]
pub struct HedgingPolicy {
    pub max_attempts: u32,
    pub hedging_delay: Duration,
    pub non_fatal_status_codes: HashSet<Code>,
}

impl Default for HedgingPolicy {
    fn default() -> Self {
        HedgingPolicy {
            max_attempts: 1,
            hedging_delay: Duration::from_millis(0),
            non_fatal_status_codes: [Code::Unavailable].into_iter().collect(),
        }
    }
}

/// A hint parsed from a `grpc-retry-pushback-ms` trailer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pushback {
    Delay(Duration),
    StopRetrying,
}

fn parse_pushback(trailers: &Metadata) -> Option<Pushback> {
    let raw = trailers.get_ascii(metadata::GRPC_RETRY_PUSHBACK_MS)?;
    match raw.trim().parse::<i64>() {
        Ok(ms) if ms < 0 => Some(Pushback::StopRetrying),
        Ok(ms) => Some(Pushback::Delay(Duration::from_millis(ms as u64))),
        Err(_) => None,
    }
}

/// Token-like rate limiter shared across attempts of the same destination
/// (section 3's `RetryThrottle`).
///
/// Process-local per the Design Notes' "global mutable state" guidance:
/// callers construct one explicitly per destination and pass it in, rather
/// than this type reaching for an ambient static.
pub struct RetryThrottle {
    max_tokens: f64,
    token_ratio: f64,
    tokens: Mutex<f64>,
}

impl RetryThrottle {
    pub fn new(max_tokens: f64, token_ratio: f64) -> RetryThrottle {
        RetryThrottle {
            max_tokens,
            token_ratio,
            tokens: Mutex::new(max_tokens),
        }
    }

    pub fn record_success(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens + self.token_ratio).min(self.max_tokens);
    }

    pub fn record_failure(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens - 1.0).max(0.0);
    }

    pub fn is_retry_permitted(&self) -> bool {
        *self.tokens.lock().unwrap() > self.max_tokens / 2.0
    }
}

impl Default for RetryThrottle {
    fn default() -> Self {
        // 10 max tokens / 0.1 ratio matches the conventional gRPC default
        // (10 retries of slack, replenished slowly on success).
        RetryThrottle::new(10.0, 0.1)
    }
}

struct BufferState<T> {
    items: VecDeque<T>,
    dropped_from_front: usize,
    finished: Option<bool>,
}

/// A bounded fan-out buffer multiplexing one producer's output to many
/// late-joining consumers (section 3's `BroadcastBuffer<T>`).
///
/// Items beyond `buffer_size` are evicted from the front; a subscriber that
/// joins after eviction has begun silently starts from the oldest item
/// still retained. Section 4.7 calls this out as a caller-tunable tradeoff:
/// "bufferSize SHOULD equal the maximum in-flight request bytes the caller
/// tolerates."
pub struct BroadcastBuffer<T> {
    state: Mutex<BufferState<T>>,
    notify: Notify,
    buffer_size: usize,
}

impl<T: Clone> BroadcastBuffer<T> {
    pub fn new(buffer_size: usize) -> Arc<BroadcastBuffer<T>> {
        Arc::new(BroadcastBuffer {
            state: Mutex::new(BufferState {
                items: VecDeque::new(),
                dropped_from_front: 0,
                finished: None,
            }),
            notify: Notify::new(),
            buffer_size: buffer_size.max(1),
        })
    }

    pub fn publish(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(item);
        while state.items.len() > self.buffer_size {
            state.items.pop_front();
            state.dropped_from_front += 1;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn finish(&self, success: bool) {
        self.state.lock().unwrap().finished = Some(success);
        self.notify.notify_waiters();
    }

    pub fn subscribe(self: &Arc<Self>) -> BufferSubscriber<T> {
        let offset = self.state.lock().unwrap().dropped_from_front;
        BufferSubscriber {
            buffer: self.clone(),
            next_index: offset,
        }
    }
}

/// A single consumer's read position into a `BroadcastBuffer`.
pub struct BufferSubscriber<T> {
    buffer: Arc<BroadcastBuffer<T>>,
    next_index: usize,
}

impl<T: Clone> BufferSubscriber<T> {
    pub async fn next(&mut self) -> Option<T> {
        loop {
            {
                let state = self.buffer.state.lock().unwrap();
                let local_index = self.next_index.saturating_sub(state.dropped_from_front);
                if let Some(item) = state.items.get(local_index) {
                    self.next_index += 1;
                    return Some(item.clone());
                }
                if state.finished.is_some() {
                    return None;
                }
            }
            self.buffer.notify.notified().await;
        }
    }
}

/// Drain a `BufferSubscriber` into a channel, returning a stream suitable
/// for `Request.messages`. Each attempt gets its own subscriber and its own
/// pump task so attempts never block one another.
fn subscriber_stream(
    mut subscriber: BufferSubscriber<Bytes>,
) -> Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(item) = subscriber.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    Box::new(ReceiverStream::new(rx))
}

/// Fields shared by every attempt of a call, independent of the message
/// producer (which is multiplexed via `BroadcastBuffer` instead).
pub struct RequestTemplate {
    pub method_path: String,
    pub initial_metadata: Metadata,
    pub send_compression: Option<Algorithm>,
    pub accept_encodings: Vec<Algorithm>,
    pub max_request_message_bytes: Option<usize>,
    pub max_response_message_bytes: Option<usize>,
    pub decompression_limit: DecompressionLimit,
    /// Shared by every attempt of this call: cancelling it stops the whole
    /// retry/hedging group, not just one attempt.
    pub cancel: CancellationToken,
}

impl RequestTemplate {
    fn build(&self, attempt_number: u32, deadline: Option<Instant>, messages: BufferSubscriber<Bytes>) -> Request {
        let mut initial_metadata = self.initial_metadata.copy();
        if attempt_number > 1 {
            let _ = initial_metadata.insert(
                metadata::GRPC_PREVIOUS_RPC_ATTEMPTS,
                (attempt_number - 1).to_string(),
            );
        }
        Request {
            method_path: self.method_path.clone(),
            initial_metadata,
            messages: subscriber_stream(messages),
            deadline,
            send_compression: self.send_compression,
            accept_encodings: self.accept_encodings.clone(),
            max_request_message_bytes: self.max_request_message_bytes,
            max_response_message_bytes: self.max_response_message_bytes,
            decompression_limit: self.decompression_limit,
            cancel: self.cancel.clone(),
        }
    }
}

/// A status is "fatal" (per the policy) iff it is `Ok` or not in the
/// policy's non-fatal set (section 4.7.1's response classification).
fn is_fatal(code: Code, non_fatal: &HashSet<Code>) -> bool {
    code.is_ok() || !non_fatal.contains(&code)
}

/// Drive the producer task: play `messages` once into `buffer`, exactly as
/// section 4.7 requires ("a producer task that plays the request's
/// outbound message stream once into a BroadcastBuffer").
async fn run_producer(
    mut messages: Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin>,
    buffer: Arc<BroadcastBuffer<Bytes>>,
) {
    use futures_util::StreamExt;
    while let Some(item) = messages.next().await {
        buffer.publish(item);
    }
    buffer.finish(true);
}

/// Run a call under [`ExecutionPolicy::Retry`]: sequential attempts with
/// jittered exponential backoff (section 4.7.2).
///
/// Each attempt opens its own stream via `dialer`: a `Call` owns one stream
/// (section 4.4), so a retried attempt cannot reuse the previous attempt's
/// transport even though it reuses the same outbound message buffer.
pub async fn run_retry(
    dialer: Arc<dyn Dialer>,
    dispatcher: Dispatcher,
    tags: Arc<TagAllocator>,
    template: RequestTemplate,
    messages: Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin>,
    policy: RetryPolicy,
    throttle: Arc<RetryThrottle>,
    deadline: Option<Instant>,
) -> Response {
    let buffer = BroadcastBuffer::new(1024);
    tokio::spawn(run_producer(messages, buffer.clone()));

    let mut attempt_number = 1u32;
    let mut pending_delay: Option<Duration> = None;
    loop {
        if let Some(delay) = pending_delay.take() {
            tokio::time::sleep(delay).await;
        }

        let transport = match dialer.open(&template.method_path).await {
            Ok(transport) => transport,
            Err(err) => return stream_executor::failure_response(err),
        };
        let request = template.build(attempt_number, deadline, buffer.subscribe());
        let response = run_with_deadline(
            transport,
            dispatcher.clone(),
            tags.clone(),
            request,
            deadline,
        )
        .await;

        if response.status_code == Code::DeadlineExceeded {
            return response;
        }

        let pushback = parse_pushback(&response.trailers);
        if pushback == Some(Pushback::StopRetrying) {
            return response;
        }

        if is_fatal(response.status_code, &policy.non_fatal_status_codes) {
            throttle.record_success();
            return response;
        }
        throttle.record_failure();

        if attempt_number >= policy.max_attempts || !throttle.is_retry_permitted() {
            tracing::debug!(
                attempt_number,
                status = ?response.status_code,
                "giving up retrying"
            );
            return response;
        }

        let backoff = match pushback {
            Some(Pushback::Delay(d)) => d,
            _ => jittered_backoff(&policy, attempt_number),
        };
        tracing::debug!(
            attempt_number,
            status = ?response.status_code,
            backoff_ms = backoff.as_millis(),
            "retrying after non-fatal status"
        );
        pending_delay = Some(backoff);
        attempt_number += 1;
    }
}

fn jittered_backoff(policy: &RetryPolicy, attempt_number: u32) -> Duration {
    let exponent = (attempt_number - 1) as i32;
    let computed = policy
        .initial_backoff
        .mul_f64(policy.multiplier.powi(exponent))
        .min(policy.max_backoff);
    let jitter = rand::thread_rng().gen_range(0.0..=1.0);
    computed.mul_f64(jitter)
}

/// Run a call under [`ExecutionPolicy::Hedging`]: concurrent staggered
/// attempts, the first usable response wins (section 4.7.1).
///
/// Each attempt dials its own stream via `dialer` before it is spawned, so
/// the supervisor can still close every loser's stream once a winner is
/// latched even though the attempts run concurrently over independent
/// streams rather than one shared one.
pub async fn run_hedging(
    dialer: Arc<dyn Dialer>,
    dispatcher: Dispatcher,
    tags: Arc<TagAllocator>,
    template: Arc<RequestTemplate>,
    messages: Box<dyn futures_core::Stream<Item = Bytes> + Send + Unpin>,
    policy: HedgingPolicy,
    throttle: Arc<RetryThrottle>,
    deadline: Option<Instant>,
) -> Response {
    let buffer = BroadcastBuffer::new(1024);
    tokio::spawn(run_producer(messages, buffer.clone()));

    let has_usable_response = Arc::new(AtomicBool::new(false));
    let (winner_tx, mut winner_rx) = mpsc::channel::<Response>(1);
    let (unusable_tx, mut unusable_rx) = mpsc::unbounded_channel::<Response>();
    let pushback: Arc<Mutex<Option<Pushback>>> = Arc::new(Mutex::new(None));

    let mut handles = Vec::new();
    let mut streams: Vec<Arc<dyn Transport>> = Vec::new();
    for attempt_number in 1..=policy.max_attempts {
        if attempt_number > 1 {
            if !throttle.is_retry_permitted() {
                tracing::debug!(attempt_number, "hedging throttled, not spawning further attempts");
                break;
            }
            let delay = match *pushback.lock().unwrap() {
                Some(Pushback::Delay(d)) => d,
                _ => policy.hedging_delay,
            };
            tokio::time::sleep(delay).await;
            // Re-check after sleeping: a sibling attempt's failure may have
            // landed mid-sleep, and a StopRetrying hint arriving late still
            // needs to cancel this slot before it dials out.
            if matches!(pushback.lock().unwrap().take(), Some(Pushback::StopRetrying)) {
                tracing::debug!(attempt_number, "server pushback said stop hedging");
                break;
            }
            if has_usable_response.load(Ordering::SeqCst) {
                break;
            }
        }

        let transport = match dialer.open(&template.method_path).await {
            Ok(transport) => transport,
            Err(err) => {
                let _ = unusable_tx.send(stream_executor::failure_response(err));
                continue;
            }
        };
        streams.push(transport.clone());
        tracing::debug!(attempt_number, "spawning hedged attempt");

        let dispatcher = dispatcher.clone();
        let tags = tags.clone();
        let template = template.clone();
        let subscriber = buffer.subscribe();
        let non_fatal = policy.non_fatal_status_codes.clone();
        let throttle = throttle.clone();
        let has_usable_response = has_usable_response.clone();
        let winner_tx = winner_tx.clone();
        let unusable_tx = unusable_tx.clone();
        let pushback = pushback.clone();

        handles.push(tokio::spawn(async move {
            let request = template.build(attempt_number, deadline, subscriber);
            let response = run_with_deadline(transport, dispatcher, tags, request, deadline).await;

            if response.status_code == Code::DeadlineExceeded {
                let _ = winner_tx.try_send(response);
                return;
            }

            if is_fatal(response.status_code, &non_fatal) {
                throttle.record_success();
                if has_usable_response
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let _ = winner_tx.send(response).await;
                }
            } else {
                throttle.record_failure();
                if let Some(hint) = parse_pushback(&response.trailers) {
                    *pushback.lock().unwrap() = Some(hint);
                }
                let _ = unusable_tx.send(response);
            }
        }));
    }
    drop(winner_tx);
    drop(unusable_tx);

    let winner = winner_rx.recv().await;
    for handle in &handles {
        handle.abort();
    }
    for stream in &streams {
        stream.close().await;
    }

    match winner {
        Some(response) => response,
        // All permitted attempts produced only unusable responses: hand the
        // most recent one to the caller rather than dropping it (section
        // 4.7.1, and the Design Notes' "surface the last unusable response").
        None => {
            let mut last = None;
            while let Ok(response) = unusable_rx.try_recv() {
                last = Some(response);
            }
            last.unwrap_or_else(|| {
                stream_executor::failure_response(crate::error::RpcError::status(
                    Code::Unavailable,
                    "no attempt produced any response",
                ))
            })
        }
    }
}

/// Wrap one attempt with an overall deadline guard (section 4.7's "an
/// optional timeout task that sleeps for the overall deadline; on fire,
/// cancels the group").
async fn run_with_deadline(
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    tags: Arc<TagAllocator>,
    request: Request,
    deadline: Option<Instant>,
) -> Response {
    match deadline {
        None => stream_executor::run_attempt(transport, dispatcher, tags, request).await,
        Some(deadline) => {
            tokio::select! {
                response = stream_executor::run_attempt(transport.clone(), dispatcher, tags, request) => response,
                _ = tokio::time::sleep_until(deadline) => {
                    transport.close().await;
                    stream_executor::failure_response(crate::error::RpcError::deadline_exceeded())
                }
            }
        }
    }
}
