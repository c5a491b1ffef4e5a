//! The call state machine (section 4.4): enforces the legal orderings of
//! operations on one RPC and aggregates the values a completed call
//! produces.
//!
//! Send side: `Idle -> Sending -> Closing -> Closed`.
//! Receive side (client view): `AwaitingHeaders -> Streaming -> TrailersReceived -> Closed`.
//! The two sides advance independently; a call is fully done only once both
//! reach their terminal state.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{Code, RpcError};
use crate::metadata::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Idle,
    Sending,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    AwaitingHeaders,
    Streaming,
    TrailersReceived,
    Closed,
}

/// The final, aggregated outcome of a call once both sides are closed
/// (section 3's "CallResult").
#[derive(Debug, Clone)]
pub struct CallResult {
    pub initial_metadata: Metadata,
    pub messages: Vec<Bytes>,
    pub status_code: Code,
    pub status_message: String,
    pub trailers: Metadata,
}

impl CallResult {
    pub fn is_ok(&self) -> bool {
        self.status_code.is_ok()
    }
}

struct Inner {
    send: SendState,
    receive: ReceiveState,
    send_queue: VecDeque<Bytes>,
    send_queue_capacity: usize,
    initial_metadata_sent: bool,
    received_initial_metadata: Option<Metadata>,
    received_messages: Vec<Bytes>,
    status: Option<(Code, String, Metadata)>,
    cancelled: bool,
}

/// Shared body of `send_close_from_client`/`send_status_from_server`: both
/// operations are the same `Sending`/`Idle -> Closing/Closed` transition,
/// only the caller's role differs.
fn finish_send(inner: &mut Inner) -> Result<(), RpcError> {
    match inner.send {
        SendState::Sending => {
            inner.send = if inner.send_queue.is_empty() {
                SendState::Closed
            } else {
                SendState::Closing
            };
            Ok(())
        }
        SendState::Idle => {
            inner.send = SendState::Closed;
            Ok(())
        }
        SendState::Closed | SendState::Closing => Ok(()),
    }
}

/// One RPC's mutable state, guarded by a single mutex.
///
/// A plain `Mutex` rather than an actor or lock-free structure: transitions
/// are short, synchronous checks (section 4.4's transition table), so there
/// is nothing to gain from finer-grained concurrency here.
pub struct Call {
    inner: Mutex<Inner>,
}

impl Call {
    pub fn new(send_queue_capacity: usize) -> Call {
        Call {
            inner: Mutex::new(Inner {
                send: SendState::Idle,
                receive: ReceiveState::AwaitingHeaders,
                send_queue: VecDeque::new(),
                send_queue_capacity,
                initial_metadata_sent: false,
                received_initial_metadata: None,
                received_messages: Vec::new(),
                status: None,
                cancelled: false,
            }),
        }
    }

    /// Send initial metadata. Legal only from `Idle`; advances to `Sending`.
    pub fn send_initial_metadata(&self) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.send {
            SendState::Idle => {
                inner.send = SendState::Sending;
                inner.initial_metadata_sent = true;
                Ok(())
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "sendInitialMetadata is illegal from send state {other:?}"
            ))),
        }
    }

    /// Enqueue a message to send. If initial metadata has not been sent yet,
    /// it is auto-inserted first, per section 4.4's "a bare sendMessage
    /// implicitly opens the call." Fails with `Blocked` if the send queue
    /// is already at capacity.
    pub fn send_message(&self, payload: Bytes) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.send == SendState::Idle {
            inner.send = SendState::Sending;
            inner.initial_metadata_sent = true;
        }
        match inner.send {
            SendState::Sending => {
                if inner.send_queue.len() >= inner.send_queue_capacity {
                    return Err(RpcError::Blocked);
                }
                inner.send_queue.push_back(payload);
                Ok(())
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "sendMessage is illegal from send state {other:?}"
            ))),
        }
    }

    /// Pop the next queued message the transport should write, if any.
    pub fn next_outgoing(&self) -> Option<Bytes> {
        self.inner.lock().unwrap().send_queue.pop_front()
    }

    /// Half-close the send side. Legal from `Sending` or `Idle` (section
    /// 4.4: "sendClose / sendStatus | Sending or Idle | Closing | final
    /// send"); advances to `Closing` and then immediately `Closed` once the
    /// queue has drained (draining itself is observed by the transport via
    /// `next_outgoing`). From `Idle` the queue is necessarily empty, so the
    /// call closes straight away with no intermediate `Closing`.
    pub fn send_close_from_client(&self) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        finish_send(&mut inner)
    }

    /// Send the final status from the server side. Legal from the same
    /// states as `send_close_from_client` — section 4.4 lists
    /// `sendClose`/`sendStatus` as the same transition, named differently
    /// only by which role is closing the send side.
    pub fn send_status_from_server(&self) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        finish_send(&mut inner)
    }

    /// The transport calls this once the send queue has drained after
    /// `sendCloseFromClient`, completing the `Closing -> Closed` transition.
    pub fn mark_send_drained(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.send == SendState::Closing && inner.send_queue.is_empty() {
            inner.send = SendState::Closed;
        }
    }

    /// Record initial metadata arriving from the peer. Legal only from
    /// `AwaitingHeaders`; advances to `Streaming`.
    pub fn receive_initial_metadata(&self, metadata: Metadata) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.receive {
            ReceiveState::AwaitingHeaders => {
                inner.received_initial_metadata = Some(metadata);
                inner.receive = ReceiveState::Streaming;
                Ok(())
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "receiveInitialMetadata is illegal from receive state {other:?}"
            ))),
        }
    }

    /// Record a message arriving from the peer. Auto-advances from
    /// `AwaitingHeaders` the same way servers may omit explicit initial
    /// metadata before their first response (section 4.4, mirroring the
    /// client-side auto-insert rule).
    pub fn receive_message(&self, payload: Bytes) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.receive == ReceiveState::AwaitingHeaders {
            inner.received_initial_metadata = Some(Metadata::new());
            inner.receive = ReceiveState::Streaming;
        }
        match inner.receive {
            ReceiveState::Streaming => {
                inner.received_messages.push(payload);
                Ok(())
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "receiveMessage is illegal from receive state {other:?}"
            ))),
        }
    }

    /// Record the final status arriving from the peer. Legal from
    /// `AwaitingHeaders` or `Streaming`; advances to `TrailersReceived`.
    pub fn receive_status_on_client(
        &self,
        code: Code,
        message: String,
        trailers: Metadata,
    ) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.receive {
            ReceiveState::AwaitingHeaders | ReceiveState::Streaming => {
                if inner.received_initial_metadata.is_none() {
                    inner.received_initial_metadata = Some(Metadata::new());
                }
                inner.status = Some((code, message, trailers));
                inner.receive = ReceiveState::TrailersReceived;
                Ok(())
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "receiveStatusOnClient is illegal from receive state {other:?}"
            ))),
        }
    }

    /// Record the client's half-close arriving at the server
    /// (`ReceiveCloseOnServer`). Legal from `AwaitingHeaders` or
    /// `Streaming`; advances to `TrailersReceived`, mirroring how
    /// `receive_status_on_client` terminates the receive side on the
    /// client's end. Unlike that method, no status is recorded here: a
    /// server's receive side terminates on a close, not a status.
    pub fn receive_close_on_server(&self) -> Result<(), RpcError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.receive {
            ReceiveState::AwaitingHeaders | ReceiveState::Streaming => {
                if inner.received_initial_metadata.is_none() {
                    inner.received_initial_metadata = Some(Metadata::new());
                }
                inner.receive = ReceiveState::TrailersReceived;
                Ok(())
            }
            other => Err(RpcError::ProtocolViolation(format!(
                "receiveCloseOnServer is illegal from receive state {other:?}"
            ))),
        }
    }

    /// Cancel the call. Idempotent: a second cancellation of an already
    /// cancelled or closed call is a no-op rather than an error, per
    /// section 4.4's "cancellation must be safe to call more than once."
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.cancelled || inner.receive == ReceiveState::TrailersReceived {
            return;
        }
        inner.cancelled = true;
        inner.send = SendState::Closed;
        inner.send_queue.clear();
        if inner.status.is_none() {
            inner.status = Some((
                Code::Cancelled,
                "call cancelled".to_string(),
                Metadata::new(),
            ));
        }
        inner.receive = ReceiveState::TrailersReceived;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    /// Whether both sides have reached a terminal state and `result()` can
    /// be called.
    pub fn is_done(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.receive == ReceiveState::TrailersReceived
    }

    /// Whether the send side has reached its terminal state, i.e. a status
    /// or close has already gone out. Used on the server side to decide
    /// whether a deadline firing still needs to send one (section 4.8).
    pub fn is_send_closed(&self) -> bool {
        self.inner.lock().unwrap().send == SendState::Closed
    }

    /// Aggregate the call's outcome. Panics if called before the receive
    /// side has reached `TrailersReceived`; callers are expected to check
    /// `is_done()` first (this mirrors a completion dispatcher invariant,
    /// not a condition that should ever occur from application code).
    pub fn result(&self) -> CallResult {
        let inner = self.inner.lock().unwrap();
        let (status_code, status_message, trailers) = inner
            .status
            .clone()
            .expect("result() called before receiveStatusOnClient");
        CallResult {
            initial_metadata: inner.received_initial_metadata.clone().unwrap_or_default(),
            messages: inner.received_messages.clone(),
            status_code,
            status_message,
            trailers,
        }
    }
}
