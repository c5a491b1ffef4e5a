//! End-to-end scenarios from section 8, driven over the in-memory fake
//! transport in `support/`.

mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use grpc_core::batch::{Operation, OperationBatch};
use grpc_core::codec::{self, Algorithm, DecompressionLimit};
use grpc_core::error::Code;
use grpc_core::metadata::{self, Metadata};
use grpc_core::retry::{ExecutionPolicy, HedgingPolicy};
use grpc_core::transport::{Frame, Transport, TransportListener};
use grpc_core::{RpcChannel, RpcOptions};

use support::dial;

/// Run a single-shot unary "server" for one accepted stream: read the
/// client's initial metadata and one message, hand both to `handler`, then
/// write back initial metadata, the handler's response message, and a
/// status built from the handler's result.
async fn serve_one_unary<F>(listener: Arc<support::FakeListener>, handler: F)
where
    F: FnOnce(Bytes) -> (Code, Bytes) + Send + 'static,
{
    tokio::spawn(async move {
        let Some((_path, stream)) = listener.accept().await else {
            return;
        };
        // Drain the client's initial metadata and first message. Message
        // bytes on the wire are codec frames (section 4.1), matching what
        // `stream_executor`'s writer task produces.
        let mut request = Bytes::new();
        loop {
            match stream.recv_frame().await {
                Some(Frame::InitialMetadata(_)) => continue,
                Some(Frame::Message(bytes)) => {
                    let decoded = codec::decode(
                        &bytes,
                        Algorithm::Identity,
                        None,
                        DecompressionLimit::default(),
                    )
                    .expect("test request frame decodes");
                    request = decoded.payload;
                }
                Some(Frame::EndOfStream) => break,
                _ => break,
            }
        }

        let (code, response) = handler(request);
        let response_frame =
            codec::encode(&response, false, Algorithm::Identity).expect("test response encodes");

        let tags = grpc_core::batch::TagAllocator::new();

        let mut md_batch = OperationBatch::new(tags.next());
        let _ = md_batch.add(Operation::SendInitialMetadata(Metadata::new()));
        let _ = stream.submit(md_batch).await;

        let mut msg_batch = OperationBatch::new(tags.next());
        let _ = msg_batch.add(Operation::SendMessage(response_frame));
        let _ = stream.submit(msg_batch).await;

        let mut status_batch = OperationBatch::new(tags.next());
        let _ = status_batch.add(Operation::SendStatusFromServer {
            code,
            message: String::new(),
            trailers: Metadata::new(),
        });
        let _ = stream.submit(status_batch).await;
    });
}

/// Run a server-streaming "server": read the client's one request message,
/// then write initial metadata announcing `grpc-encoding: deflate`
/// (negotiated because at least one response is sent compressed), followed
/// by one frame per entry in `parts` (`(compressed, size)`), then an OK
/// status.
async fn serve_streaming_parts(listener: Arc<support::FakeListener>, parts: Vec<(bool, usize)>) {
    tokio::spawn(async move {
        let Some((_path, stream)) = listener.accept().await else {
            return;
        };
        loop {
            match stream.recv_frame().await {
                Some(Frame::InitialMetadata(_)) => continue,
                Some(Frame::Message(_)) => continue,
                Some(Frame::EndOfStream) => break,
                _ => break,
            }
        }

        let tags = grpc_core::batch::TagAllocator::new();

        let mut initial_metadata = Metadata::new();
        let _ = initial_metadata.insert(metadata::GRPC_ENCODING, Algorithm::Deflate.as_str());
        let mut md_batch = OperationBatch::new(tags.next());
        let _ = md_batch.add(Operation::SendInitialMetadata(initial_metadata));
        let _ = stream.submit(md_batch).await;

        for (compressed, size) in parts {
            let payload = Bytes::from(vec![0u8; size]);
            let frame = codec::encode(&payload, compressed, Algorithm::Deflate)
                .expect("test response encodes");
            let mut msg_batch = OperationBatch::new(tags.next());
            let _ = msg_batch.add(Operation::SendMessage(frame));
            let _ = stream.submit(msg_batch).await;
        }

        let mut status_batch = OperationBatch::new(tags.next());
        let _ = status_batch.add(Operation::SendStatusFromServer {
            code: Code::Ok,
            message: String::new(),
            trailers: Metadata::new(),
        });
        let _ = stream.submit(status_batch).await;
    });
}

fn base_options() -> RpcOptions {
    RpcOptions {
        decompression_limit: DecompressionLimit::Bytes(1 << 20),
        ..RpcOptions::default()
    }
}

#[tokio::test]
async fn empty_unary_returns_empty_response_and_ok_status() {
    let (listener, dialer) = dial();
    serve_one_unary(listener, |_req| (Code::Ok, Bytes::new())).await;

    let client_dispatcher = dialer.client_dispatcher();
    let channel = RpcChannel::new(Arc::new(dialer), client_dispatcher);

    let (_, payload, _) = channel
        .unary(
            "/grpc.testing.TestService/EmptyCall",
            Metadata::new(),
            Bytes::new(),
            &base_options(),
        )
        .await
        .expect("expected OK status");

    assert!(payload.is_empty());
}

#[tokio::test]
async fn large_unary_returns_requested_payload_size() {
    let (listener, dialer) = dial();
    let response_size = 314_159usize;
    serve_one_unary(listener, move |_req| {
        (Code::Ok, Bytes::from(vec![0u8; response_size]))
    })
    .await;

    let client_dispatcher = dialer.client_dispatcher();
    let channel = RpcChannel::new(Arc::new(dialer), client_dispatcher);

    let request = Bytes::from(vec![0u8; 271_828]);
    let (_, payload, _) = channel
        .unary(
            "/grpc.testing.TestService/UnaryCall",
            Metadata::new(),
            request,
            &base_options(),
        )
        .await
        .expect("expected OK status");

    assert_eq!(payload.len(), response_size);
}

#[tokio::test]
async fn unimplemented_method_yields_unimplemented_status() {
    let (listener, dialer) = dial();
    serve_one_unary(listener, |_req| {
        (Code::Unimplemented, Bytes::new())
    })
    .await;

    let client_dispatcher = dialer.client_dispatcher();
    let channel = RpcChannel::new(Arc::new(dialer), client_dispatcher);

    let err = channel
        .unary(
            "/grpc.testing.TestService/UnimplementedCall",
            Metadata::new(),
            Bytes::new(),
            &base_options(),
        )
        .await
        .expect_err("expected Unimplemented status");

    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn timeout_on_sleeping_server_yields_deadline_exceeded() {
    let (listener, dialer) = dial();
    // Server accepts the stream but never responds.
    tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let client_dispatcher = dialer.client_dispatcher();
    let channel = RpcChannel::new(Arc::new(dialer), client_dispatcher);

    let options = RpcOptions {
        timeout: Some(Duration::from_millis(1)),
        ..base_options()
    };

    let started = tokio::time::Instant::now();
    let err = channel
        .unary(
            "/grpc.testing.TestService/FullDuplexCall",
            Metadata::new(),
            Bytes::new(),
            &options,
        )
        .await
        .expect_err("expected DeadlineExceeded");

    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn compressed_server_streaming_returns_each_requested_part() {
    let (listener, dialer) = dial();
    serve_streaming_parts(listener, vec![(true, 31_415), (false, 92_653)]).await;

    let client_dispatcher = dialer.client_dispatcher();
    let channel = RpcChannel::new(Arc::new(dialer), client_dispatcher);

    let options = RpcOptions {
        accept_encodings: vec![Algorithm::Deflate, Algorithm::Identity],
        ..base_options()
    };

    let mut response = channel
        .server_streaming(
            "/grpc.testing.TestService/StreamingOutputCall",
            Metadata::new(),
            Bytes::new(),
            &options,
        )
        .await
        .expect("expected OK status");

    assert_eq!(
        response.initial_metadata.get_ascii(metadata::GRPC_ENCODING),
        Some("deflate")
    );

    let first = response.messages.recv().await.expect("first part");
    assert_eq!(first.len(), 31_415);
    let second = response.messages.recv().await.expect("second part");
    assert_eq!(second.len(), 92_653);
    assert_eq!(response.messages.recv().await, None);
}

/// Cancellation races the cancel signal against the call itself: the call
/// is spawned onto its own task so the test can fire the token while it is
/// still in flight, mirroring how an embedder would cancel a call it
/// handed off to another task.
#[tokio::test]
async fn cancel_after_first_response_yields_cancelled_and_stops_delivery() {
    let (listener, dialer) = dial();
    tokio::spawn(async move {
        let Some((_path, stream)) = listener.accept().await else {
            return;
        };
        loop {
            match stream.recv_frame().await {
                Some(Frame::InitialMetadata(_)) | Some(Frame::Message(_)) => continue,
                Some(Frame::EndOfStream) => break,
                _ => break,
            }
        }

        let tags = grpc_core::batch::TagAllocator::new();
        let mut md_batch = OperationBatch::new(tags.next());
        let _ = md_batch.add(Operation::SendInitialMetadata(Metadata::new()));
        let _ = stream.submit(md_batch).await;

        let first = codec::encode(b"first", false, Algorithm::Identity).unwrap();
        let mut msg_batch = OperationBatch::new(tags.next());
        let _ = msg_batch.add(Operation::SendMessage(first));
        let _ = stream.submit(msg_batch).await;

        // Give the test time to cancel before the stream would otherwise
        // complete; a real server's next message would race the same way.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = codec::encode(b"second", false, Algorithm::Identity).unwrap();
        let mut msg_batch = OperationBatch::new(tags.next());
        let _ = msg_batch.add(Operation::SendMessage(second));
        let _ = stream.submit(msg_batch).await;

        let mut status_batch = OperationBatch::new(tags.next());
        let _ = status_batch.add(Operation::SendStatusFromServer {
            code: Code::Ok,
            message: String::new(),
            trailers: Metadata::new(),
        });
        let _ = stream.submit(status_batch).await;
    });

    let client_dispatcher = dialer.client_dispatcher();
    let channel = RpcChannel::new(Arc::new(dialer), client_dispatcher);
    let cancel = tokio_util::sync::CancellationToken::new();
    let options = RpcOptions {
        cancel: cancel.clone(),
        ..base_options()
    };

    let call = tokio::spawn(async move {
        channel
            .bidi_streaming(
                "/grpc.testing.TestService/FullDuplexCall",
                Metadata::new(),
                Box::new(tokio_stream::once(Bytes::new())),
                &options,
            )
            .await
    });

    // Let the reader task observe the server's own first message before
    // cancelling, so this genuinely exercises "cancel after first response"
    // rather than cancelling before anything was delivered.
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let response = call.await.expect("call task did not panic");
    assert_eq!(response.status_code, Code::Cancelled);
}

#[tokio::test]
async fn hedging_picks_first_success_and_ignores_later_attempts() {
    let (listener, dialer) = dial();

    tokio::spawn(async move {
        let mut attempt = 0u32;
        loop {
            let Some((_path, stream)) = listener.accept().await else {
                return;
            };
            attempt += 1;
            let this_attempt = attempt;
            tokio::spawn(async move {
                loop {
                    match stream.recv_frame().await {
                        Some(Frame::InitialMetadata(_)) | Some(Frame::Message(_)) => continue,
                        Some(Frame::EndOfStream) => break,
                        _ => break,
                    }
                }

                // The first attempt hangs forever (never responds); the
                // rest answer promptly so the second one to reply wins.
                if this_attempt == 1 {
                    std::future::pending::<()>().await;
                }

                let tags = grpc_core::batch::TagAllocator::new();
                let mut md_batch = OperationBatch::new(tags.next());
                let _ = md_batch.add(Operation::SendInitialMetadata(Metadata::new()));
                let _ = stream.submit(md_batch).await;

                let payload = Bytes::from(format!("attempt-{this_attempt}"));
                let frame = codec::encode(&payload, false, Algorithm::Identity).unwrap();
                let mut msg_batch = OperationBatch::new(tags.next());
                let _ = msg_batch.add(Operation::SendMessage(frame));
                let _ = stream.submit(msg_batch).await;

                let mut status_batch = OperationBatch::new(tags.next());
                let _ = status_batch.add(Operation::SendStatusFromServer {
                    code: Code::Ok,
                    message: String::new(),
                    trailers: Metadata::new(),
                });
                let _ = stream.submit(status_batch).await;
            });
        }
    });

    let client_dispatcher = dialer.client_dispatcher();
    let channel = RpcChannel::new(Arc::new(dialer), client_dispatcher);
    let options = RpcOptions {
        execution_policy: ExecutionPolicy::Hedging(HedgingPolicy {
            max_attempts: 3,
            hedging_delay: Duration::from_millis(10),
            non_fatal_status_codes: Default::default(),
        }),
        ..base_options()
    };

    let (_, payload, _) = channel
        .unary(
            "/grpc.testing.TestService/UnaryCall",
            Metadata::new(),
            Bytes::new(),
            &options,
        )
        .await
        .expect("expected OK status from a hedged attempt");

    assert_ne!(payload, Bytes::from_static(b"attempt-1"));
    assert!(payload.starts_with(b"attempt-"));
}

#[tokio::test]
async fn hedging_stops_scheduling_further_attempts_on_pushback_stop() {
    let (listener, dialer) = dial();
    let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let accepted_counter = accepted.clone();

    tokio::spawn(async move {
        loop {
            let Some((_path, stream)) = listener.accept().await else {
                return;
            };
            accepted_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::spawn(async move {
                loop {
                    match stream.recv_frame().await {
                        Some(Frame::InitialMetadata(_)) | Some(Frame::Message(_)) => continue,
                        Some(Frame::EndOfStream) => break,
                        _ => break,
                    }
                }

                let tags = grpc_core::batch::TagAllocator::new();
                let mut md_batch = OperationBatch::new(tags.next());
                let _ = md_batch.add(Operation::SendInitialMetadata(Metadata::new()));
                let _ = stream.submit(md_batch).await;

                let mut trailers = Metadata::new();
                let _ = trailers.insert(metadata::GRPC_RETRY_PUSHBACK_MS, "-1");
                let mut status_batch = OperationBatch::new(tags.next());
                let _ = status_batch.add(Operation::SendStatusFromServer {
                    code: Code::Unavailable,
                    message: "go away".to_string(),
                    trailers,
                });
                let _ = stream.submit(status_batch).await;
            });
        }
    });

    let client_dispatcher = dialer.client_dispatcher();
    let channel = RpcChannel::new(Arc::new(dialer), client_dispatcher);
    let options = RpcOptions {
        execution_policy: ExecutionPolicy::Hedging(HedgingPolicy {
            max_attempts: 5,
            hedging_delay: Duration::from_millis(5),
            non_fatal_status_codes: [Code::Unavailable].into_iter().collect(),
        }),
        ..base_options()
    };

    let err = channel
        .unary(
            "/grpc.testing.TestService/UnaryCall",
            Metadata::new(),
            Bytes::new(),
            &options,
        )
        .await
        .expect_err("expected Unavailable status");

    assert_eq!(err.code(), Code::Unavailable);
    // Pushback told the first attempt to stop: only one stream should ever
    // have been accepted, not all five configured hedging slots.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
}
