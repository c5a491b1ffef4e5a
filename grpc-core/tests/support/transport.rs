use std::sync::Arc;

use async_trait::async_trait;
use grpc_core::batch::{Operation, OperationBatch, Outcome};
use grpc_core::dispatcher::Dispatcher;
use grpc_core::error::RpcError;
use grpc_core::transport::{self, Frame, Transport, TransportListener};
use tokio::sync::{mpsc, Mutex};

/// One half of an in-memory duplex stream. Operations submitted on one end
/// are translated directly into `Frame`s delivered to the other end's
/// `recv_frame`, since there is no real wire to cross.
pub struct FakeStream {
    dispatcher: Dispatcher,
    to_peer: mpsc::UnboundedSender<Frame>,
    from_peer: Mutex<mpsc::UnboundedReceiver<Frame>>,
    closed: std::sync::atomic::AtomicBool,
}

impl FakeStream {
    fn pair(dispatcher_a: Dispatcher, dispatcher_b: Dispatcher) -> (FakeStream, FakeStream) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        (
            FakeStream {
                dispatcher: dispatcher_a,
                to_peer: tx_ab,
                from_peer: Mutex::new(rx_ba),
                closed: std::sync::atomic::AtomicBool::new(false),
            },
            FakeStream {
                dispatcher: dispatcher_b,
                to_peer: tx_ba,
                from_peer: Mutex::new(rx_ab),
                closed: std::sync::atomic::AtomicBool::new(false),
            },
        )
    }
}

#[async_trait]
impl Transport for FakeStream {
    async fn submit(&self, batch: OperationBatch) -> Result<(), RpcError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RpcError::Transport("stream closed".into()));
        }
        for op in batch.operations() {
            let frame = match op {
                Operation::SendInitialMetadata(md) => Some(Frame::InitialMetadata(md.clone())),
                Operation::SendMessage(bytes) => Some(Frame::Message(bytes.clone())),
                Operation::SendCloseFromClient => Some(Frame::EndOfStream),
                Operation::SendStatusFromServer {
                    code,
                    message,
                    trailers,
                } => Some(Frame::Status {
                    code: *code,
                    message: message.clone(),
                    trailers: trailers.clone(),
                }),
                _ => None,
            };
            if let Some(frame) = frame {
                let _ = self.to_peer.send(frame);
            }
        }
        self.dispatcher.complete(batch.tag(), Outcome::Success);
        Ok(())
    }

    async fn recv_frame(&self) -> Option<Frame> {
        self.from_peer.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Accepts streams opened via [`dial`]. Used on the "server" side of a test.
pub struct FakeListener {
    dispatcher: Dispatcher,
    incoming: Mutex<mpsc::UnboundedReceiver<(String, FakeStream)>>,
}

#[async_trait]
impl TransportListener for FakeListener {
    type Stream = FakeStream;

    async fn accept(&self) -> Option<(String, FakeStream)> {
        self.incoming.lock().await.recv().await
    }
}

/// Construct a connected (listener, dial-fn) pair sharing one dispatcher
/// per side, matching how a single completion queue serves every call on
/// a connection (section 4.5).
pub fn dial() -> (Arc<FakeListener>, Dialer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener_dispatcher = Dispatcher::spawn();
    let listener = Arc::new(FakeListener {
        dispatcher: listener_dispatcher.clone(),
        incoming: Mutex::new(rx),
    });
    (
        listener,
        Dialer {
            opener: tx,
            client_dispatcher: Dispatcher::spawn(),
            server_dispatcher: listener_dispatcher,
        },
    )
}

pub struct Dialer {
    opener: mpsc::UnboundedSender<(String, FakeStream)>,
    client_dispatcher: Dispatcher,
    server_dispatcher: Dispatcher,
}

impl Dialer {
    pub fn client_dispatcher(&self) -> Dispatcher {
        self.client_dispatcher.clone()
    }

    pub fn server_dispatcher(&self) -> Dispatcher {
        self.server_dispatcher.clone()
    }

    /// Open a new stream against `path`; returns the client's end.
    pub fn open(&self, path: impl Into<String>) -> Arc<FakeStream> {
        let (client, server) = FakeStream::pair(self.client_dispatcher.clone(), self.server_dispatcher.clone());
        let _ = self.opener.send((path.into(), server));
        Arc::new(client)
    }
}

/// Lets a `Dialer` stand in for `RpcChannel`'s production `Dialer` seam, so
/// tests can drive retry/hedging (which open one stream per attempt) the
/// same way a real binding would.
#[async_trait]
impl transport::Dialer for Dialer {
    async fn open(&self, method_path: &str) -> Result<Arc<dyn Transport>, RpcError> {
        Ok(self.open(method_path) as Arc<dyn Transport>)
    }
}
