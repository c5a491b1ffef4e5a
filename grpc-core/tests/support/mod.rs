//! An in-memory fake `Transport`/`TransportListener` pair, standing in for
//! a real HTTP/2 binding so the section 8 scenarios can run end-to-end
//! in-process. Mirrors the teacher's `grpcurl-cli/tests/common/{mod.rs,
//! server.rs}` pattern of standing up a real server per test, substituting
//! an in-memory fake stream for a real socket.

pub mod transport;

pub use transport::{dial, FakeListener, FakeStream};
