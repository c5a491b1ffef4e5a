//! Operation batches (section 4.3): the unit of atomicity presented to the
//! transport. A batch names up to one of each of eight operation kinds and
//! carries a single process-wide-unique tag used to correlate its eventual
//! completion.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::Code;
use crate::metadata::Metadata;

/// A 64-bit tag uniquely identifying one in-flight batch, process-wide.
/// Monotonically increasing per the Design Notes' "global mutable state"
/// guidance: the counter itself is an explicitly injected object (`TagAllocator`),
/// not an ambient static, so tests can run with a fresh allocator per case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Hands out monotonically increasing tags. One instance is shared by every
/// call on a connection (in production; tests construct one per case to get
/// deterministic tag sequences).
#[derive(Debug, Default)]
pub struct TagAllocator {
    next: AtomicU64,
}

impl TagAllocator {
    pub fn new() -> TagAllocator {
        TagAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Tag {
        Tag(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// The eight operation kinds a batch may carry (section 3). Replaces the
/// "deep inheritance of operation observers" the Design Notes call out:
/// one tagged union whose variants carry their own parameters, driven by
/// a single match statement at submission time.
#[derive(Debug, Clone)]
pub enum Operation {
    SendInitialMetadata(Metadata),
    SendMessage(Bytes),
    SendCloseFromClient,
    SendStatusFromServer {
        code: Code,
        message: String,
        trailers: Metadata,
    },
    ReceiveInitialMetadata,
    ReceiveMessage,
    ReceiveStatusOnClient,
    ReceiveCloseOnServer,
}

impl Operation {
    fn kind_index(&self) -> usize {
        match self {
            Operation::SendInitialMetadata(_) => 0,
            Operation::SendMessage(_) => 1,
            Operation::SendCloseFromClient => 2,
            Operation::SendStatusFromServer { .. } => 3,
            Operation::ReceiveInitialMetadata => 4,
            Operation::ReceiveMessage => 5,
            Operation::ReceiveStatusOnClient => 6,
            Operation::ReceiveCloseOnServer => 7,
        }
    }
}

/// An ordered collection of at most one of each `Operation` kind, submitted
/// atomically with one completion tag (section 3).
#[derive(Debug, Clone)]
pub struct OperationBatch {
    tag: Tag,
    operations: Vec<Operation>,
}

/// Returned when a caller tries to add a second operation of a kind already
/// present in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateOperationKind;

impl OperationBatch {
    pub fn new(tag: Tag) -> OperationBatch {
        OperationBatch {
            tag,
            operations: Vec::new(),
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Add `op`, rejecting a second operation of the same kind (section 3:
    /// "at most one of each operation kind").
    pub fn add(&mut self, op: Operation) -> Result<(), DuplicateOperationKind> {
        let kind = op.kind_index();
        if self.operations.iter().any(|o| o.kind_index() == kind) {
            return Err(DuplicateOperationKind);
        }
        self.operations.push(op);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// The outcome of a submitted batch, delivered exactly once to its
/// completion callback (section 3, section 8's "exactly one completion").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Cancelled,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}
