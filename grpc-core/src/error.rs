use std::fmt;

use crate::metadata::Metadata;

/// The canonical gRPC status code set (0-16), as standardised by upstream gRPC.
///
/// A closed enum rather than an open string, so policy decisions (section 4.7's
/// "non-fatal status codes") can be expressed as a set membership test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Decode a `grpc-status` trailer value (always decimal per section 6).
    pub fn from_decimal(value: &str) -> Option<Code> {
        value.trim().parse::<u8>().ok().and_then(Code::from_u8)
    }

    pub fn from_u8(value: u8) -> Option<Code> {
        use Code::*;
        Some(match value {
            0 => Ok,
            1 => Cancelled,
            2 => Unknown,
            3 => InvalidArgument,
            4 => DeadlineExceeded,
            5 => NotFound,
            6 => AlreadyExists,
            7 => PermissionDenied,
            8 => ResourceExhausted,
            9 => FailedPrecondition,
            10 => Aborted,
            11 => OutOfRange,
            12 => Unimplemented,
            13 => Internal,
            14 => Unavailable,
            15 => DataLoss,
            16 => Unauthenticated,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Code::Ok)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// All error conditions produced by the call layer.
///
/// This is the one error currency that crosses the public API boundary:
/// protocol violations, transport failures, remote statuses, deadlines,
/// cancellation and resource limits are all represented as variants here
/// rather than as distinct exception types or panics.
#[derive(Debug, Clone)]
pub enum RpcError {
    /// A status reported by the peer, or synthesized locally to represent
    /// a local failure (protocol violation, deadline, cancellation, ...).
    Status {
        code: Code,
        message: String,
        trailers: Metadata,
    },

    /// An illegal operation ordering was attempted locally (section 4.4).
    /// Never sent to the peer; surfaces to the caller as `Code::Internal`.
    ProtocolViolation(String),

    /// The transport reported a connection loss or stream reset.
    Transport(String),

    /// A decompression or message-size bound would have been exceeded.
    ResourceExceeded(String),

    /// The call's send queue was full and the caller must not enqueue.
    Blocked,
}

impl RpcError {
    pub fn status(code: Code, message: impl Into<String>) -> RpcError {
        RpcError::Status {
            code,
            message: message.into(),
            trailers: Metadata::new(),
        }
    }

    pub fn status_with_trailers(
        code: Code,
        message: impl Into<String>,
        trailers: Metadata,
    ) -> RpcError {
        RpcError::Status {
            code,
            message: message.into(),
            trailers,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> RpcError {
        RpcError::status(Code::Cancelled, message)
    }

    pub fn deadline_exceeded() -> RpcError {
        RpcError::status(Code::DeadlineExceeded, "deadline exceeded")
    }

    pub fn unimplemented(message: impl Into<String>) -> RpcError {
        RpcError::status(Code::Unimplemented, message)
    }

    /// The status code this error should be reported to the caller as.
    /// Protocol violations, transport errors, and resource limits all map
    /// to a fixed code per section 7's error handling design.
    pub fn code(&self) -> Code {
        match self {
            RpcError::Status { code, .. } => *code,
            RpcError::ProtocolViolation(_) => Code::Internal,
            RpcError::Transport(_) => Code::Unavailable,
            RpcError::ResourceExceeded(_) => Code::ResourceExhausted,
            RpcError::Blocked => Code::ResourceExhausted,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RpcError::Status { message, .. } => message,
            RpcError::ProtocolViolation(msg) => msg,
            RpcError::Transport(msg) => msg,
            RpcError::ResourceExceeded(msg) => msg,
            RpcError::Blocked => "send queue is full",
        }
    }

    pub fn trailers(&self) -> Option<&Metadata> {
        match self {
            RpcError::Status { trailers, .. } => Some(trailers),
            _ => None,
        }
    }

    /// Convert into `(code, message, trailers)`, synthesizing empty
    /// trailers for locally-generated errors.
    pub fn into_status(self) -> (Code, String, Metadata) {
        match self {
            RpcError::Status {
                code,
                message,
                trailers,
            } => (code, message, trailers),
            other => {
                let code = other.code();
                let message = other.message().to_string();
                (code, message, Metadata::new())
            }
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Status { code, message, .. } => write!(f, "{code}: {message}"),
            RpcError::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            RpcError::Transport(msg) => write!(f, "transport error: {msg}"),
            RpcError::ResourceExceeded(msg) => write!(f, "resource exhausted: {msg}"),
            RpcError::Blocked => write!(f, "send queue is full"),
        }
    }
}

impl std::error::Error for RpcError {}

/// Convenience type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
