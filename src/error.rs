//! Status codes and error types.

use core::fmt;

/// RPC status codes shared by both ends of the wire.
///
/// The numeric values follow the widespread gRPC numbering so that
/// independently written peers agree on them without a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    /// Success (not an error).
    Ok = 0,
    /// Call was cancelled by the client.
    Cancelled = 1,
    /// Failure of unknown origin.
    Unknown = 2,
    /// Caller supplied invalid arguments.
    InvalidArgument = 3,
    /// Deadline passed before completion.
    DeadlineExceeded = 4,
    /// Requested entity not found.
    NotFound = 5,
    /// Entity already exists.
    AlreadyExists = 6,
    /// Caller lacks permission.
    PermissionDenied = 7,
    /// Out of resources (memory, slots, quota).
    ResourceExhausted = 8,
    /// System not in the required state.
    FailedPrecondition = 9,
    /// Operation aborted.
    Aborted = 10,
    /// Value out of valid range.
    OutOfRange = 11,
    /// Method not implemented.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// Service temporarily unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// Caller is not authenticated.
    Unauthenticated = 16,
}

impl Status {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::Unknown),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::DeadlineExceeded),
            5 => Some(Self::NotFound),
            6 => Some(Self::AlreadyExists),
            7 => Some(Self::PermissionDenied),
            8 => Some(Self::ResourceExhausted),
            9 => Some(Self::FailedPrecondition),
            10 => Some(Self::Aborted),
            11 => Some(Self::OutOfRange),
            12 => Some(Self::Unimplemented),
            13 => Some(Self::Internal),
            14 => Some(Self::Unavailable),
            15 => Some(Self::DataLoss),
            16 => Some(Self::Unauthenticated),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unknown => write!(f, "unknown"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Aborted => write!(f, "aborted"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::DataLoss => write!(f, "data loss"),
            Self::Unauthenticated => write!(f, "unauthenticated"),
        }
    }
}

/// Errors surfaced by a channel's output function.
#[derive(Debug)]
pub enum ChannelError {
    /// The underlying transport is closed.
    Closed,
    Io(std::io::Error),
    Other(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Wire envelope decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    UnknownPacketType(u8),
    UnknownStatus(u32),
    UnknownFlags(u8),
    TrailingBytes(usize),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of input"),
            Self::UnknownPacketType(value) => write!(f, "unknown packet type {value}"),
            Self::UnknownStatus(value) => write!(f, "unknown status code {value}"),
            Self::UnknownFlags(value) => write!(f, "unknown flag bits {value:#010b}"),
            Self::TrailingBytes(count) => write!(f, "{count} trailing bytes after packet"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Application payload codec errors.
#[derive(Debug)]
pub enum CodecError {
    /// The message's concrete type does not match the codec.
    WrongMessageType { expected: &'static str },
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongMessageType { expected } => {
                write!(f, "message is not a {expected}")
            }
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
            Self::Decode(msg) => write!(f, "decode failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors building channel/service tables from descriptor input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// A method references a type path with no registered codec.
    UnknownType { method: String, type_path: String },
    DuplicateMethod { service: String, method: String },
    DuplicateService { service: String },
    DuplicateChannel { channel_id: u32 },
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType { method, type_path } => {
                write!(f, "method {method}: no codec registered for {type_path}")
            }
            Self::DuplicateMethod { service, method } => {
                write!(f, "service {service} defines method {method} twice")
            }
            Self::DuplicateService { service } => {
                write!(f, "service {service} registered twice")
            }
            Self::DuplicateChannel { channel_id } => {
                write!(f, "channel {channel_id} registered twice")
            }
        }
    }
}

impl std::error::Error for DescriptorError {}

/// Call-level errors surfaced to whoever is consuming a call.
#[derive(Debug)]
pub enum CallError {
    /// The call ended with an error status: a server-reported failure,
    /// a cancellation, or eviction by a newer call under the identity.
    Status(Status),
    /// A read attempt outlived its deadline. The awaited item, if one
    /// eventually arrives, stays queued for the next attempt.
    Timeout { timeout_ms: u64 },
    /// A user listener panicked earlier; the panic was deferred and is
    /// re-raised at this blocking read.
    Callback(String),
    /// Encoding or decoding an application payload failed.
    Codec(CodecError),
    /// The channel output rejected an outgoing packet.
    Channel(ChannelError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "call failed: {status}"),
            Self::Timeout { timeout_ms } => {
                write!(f, "timed out waiting {timeout_ms} ms for a response")
            }
            Self::Callback(msg) => write!(f, "deferred listener failure: {msg}"),
            Self::Codec(e) => write!(f, "payload codec error: {e}"),
            Self::Channel(e) => write!(f, "channel error: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Channel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for CallError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<ChannelError> for CallError {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}
