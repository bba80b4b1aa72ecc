use std::io;

pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while encoding or decoding framed buffers and typed values.
#[derive(Debug, Clone, PartialEq)]
pub enum WireError {
    /// The buffer ran out of bytes mid-read.
    Truncated,
    /// A varint did not terminate within 32 bits.
    Overflow,
    /// A string field did not hold valid UTF-8.
    Utf8,
    /// No decoder is registered for the tag.
    UnknownTag(u32),
    /// The frame started with an opcode outside the protocol.
    UnknownOpcode(u8),
    /// The RPC frame started with a message type outside the protocol.
    UnknownMessageType(u8),
    /// The JSON fallback cannot carry the value.
    Unrepresentable(&'static str),
    /// JSON serialization or parsing failed.
    Json(String),
}

impl From<serde_json::Error> for WireError {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        WireError::Json(err.to_string())
    }
}

pub type MuxResult<T> = Result<T, MuxError>;

/// Errors raised by the channel multiplexer and the underlying pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum MuxError {
    /// A frame failed to decode.
    Wire(WireError),
    /// AckOpen arrived for an id with no pending open.
    StrayAck(String),
    /// An id was opened while already pending or open.
    DuplicateChannel(String),
    /// The underlying pipe failed.
    Io(io::ErrorKind),
}

impl From<WireError> for MuxError {
    #[inline]
    fn from(err: WireError) -> Self {
        MuxError::Wire(err)
    }
}

impl From<io::Error> for MuxError {
    #[inline]
    fn from(err: io::Error) -> Self {
        MuxError::Io(err.kind())
    }
}
