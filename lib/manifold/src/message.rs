use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::support::{WireError, WireResult};
use crate::value::{Value, ValueCodec};
use filament::CallId;
use indexmap::IndexMap;

/// Record field marking a transported value as a serialized error.
pub const ERROR_MARKER: &str = "$isError";

/// Leading byte of every RPC frame.
#[derive(Debug, Eq, PartialEq)]
pub enum MessageKind {
    Request = 1,
    Notification = 2,
    Reply = 3,
    ReplyError = 4,
    Cancel = 5,
}

impl From<MessageKind> for u8 {
    #[inline]
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

/// A decoded RPC frame: `kind | call id | body`.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        id: CallId,
        method: String,
        args: Vec<Value>,
    },
    Notification {
        id: CallId,
        method: String,
        args: Vec<Value>,
    },
    Reply {
        id: CallId,
        result: Value,
    },
    ReplyError {
        id: CallId,
        error: Fault,
    },
    Cancel {
        id: CallId,
    },
}

/// Error payload carried by a `ReplyError`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// A serialized error rehydrated from its marker record.
    Remote(RemoteError),
    /// Any other transported value.
    Opaque(Value),
}

/// Structured error raised by the remote handler.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: String,
}

impl RpcMessage {
    #[inline]
    pub fn kind(&self) -> MessageKind {
        match self {
            RpcMessage::Request { .. } => MessageKind::Request,
            RpcMessage::Notification { .. } => MessageKind::Notification,
            RpcMessage::Reply { .. } => MessageKind::Reply,
            RpcMessage::ReplyError { .. } => MessageKind::ReplyError,
            RpcMessage::Cancel { .. } => MessageKind::Cancel,
        }
    }

    #[inline]
    pub fn id(&self) -> CallId {
        match self {
            RpcMessage::Request { id, .. }
            | RpcMessage::Notification { id, .. }
            | RpcMessage::Reply { id, .. }
            | RpcMessage::ReplyError { id, .. }
            | RpcMessage::Cancel { id } => *id,
        }
    }

    /// Write the frame into the supplied buffer.
    pub fn write(&self, codec: &ValueCodec, buffer: &mut WriteBuffer) -> WireResult<()> {
        buffer.write_byte(self.kind().into()).write_int(self.id());

        match self {
            RpcMessage::Request { method, args, .. }
            | RpcMessage::Notification { method, args, .. } => {
                buffer.write_string(method);
                buffer.write_int(args.len() as u32);

                for arg in args {
                    codec.encode(buffer, arg)?;
                }

                Ok(())
            }
            RpcMessage::Reply { result, .. } => codec.encode(buffer, result),
            RpcMessage::ReplyError { error, .. } => codec.encode(buffer, &error.to_value()),
            RpcMessage::Cancel { .. } => Ok(()),
        }
    }

    /// Parse one frame. Unknown kinds and truncated bodies surface as errors.
    pub fn read(codec: &ValueCodec, buffer: &mut ReadBuffer<'_>) -> WireResult<RpcMessage> {
        let kind = buffer.read_byte()?;
        let id = buffer.read_int()?;

        Ok(match kind {
            1 => {
                let method = buffer.read_string()?;
                let args = read_args(codec, buffer)?;
                RpcMessage::Request { id, method, args }
            }
            2 => {
                let method = buffer.read_string()?;
                let args = read_args(codec, buffer)?;
                RpcMessage::Notification { id, method, args }
            }
            3 => RpcMessage::Reply {
                id,
                result: codec.decode(buffer)?,
            },
            4 => RpcMessage::ReplyError {
                id,
                error: Fault::from_value(codec.decode(buffer)?),
            },
            5 => RpcMessage::Cancel { id },
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

/// Argument lists normalize JSON `null` to the absent value, so peers that
/// distinguish the two agree on which arguments were supplied.
fn read_args(codec: &ValueCodec, buffer: &mut ReadBuffer<'_>) -> WireResult<Vec<Value>> {
    let count = buffer.read_int()?;
    let mut args = Vec::new();

    for _ in 0..count {
        args.push(match codec.decode(buffer)? {
            Value::Null => Value::Absent,
            value => value,
        });
    }

    Ok(args)
}

impl Fault {
    fn to_value(&self) -> Value {
        match self {
            Fault::Remote(error) => error.to_value(),
            Fault::Opaque(value) => value.clone(),
        }
    }

    fn from_value(value: Value) -> Fault {
        match RemoteError::from_value(&value) {
            Some(error) => Fault::Remote(error),
            None => Fault::Opaque(value),
        }
    }
}

impl RemoteError {
    fn to_value(&self) -> Value {
        let mut fields = IndexMap::new();

        fields.insert(ERROR_MARKER.to_string(), Value::Bool(true));
        fields.insert("name".to_string(), Value::String(self.name.clone()));
        fields.insert("message".to_string(), Value::String(self.message.clone()));
        fields.insert("stack".to_string(), Value::String(self.stack.clone()));

        Value::Record(fields)
    }

    fn from_value(value: &Value) -> Option<RemoteError> {
        let fields = match value {
            Value::Record(fields) => fields,
            _ => return None,
        };

        match fields.get(ERROR_MARKER) {
            Some(Value::Bool(true)) => (),
            _ => return None,
        }

        let text = |key: &str| match fields.get(key) {
            Some(Value::String(text)) => Some(text.clone()),
            _ => None,
        };

        Some(RemoteError {
            name: text("name")?,
            message: text("message")?,
            stack: text("stack")?,
        })
    }
}
