use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::support::{WireError, WireResult};
use hashbrown::HashMap;
use indexmap::IndexMap;
use serde_json::Value as Json;

/// Reserved wire tags. Custom registrations must stay clear of these.
pub const TAG_JSON: u32 = 0;
pub const TAG_BYTES: u32 = 1;
pub const TAG_ARRAY: u32 = 2;
pub const TAG_ABSENT: u32 = 3;
pub const TAG_RECORD: u32 = 4;

/// A dynamically typed value transportable on the wire.
///
/// `Absent` is the distinguished "no value", distinct from `Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Absent,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Record(IndexMap<String, Value>),
}

pub type Predicate = Box<dyn Fn(&Value) -> bool>;
pub type EncodeFn = Box<dyn Fn(&ValueCodec, &mut WriteBuffer, &Value) -> WireResult<()>>;
pub type DecodeFn = Box<dyn Fn(&ValueCodec, &mut ReadBuffer<'_>) -> WireResult<Value>>;

struct Encoder {
    tag: u32,
    accepts: Predicate,
    write: EncodeFn,
}

/// Tag-dispatched serializer for `Value`.
///
/// Encoders are consulted in reverse registration order, so later
/// registrations take precedence and the JSON encoder registered first acts
/// as the universal fallback. Composite encoders recurse through the codec
/// they were handed, so custom tags nest inside arrays and records for free.
pub struct ValueCodec {
    encoders: Vec<Encoder>,
    decoders: HashMap<u32, DecodeFn>,
}

impl ValueCodec {
    pub fn new() -> ValueCodec {
        let mut codec = ValueCodec {
            encoders: Vec::new(),
            decoders: HashMap::new(),
        };

        codec.register(
            TAG_JSON,
            Box::new(|_| true),
            Box::new(write_json),
            Box::new(read_json),
        );
        codec.register(
            TAG_BYTES,
            Box::new(|value| matches!(value, Value::Bytes(_))),
            Box::new(write_bytes),
            Box::new(read_bytes),
        );
        codec.register(
            TAG_ARRAY,
            Box::new(|value| matches!(value, Value::Array(_))),
            Box::new(write_array),
            Box::new(read_array),
        );
        codec.register(
            TAG_ABSENT,
            Box::new(|value| matches!(value, Value::Absent)),
            Box::new(write_absent),
            Box::new(read_absent),
        );
        codec.register(
            TAG_RECORD,
            Box::new(|value| matches!(value, Value::Record(_))),
            Box::new(write_record),
            Box::new(read_record),
        );

        codec
    }

    /// Register a custom tag trio. Panics if the tag is already taken.
    pub fn register(&mut self, tag: u32, accepts: Predicate, write: EncodeFn, read: DecodeFn) {
        if self.decoders.contains_key(&tag) {
            panic!("Attempted to register duplicate tag {}", tag);
        }

        self.encoders.push(Encoder { tag, accepts, write });
        self.decoders.insert(tag, read);
    }

    /// Encode one value: the last registered encoder claiming it wins.
    pub fn encode(&self, buffer: &mut WriteBuffer, value: &Value) -> WireResult<()> {
        let encoder = self
            .encoders
            .iter()
            .rev()
            .find(|encoder| (encoder.accepts)(value))
            .expect("The JSON fallback claims every value");

        buffer.write_int(encoder.tag);
        (encoder.write)(self, buffer, value)
    }

    /// Decode one tagged value.
    pub fn decode(&self, buffer: &mut ReadBuffer<'_>) -> WireResult<Value> {
        let tag = buffer.read_int()?;

        let decoder = self
            .decoders
            .get(&tag)
            .ok_or(WireError::UnknownTag(tag))?;

        decoder(self, buffer)
    }
}

fn write_json(_: &ValueCodec, buffer: &mut WriteBuffer, value: &Value) -> WireResult<()> {
    let text = serde_json::to_string(&to_json(value)?)?;

    buffer.write_string(&text);
    Ok(())
}

fn read_json(_: &ValueCodec, buffer: &mut ReadBuffer<'_>) -> WireResult<Value> {
    let text = buffer.read_string()?;

    Ok(from_json(serde_json::from_str(&text)?))
}

fn write_bytes(_: &ValueCodec, buffer: &mut WriteBuffer, value: &Value) -> WireResult<()> {
    match value {
        Value::Bytes(raw) => {
            buffer.write_bytes(raw);
            Ok(())
        }
        _ => unreachable!("Bytes encoder accepts byte arrays only"),
    }
}

fn read_bytes(_: &ValueCodec, buffer: &mut ReadBuffer<'_>) -> WireResult<Value> {
    Ok(Value::Bytes(buffer.read_bytes()?))
}

fn write_array(codec: &ValueCodec, buffer: &mut WriteBuffer, value: &Value) -> WireResult<()> {
    match value {
        Value::Array(items) => {
            buffer.write_int(items.len() as u32);

            for item in items {
                codec.encode(buffer, item)?;
            }

            Ok(())
        }
        _ => unreachable!("Array encoder accepts arrays only"),
    }
}

fn read_array(codec: &ValueCodec, buffer: &mut ReadBuffer<'_>) -> WireResult<Value> {
    let count = buffer.read_int()?;
    let mut items = Vec::new();

    for _ in 0..count {
        items.push(codec.decode(buffer)?);
    }

    Ok(Value::Array(items))
}

fn write_absent(_: &ValueCodec, _: &mut WriteBuffer, _: &Value) -> WireResult<()> {
    Ok(())
}

fn read_absent(_: &ValueCodec, _: &mut ReadBuffer<'_>) -> WireResult<Value> {
    Ok(Value::Absent)
}

fn write_record(codec: &ValueCodec, buffer: &mut WriteBuffer, value: &Value) -> WireResult<()> {
    match value {
        Value::Record(fields) => {
            buffer.write_int(fields.len() as u32);

            for (key, field) in fields {
                buffer.write_string(key);
                codec.encode(buffer, field)?;
            }

            Ok(())
        }
        _ => unreachable!("Record encoder accepts records only"),
    }
}

fn read_record(codec: &ValueCodec, buffer: &mut ReadBuffer<'_>) -> WireResult<Value> {
    let count = buffer.read_int()?;
    let mut fields = IndexMap::new();

    for _ in 0..count {
        let key = buffer.read_string()?;
        let field = codec.decode(buffer)?;
        fields.insert(key, field);
    }

    Ok(Value::Record(fields))
}

/// Convert a value into its JSON form. Byte arrays have none and are
/// rejected rather than silently mangled; absent collapses to `null`.
pub fn to_json(value: &Value) -> WireResult<Json> {
    Ok(match value {
        Value::Absent | Value::Null => Json::Null,
        Value::Bool(flag) => Json::Bool(*flag),
        // Non-finite numbers have no JSON form and collapse to null.
        Value::Number(number) => serde_json::Number::from_f64(*number)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::String(text) => Json::String(text.clone()),
        Value::Bytes(_) => return Err(WireError::Unrepresentable("byte array")),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect::<WireResult<_>>()?),
        Value::Record(fields) => {
            let mut map = serde_json::Map::new();

            for (key, field) in fields {
                map.insert(key.clone(), to_json(field)?);
            }

            Json::Object(map)
        }
    })
}

/// Convert parsed JSON into a value.
pub fn from_json(json: Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(flag) => Value::Bool(flag),
        Json::Number(number) => Value::Number(number.as_f64().unwrap_or(std::f64::NAN)),
        Json::String(text) => Value::String(text),
        Json::Array(items) => Value::Array(items.into_iter().map(from_json).collect()),
        Json::Object(map) => {
            let mut fields = IndexMap::new();

            for (key, field) in map {
                fields.insert(key, from_json(field));
            }

            Value::Record(fields)
        }
    }
}
