//! Field-keyed packet streams.
//!
//! Packets serialize themselves through [`PacketWriter`] and read themselves
//! back through [`PacketReader`]. Every call names the field it touches. The
//! binary codec ignores the names and relies purely on call order; the JSON
//! codec stores fields under their names and looks them up by name, so the
//! name is authoritative there. A packet's `write` and `read` must visit the
//! same fields in the same order for the binary codec to round-trip.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Sink for named packet fields.
pub trait PacketWriter {
    fn write_u8(&mut self, name: &str, value: u8);
    fn write_u16(&mut self, name: &str, value: u16);
    fn write_u32(&mut self, name: &str, value: u32);
    fn write_u64(&mut self, name: &str, value: u64);
    fn write_i32(&mut self, name: &str, value: i32);
    fn write_f32(&mut self, name: &str, value: f32);
    fn write_bool(&mut self, name: &str, value: bool);
    fn write_bytes(&mut self, name: &str, value: &[u8]);
    fn write_str(&mut self, name: &str, value: &str);
}

/// Source of named packet fields.
pub trait PacketReader {
    fn read_u8(&mut self, name: &str) -> Result<u8, ProtocolError>;
    fn read_u16(&mut self, name: &str) -> Result<u16, ProtocolError>;
    fn read_u32(&mut self, name: &str) -> Result<u32, ProtocolError>;
    fn read_u64(&mut self, name: &str) -> Result<u64, ProtocolError>;
    fn read_i32(&mut self, name: &str) -> Result<i32, ProtocolError>;
    fn read_f32(&mut self, name: &str) -> Result<f32, ProtocolError>;
    fn read_bool(&mut self, name: &str) -> Result<bool, ProtocolError>;
    fn read_bytes(&mut self, name: &str) -> Result<Vec<u8>, ProtocolError>;
    fn read_str(&mut self, name: &str) -> Result<String, ProtocolError>;
}

// ---------------------------------------------------------------------------
// WireFormat
// ---------------------------------------------------------------------------

/// Which codec a network interface uses for frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Compact little-endian encoding; field names are advisory.
    #[default]
    Binary,
    /// JSON object per frame; field names are authoritative.
    Json,
}

impl WireFormat {
    /// A fresh writer for this format.
    pub fn writer(self) -> FrameWriter {
        match self {
            WireFormat::Binary => FrameWriter::Binary(BinaryWriter::new()),
            WireFormat::Json => FrameWriter::Json(JsonWriter::new()),
        }
    }

    /// A reader over `bytes` for this format.
    pub fn reader(self, bytes: &[u8]) -> Result<FrameReader<'_>, ProtocolError> {
        match self {
            WireFormat::Binary => Ok(FrameReader::Binary(BinaryReader::new(bytes))),
            WireFormat::Json => Ok(FrameReader::Json(JsonReader::from_slice(bytes)?)),
        }
    }
}

/// Writer for either wire format.
pub enum FrameWriter {
    Binary(BinaryWriter),
    Json(JsonWriter),
}

impl FrameWriter {
    /// Borrow as a trait object for packet code.
    pub fn as_dyn(&mut self) -> &mut dyn PacketWriter {
        match self {
            FrameWriter::Binary(w) => w,
            FrameWriter::Json(w) => w,
        }
    }

    /// Finish the frame.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FrameWriter::Binary(w) => w.into_bytes(),
            FrameWriter::Json(w) => w.into_bytes(),
        }
    }
}

/// Reader for either wire format.
pub enum FrameReader<'a> {
    Binary(BinaryReader<'a>),
    Json(JsonReader),
}

impl FrameReader<'_> {
    /// Borrow as a trait object for packet code.
    pub fn as_dyn(&mut self) -> &mut dyn PacketReader {
        match self {
            FrameReader::Binary(r) => r,
            FrameReader::Json(r) => r,
        }
    }
}

// ---------------------------------------------------------------------------
// Binary codec
// ---------------------------------------------------------------------------

/// Little-endian writer. Byte strings and text are prefixed by a `u32` length.
#[derive(Debug, Default)]
pub struct BinaryWriter {
    buffer: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl PacketWriter for BinaryWriter {
    fn write_u8(&mut self, _name: &str, value: u8) {
        self.buffer.push(value);
    }

    fn write_u16(&mut self, _name: &str, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, _name: &str, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, _name: &str, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn write_i32(&mut self, _name: &str, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn write_f32(&mut self, _name: &str, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn write_bool(&mut self, _name: &str, value: bool) {
        self.buffer.push(u8::from(value));
    }

    fn write_bytes(&mut self, name: &str, value: &[u8]) {
        let len = u32::try_from(value.len()).expect("byte field longer than u32::MAX");
        self.write_u32(name, len);
        self.buffer.extend_from_slice(value);
    }

    fn write_str(&mut self, name: &str, value: &str) {
        self.write_bytes(name, value.as_bytes());
    }
}

/// Little-endian reader over a borrowed frame.
#[derive(Debug)]
pub struct BinaryReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < needed {
            return Err(ProtocolError::UnexpectedEnd {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.cursor..self.cursor + needed];
        self.cursor += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

impl PacketReader for BinaryReader<'_> {
    fn read_u8(&mut self, _name: &str) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self, _name: &str) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    fn read_u32(&mut self, _name: &str) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn read_u64(&mut self, _name: &str) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    fn read_i32(&mut self, _name: &str) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    fn read_f32(&mut self, _name: &str) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    fn read_bool(&mut self, name: &str) -> Result<bool, ProtocolError> {
        match self.read_u8(name)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidValue {
                name: name.to_owned(),
                details: format!("bool byte {other}"),
            }),
        }
    }

    fn read_bytes(&mut self, name: &str) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_u32(name)? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_str(&mut self, name: &str) -> Result<String, ProtocolError> {
        let bytes = self.read_bytes(name)?;
        String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8 {
            name: name.to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// JSON codec
// ---------------------------------------------------------------------------

/// Writes one JSON object per frame, keyed by field name.
#[derive(Debug, Default)]
pub struct JsonWriter {
    fields: Map<String, Value>,
}

impl JsonWriter {
    pub fn new() -> Self {
        Self { fields: Map::new() }
    }

    /// The object built so far.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_bytes(self) -> Vec<u8> {
        serde_json::to_vec(&Value::Object(self.fields))
            .expect("a JSON object of plain values always serializes")
    }

    fn put(&mut self, name: &str, value: Value) {
        debug_assert!(
            !self.fields.contains_key(name),
            "field '{name}' written twice in one frame"
        );
        self.fields.insert(name.to_owned(), value);
    }
}

impl PacketWriter for JsonWriter {
    fn write_u8(&mut self, name: &str, value: u8) {
        self.put(name, Value::from(value));
    }

    fn write_u16(&mut self, name: &str, value: u16) {
        self.put(name, Value::from(value));
    }

    fn write_u32(&mut self, name: &str, value: u32) {
        self.put(name, Value::from(value));
    }

    fn write_u64(&mut self, name: &str, value: u64) {
        self.put(name, Value::from(value));
    }

    fn write_i32(&mut self, name: &str, value: i32) {
        self.put(name, Value::from(value));
    }

    fn write_f32(&mut self, name: &str, value: f32) {
        self.put(name, Value::from(f64::from(value)));
    }

    fn write_bool(&mut self, name: &str, value: bool) {
        self.put(name, Value::Bool(value));
    }

    fn write_bytes(&mut self, name: &str, value: &[u8]) {
        self.put(name, Value::from(value.to_vec()));
    }

    fn write_str(&mut self, name: &str, value: &str) {
        self.put(name, Value::String(value.to_owned()));
    }
}

/// Reads fields back out of a JSON object by name.
#[derive(Debug)]
pub struct JsonReader {
    fields: Map<String, Value>,
}

impl JsonReader {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(fields)) => Ok(Self { fields }),
            Ok(_) => Err(ProtocolError::MalformedFrame(
                "JSON frame is not an object".to_owned(),
            )),
            Err(e) => Err(ProtocolError::MalformedFrame(e.to_string())),
        }
    }

    fn field(&self, name: &str) -> Result<&Value, ProtocolError> {
        self.fields
            .get(name)
            .ok_or_else(|| ProtocolError::MissingField {
                name: name.to_owned(),
            })
    }

    fn unsigned(&self, name: &str, max: u64) -> Result<u64, ProtocolError> {
        let value = self
            .field(name)?
            .as_u64()
            .ok_or_else(|| type_error(name, "unsigned integer"))?;
        if value > max {
            return Err(ProtocolError::InvalidValue {
                name: name.to_owned(),
                details: format!("{value} exceeds {max}"),
            });
        }
        Ok(value)
    }
}

fn type_error(name: &str, expected: &'static str) -> ProtocolError {
    ProtocolError::FieldType {
        name: name.to_owned(),
        expected,
    }
}

impl PacketReader for JsonReader {
    fn read_u8(&mut self, name: &str) -> Result<u8, ProtocolError> {
        Ok(self.unsigned(name, u64::from(u8::MAX))? as u8)
    }

    fn read_u16(&mut self, name: &str) -> Result<u16, ProtocolError> {
        Ok(self.unsigned(name, u64::from(u16::MAX))? as u16)
    }

    fn read_u32(&mut self, name: &str) -> Result<u32, ProtocolError> {
        Ok(self.unsigned(name, u64::from(u32::MAX))? as u32)
    }

    fn read_u64(&mut self, name: &str) -> Result<u64, ProtocolError> {
        self.unsigned(name, u64::MAX)
    }

    fn read_i32(&mut self, name: &str) -> Result<i32, ProtocolError> {
        let value = self
            .field(name)?
            .as_i64()
            .ok_or_else(|| type_error(name, "signed integer"))?;
        i32::try_from(value).map_err(|_| ProtocolError::InvalidValue {
            name: name.to_owned(),
            details: format!("{value} out of i32 range"),
        })
    }

    fn read_f32(&mut self, name: &str) -> Result<f32, ProtocolError> {
        self.field(name)?
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| type_error(name, "number"))
    }

    fn read_bool(&mut self, name: &str) -> Result<bool, ProtocolError> {
        self.field(name)?
            .as_bool()
            .ok_or_else(|| type_error(name, "bool"))
    }

    fn read_bytes(&mut self, name: &str) -> Result<Vec<u8>, ProtocolError> {
        let array = self
            .field(name)?
            .as_array()
            .ok_or_else(|| type_error(name, "byte array"))?;
        array
            .iter()
            .map(|v| {
                v.as_u64()
                    .filter(|b| *b <= u64::from(u8::MAX))
                    .map(|b| b as u8)
                    .ok_or_else(|| type_error(name, "byte array"))
            })
            .collect()
    }

    fn read_str(&mut self, name: &str) -> Result<String, ProtocolError> {
        self.field(name)?
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| type_error(name, "string"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
