//! `EVT_VARIANT` arrays: the typed value layout the event log API renders records into.
//!
//! A rendered buffer starts with `count` fixed 16 byte slots:
//!
//! ```text
//! 0      8        12       16
//! | value | count  | type   |
//! ```
//!
//! Scalars live inline in `value`. Strings, GUIDs, SIDs, binary blobs and arrays store a pointer
//! in `value`, which in a render buffer is an offset relative to the start of the buffer. Every
//! pointer is validated against the buffer before it is dereferenced.

use std::fmt;
use std::hash::{BuildHasher, Hasher};

use byteorder::{ByteOrder, LittleEndian};
use encoding::all::WINDOWS_1252;
use encoding::{DecoderTrap, EncoderTrap, Encoding};
use jiff::Timestamp;

use crate::err::{DeserializationError, DeserializationResult};
use crate::guid::Guid;
use crate::sid::Sid;
use crate::utils::ByteCursor;
use crate::utils::time::{
    filetime_to_timestamp, read_systime, timestamp_to_filetime, timestamp_to_systime,
};
use crate::utils::utf16::encode_utf16le_z;

pub const VARIANT_SIZE: usize = 16;
pub const VARIANT_TYPE_MASK: u32 = 0x7f;
pub const VARIANT_TYPE_ARRAY: u32 = 128;

/// A hash over the shape (count and type tags) of a rendered value array.
pub type Fingerprint = u64;

// Fixed seeds keep fingerprints stable for the life of the process.
const FINGERPRINT_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantType {
    Null = 0,
    String = 1,
    AnsiString = 2,
    SByte = 3,
    Byte = 4,
    Int16 = 5,
    UInt16 = 6,
    Int32 = 7,
    UInt32 = 8,
    Int64 = 9,
    UInt64 = 10,
    Single = 11,
    Double = 12,
    Boolean = 13,
    Binary = 14,
    Guid = 15,
    SizeT = 16,
    FileTime = 17,
    SysTime = 18,
    Sid = 19,
    HexInt32 = 20,
    HexInt64 = 21,
    EvtHandle = 32,
    EvtXml = 35,
}

impl VariantType {
    pub fn from_u32(value: u32) -> Option<VariantType> {
        let t = match value {
            0 => VariantType::Null,
            1 => VariantType::String,
            2 => VariantType::AnsiString,
            3 => VariantType::SByte,
            4 => VariantType::Byte,
            5 => VariantType::Int16,
            6 => VariantType::UInt16,
            7 => VariantType::Int32,
            8 => VariantType::UInt32,
            9 => VariantType::Int64,
            10 => VariantType::UInt64,
            11 => VariantType::Single,
            12 => VariantType::Double,
            13 => VariantType::Boolean,
            14 => VariantType::Binary,
            15 => VariantType::Guid,
            16 => VariantType::SizeT,
            17 => VariantType::FileTime,
            18 => VariantType::SysTime,
            19 => VariantType::Sid,
            20 => VariantType::HexInt32,
            21 => VariantType::HexInt64,
            32 => VariantType::EvtHandle,
            35 => VariantType::EvtXml,
            _ => return None,
        };
        Some(t)
    }

    pub fn name(&self) -> &'static str {
        match self {
            VariantType::Null => "Null",
            VariantType::String => "String",
            VariantType::AnsiString => "AnsiString",
            VariantType::SByte => "SByte",
            VariantType::Byte => "Byte",
            VariantType::Int16 => "Int16",
            VariantType::UInt16 => "UInt16",
            VariantType::Int32 => "Int32",
            VariantType::UInt32 => "UInt32",
            VariantType::Int64 => "Int64",
            VariantType::UInt64 => "UInt64",
            VariantType::Single => "Single",
            VariantType::Double => "Double",
            VariantType::Boolean => "Boolean",
            VariantType::Binary => "Binary",
            VariantType::Guid => "Guid",
            VariantType::SizeT => "SizeT",
            VariantType::FileTime => "FileTime",
            VariantType::SysTime => "SysTime",
            VariantType::Sid => "Sid",
            VariantType::HexInt32 => "HexInt32",
            VariantType::HexInt64 => "HexInt64",
            VariantType::EvtHandle => "EvtHandle",
            VariantType::EvtXml => "EvtXml",
        }
    }

    /// Size of one inline element, for types stored by value.
    fn inline_size(&self) -> Option<usize> {
        match self {
            VariantType::SByte | VariantType::Byte => Some(1),
            VariantType::Int16 | VariantType::UInt16 => Some(2),
            VariantType::Int32
            | VariantType::UInt32
            | VariantType::Single
            | VariantType::Boolean
            | VariantType::HexInt32 => Some(4),
            VariantType::Int64
            | VariantType::UInt64
            | VariantType::Double
            | VariantType::SizeT
            | VariantType::FileTime
            | VariantType::HexInt64
            | VariantType::EvtHandle => Some(8),
            _ => None,
        }
    }
}

/// One decoded `EVT_VARIANT`.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    String(String),
    AnsiString(String),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Single(f32),
    Double(f64),
    Boolean(bool),
    Binary(Vec<u8>),
    Guid(Guid),
    SizeT(u64),
    FileTime(Timestamp),
    SysTime(Timestamp),
    Sid(Sid),
    HexInt32(u32),
    HexInt64(u64),
    EvtHandle(u64),
    EvtXml(String),
    Array(VariantType, Vec<TypedValue>),
}

impl TypedValue {
    pub fn variant_type(&self) -> VariantType {
        match self {
            TypedValue::Null => VariantType::Null,
            TypedValue::String(_) => VariantType::String,
            TypedValue::AnsiString(_) => VariantType::AnsiString,
            TypedValue::SByte(_) => VariantType::SByte,
            TypedValue::Byte(_) => VariantType::Byte,
            TypedValue::Int16(_) => VariantType::Int16,
            TypedValue::UInt16(_) => VariantType::UInt16,
            TypedValue::Int32(_) => VariantType::Int32,
            TypedValue::UInt32(_) => VariantType::UInt32,
            TypedValue::Int64(_) => VariantType::Int64,
            TypedValue::UInt64(_) => VariantType::UInt64,
            TypedValue::Single(_) => VariantType::Single,
            TypedValue::Double(_) => VariantType::Double,
            TypedValue::Boolean(_) => VariantType::Boolean,
            TypedValue::Binary(_) => VariantType::Binary,
            TypedValue::Guid(_) => VariantType::Guid,
            TypedValue::SizeT(_) => VariantType::SizeT,
            TypedValue::FileTime(_) => VariantType::FileTime,
            TypedValue::SysTime(_) => VariantType::SysTime,
            TypedValue::Sid(_) => VariantType::Sid,
            TypedValue::HexInt32(_) => VariantType::HexInt32,
            TypedValue::HexInt64(_) => VariantType::HexInt64,
            TypedValue::EvtHandle(_) => VariantType::EvtHandle,
            TypedValue::EvtXml(_) => VariantType::EvtXml,
            TypedValue::Array(t, _) => *t,
        }
    }

    /// The raw `Type` field this value is rendered with, including the array flag.
    pub fn type_tag(&self) -> u32 {
        match self {
            TypedValue::Array(t, _) => *t as u32 | VARIANT_TYPE_ARRAY,
            other => other.variant_type() as u32,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) | TypedValue::AnsiString(s) | TypedValue::EvtXml(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Null => Ok(()),
            TypedValue::String(s) | TypedValue::AnsiString(s) | TypedValue::EvtXml(s) => {
                f.write_str(s)
            }
            TypedValue::SByte(v) => write!(f, "{v}"),
            TypedValue::Byte(v) => write!(f, "{v}"),
            TypedValue::Int16(v) => write!(f, "{v}"),
            TypedValue::UInt16(v) => write!(f, "{v}"),
            TypedValue::Int32(v) => write!(f, "{v}"),
            TypedValue::UInt32(v) => write!(f, "{v}"),
            TypedValue::Int64(v) => write!(f, "{v}"),
            TypedValue::UInt64(v) | TypedValue::SizeT(v) | TypedValue::EvtHandle(v) => {
                write!(f, "{v}")
            }
            TypedValue::Single(v) => write!(f, "{v}"),
            TypedValue::Double(v) => write!(f, "{v}"),
            TypedValue::Boolean(v) => write!(f, "{v}"),
            TypedValue::Binary(bytes) => {
                for b in bytes {
                    write!(f, "{b:02X}")?;
                }
                Ok(())
            }
            TypedValue::Guid(g) => write!(f, "{g}"),
            TypedValue::FileTime(ts) | TypedValue::SysTime(ts) => write!(f, "{ts}"),
            TypedValue::Sid(sid) => write!(f, "{sid}"),
            TypedValue::HexInt32(v) => write!(f, "0x{v:x}"),
            TypedValue::HexInt64(v) => write!(f, "0x{v:x}"),
            TypedValue::Array(_, items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Which part of a record to render into a variant array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderContext {
    /// The 18 well known system properties, in [`SystemProperty`] order.
    System,
    /// The event's own data (`EventData` or `UserData` values), in template order.
    User,
}

/// Index of each property in a [`RenderContext::System`] array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemProperty {
    ProviderName = 0,
    ProviderGuid,
    EventId,
    Qualifiers,
    Level,
    Task,
    Opcode,
    Keywords,
    TimeCreated,
    EventRecordId,
    ActivityId,
    RelatedActivityId,
    ProcessId,
    ThreadId,
    Channel,
    Computer,
    UserId,
    Version,
}

impl SystemProperty {
    pub const COUNT: usize = 18;

    pub const ALL: [SystemProperty; SystemProperty::COUNT] = [
        SystemProperty::ProviderName,
        SystemProperty::ProviderGuid,
        SystemProperty::EventId,
        SystemProperty::Qualifiers,
        SystemProperty::Level,
        SystemProperty::Task,
        SystemProperty::Opcode,
        SystemProperty::Keywords,
        SystemProperty::TimeCreated,
        SystemProperty::EventRecordId,
        SystemProperty::ActivityId,
        SystemProperty::RelatedActivityId,
        SystemProperty::ProcessId,
        SystemProperty::ThreadId,
        SystemProperty::Channel,
        SystemProperty::Computer,
        SystemProperty::UserId,
        SystemProperty::Version,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SystemProperty::ProviderName => "ProviderName",
            SystemProperty::ProviderGuid => "ProviderGuid",
            SystemProperty::EventId => "EventID",
            SystemProperty::Qualifiers => "Qualifiers",
            SystemProperty::Level => "Level",
            SystemProperty::Task => "Task",
            SystemProperty::Opcode => "Opcode",
            SystemProperty::Keywords => "Keywords",
            SystemProperty::TimeCreated => "TimeCreated",
            SystemProperty::EventRecordId => "EventRecordID",
            SystemProperty::ActivityId => "ActivityID",
            SystemProperty::RelatedActivityId => "RelatedActivityID",
            SystemProperty::ProcessId => "ProcessID",
            SystemProperty::ThreadId => "ThreadID",
            SystemProperty::Channel => "Channel",
            SystemProperty::Computer => "Computer",
            SystemProperty::UserId => "UserID",
            SystemProperty::Version => "Version",
        }
    }
}

/// A bounds checked view over a rendered `EVT_VARIANT` array.
#[derive(Debug, Clone, Copy)]
pub struct VariantArray<'a> {
    buf: &'a [u8],
    count: usize,
}

impl<'a> VariantArray<'a> {
    /// Fails if the buffer cannot hold `count` slots.
    pub fn new(buf: &'a [u8], count: usize) -> DeserializationResult<Self> {
        let need = count
            .checked_mul(VARIANT_SIZE)
            .ok_or(DeserializationError::Truncated {
                what: "variant array",
                offset: 0,
                need: usize::MAX,
                have: buf.len(),
            })?;
        if buf.len() < need {
            return Err(DeserializationError::Truncated {
                what: "variant array",
                offset: 0,
                need,
                have: buf.len(),
            });
        }
        Ok(VariantArray { buf, count })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn slot(&self, index: usize) -> DeserializationResult<ByteCursor<'a>> {
        ByteCursor::at(self.buf, index * VARIANT_SIZE, "variant slot")
    }

    /// The raw `Type` field of slot `index`, including the array flag.
    pub fn type_tag(&self, index: usize) -> u32 {
        let offset = index * VARIANT_SIZE + 12;
        LittleEndian::read_u32(&self.buf[offset..offset + 4])
    }

    pub fn fingerprint(&self) -> Fingerprint {
        if self.count == 0 {
            return 0;
        }

        let [k0, k1, k2, k3] = FINGERPRINT_SEEDS;
        let mut hasher = ahash::RandomState::with_seeds(k0, k1, k2, k3).build_hasher();
        hasher.write_i64(self.count as i64);
        for i in 0..self.count {
            hasher.write_u32(self.type_tag(i));
        }
        hasher.finish()
    }

    /// Decode slot `index`.
    pub fn value(&self, index: usize) -> DeserializationResult<TypedValue> {
        if index >= self.count {
            return Err(DeserializationError::Truncated {
                what: "variant slot",
                offset: (index * VARIANT_SIZE) as u64,
                need: VARIANT_SIZE,
                have: 0,
            });
        }

        let mut slot = self.slot(index)?;
        let at = slot.position();
        let raw = slot.array::<8>("variant value")?;
        let count = slot.u32_named("variant count")?;
        let type_tag = slot.u32_named("variant type")?;

        let base = type_tag & VARIANT_TYPE_MASK;
        let vtype = VariantType::from_u32(base).ok_or(DeserializationError::UnknownVariantType {
            value: type_tag,
            offset: at,
        })?;

        if type_tag & VARIANT_TYPE_ARRAY != 0 {
            let pointer = u64::from_le_bytes(raw);
            if pointer == 0 || count == 0 {
                return Ok(TypedValue::Array(vtype, Vec::new()));
            }
            return self.read_array(vtype, pointer, count as usize, at);
        }

        self.read_scalar(vtype, &raw, count, at)
    }

    /// Decode every slot, keeping per-slot failures separate.
    pub fn values(&self) -> Vec<DeserializationResult<TypedValue>> {
        (0..self.count).map(|i| self.value(i)).collect()
    }

    fn read_scalar(
        &self,
        vtype: VariantType,
        raw: &[u8; 8],
        count: u32,
        at: u64,
    ) -> DeserializationResult<TypedValue> {
        if let Some(size) = vtype.inline_size() {
            return read_inline(vtype, &raw[..size], at);
        }

        let pointer = u64::from_le_bytes(*raw);
        if pointer == 0 && vtype != VariantType::Null {
            return Ok(TypedValue::Null);
        }

        let value = match vtype {
            VariantType::Null => TypedValue::Null,
            VariantType::String => {
                let mut c = ByteCursor::at_pointer(self.buf, pointer, at, "string")?;
                TypedValue::String(c.null_terminated_utf16_string()?)
            }
            VariantType::EvtXml => {
                let mut c = ByteCursor::at_pointer(self.buf, pointer, at, "xml")?;
                TypedValue::EvtXml(c.null_terminated_utf16_string()?)
            }
            VariantType::AnsiString => {
                let mut c = ByteCursor::at_pointer(self.buf, pointer, at, "ansi string")?;
                TypedValue::AnsiString(decode_ansi(c.null_terminated_bytes(), at)?)
            }
            VariantType::Binary => {
                let mut c = ByteCursor::at_pointer(self.buf, pointer, at, "binary")?;
                TypedValue::Binary(c.take_bytes(count as usize, "binary")?.to_vec())
            }
            VariantType::Guid => {
                let mut c = ByteCursor::at_pointer(self.buf, pointer, at, "guid")?;
                let mut bytes = c.take_bytes(16, "guid")?;
                TypedValue::Guid(Guid::from_reader(&mut bytes)?)
            }
            VariantType::SysTime => {
                let mut c = ByteCursor::at_pointer(self.buf, pointer, at, "systime")?;
                TypedValue::SysTime(read_systime(&mut c)?)
            }
            VariantType::Sid => {
                let mut c = ByteCursor::at_pointer(self.buf, pointer, at, "sid")?;
                TypedValue::Sid(Sid::from_validated_bytes(c.sid_bytes()?))
            }
            other => {
                return Err(DeserializationError::UnsupportedVariantType {
                    name: other.name(),
                    offset: at,
                });
            }
        };
        Ok(value)
    }

    fn read_array(
        &self,
        vtype: VariantType,
        pointer: u64,
        count: usize,
        at: u64,
    ) -> DeserializationResult<TypedValue> {
        let mut cursor = ByteCursor::at_pointer(self.buf, pointer, at, "array")?;
        let mut items = Vec::with_capacity(count.min(1024));

        for _ in 0..count {
            let item = if let Some(size) = vtype.inline_size() {
                let bytes = cursor.take_bytes(size, "array element")?;
                read_inline(vtype, bytes, cursor.position())?
            } else {
                match vtype {
                    VariantType::Guid => {
                        let mut bytes = cursor.take_bytes(16, "guid")?;
                        TypedValue::Guid(Guid::from_reader(&mut bytes)?)
                    }
                    VariantType::SysTime => TypedValue::SysTime(read_systime(&mut cursor)?),
                    VariantType::String | VariantType::AnsiString | VariantType::Sid => {
                        // Arrays of variable sized values hold a table of pointers.
                        let element_at = cursor.position();
                        let element = cursor.u64_named("array element pointer")?;
                        let mut c =
                            ByteCursor::at_pointer(self.buf, element, element_at, "array element")?;
                        match vtype {
                            VariantType::String => {
                                TypedValue::String(c.null_terminated_utf16_string()?)
                            }
                            VariantType::AnsiString => TypedValue::AnsiString(decode_ansi(
                                c.null_terminated_bytes(),
                                element_at,
                            )?),
                            _ => TypedValue::Sid(Sid::from_validated_bytes(c.sid_bytes()?)),
                        }
                    }
                    other => {
                        return Err(DeserializationError::UnsupportedVariantType {
                            name: other.name(),
                            offset: at,
                        });
                    }
                }
            };
            items.push(item);
        }

        Ok(TypedValue::Array(vtype, items))
    }
}

fn read_inline(vtype: VariantType, bytes: &[u8], at: u64) -> DeserializationResult<TypedValue> {
    let value = match vtype {
        VariantType::SByte => TypedValue::SByte(bytes[0] as i8),
        VariantType::Byte => TypedValue::Byte(bytes[0]),
        VariantType::Int16 => TypedValue::Int16(LittleEndian::read_i16(bytes)),
        VariantType::UInt16 => TypedValue::UInt16(LittleEndian::read_u16(bytes)),
        VariantType::Int32 => TypedValue::Int32(LittleEndian::read_i32(bytes)),
        VariantType::UInt32 => TypedValue::UInt32(LittleEndian::read_u32(bytes)),
        VariantType::HexInt32 => TypedValue::HexInt32(LittleEndian::read_u32(bytes)),
        VariantType::Boolean => TypedValue::Boolean(LittleEndian::read_u32(bytes) != 0),
        VariantType::Single => TypedValue::Single(LittleEndian::read_f32(bytes)),
        VariantType::Int64 => TypedValue::Int64(LittleEndian::read_i64(bytes)),
        VariantType::UInt64 => TypedValue::UInt64(LittleEndian::read_u64(bytes)),
        VariantType::HexInt64 => TypedValue::HexInt64(LittleEndian::read_u64(bytes)),
        VariantType::SizeT => TypedValue::SizeT(LittleEndian::read_u64(bytes)),
        VariantType::EvtHandle => TypedValue::EvtHandle(LittleEndian::read_u64(bytes)),
        VariantType::Double => TypedValue::Double(LittleEndian::read_f64(bytes)),
        VariantType::FileTime => {
            TypedValue::FileTime(filetime_to_timestamp(LittleEndian::read_u64(bytes))?)
        }
        other => {
            return Err(DeserializationError::UnsupportedVariantType {
                name: other.name(),
                offset: at,
            });
        }
    };
    Ok(value)
}

fn decode_ansi(bytes: &[u8], at: u64) -> DeserializationResult<String> {
    WINDOWS_1252
        .decode(bytes, DecoderTrap::Strict)
        .map_err(|message| DeserializationError::FailedToDecodeAnsiString {
            message: message.into_owned(),
            offset: at,
        })
}

/// Lays out values the way `EvtRender` does: fixed slots first, pointed-to data after.
#[derive(Debug, Default)]
pub struct VariantWriter<'v> {
    values: Vec<&'v TypedValue>,
}

impl<'v> VariantWriter<'v> {
    pub fn new() -> Self {
        VariantWriter { values: Vec::new() }
    }

    pub fn push(&mut self, value: &'v TypedValue) -> &mut Self {
        self.values.push(value);
        self
    }

    /// Write the array into `out` (replacing its contents); returns the property count.
    pub fn finish(&self, out: &mut Vec<u8>) -> usize {
        out.clear();
        out.resize(self.values.len() * VARIANT_SIZE, 0);

        for (i, value) in self.values.iter().enumerate() {
            let slot = i * VARIANT_SIZE;
            let (raw, count) = write_value(value, out);
            out[slot..slot + 8].copy_from_slice(&raw);
            LittleEndian::write_u32(&mut out[slot + 8..slot + 12], count);
            LittleEndian::write_u32(&mut out[slot + 12..slot + 16], value.type_tag());
        }
        self.values.len()
    }
}

fn pointer_to_end(out: &mut Vec<u8>) -> [u8; 8] {
    // Keep pointed-to data 8 byte aligned, like the API does.
    while out.len() % 8 != 0 {
        out.push(0);
    }
    (out.len() as u64).to_le_bytes()
}

fn inline_bytes(value: &TypedValue) -> Option<[u8; 8]> {
    let mut raw = [0u8; 8];
    match *value {
        TypedValue::SByte(v) => raw[0] = v as u8,
        TypedValue::Byte(v) => raw[0] = v,
        TypedValue::Int16(v) => LittleEndian::write_i16(&mut raw, v),
        TypedValue::UInt16(v) => LittleEndian::write_u16(&mut raw, v),
        TypedValue::Int32(v) => LittleEndian::write_i32(&mut raw, v),
        TypedValue::UInt32(v) | TypedValue::HexInt32(v) => LittleEndian::write_u32(&mut raw, v),
        TypedValue::Boolean(v) => LittleEndian::write_u32(&mut raw, u32::from(v)),
        TypedValue::Single(v) => LittleEndian::write_f32(&mut raw, v),
        TypedValue::Int64(v) => LittleEndian::write_i64(&mut raw, v),
        TypedValue::UInt64(v)
        | TypedValue::HexInt64(v)
        | TypedValue::SizeT(v)
        | TypedValue::EvtHandle(v) => LittleEndian::write_u64(&mut raw, v),
        TypedValue::Double(v) => LittleEndian::write_f64(&mut raw, v),
        TypedValue::FileTime(ts) => LittleEndian::write_u64(&mut raw, timestamp_to_filetime(ts)),
        _ => return None,
    }
    Some(raw)
}

fn encode_ansi(s: &str) -> Vec<u8> {
    WINDOWS_1252
        .encode(s, EncoderTrap::Replace)
        .unwrap_or_else(|_| s.bytes().filter(u8::is_ascii).collect())
}

fn write_value(value: &TypedValue, out: &mut Vec<u8>) -> ([u8; 8], u32) {
    if let Some(raw) = inline_bytes(value) {
        return (raw, 0);
    }

    match value {
        TypedValue::Null => ([0; 8], 0),
        TypedValue::String(s) | TypedValue::EvtXml(s) => {
            let ptr = pointer_to_end(out);
            encode_utf16le_z(s, out);
            (ptr, s.encode_utf16().count() as u32)
        }
        TypedValue::AnsiString(s) => {
            let ptr = pointer_to_end(out);
            let bytes = encode_ansi(s);
            out.extend_from_slice(&bytes);
            out.push(0);
            (ptr, bytes.len() as u32)
        }
        TypedValue::Binary(bytes) => {
            let ptr = pointer_to_end(out);
            out.extend_from_slice(bytes);
            (ptr, bytes.len() as u32)
        }
        TypedValue::Guid(g) => {
            let ptr = pointer_to_end(out);
            out.extend_from_slice(&g.to_bytes());
            (ptr, 0)
        }
        TypedValue::SysTime(ts) => {
            let ptr = pointer_to_end(out);
            out.extend_from_slice(&timestamp_to_systime(*ts));
            (ptr, 0)
        }
        TypedValue::Sid(sid) => {
            let ptr = pointer_to_end(out);
            out.extend_from_slice(sid.as_bytes());
            (ptr, sid.as_bytes().len() as u32)
        }
        TypedValue::Array(_, items) => {
            if items.is_empty() {
                return ([0; 8], 0);
            }
            let ptr = pointer_to_end(out);
            let table_start = out.len();
            let by_reference = items.iter().any(|item| {
                matches!(
                    item,
                    TypedValue::String(_) | TypedValue::AnsiString(_) | TypedValue::Sid(_)
                )
            });

            if by_reference {
                out.resize(table_start + items.len() * 8, 0);
                for (i, item) in items.iter().enumerate() {
                    let (element_ptr, _) = write_value(item, out);
                    let entry = table_start + i * 8;
                    out[entry..entry + 8].copy_from_slice(&element_ptr);
                }
            } else {
                for item in items {
                    match item {
                        TypedValue::Guid(g) => out.extend_from_slice(&g.to_bytes()),
                        TypedValue::SysTime(ts) => {
                            out.extend_from_slice(&timestamp_to_systime(*ts))
                        }
                        other => {
                            let size = other.variant_type().inline_size().unwrap_or(0);
                            let raw = inline_bytes(other).unwrap_or([0; 8]);
                            out.extend_from_slice(&raw[..size]);
                        }
                    }
                }
            }
            (ptr, items.len() as u32)
        }
        // Inline values were handled above.
        _ => ([0; 8], 0),
    }
}
