//! Typed records and their binary and dictionary forms
//!
//! [`Record`] is the capability set the data exchange layer relies on.
//! [`DynamicRecord`] implements it over any [`DataFormat`] with an in-memory
//! tagged union ([`Value`]).
//!
//! Binary layout, field by field in sorted name order:
//! - scalars little-endian, complex values as (real, imaginary);
//! - strings as a `u64` byte length followed by UTF-8 bytes;
//! - arrays as their actual shape (`u64` per dimension) followed by the
//!   elements in row-major order;
//! - nested formats inline.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Number, Value as JsonValue};

use crate::dataformat::{DataFormat, DataType, ScalarType};
use crate::error::{Error, Result};

/// Conversion policy when populating records from dictionaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Casting {
    /// Reject conversions that lose information
    #[default]
    Safe,
    /// Convert anything convertible, truncating if needed
    Unsafe,
}

/// Operations the data exchange layer needs from a record
pub trait Record: fmt::Debug + Send + Sync {
    /// Name of the data format this record conforms to
    fn format_name(&self) -> &str;

    /// Binary encoding of this record
    fn pack(&self) -> Result<Vec<u8>>;

    /// Replace the content of this record with a decoded binary payload
    fn unpack(&mut self, data: &[u8]) -> Result<()>;

    /// Replace the content of this record from a dictionary
    fn from_dict(&mut self, data: &JsonValue, casting: Casting, add_defaults: bool) -> Result<()>;

    /// Dictionary form, arrays lowered to nested lists
    fn as_dict(&self) -> JsonValue;

    /// Numerical closeness; integers, booleans and strings must match exactly
    fn isclose(&self, other: &dyn Record, rtol: f64, atol: f64) -> bool;

    /// Boxed deep copy
    fn clone_record(&self) -> Box<dyn Record>;

    /// Access to the concrete type
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Record> {
    fn clone(&self) -> Self {
        self.clone_record()
    }
}

/// A single field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// 8-bit signed integer
    Int8(i8),
    /// 16-bit signed integer
    Int16(i16),
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit signed integer
    Int64(i64),
    /// 8-bit unsigned integer
    UInt8(u8),
    /// 16-bit unsigned integer
    UInt16(u16),
    /// 32-bit unsigned integer
    UInt32(u32),
    /// 64-bit unsigned integer
    UInt64(u64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
    /// Complex with 32-bit parts
    Complex64(f32, f32),
    /// Complex with 64-bit parts
    Complex128(f64, f64),
    /// UTF-8 string
    String(String),
    /// Nested record
    Object(DynamicRecord),
    /// Array with its actual shape
    Array(Array),
}

/// Row-major array of values
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    /// Actual shape
    pub shape: Vec<usize>,
    /// Elements, `shape.iter().product()` of them
    pub items: Vec<Value>,
}

impl Value {
    /// Integer content, for any integer or boolean value
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Bool(v) => Some(i64::from(v)),
            Value::Int8(v) => Some(i64::from(v)),
            Value::Int16(v) => Some(i64::from(v)),
            Value::Int32(v) => Some(i64::from(v)),
            Value::Int64(v) => Some(v),
            Value::UInt8(v) => Some(i64::from(v)),
            Value::UInt16(v) => Some(i64::from(v)),
            Value::UInt32(v) => Some(i64::from(v)),
            Value::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Real numeric content
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(v) => Some(f64::from(v)),
            Value::Float64(v) => Some(v),
            Value::UInt64(v) => Some(v as f64),
            Value::Int64(v) => Some(v as f64),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    /// String content
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Nested record content
    pub fn as_record(&self) -> Option<&DynamicRecord> {
        match self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }

    /// Default value of a declared type
    pub fn default_for(data_type: &DataType) -> Value {
        match data_type {
            DataType::Scalar(s) => scalar_default(*s),
            DataType::String => Value::String(String::new()),
            DataType::Format(format) => Value::Object(DynamicRecord::new(Arc::clone(format))),
            DataType::Array { shape, item } => {
                let len = shape.iter().product();
                Value::Array(Array {
                    shape: shape.clone(),
                    items: vec![Value::default_for(item); len],
                })
            }
        }
    }

    /// Dictionary form of this value
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Bool(v) => JsonValue::Bool(*v),
            Value::Int8(v) => JsonValue::from(*v),
            Value::Int16(v) => JsonValue::from(*v),
            Value::Int32(v) => JsonValue::from(*v),
            Value::Int64(v) => JsonValue::from(*v),
            Value::UInt8(v) => JsonValue::from(*v),
            Value::UInt16(v) => JsonValue::from(*v),
            Value::UInt32(v) => JsonValue::from(*v),
            Value::UInt64(v) => JsonValue::from(*v),
            Value::Float32(v) => float_json(f64::from(*v)),
            Value::Float64(v) => float_json(*v),
            Value::Complex64(re, im) => JsonValue::Array(vec![float_json(f64::from(*re)), float_json(f64::from(*im))]),
            Value::Complex128(re, im) => JsonValue::Array(vec![float_json(*re), float_json(*im)]),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Object(record) => record.as_dict(),
            Value::Array(array) => nest(&array.shape, &array.items),
        }
    }

    /// Convert a dictionary value to the declared type
    pub fn from_json(
        json: &JsonValue,
        data_type: &DataType,
        casting: Casting,
        add_defaults: bool,
    ) -> Result<Value> {
        match data_type {
            DataType::Scalar(s) => scalar_from_json(json, *s, casting),
            DataType::String => match json {
                JsonValue::String(s) => Ok(Value::String(s.clone())),
                JsonValue::Null => Ok(Value::String(String::new())),
                other if casting == Casting::Unsafe => Ok(Value::String(other.to_string())),
                other => Err(Error::TypeMismatch(format!("expected a string, got {other}"))),
            },
            DataType::Format(format) => {
                let mut record = DynamicRecord::new(Arc::clone(format));
                record.from_dict(json, casting, add_defaults)?;
                Ok(Value::Object(record))
            }
            DataType::Array { shape, item } => {
                if json.is_null() || json.as_array().is_some_and(Vec::is_empty) {
                    let empty: Vec<usize> = shape.iter().map(|_| 0).collect();
                    return Ok(Value::Array(Array {
                        shape: empty,
                        items: Vec::new(),
                    }));
                }
                let mut actual = Vec::with_capacity(shape.len());
                let mut flat = Vec::new();
                flatten(json, shape.len(), &mut actual, &mut flat)?;
                for (i, (declared, got)) in shape.iter().zip(&actual).enumerate() {
                    if *declared != 0 && declared != got {
                        return Err(Error::TypeMismatch(format!(
                            "dimension {i} has length {got}, the format requires {declared}"
                        )));
                    }
                }
                let items = flat
                    .into_iter()
                    .map(|v| Value::from_json(v, item, casting, add_defaults))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(Array {
                    shape: actual,
                    items,
                }))
            }
        }
    }

    fn conforms_to(&self, data_type: &DataType) -> bool {
        match (self, data_type) {
            (Value::String(_), DataType::String) => true,
            (Value::Object(r), DataType::Format(f)) => r.format.name() == f.name(),
            (Value::Array(a), DataType::Array { shape, item }) => {
                a.shape.len() == shape.len()
                    && a.shape.iter().zip(shape).all(|(g, d)| *d == 0 || g == d)
                    && a.items.len() == a.shape.iter().product::<usize>()
                    && a.items.iter().all(|v| v.conforms_to(item))
            }
            (value, DataType::Scalar(s)) => scalar_default(*s).same_variant(value),
            _ => false,
        }
    }

    fn same_variant(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn pack_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bool(v) => out.push(u8::from(*v)),
            Value::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt8(v) => out.push(*v),
            Value::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::UInt64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Float64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Complex64(re, im) => {
                out.extend_from_slice(&re.to_le_bytes());
                out.extend_from_slice(&im.to_le_bytes());
            }
            Value::Complex128(re, im) => {
                out.extend_from_slice(&re.to_le_bytes());
                out.extend_from_slice(&im.to_le_bytes());
            }
            Value::String(s) => {
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Object(record) => record.pack_into(out),
            Value::Array(array) => {
                for dim in &array.shape {
                    out.extend_from_slice(&(*dim as u64).to_le_bytes());
                }
                for item in &array.items {
                    item.pack_into(out);
                }
            }
        }
    }

    fn unpack_from(data_type: &DataType, reader: &mut ByteReader<'_>) -> Result<Value> {
        match data_type {
            DataType::Scalar(s) => unpack_scalar(*s, reader),
            DataType::String => {
                let len = reader.read_len()?;
                let bytes = reader.take(len)?;
                let s = std::str::from_utf8(bytes).map_err(Error::format)?;
                Ok(Value::String(s.to_owned()))
            }
            DataType::Format(format) => {
                let mut record = DynamicRecord::new(Arc::clone(format));
                record.unpack_from(reader)?;
                Ok(Value::Object(record))
            }
            DataType::Array { shape, item } => {
                let mut actual = Vec::with_capacity(shape.len());
                for _ in shape {
                    actual.push(reader.read_len()?);
                }
                let count = actual
                    .iter()
                    .try_fold(1usize, |acc, d| acc.checked_mul(*d))
                    .ok_or_else(|| Error::format("array shape overflows"))?;
                if let DataType::Scalar(s) = item.as_ref() {
                    if count.saturating_mul(s.size_bytes()) > reader.remaining() {
                        return Err(Error::format("truncated record: array exceeds payload"));
                    }
                }
                let items = (0..count)
                    .map(|_| Value::unpack_from(item, reader))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(Array {
                    shape: actual,
                    items,
                }))
            }
        }
    }

    fn isclose(&self, other: &Value, rtol: f64, atol: f64) -> bool {
        let close = |a: f64, b: f64| {
            if a.is_nan() || b.is_nan() {
                return false;
            }
            a == b || (a - b).abs() <= atol + rtol * b.abs()
        };
        match (self, other) {
            (Value::Float32(a), Value::Float32(b)) => close(f64::from(*a), f64::from(*b)),
            (Value::Float64(a), Value::Float64(b)) => close(*a, *b),
            (Value::Complex64(ar, ai), Value::Complex64(br, bi)) => {
                close(f64::from(*ar), f64::from(*br)) && close(f64::from(*ai), f64::from(*bi))
            }
            (Value::Complex128(ar, ai), Value::Complex128(br, bi)) => close(*ar, *br) && close(*ai, *bi),
            (Value::Object(a), Value::Object(b)) => a.isclose_dynamic(b, rtol, atol),
            (Value::Array(a), Value::Array(b)) => {
                a.shape == b.shape
                    && a.items
                        .iter()
                        .zip(&b.items)
                        .all(|(x, y)| x.isclose(y, rtol, atol))
            }
            (a, b) => a == b,
        }
    }
}

fn scalar_default(scalar: ScalarType) -> Value {
    match scalar {
        ScalarType::Bool => Value::Bool(false),
        ScalarType::Int8 => Value::Int8(0),
        ScalarType::Int16 => Value::Int16(0),
        ScalarType::Int32 => Value::Int32(0),
        ScalarType::Int64 => Value::Int64(0),
        ScalarType::UInt8 => Value::UInt8(0),
        ScalarType::UInt16 => Value::UInt16(0),
        ScalarType::UInt32 => Value::UInt32(0),
        ScalarType::UInt64 => Value::UInt64(0),
        ScalarType::Float32 => Value::Float32(0.0),
        ScalarType::Float64 => Value::Float64(0.0),
        ScalarType::Complex64 => Value::Complex64(0.0, 0.0),
        ScalarType::Complex128 => Value::Complex128(0.0, 0.0),
    }
}

fn float_json(v: f64) -> JsonValue {
    Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number)
}

fn nest(shape: &[usize], items: &[Value]) -> JsonValue {
    match shape.split_first() {
        None => items.first().map_or(JsonValue::Null, Value::to_json),
        Some((_, rest)) if rest.is_empty() => JsonValue::Array(items.iter().map(Value::to_json).collect()),
        Some((&len, rest)) => {
            let stride: usize = rest.iter().product();
            let rows = (0..len)
                .map(|i| {
                    let start = (i * stride).min(items.len());
                    let end = ((i + 1) * stride).min(items.len());
                    nest(rest, &items[start..end])
                })
                .collect();
            JsonValue::Array(rows)
        }
    }
}

fn flatten<'a>(
    json: &'a JsonValue,
    depth: usize,
    shape: &mut Vec<usize>,
    flat: &mut Vec<&'a JsonValue>,
) -> Result<()> {
    fn walk<'a>(
        json: &'a JsonValue,
        level: usize,
        depth: usize,
        shape: &mut Vec<usize>,
        flat: &mut Vec<&'a JsonValue>,
    ) -> Result<()> {
        if level == depth {
            flat.push(json);
            return Ok(());
        }
        let items = json.as_array().ok_or_else(|| {
            Error::TypeMismatch(format!(
                "array value has {level} dimension(s), the format requires {depth}"
            ))
        })?;
        if shape.len() == level {
            shape.push(items.len());
        } else if shape[level] != items.len() {
            return Err(Error::TypeMismatch("ragged array value".to_owned()));
        }
        for item in items {
            walk(item, level + 1, depth, shape, flat)?;
        }
        Ok(())
    }

    walk(json, 0, depth, shape, flat)?;
    while shape.len() < depth {
        shape.push(0);
    }
    Ok(())
}

fn scalar_from_json(json: &JsonValue, scalar: ScalarType, casting: Casting) -> Result<Value> {
    let lossy = |what: &str| {
        Error::TypeMismatch(format!(
            "cannot safely cast {what} to `{scalar}' without precision loss"
        ))
    };

    if scalar == ScalarType::Bool {
        return match json {
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::Null => Ok(Value::Bool(false)),
            JsonValue::Number(n) if casting == Casting::Unsafe => {
                Ok(Value::Bool(n.as_f64().is_some_and(|v| v != 0.0)))
            }
            other => Err(lossy(&other.to_string())),
        };
    }

    if scalar.is_complex() {
        let (re, im) = match json {
            JsonValue::Array(parts) if parts.len() == 2 => {
                let re = parts[0].as_f64().ok_or_else(|| lossy("a non-numeric real part"))?;
                let im = parts[1].as_f64().ok_or_else(|| lossy("a non-numeric imaginary part"))?;
                (re, im)
            }
            JsonValue::Object(parts) => {
                let get = |k: &str| parts.get(k).and_then(JsonValue::as_f64).unwrap_or(0.0);
                (get("real"), get("imag"))
            }
            JsonValue::Number(n) => (n.as_f64().unwrap_or(0.0), 0.0),
            JsonValue::Null => (0.0, 0.0),
            other => return Err(lossy(&other.to_string())),
        };
        return Ok(match scalar {
            ScalarType::Complex64 => Value::Complex64(re as f32, im as f32),
            _ => Value::Complex128(re, im),
        });
    }

    if scalar.is_float() {
        let v = match json {
            JsonValue::Number(n) => n.as_f64().unwrap_or(f64::NAN),
            JsonValue::Bool(b) => f64::from(u8::from(*b)),
            JsonValue::Null => 0.0,
            other => return Err(lossy(&other.to_string())),
        };
        return Ok(match scalar {
            ScalarType::Float32 => Value::Float32(v as f32),
            _ => Value::Float64(v),
        });
    }

    let v: i128 = match json {
        JsonValue::Bool(b) => i128::from(*b),
        JsonValue::Null => 0,
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                i128::from(i)
            } else if let Some(u) = n.as_u64() {
                i128::from(u)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if casting == Casting::Safe {
                    return Err(lossy(&format!("float {f}")));
                }
                f as i128
            }
        }
        other => return Err(lossy(&other.to_string())),
    };
    int_value(v, scalar, casting).ok_or_else(|| lossy(&format!("integer {v}")))
}

fn int_value(v: i128, scalar: ScalarType, casting: Casting) -> Option<Value> {
    macro_rules! fit {
        ($variant:ident, $t:ty) => {
            match <$t>::try_from(v) {
                Ok(x) => Some(Value::$variant(x)),
                Err(_) if casting == Casting::Unsafe => Some(Value::$variant(v as $t)),
                Err(_) => None,
            }
        };
    }
    match scalar {
        ScalarType::Int8 => fit!(Int8, i8),
        ScalarType::Int16 => fit!(Int16, i16),
        ScalarType::Int32 => fit!(Int32, i32),
        ScalarType::Int64 => fit!(Int64, i64),
        ScalarType::UInt8 => fit!(UInt8, u8),
        ScalarType::UInt16 => fit!(UInt16, u16),
        ScalarType::UInt32 => fit!(UInt32, u32),
        ScalarType::UInt64 => fit!(UInt64, u64),
        _ => None,
    }
}

fn unpack_scalar(scalar: ScalarType, reader: &mut ByteReader<'_>) -> Result<Value> {
    macro_rules! read {
        ($t:ty) => {{
            let mut buf = [0u8; std::mem::size_of::<$t>()];
            buf.copy_from_slice(reader.take(std::mem::size_of::<$t>())?);
            <$t>::from_le_bytes(buf)
        }};
    }
    let value = match scalar {
        ScalarType::Bool => Value::Bool(read!(u8) != 0),
        ScalarType::Int8 => Value::Int8(read!(i8)),
        ScalarType::Int16 => Value::Int16(read!(i16)),
        ScalarType::Int32 => Value::Int32(read!(i32)),
        ScalarType::Int64 => Value::Int64(read!(i64)),
        ScalarType::UInt8 => Value::UInt8(read!(u8)),
        ScalarType::UInt16 => Value::UInt16(read!(u16)),
        ScalarType::UInt32 => Value::UInt32(read!(u32)),
        ScalarType::UInt64 => Value::UInt64(read!(u64)),
        ScalarType::Float32 => Value::Float32(read!(f32)),
        ScalarType::Float64 => Value::Float64(read!(f64)),
        ScalarType::Complex64 => {
            let re = read!(f32);
            let im = read!(f32);
            Value::Complex64(re, im)
        }
        ScalarType::Complex128 => {
            let re = read!(f64);
            let im = read!(f64);
            Value::Complex128(re, im)
        }
    };
    Ok(value)
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Format(format!(
                "truncated record: needed {len} more byte(s), {} left",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_len(&mut self) -> Result<usize> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        usize::try_from(u64::from_le_bytes(buf)).map_err(Error::format)
    }
}

/// Record backed by a [`DataFormat`] and a map of field values
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicRecord {
    format: Arc<DataFormat>,
    values: BTreeMap<String, Value>,
}

impl DynamicRecord {
    /// Create a record with every field at its default value
    pub fn new(format: Arc<DataFormat>) -> Self {
        let values = format
            .fields()
            .iter()
            .map(|f| (f.name.clone(), Value::default_for(&f.data_type)))
            .collect();
        Self { format, values }
    }

    /// Create a record from a dictionary holding every declared field
    pub fn from_json(format: Arc<DataFormat>, data: &JsonValue) -> Result<Self> {
        let mut record = Self::new(format);
        record.from_dict(data, Casting::Safe, false)?;
        Ok(record)
    }

    /// Format of this record
    pub fn format(&self) -> &Arc<DataFormat> {
        &self.format
    }

    /// Value of a field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Replace the value of a field, checking it against the declaration
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        let field = self.format.field(name).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "`{}' has no attribute `{name}'",
                self.format.name()
            ))
        })?;
        if !value.conforms_to(&field.data_type) {
            return Err(Error::TypeMismatch(format!(
                "attribute `{name}' of `{}' requires {}",
                self.format.name(),
                field.data_type
            )));
        }
        self.values.insert(name.to_owned(), value);
        Ok(())
    }

    fn pack_into(&self, out: &mut Vec<u8>) {
        for field in self.format.fields() {
            match self.values.get(&field.name) {
                Some(value) => value.pack_into(out),
                None => Value::default_for(&field.data_type).pack_into(out),
            }
        }
    }

    fn unpack_from(&mut self, reader: &mut ByteReader<'_>) -> Result<()> {
        let mut values = BTreeMap::new();
        for field in self.format.fields() {
            values.insert(field.name.clone(), Value::unpack_from(&field.data_type, reader)?);
        }
        self.values = values;
        Ok(())
    }

    fn isclose_dynamic(&self, other: &DynamicRecord, rtol: f64, atol: f64) -> bool {
        self.format.name() == other.format.name()
            && self.format.fields().iter().all(|f| {
                match (self.values.get(&f.name), other.values.get(&f.name)) {
                    (Some(a), Some(b)) => a.isclose(b, rtol, atol),
                    _ => false,
                }
            })
    }
}

impl Record for DynamicRecord {
    fn format_name(&self) -> &str {
        self.format.name()
    }

    fn pack(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.pack_into(&mut out);
        Ok(out)
    }

    fn unpack(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.unpack_from(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(Error::Format(format!(
                "{} trailing byte(s) after a `{}' record",
                reader.remaining(),
                self.format.name()
            )));
        }
        Ok(())
    }

    fn from_dict(&mut self, data: &JsonValue, casting: Casting, add_defaults: bool) -> Result<()> {
        let empty = Map::new();
        let object = match data {
            JsonValue::Object(map) => map,
            JsonValue::Null => &empty,
            other => {
                return Err(Error::TypeMismatch(format!(
                    "`{}' must be built from an object, got {other}",
                    self.format.name()
                )))
            }
        };

        let provided: Vec<&String> = object.keys().filter(|k| *k != "__type__").collect();
        let unknown: Vec<&str> = provided
            .iter()
            .filter(|k| self.format.field(k).is_none())
            .map(|k| k.as_str())
            .collect();
        if !unknown.is_empty() {
            return Err(Error::TypeMismatch(format!(
                "unexpected attribute ({}) for data format `{}'",
                unknown.join(", "),
                self.format.name()
            )));
        }
        if !add_defaults {
            let missing: Vec<&str> = self
                .format
                .fields()
                .iter()
                .filter(|f| !object.contains_key(&f.name))
                .map(|f| f.name.as_str())
                .collect();
            if !missing.is_empty() {
                return Err(Error::TypeMismatch(format!(
                    "missing attributes ({}) for data format `{}'",
                    missing.join(", "),
                    self.format.name()
                )));
            }
        }

        let mut values = BTreeMap::new();
        for field in self.format.fields() {
            let value = match object.get(&field.name) {
                Some(json) => Value::from_json(json, &field.data_type, casting, add_defaults)
                    .map_err(|e| match e {
                        Error::TypeMismatch(msg) => Error::TypeMismatch(format!(
                            "attribute `{}' of `{}': {msg}",
                            field.name,
                            self.format.name()
                        )),
                        other => other,
                    })?,
                None => Value::default_for(&field.data_type),
            };
            values.insert(field.name.clone(), value);
        }
        self.values = values;
        Ok(())
    }

    fn as_dict(&self) -> JsonValue {
        let mut map = Map::new();
        for field in self.format.fields() {
            let json = self
                .values
                .get(&field.name)
                .map_or(JsonValue::Null, Value::to_json);
            map.insert(field.name.clone(), json);
        }
        JsonValue::Object(map)
    }

    fn isclose(&self, other: &dyn Record, rtol: f64, atol: f64) -> bool {
        other
            .as_any()
            .downcast_ref::<DynamicRecord>()
            .is_some_and(|other| self.isclose_dynamic(other, rtol, atol))
    }

    fn clone_record(&self) -> Box<dyn Record> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

static_assertions::assert_impl_all!(DynamicRecord: Record, Send, Sync);
static_assertions::assert_obj_safe!(Record);

impl fmt::Display for DynamicRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_dict())
    }
}
