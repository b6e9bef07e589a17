//! Physical data types and dynamically typed values.

use std::cmp::Ordering;
use std::fmt;

use smallvec::SmallVec;

/// Encoded grouping or join key. Most keys fit inline.
pub type KeyBytes = SmallVec<[u8; 16]>;

/// Physical type of a schema field.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub enum DataType {
    /// One byte, zero is false.
    Bool,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// Single ASCII byte.
    Char,
    /// Variable-sized UTF-8 text stored in a child buffer.
    Text,
}

impl DataType {
    /// Number of bytes the type occupies inline in a record.
    ///
    /// `Text` occupies the 4-byte child buffer index.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 | Self::Char => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 | Self::Text => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// True for integer and float types.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Bool | Self::Char | Self::Text)
    }

    /// True for float types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed 8-bit integer.
    Int8(i8),
    /// Signed 16-bit integer.
    Int16(i16),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// Unsigned 8-bit integer.
    UInt8(u8),
    /// Unsigned 16-bit integer.
    UInt16(u16),
    /// Unsigned 32-bit integer.
    UInt32(u32),
    /// Unsigned 64-bit integer.
    UInt64(u64),
    /// 32-bit float.
    Float32(f32),
    /// 64-bit float.
    Float64(f64),
    /// Single ASCII byte.
    Char(u8),
    /// UTF-8 text.
    Text(String),
}

impl Value {
    /// The physical type of this value.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::UInt8(_) => DataType::UInt8,
            Self::UInt16(_) => DataType::UInt16,
            Self::UInt32(_) => DataType::UInt32,
            Self::UInt64(_) => DataType::UInt64,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::Char(_) => DataType::Char,
            Self::Text(_) => DataType::Text,
        }
    }

    /// Integer view of the value (`None` for floats and non-numerics).
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Self::Int8(v) => v.into(),
            Self::Int16(v) => v.into(),
            Self::Int32(v) => v.into(),
            Self::Int64(v) => v.into(),
            Self::UInt8(v) => v.into(),
            Self::UInt16(v) => v.into(),
            Self::UInt32(v) => v.into(),
            Self::UInt64(v) => v.into(),
            _ => return None,
        })
    }

    /// Float view of any numeric value.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Float32(v) => Some(f64::from(v)),
            Self::Float64(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// Unsigned view used for timestamps. Negative values yield `None`.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().and_then(|v| u64::try_from(v).ok())
    }

    /// Boolean view; numerics are true when non-zero.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Text(_) => None,
            Self::Char(c) => Some(*c != 0),
            other => other.as_f64().map(|v| v != 0.0),
        }
    }

    /// Compares two values, promoting numerics.
    ///
    /// Integers compare exactly; as soon as one side is a float both sides
    /// compare as `f64`. Mismatched non-numeric types are incomparable.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Char(a), Self::Char(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            _ => match (self.as_i128(), other.as_i128()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
            },
        }
    }

    /// Numeric addition with the same promotion rules as [`compare`](Self::compare).
    #[must_use]
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        match (self.as_i128(), other.as_i128()) {
            (Some(a), Some(b)) => i64::try_from(a.checked_add(b)?).ok().map(Value::Int64),
            _ => Some(Value::Float64(self.as_f64()? + other.as_f64()?)),
        }
    }

    /// Appends a canonical byte encoding used as a hash key.
    ///
    /// Integers of every width encode identically so that `Int32(5)` and
    /// `Int64(5)` land on the same hash bucket.
    pub fn encode_key(&self, out: &mut KeyBytes) {
        match self {
            Self::Bool(v) => {
                out.push(0);
                out.push(u8::from(*v));
            }
            Self::Char(c) => {
                out.push(1);
                out.push(*c);
            }
            Self::Text(s) => {
                out.push(2);
                #[allow(clippy::cast_possible_truncation)]
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Self::Float32(_) | Self::Float64(_) => {
                out.push(3);
                // adding zero turns -0.0 into 0.0, which compares equal to it
                let v = self.as_f64().unwrap_or_default() + 0.0;
                out.extend_from_slice(&v.to_bits().to_le_bytes());
            }
            integer => {
                let wide = integer.as_i128().unwrap_or_default();
                match i64::try_from(wide) {
                    Ok(narrow) => {
                        out.push(4);
                        out.extend_from_slice(&narrow.to_le_bytes());
                    }
                    Err(_) => {
                        out.push(5);
                        out.extend_from_slice(&wide.to_le_bytes());
                    }
                }
            }
        }
    }

    /// Converts the value into `target`, if representable.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn cast_to(&self, target: DataType) -> Option<Value> {
        if self.data_type() == target {
            return Some(self.clone());
        }
        let int = self.as_i128();
        Some(match target {
            DataType::Bool => Value::Bool(self.as_bool()?),
            DataType::Int8 => Value::Int8(i8::try_from(int?).ok()?),
            DataType::Int16 => Value::Int16(i16::try_from(int?).ok()?),
            DataType::Int32 => Value::Int32(i32::try_from(int?).ok()?),
            DataType::Int64 => Value::Int64(i64::try_from(int?).ok()?),
            DataType::UInt8 => Value::UInt8(u8::try_from(int?).ok()?),
            DataType::UInt16 => Value::UInt16(u16::try_from(int?).ok()?),
            DataType::UInt32 => Value::UInt32(u32::try_from(int?).ok()?),
            DataType::UInt64 => Value::UInt64(u64::try_from(int?).ok()?),
            DataType::Float32 => Value::Float32(self.as_f64()? as f32),
            DataType::Float64 => Value::Float64(self.as_f64()?),
            DataType::Char | DataType::Text => return None,
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::UInt8(v) => write!(f, "{v}"),
            Self::UInt16(v) => write!(f, "{v}"),
            Self::UInt32(v) => write!(f, "{v}"),
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Char(c) => write!(f, "{}", char::from(*c)),
            Self::Text(s) => f.write_str(s),
        }
    }
}
