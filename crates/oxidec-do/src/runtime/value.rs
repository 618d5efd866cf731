//! Typed argument and return values.
//!
//! A [`Value`] is what an [`Invocation`](super::Invocation) slot holds. Each
//! variant corresponds to one type-encoding character, so a slot can be
//! checked against its [`TypeEncoding`] before it is stored or sent.
//!
//! Scalars and aggregates of scalars can also be viewed as raw bytes in
//! native C layout, which is what the byte-level invocation accessors use.

use crate::error::{Error, Result};
use crate::runtime::encoding::{TypeEncoding, TypeKind, struct_field_offsets, types};
use crate::runtime::{Class, Object, Selector};

/// A single typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Char(i8),
    UChar(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    LongLong(i64),
    ULongLong(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    /// `*`: owned bytes without the trailing NUL, or NULL.
    CString(Option<Vec<u8>>),
    Selector(Option<Selector>),
    Class(Option<Class>),
    Object(Option<Object>),
    /// `^T`: the pointee, or NULL.
    Pointer(Option<Box<Value>>),
    /// Field values in declaration order.
    Struct(Vec<Value>),
    /// Raw union storage, sized to the union.
    Union(Vec<u8>),
    Array(Vec<Value>),
    /// `?`: an opaque pointer that cannot leave the process.
    Unknown,
}

impl Value {
    /// The zero value of a type: numeric zero, NULL, or an aggregate of zeros.
    #[must_use]
    pub fn zero(ty: &TypeEncoding) -> Value {
        match ty.kind() {
            TypeKind::Void => Value::Void,
            TypeKind::Char => Value::Char(0),
            TypeKind::UChar => Value::UChar(0),
            TypeKind::Short => Value::Short(0),
            TypeKind::UShort => Value::UShort(0),
            TypeKind::Int => Value::Int(0),
            TypeKind::UInt => Value::UInt(0),
            TypeKind::Long => Value::Long(0),
            TypeKind::ULong => Value::ULong(0),
            TypeKind::LongLong => Value::LongLong(0),
            TypeKind::ULongLong => Value::ULongLong(0),
            TypeKind::Float => Value::Float(0.0),
            TypeKind::Double => Value::Double(0.0),
            TypeKind::Bool => Value::Bool(false),
            TypeKind::CString => Value::CString(None),
            TypeKind::Object => Value::Object(None),
            TypeKind::Class => Value::Class(None),
            TypeKind::Selector => Value::Selector(None),
            TypeKind::Unknown => Value::Unknown,
            TypeKind::Pointer(_) => Value::Pointer(None),
            TypeKind::Struct { fields, .. } => Value::Struct(fields.iter().map(Value::zero).collect()),
            TypeKind::Union { .. } => Value::Union(vec![0; ty.size()]),
            TypeKind::Array { len, element } => {
                Value::Array((0..*len).map(|_| Value::zero(element)).collect())
            }
        }
    }

    /// The type-encoding character this value carries.
    #[must_use]
    pub const fn tag(&self) -> char {
        match self {
            Value::Void => types::VOID,
            Value::Char(_) => types::CHAR,
            Value::UChar(_) => types::UCHAR,
            Value::Short(_) => types::SHORT,
            Value::UShort(_) => types::USHORT,
            Value::Int(_) => types::INT,
            Value::UInt(_) => types::UINT,
            Value::Long(_) => types::LONG,
            Value::ULong(_) => types::ULONG,
            Value::LongLong(_) => types::LONG_LONG,
            Value::ULongLong(_) => types::ULONG_LONG,
            Value::Float(_) => types::FLOAT,
            Value::Double(_) => types::DOUBLE,
            Value::Bool(_) => types::BOOL,
            Value::CString(_) => types::C_STRING,
            Value::Selector(_) => types::SELECTOR,
            Value::Class(_) => types::CLASS,
            Value::Object(_) => types::OBJECT,
            Value::Pointer(_) => types::POINTER,
            Value::Struct(_) => types::STRUCT_BEGIN,
            Value::Union(_) => types::UNION_BEGIN,
            Value::Array(_) => types::ARRAY_BEGIN,
            Value::Unknown => types::UNKNOWN,
        }
    }

    /// Finds the first place where this value does not fit `ty`.
    ///
    /// Returns the `(expected, got)` type characters of the mismatch.
    #[must_use]
    pub fn mismatch(&self, ty: &TypeEncoding) -> Option<(char, char)> {
        let shallow = || Some((ty.tag(), self.tag()));
        match (self, ty.kind()) {
            (Value::Pointer(None), TypeKind::Pointer(_)) => None,
            (Value::Pointer(Some(pointee)), TypeKind::Pointer(target)) => {
                if *target.kind() == TypeKind::Void {
                    None
                } else {
                    pointee.mismatch(target)
                }
            }
            (Value::Struct(values), TypeKind::Struct { fields, .. }) => {
                if values.len() != fields.len() {
                    return shallow();
                }
                values.iter().zip(fields).find_map(|(v, f)| v.mismatch(f))
            }
            (Value::Array(values), TypeKind::Array { len, element }) => {
                if values.len() != *len {
                    return shallow();
                }
                values.iter().find_map(|v| v.mismatch(element))
            }
            (Value::Union(bytes), TypeKind::Union { .. }) => {
                if bytes.len() == ty.size() {
                    None
                } else {
                    shallow()
                }
            }
            _ if self.tag() == ty.tag() => None,
            _ => shallow(),
        }
    }

    /// Checks that this value fits `ty`, reporting `index` on failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgumentTypeMismatch`].
    pub fn check(&self, ty: &TypeEncoding, index: usize) -> Result<()> {
        match self.mismatch(ty) {
            None => Ok(()),
            Some((expected, got)) => Err(Error::ArgumentTypeMismatch {
                expected,
                got,
                index,
            }),
        }
    }

    /// Writes the value in native C layout, exactly `ty.size()` bytes.
    ///
    /// # Errors
    ///
    /// Reference kinds (objects, strings, pointers) have no byte form and
    /// return [`Error::NotImplemented`]; a value that does not fit `ty`
    /// returns [`Error::ArgumentTypeMismatch`].
    pub fn to_native_bytes(&self, ty: &TypeEncoding) -> Result<Vec<u8>> {
        let mut out = vec![0u8; ty.size()];
        self.write_native(ty, &mut out)?;
        Ok(out)
    }

    fn write_native(&self, ty: &TypeEncoding, out: &mut [u8]) -> Result<()> {
        if let Some((expected, got)) = self.mismatch(ty) {
            return Err(Error::ArgumentTypeMismatch {
                expected,
                got,
                index: usize::MAX,
            });
        }
        match (self, ty.kind()) {
            (Value::Void, _) => {}
            (Value::Char(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::UChar(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::Short(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::UShort(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::Int(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::UInt(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::Long(v) | Value::LongLong(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::ULong(v) | Value::ULongLong(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::Float(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::Double(v), _) => out.copy_from_slice(&v.to_ne_bytes()),
            (Value::Bool(v), _) => out[0] = u8::from(*v),
            (Value::Union(bytes), _) => out.copy_from_slice(bytes),
            (Value::Struct(values), TypeKind::Struct { fields, .. }) => {
                for ((value, field), offset) in
                    values.iter().zip(fields).zip(struct_field_offsets(fields))
                {
                    value.write_native(field, &mut out[offset..offset + field.size()])?;
                }
            }
            (Value::Array(values), TypeKind::Array { element, .. }) => {
                for (value, chunk) in values.iter().zip(out.chunks_exact_mut(element.size().max(1))) {
                    value.write_native(element, chunk)?;
                }
            }
            _ => {
                return Err(Error::NotImplemented {
                    feature: "byte access to reference types",
                });
            }
        }
        Ok(())
    }

    /// Reads a value of type `ty` from native C layout.
    ///
    /// Consumes exactly `ty.size()` bytes from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] if `bytes` is too short and
    /// [`Error::NotImplemented`] for reference kinds.
    pub fn from_native_bytes(ty: &TypeEncoding, bytes: &[u8]) -> Result<Value> {
        if bytes.len() < ty.size() {
            return Err(Error::SizeMismatch {
                needed: ty.size(),
                available: bytes.len(),
            });
        }
        let b = &bytes[..ty.size()];

        fn arr<const N: usize>(b: &[u8]) -> [u8; N] {
            let mut out = [0u8; N];
            out.copy_from_slice(&b[..N]);
            out
        }

        let value = match ty.kind() {
            TypeKind::Void => Value::Void,
            TypeKind::Char => Value::Char(i8::from_ne_bytes(arr(b))),
            TypeKind::UChar => Value::UChar(b[0]),
            TypeKind::Short => Value::Short(i16::from_ne_bytes(arr(b))),
            TypeKind::UShort => Value::UShort(u16::from_ne_bytes(arr(b))),
            TypeKind::Int => Value::Int(i32::from_ne_bytes(arr(b))),
            TypeKind::UInt => Value::UInt(u32::from_ne_bytes(arr(b))),
            TypeKind::Long => Value::Long(i64::from_ne_bytes(arr(b))),
            TypeKind::ULong => Value::ULong(u64::from_ne_bytes(arr(b))),
            TypeKind::LongLong => Value::LongLong(i64::from_ne_bytes(arr(b))),
            TypeKind::ULongLong => Value::ULongLong(u64::from_ne_bytes(arr(b))),
            TypeKind::Float => Value::Float(f32::from_ne_bytes(arr(b))),
            TypeKind::Double => Value::Double(f64::from_ne_bytes(arr(b))),
            TypeKind::Bool => Value::Bool(b[0] != 0),
            TypeKind::Union { .. } => Value::Union(b.to_vec()),
            TypeKind::Struct { fields, .. } => Value::Struct(
                fields
                    .iter()
                    .zip(struct_field_offsets(fields))
                    .map(|(field, offset)| Value::from_native_bytes(field, &b[offset..]))
                    .collect::<Result<_>>()?,
            ),
            TypeKind::Array { len, element } if element.size() == 0 => Value::Array(
                std::iter::repeat_n(Value::from_native_bytes(element, &[])?, *len).collect(),
            ),
            TypeKind::Array { element, .. } => Value::Array(
                b.chunks_exact(element.size())
                    .map(|chunk| Value::from_native_bytes(element, chunk))
                    .collect::<Result<_>>()?,
            ),
            _ => {
                return Err(Error::NotImplemented {
                    feature: "byte access to reference types",
                });
            }
        };
        Ok(value)
    }

    /// The object, if this is a non-nil object value.
    #[must_use]
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(Some(obj)) => Some(obj),
            _ => None,
        }
    }

    /// Any integer value widened to `i64`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Char(v) => Some(i64::from(v)),
            Value::UChar(v) => Some(i64::from(v)),
            Value::Short(v) => Some(i64::from(v)),
            Value::UShort(v) => Some(i64::from(v)),
            Value::Int(v) => Some(i64::from(v)),
            Value::UInt(v) => Some(i64::from(v)),
            Value::Long(v) | Value::LongLong(v) => Some(v),
            Value::ULong(v) | Value::ULongLong(v) => i64::try_from(v).ok(),
            Value::Bool(v) => Some(i64::from(v)),
            _ => None,
        }
    }

    /// Floating point values widened to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(f64::from(v)),
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    /// The C string's bytes as UTF-8, if valid.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::CString(Some(bytes)) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// The pointee of a non-NULL pointer.
    #[must_use]
    pub fn pointee(&self) -> Option<&Value> {
        match self {
            Value::Pointer(Some(p)) => Some(p),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::LongLong(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::ULongLong(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::CString(Some(v.as_bytes().to_vec()))
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::Object(Some(v))
    }
}

impl From<Option<Object>> for Value {
    fn from(v: Option<Object>) -> Self {
        Value::Object(v)
    }
}
