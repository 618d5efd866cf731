//! Decoding half of the port coder.
//!
//! Every structural problem (unknown tag, a tag the signature does not
//! allow at that position, a length running past the buffer) is reported as
//! a protocol violation so the connection that delivered the bytes can be
//! invalidated.

use crate::coder::{MAX_NESTING, ProxyResolver, object_tag, presence};
use crate::error::{Error, Result};
use crate::runtime::encoding::{TypeEncoding, TypeKind, types};
use crate::runtime::{Class, Invocation, Object, Selector, Value};

/// Reads self-describing values from a buffer.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    resolver: &'a dyn ProxyResolver,
    /// Archived objects in back-reference order.
    backrefs: Vec<Object>,
    interconnect_stack_height: usize,
    /// Handles imported by this pass, in order, one entry per reference.
    imported: Vec<u32>,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8], resolver: &'a dyn ProxyResolver) -> Self {
        Decoder {
            buf,
            pos: 0,
            resolver,
            backrefs: Vec::new(),
            interconnect_stack_height: 0,
            imported: Vec::new(),
        }
    }

    /// Bytes not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fails unless every byte has been consumed.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if bytes remain.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(Error::SizeMismatch {
                needed: self.pos,
                available: self.buf.len(),
            })
        }
    }

    /// Handles imported so far; each entry took one count on its proxy.
    #[must_use]
    pub fn imported_handles(&self) -> &[u32] {
        &self.imported
    }

    /// Takes the imported handle list.
    pub fn take_imported_handles(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.imported)
    }

    /// Reads `n` raw bytes.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let available = self.remaining();
        if n > available {
            return Err(Error::SizeMismatch {
                needed: n,
                available,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] at the end of the buffer.
    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if fewer than four bytes remain.
    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    /// Reads a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if the declared length runs past the buffer.
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// As for [`Decoder::get_bytes`], or [`Error::MalformedString`] for
    /// invalid UTF-8.
    pub fn get_str(&mut self) -> Result<&'a str> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| Error::MalformedString { what: "string" })
    }

    fn get_optional(&mut self) -> Result<Option<&'a [u8]>> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => self.get_bytes().map(Some),
            tag => Err(Error::UnknownTypeTag { tag }),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.interconnect_stack_height += 1;
        if self.interconnect_stack_height > MAX_NESTING {
            return Err(Error::NestingTooDeep {
                depth: self.interconnect_stack_height,
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.interconnect_stack_height -= 1;
    }

    /// Decodes one value of any type.
    ///
    /// # Errors
    ///
    /// A protocol violation for malformed input, or whatever the resolver
    /// reports for object references.
    pub fn decode_value(&mut self) -> Result<Value> {
        self.decode(None)
    }

    /// Decodes one value that must have type `ty`.
    ///
    /// # Errors
    ///
    /// As for [`Decoder::decode_value`], plus [`Error::UnknownTypeTag`] when
    /// the tag on the wire is not the one `ty` requires.
    pub fn decode_typed(&mut self, ty: &TypeEncoding) -> Result<Value> {
        self.decode(Some(ty))
    }

    fn decode(&mut self, expected: Option<&TypeEncoding>) -> Result<Value> {
        let tag = self.get_u8()?;
        if let Some(ty) = expected {
            // '?' and '@?' share a tag; any object tag satisfies '@"Class"'.
            if ty.tag() as u8 != tag {
                return Err(Error::UnknownTypeTag { tag });
            }
        }

        let value = match tag as char {
            types::VOID => Value::Void,
            types::CHAR => Value::Char(i8::from_be_bytes(self.array()?)),
            types::UCHAR => Value::UChar(self.get_u8()?),
            types::SHORT => Value::Short(i16::from_be_bytes(self.array()?)),
            types::USHORT => Value::UShort(u16::from_be_bytes(self.array()?)),
            types::INT => Value::Int(i32::from_be_bytes(self.array()?)),
            types::UINT => Value::UInt(u32::from_be_bytes(self.array()?)),
            types::LONG => Value::Long(i64::from_be_bytes(self.array()?)),
            types::ULONG => Value::ULong(u64::from_be_bytes(self.array()?)),
            types::LONG_LONG => Value::LongLong(i64::from_be_bytes(self.array()?)),
            types::ULONG_LONG => Value::ULongLong(u64::from_be_bytes(self.array()?)),
            types::FLOAT => Value::Float(f32::from_bits(u32::from_be_bytes(self.array()?))),
            types::DOUBLE => Value::Double(f64::from_bits(u64::from_be_bytes(self.array()?))),
            types::BOOL => match self.get_u8()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                tag => return Err(Error::UnknownTypeTag { tag }),
            },
            types::C_STRING => Value::CString(self.get_optional()?.map(<[u8]>::to_vec)),
            types::SELECTOR => match self.get_optional()? {
                None => Value::Selector(None),
                Some(name) => {
                    let name = std::str::from_utf8(name)
                        .map_err(|_| Error::MalformedString { what: "selector" })?;
                    Value::Selector(Some(name.parse::<Selector>()?))
                }
            },
            types::CLASS => match self.get_optional()? {
                None => Value::Class(None),
                Some(name) => {
                    let name = std::str::from_utf8(name)
                        .map_err(|_| Error::MalformedString { what: "class name" })?;
                    Value::Class(Some(Class::named(name)?))
                }
            },
            types::OBJECT => Value::Object(self.decode_object_payload()?),
            types::POINTER => self.decode_pointer(expected)?,
            types::STRUCT_BEGIN | types::ARRAY_BEGIN => {
                let count = self.get_u32()? as usize;
                let element_types = expected.map(|ty| aggregate_element_types(ty, count));
                if let Some(Err(e)) = &element_types {
                    return Err(e.clone());
                }
                self.enter()?;
                // Each element takes at least its tag byte.
                let mut elements = Vec::with_capacity(count.min(self.remaining()));
                for i in 0..count {
                    let element_ty = match &element_types {
                        Some(Ok(tys)) => Some(tys[i]),
                        _ => None,
                    };
                    elements.push(self.decode(element_ty)?);
                }
                self.leave();
                if tag as char == types::STRUCT_BEGIN {
                    Value::Struct(elements)
                } else {
                    Value::Array(elements)
                }
            }
            types::UNION_BEGIN => {
                let bytes = self.get_bytes()?.to_vec();
                if let Some(ty) = expected
                    && bytes.len() != ty.size()
                {
                    return Err(Error::SizeMismatch {
                        needed: ty.size(),
                        available: bytes.len(),
                    });
                }
                Value::Union(bytes)
            }
            _ => return Err(Error::UnknownTypeTag { tag }),
        };
        Ok(value)
    }

    fn decode_pointer(&mut self, expected: Option<&TypeEncoding>) -> Result<Value> {
        let pointee_ty = match expected.map(TypeEncoding::kind) {
            Some(TypeKind::Pointer(pointee)) => Some(pointee.as_ref()),
            _ => None,
        };
        match self.get_u8()? {
            presence::NULL => Ok(Value::Pointer(None)),
            presence::PRESENT => {
                self.enter()?;
                let pointee = self.decode(pointee_ty)?;
                self.leave();
                Ok(Value::Pointer(Some(Box::new(pointee))))
            }
            // The callee writes the pointee; give it zeroed storage.
            presence::WITHHELD => match pointee_ty {
                Some(ty) => Ok(Value::Pointer(Some(Box::new(Value::zero(ty))))),
                None => Err(Error::UnknownTypeTag {
                    tag: presence::WITHHELD,
                }),
            },
            tag => Err(Error::UnknownTypeTag { tag }),
        }
    }

    fn decode_object_payload(&mut self) -> Result<Option<Object>> {
        match self.get_u8()? {
            object_tag::NIL => Ok(None),
            object_tag::LOCAL_REF => {
                let handle = self.get_u32()?;
                let protocol = self.get_str()?;
                let protocol = (!protocol.is_empty()).then_some(protocol);
                let proxy = self.resolver.import(handle, protocol)?;
                self.imported.push(handle);
                Ok(Some(proxy))
            }
            object_tag::REMOTE_REF => {
                let handle = self.get_u32()?;
                self.resolver.local_object(handle).map(Some)
            }
            object_tag::ARCHIVE => self.decode_archive().map(Some),
            object_tag::BACKREF => {
                let index = self.get_u32()? as usize;
                self.backrefs
                    .get(index)
                    .cloned()
                    .map(Some)
                    .ok_or(Error::SizeMismatch {
                        needed: index + 1,
                        available: self.backrefs.len(),
                    })
            }
            tag => Err(Error::UnknownTypeTag { tag }),
        }
    }

    fn decode_archive(&mut self) -> Result<Object> {
        self.enter()?;
        let class = Class::named(self.get_str()?)?;
        let object = Object::new(&class);
        // Registered before the ivars so that cycles resolve to it.
        self.backrefs.push(object.clone());

        let count = self.get_u32()?;
        for _ in 0..count {
            let name = self.get_str()?;
            let value = self.decode(None)?;
            object.set_ivar(name, value);
        }
        self.leave();
        Ok(object)
    }

    /// Decodes request arguments into `invocation`'s explicit slots.
    ///
    /// # Errors
    ///
    /// Any decode error; the invocation may be partially filled.
    pub fn decode_request_arguments(&mut self, invocation: &mut Invocation) -> Result<()> {
        let signature = invocation.signature().clone();
        for (slot, info) in signature.explicit_arguments().iter().enumerate() {
            let value = self.decode_typed(info.type_encoding())?;
            invocation.install_argument(slot, value);
        }
        Ok(())
    }

    /// Decodes a reply's return value and returned pointees into
    /// `invocation`.
    ///
    /// # Errors
    ///
    /// Any decode error.
    pub fn decode_reply_values(&mut self, invocation: &mut Invocation) -> Result<()> {
        let signature = invocation.signature().clone();
        let ret = signature.return_info();
        let value = if ret.size() > 0 {
            self.decode_typed(ret.type_encoding())?
        } else {
            Value::Void
        };
        invocation.install_return_value(value);

        for (slot, info) in signature.explicit_arguments().iter().enumerate() {
            if info.tag() == types::POINTER && info.qualifiers().returns_pointee() {
                let value = self.decode_typed(info.type_encoding())?;
                invocation.install_argument(slot, value);
            }
        }
        Ok(())
    }
}

fn aggregate_element_types(ty: &TypeEncoding, count: usize) -> Result<Vec<&TypeEncoding>> {
    let len = match ty.kind() {
        TypeKind::Struct { fields, .. } => fields.len(),
        TypeKind::Array { len, .. } => *len,
        _ => 0,
    };
    if len != count {
        return Err(Error::SizeMismatch {
            needed: len,
            available: count,
        });
    }
    Ok(match ty.kind() {
        TypeKind::Struct { fields, .. } => fields.iter().collect(),
        TypeKind::Array { element, .. } => std::iter::repeat_n(element.as_ref(), count).collect(),
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coder::{ClassNameMap, DetachedResolver, Encoder};
    use crate::runtime::MethodSignature;

    fn encode(values: &[Value]) -> Vec<u8> {
        let names = ClassNameMap::new();
        let mut enc = Encoder::new(&DetachedResolver, &names);
        for v in values {
            enc.encode_value(v).unwrap();
        }
        enc.finish()
    }

    #[test]
    fn test_decode_primitives() {
        let values = vec![
            Value::Char(-5),
            Value::UShort(65535),
            Value::Int(-123_456),
            Value::ULongLong(u64::MAX),
            Value::Float(1.25),
            Value::Double(-0.5),
            Value::Bool(true),
            Value::CString(Some(b"text".to_vec())),
            Value::CString(None),
            Value::Selector(Some("decoderTest:".parse().unwrap())),
        ];
        let bytes = encode(&values);
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        for v in &values {
            assert_eq!(&dec.decode_value().unwrap(), v);
        }
        dec.finish().unwrap();
    }

    #[test]
    fn test_unknown_tag() {
        let mut dec = Decoder::new(b"x", &DetachedResolver);
        let err = dec.decode_value().unwrap_err();
        assert!(matches!(err, Error::UnknownTypeTag { tag: b'x' }));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_invalid_utf8_is_structural() {
        // ':' present, 2-byte name.
        let bytes = [b':', 1, 0, 0, 0, 2, 0xff, 0xfe];
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        let err = dec.decode_value().unwrap_err();
        assert!(matches!(err, Error::MalformedString { what: "selector" }));
        assert!(err.is_protocol_violation());

        let bytes = [0, 0, 0, 1, 0xc3];
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        assert!(dec.get_str().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_huge_array_count_rejected_before_collecting() {
        let ty = TypeEncoding::parse("[2i]").unwrap();
        let bytes = [b'[', 0xff, 0xff, 0xff, 0xff];
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        assert!(matches!(
            dec.decode_typed(&ty),
            Err(Error::SizeMismatch {
                needed: 2,
                available: 0xffff_ffff
            })
        ));
    }

    #[test]
    fn test_tag_signature_mismatch() {
        let bytes = encode(&[Value::Double(1.0)]);
        let ty = TypeEncoding::parse("i").unwrap();
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        assert!(matches!(
            dec.decode_typed(&ty),
            Err(Error::UnknownTypeTag { tag: b'd' })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = encode(&[Value::CString(Some(b"abcdef".to_vec()))]);
        bytes.truncate(bytes.len() - 2);
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        assert!(matches!(
            dec.decode_value(),
            Err(Error::SizeMismatch {
                needed: 6,
                available: 4
            })
        ));
    }

    #[test]
    fn test_struct_field_count_must_match_signature() {
        let bytes = encode(&[Value::Struct(vec![Value::Int(1)])]);
        let ty = TypeEncoding::parse("{P=ii}").unwrap();
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        assert!(dec.decode_typed(&ty).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let mut bytes = encode(&[Value::Int(1)]);
        bytes.push(0);
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        dec.decode_value().unwrap();
        assert!(dec.finish().is_err());
    }

    #[test]
    fn test_withheld_pointer_gets_zeroed_pointee() {
        let sig = MethodSignature::parse("v@:o^{P=ii}").unwrap();
        let mut inv = Invocation::new(sig.clone());
        inv.set_pointee(2, Value::Struct(vec![Value::Int(1), Value::Int(2)]))
            .unwrap();
        let names = ClassNameMap::new();
        let mut enc = Encoder::new(&DetachedResolver, &names);
        enc.encode_request_arguments(&inv).unwrap();
        let bytes = enc.finish();

        let mut remote = Invocation::new(sig);
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        dec.decode_request_arguments(&mut remote).unwrap();
        assert_eq!(
            remote.argument(2).unwrap().pointee(),
            Some(&Value::Struct(vec![Value::Int(0), Value::Int(0)]))
        );
    }

    #[test]
    fn test_bad_backref() {
        let bytes = [b'@', object_tag::BACKREF, 0, 0, 0, 3];
        let mut dec = Decoder::new(&bytes, &DetachedResolver);
        assert!(matches!(
            dec.decode_value(),
            Err(Error::SizeMismatch { .. })
        ));
    }
}
