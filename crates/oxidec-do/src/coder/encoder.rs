//! Encoding half of the port coder.

use crate::coder::{ClassNameMap, MAX_NESTING, ProxyResolver, object_tag, presence};
use crate::error::{Error, Result};
use crate::runtime::encoding::{Qualifiers, types};
use crate::runtime::{Invocation, Object, Value};
use fxhash::FxHashMap;

/// Writes self-describing values into a buffer.
///
/// One encoder is used for one message and then discarded; back-references
/// are only meaningful within that message.
pub struct Encoder<'a> {
    buf: Vec<u8>,
    resolver: &'a dyn ProxyResolver,
    class_names: &'a ClassNameMap,
    /// Object id -> back-reference index of everything archived so far.
    backrefs: FxHashMap<u64, u32>,
    /// Handles exported by this message, once per occurrence.
    exported: Vec<u32>,
    interconnect_stack_height: usize,
}

impl<'a> Encoder<'a> {
    /// Creates an encoder resolving references through `resolver`.
    #[must_use]
    pub fn new(resolver: &'a dyn ProxyResolver, class_names: &'a ClassNameMap) -> Self {
        Encoder {
            buf: Vec::with_capacity(64),
            resolver,
            class_names,
            backrefs: FxHashMap::default(),
            exported: Vec::new(),
            interconnect_stack_height: 0,
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current nesting depth; zero between top-level values.
    #[must_use]
    pub fn interconnect_stack_height(&self) -> usize {
        self.interconnect_stack_height
    }

    /// Takes the handles of every local object written by reference.
    pub fn take_exported_handles(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.exported)
    }

    /// Takes the encoded bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Writes one raw byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Writes a big-endian `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Writes a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if `bytes` exceeds the 32-bit length field.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::SizeMismatch {
            needed: bytes.len(),
            available: u32::MAX as usize,
        })?;
        self.put_u32(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// As for [`Encoder::put_bytes`].
    pub fn put_str(&mut self, s: &str) -> Result<()> {
        self.put_bytes(s.as_bytes())
    }

    fn put_tag(&mut self, tag: char) {
        // Type characters are ASCII.
        self.buf.push(tag as u8);
    }

    fn put_count(&mut self, n: usize) -> Result<()> {
        let n = u32::try_from(n).map_err(|_| Error::SizeMismatch {
            needed: n,
            available: u32::MAX as usize,
        })?;
        self.put_u32(n);
        Ok(())
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

    /// Encodes a value; objects travel by reference.
    ///
    /// # Errors
    ///
    /// [`Error::NotImplemented`] for opaque or `void` pointers,
    /// [`Error::NestingTooDeep`] for pathologically deep values, or whatever
    /// the resolver reports when exporting an object.
    pub fn encode_value(&mut self, value: &Value) -> Result<()> {
        self.encode(value, false)
    }

    /// Encodes an object; `bycopy` archives it by value.
    ///
    /// # Errors
    ///
    /// As for [`Encoder::encode_value`].
    pub fn encode_object(&mut self, object: Option<&Object>, bycopy: bool) -> Result<()> {
        self.put_tag(types::OBJECT);
        self.encode_object_payload(object, bycopy)
    }

    fn encode(&mut self, value: &Value, archiving: bool) -> Result<()> {
        self.put_tag(value.tag());
        match value {
            Value::Void => {}
            Value::Char(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            Value::UChar(v) => self.put_u8(*v),
            Value::Short(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            Value::UShort(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            Value::Int(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            Value::UInt(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            Value::Long(v) | Value::LongLong(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            Value::ULong(v) | Value::ULongLong(v) => self.buf.extend_from_slice(&v.to_be_bytes()),
            Value::Float(v) => self.buf.extend_from_slice(&v.to_bits().to_be_bytes()),
            Value::Double(v) => self.buf.extend_from_slice(&v.to_bits().to_be_bytes()),
            Value::Bool(v) => self.put_u8(u8::from(*v)),
            Value::CString(s) => self.put_optional(s.as_deref())?,
            Value::Selector(sel) => self.put_optional(sel.map(|s| s.name().as_bytes()))?,
            Value::Class(class) => {
                let wire = class.as_ref().map(|c| self.class_names.wire_name(c.name()));
                self.put_optional(wire.as_deref().map(str::as_bytes))?;
            }
            Value::Object(obj) => self.encode_object_payload(obj.as_ref(), archiving)?,
            Value::Pointer(None) => self.put_u8(presence::NULL),
            Value::Pointer(Some(pointee)) => {
                if **pointee == Value::Void {
                    return Err(Error::NotImplemented {
                        feature: "void pointers",
                    });
                }
                self.put_u8(presence::PRESENT);
                self.enter()?;
                self.encode(pointee, archiving)?;
                self.leave();
            }
            Value::Struct(fields) | Value::Array(fields) => {
                self.put_count(fields.len())?;
                self.enter()?;
                for field in fields {
                    self.encode(field, archiving)?;
                }
                self.leave();
            }
            Value::Union(bytes) => self.put_bytes(bytes)?,
            Value::Unknown => {
                return Err(Error::NotImplemented {
                    feature: "opaque pointers",
                });
            }
        }
        Ok(())
    }

    fn put_optional(&mut self, bytes: Option<&[u8]>) -> Result<()> {
        match bytes {
            None => {
                self.put_u8(0);
                Ok(())
            }
            Some(bytes) => {
                self.put_u8(1);
                self.put_bytes(bytes)
            }
        }
    }

    fn encode_object_payload(&mut self, object: Option<&Object>, bycopy: bool) -> Result<()> {
        let Some(object) = object else {
            self.put_u8(object_tag::NIL);
            return Ok(());
        };

        // Proxies have no state to copy; they always travel by reference.
        if bycopy && !object.is_proxy() {
            return self.encode_archive(object);
        }

        if let Some(handle) = object
            .as_proxy()
            .and_then(|proxy| self.resolver.imported_handle(proxy))
        {
            self.put_u8(object_tag::REMOTE_REF);
            self.put_u32(handle);
            return Ok(());
        }

        let (handle, protocol) = self.resolver.export(object)?;
        self.exported.push(handle);
        self.put_u8(object_tag::LOCAL_REF);
        self.put_u32(handle);
        self.put_str(protocol.as_deref().unwrap_or(""))
    }

    fn encode_archive(&mut self, object: &Object) -> Result<()> {
        if let Some(&index) = self.backrefs.get(&object.id()) {
            self.put_u8(object_tag::BACKREF);
            self.put_u32(index);
            return Ok(());
        }

        // Numbered before the ivars so that cycles can refer back to it.
        let index = u32::try_from(self.backrefs.len()).map_err(|_| Error::SizeMismatch {
            needed: self.backrefs.len(),
            available: u32::MAX as usize,
        })?;
        self.backrefs.insert(object.id(), index);

        self.enter()?;
        self.put_u8(object_tag::ARCHIVE);
        self.put_str(&self.class_names.wire_name(&object.class_name()))?;
        let ivars = object.ivars();
        self.put_count(ivars.len())?;
        for (name, value) in &ivars {
            self.put_str(name)?;
            self.encode(value, true)?;
        }
        self.leave();
        Ok(())
    }

    /// Encodes the explicit arguments of a request.
    ///
    /// Pointers qualified `out` are sent without their pointee; objects
    /// qualified `bycopy` are archived.
    ///
    /// # Errors
    ///
    /// [`Error::NotImplemented`] for `byref` arguments,
    /// [`Error::ArgumentTypeMismatch`] if a slot no longer fits its type, or
    /// any error from [`Encoder::encode_value`].
    pub fn encode_request_arguments(&mut self, invocation: &Invocation) -> Result<()> {
        let signature = invocation.signature();
        if signature.has_byref_arguments() {
            return Err(Error::NotImplemented {
                feature: "byref arguments",
            });
        }

        let args = signature.explicit_arguments().iter().zip(invocation.arguments());
        for (offset, (info, value)) in args.enumerate() {
            value.check(info.type_encoding(), offset + 2)?;
            let qualifiers = info.qualifiers();
            match value {
                Value::Pointer(Some(_)) if !qualifiers.sends_pointee() => {
                    self.put_tag(types::POINTER);
                    self.put_u8(presence::WITHHELD);
                }
                Value::Object(obj) => {
                    self.encode_object(obj.as_ref(), qualifiers.contains(Qualifiers::BYCOPY))?;
                }
                _ => self.encode_value(value)?,
            }
        }
        Ok(())
    }

    /// Encodes a reply: the return value (unless `void`) followed by the
    /// pointee of every pointer argument that travels back.
    ///
    /// # Errors
    ///
    /// [`Error::ReturnValueUnavailable`] if the invocation was not
    /// dispatched, otherwise as for [`Encoder::encode_value`].
    pub fn encode_reply_values(&mut self, invocation: &Invocation) -> Result<()> {
        let signature = invocation.signature();
        let ret = signature.return_info();
        if ret.size() > 0 {
            let value = invocation.return_value()?;
            value.check(ret.type_encoding(), usize::MAX)?;
            match value {
                Value::Object(obj) => {
                    self.encode_object(obj.as_ref(), ret.qualifiers().contains(Qualifiers::BYCOPY))?;
                }
                _ => self.encode_value(value)?,
            }
        }

        let args = signature.explicit_arguments().iter().zip(invocation.arguments());
        for (info, value) in args {
            if info.tag() == types::POINTER && info.qualifiers().returns_pointee() {
                self.encode_value(value)?;
            }
        }
        Ok(())
    }
}
