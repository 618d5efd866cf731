//! Type encodings and method signatures.
//!
//! A method signature is written in the compact `@encode` notation: the
//! return type first, then one type per argument, starting with the receiver
//! (`@`) and the selector (`:`). Each type may be preceded by qualifiers and
//! followed by a frame offset, which compilers emit and we ignore:
//!
//! ```text
//!   Vv24@0:8@16          oneway void, self, _cmd, object
//!   {Point=dd}32@0:8d16  struct return, self, _cmd, double
//!   v40@0:8n^{Range=QQ}16O@24  in-pointer to struct, bycopy object
//! ```
//!
//! Parsing happens once; the resulting [`MethodSignature`] stores the offset,
//! size, alignment and qualifiers of every argument so invocations never
//! re-derive them.
//!
//! # Frame layout
//!
//! Every argument occupies its size rounded up to an 8-byte word. The frame
//! length is therefore the sum of those aligned sizes, and the fixed prologue
//! (self + _cmd) is 16 bytes.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Type encoding characters.
pub mod types {
    /// void
    pub const VOID: char = 'v';
    /// char
    pub const CHAR: char = 'c';
    /// unsigned char
    pub const UCHAR: char = 'C';
    /// short
    pub const SHORT: char = 's';
    /// unsigned short
    pub const USHORT: char = 'S';
    /// int
    pub const INT: char = 'i';
    /// unsigned int
    pub const UINT: char = 'I';
    /// long (64-bit)
    pub const LONG: char = 'l';
    /// unsigned long (64-bit)
    pub const ULONG: char = 'L';
    /// long long
    pub const LONG_LONG: char = 'q';
    /// unsigned long long
    pub const ULONG_LONG: char = 'Q';
    /// float
    pub const FLOAT: char = 'f';
    /// double
    pub const DOUBLE: char = 'd';
    /// bool
    pub const BOOL: char = 'B';
    /// C string
    pub const C_STRING: char = '*';
    /// object (id)
    pub const OBJECT: char = '@';
    /// class
    pub const CLASS: char = '#';
    /// selector
    pub const SELECTOR: char = ':';
    /// unknown / function pointer
    pub const UNKNOWN: char = '?';
    /// pointer prefix
    pub const POINTER: char = '^';
    /// struct open
    pub const STRUCT_BEGIN: char = '{';
    /// struct close
    pub const STRUCT_END: char = '}';
    /// union open
    pub const UNION_BEGIN: char = '(';
    /// union close
    pub const UNION_END: char = ')';
    /// array open
    pub const ARRAY_BEGIN: char = '[';
    /// array close
    pub const ARRAY_END: char = ']';
}

/// Size in bytes of pointers, objects, selectors and classes in a frame.
pub const POINTER_SIZE: usize = 8;

/// Word size every frame slot is rounded up to.
pub const FRAME_WORD: usize = 8;

/// Size of the self + _cmd prologue.
pub const PROLOGUE_SIZE: usize = 2 * FRAME_WORD;

/// Deepest aggregate nesting the parser accepts.
const MAX_TYPE_DEPTH: usize = 64;

/// Largest C size, in bytes, of one type or of all arguments of a method.
pub const MAX_TYPE_SIZE: usize = 1 << 24;

/// Most values a zero-filled type or method frame may expand to.
pub const MAX_TYPE_SLOTS: usize = 1 << 20;

const fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Argument qualifier flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Qualifiers(u8);

impl Qualifiers {
    /// No qualifiers.
    pub const NONE: Qualifiers = Qualifiers(0);
    /// `r`: const.
    pub const CONST: Qualifiers = Qualifiers(1);
    /// `n`: pointee travels only with the request.
    pub const IN: Qualifiers = Qualifiers(1 << 1);
    /// `o`: pointee travels only with the reply.
    pub const OUT: Qualifiers = Qualifiers(1 << 2);
    /// `N`: pointee travels both ways.
    pub const INOUT: Qualifiers = Qualifiers(1 << 3);
    /// `O`: object is sent as an independent copy.
    pub const BYCOPY: Qualifiers = Qualifiers(1 << 4);
    /// `R`: object is sent as a call-scoped reference. Not supported.
    pub const BYREF: Qualifiers = Qualifiers(1 << 5);
    /// `V`: no reply is expected.
    pub const ONEWAY: Qualifiers = Qualifiers(1 << 6);

    /// Maps a qualifier character to its flag.
    #[must_use]
    pub const fn from_char(c: char) -> Option<Qualifiers> {
        match c {
            'r' => Some(Self::CONST),
            'n' => Some(Self::IN),
            'o' => Some(Self::OUT),
            'N' => Some(Self::INOUT),
            'O' => Some(Self::BYCOPY),
            'R' => Some(Self::BYREF),
            'V' => Some(Self::ONEWAY),
            _ => None,
        }
    }

    /// Whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Qualifiers) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the flags in `other`.
    pub fn insert(&mut self, other: Qualifiers) {
        self.0 |= other.0;
    }

    /// Whether no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether a pointee must be sent with the request.
    #[must_use]
    pub const fn sends_pointee(self) -> bool {
        !self.contains(Qualifiers::OUT)
    }

    /// Whether a pointee must come back with the reply.
    #[must_use]
    pub const fn returns_pointee(self) -> bool {
        !self.contains(Qualifiers::IN) && !self.contains(Qualifiers::CONST)
    }
}

impl fmt::Debug for Qualifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Qualifiers, &str); 7] = [
            (Qualifiers::CONST, "const"),
            (Qualifiers::IN, "in"),
            (Qualifiers::OUT, "out"),
            (Qualifiers::INOUT, "inout"),
            (Qualifiers::BYCOPY, "bycopy"),
            (Qualifiers::BYREF, "byref"),
            (Qualifiers::ONEWAY, "oneway"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}

/// The primitive kind of a type, with aggregates described recursively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Bool,
    CString,
    Object,
    Class,
    Selector,
    Unknown,
    Pointer(Box<TypeEncoding>),
    Struct {
        name: String,
        fields: Vec<TypeEncoding>,
    },
    Union {
        name: String,
        fields: Vec<TypeEncoding>,
    },
    Array {
        len: usize,
        element: Box<TypeEncoding>,
    },
}

/// A parsed type with its C size and alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeEncoding {
    kind: TypeKind,
    size: usize,
    align: usize,
    // Values `Value::zero` builds for this type, pointees included.
    slots: usize,
}

impl TypeEncoding {
    const fn scalar(kind: TypeKind, size: usize) -> Self {
        TypeEncoding {
            kind,
            size,
            align: if size == 0 { 1 } else { size },
            slots: 1,
        }
    }

    /// The type's kind.
    #[must_use]
    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Alignment in bytes.
    #[must_use]
    pub const fn align(&self) -> usize {
        self.align
    }

    /// Number of values a zero-filled instance of this type holds.
    #[must_use]
    pub const fn slots(&self) -> usize {
        self.slots
    }

    /// The leading encoding character, used as the wire tag.
    #[must_use]
    pub const fn tag(&self) -> char {
        match &self.kind {
            TypeKind::Void => types::VOID,
            TypeKind::Char => types::CHAR,
            TypeKind::UChar => types::UCHAR,
            TypeKind::Short => types::SHORT,
            TypeKind::UShort => types::USHORT,
            TypeKind::Int => types::INT,
            TypeKind::UInt => types::UINT,
            TypeKind::Long => types::LONG,
            TypeKind::ULong => types::ULONG,
            TypeKind::LongLong => types::LONG_LONG,
            TypeKind::ULongLong => types::ULONG_LONG,
            TypeKind::Float => types::FLOAT,
            TypeKind::Double => types::DOUBLE,
            TypeKind::Bool => types::BOOL,
            TypeKind::CString => types::C_STRING,
            TypeKind::Object => types::OBJECT,
            TypeKind::Class => types::CLASS,
            TypeKind::Selector => types::SELECTOR,
            TypeKind::Unknown => types::UNKNOWN,
            TypeKind::Pointer(_) => types::POINTER,
            TypeKind::Struct { .. } => types::STRUCT_BEGIN,
            TypeKind::Union { .. } => types::UNION_BEGIN,
            TypeKind::Array { .. } => types::ARRAY_BEGIN,
        }
    }

    /// Parses a single type (no qualifiers, no offsets).
    ///
    /// ```rust
    /// use oxidec_do::runtime::encoding::TypeEncoding;
    ///
    /// let point = TypeEncoding::parse("{Point=ci}").unwrap();
    /// assert_eq!(point.size(), 8);
    /// assert_eq!(point.align(), 4);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSignature`] if `text` is not exactly one type.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parser = Parser::new(text);
        let ty = parser.parse_type(0)?;
        if !parser.at_end() {
            return Err(parser.error("trailing characters after type"));
        }
        Ok(ty)
    }
}

/// Layout and qualifiers of one argument (or the return value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentInfo {
    offset: usize,
    size: usize,
    align: usize,
    ty: TypeEncoding,
    qualifiers: Qualifiers,
    is_register: bool,
    type_string: String,
}

impl ArgumentInfo {
    /// Byte offset of this argument within the frame.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Byte size of the argument's type.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Alignment of the argument's type.
    #[must_use]
    pub const fn align(&self) -> usize {
        self.align
    }

    /// The parsed type.
    #[must_use]
    pub fn type_encoding(&self) -> &TypeEncoding {
        &self.ty
    }

    /// The primitive type tag.
    #[must_use]
    pub const fn tag(&self) -> char {
        self.ty.tag()
    }

    /// Qualifier flags.
    #[must_use]
    pub const fn qualifiers(&self) -> Qualifiers {
        self.qualifiers
    }

    /// Whether the compiler marked the argument as passed in a register.
    #[must_use]
    pub const fn is_register(&self) -> bool {
        self.is_register
    }

    /// The type text without qualifiers or offset.
    #[must_use]
    pub fn type_string(&self) -> &str {
        &self.type_string
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SignatureInner {
    types: String,
    return_info: ArgumentInfo,
    arguments: Vec<ArgumentInfo>,
    frame_length: usize,
}

/// An immutable, parsed method signature. Cloning is cheap.
///
/// ```rust
/// use oxidec_do::MethodSignature;
///
/// let sig = MethodSignature::parse("d@:i{Pair=ii}").unwrap();
/// assert_eq!(sig.number_of_arguments(), 4);
/// assert_eq!(sig.explicit_arguments().len(), 2);
/// assert_eq!(sig.method_return_length(), 8);
/// assert_eq!(sig.frame_length(), 16 + 8 + 8);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct MethodSignature {
    inner: Arc<SignatureInner>,
}

impl MethodSignature {
    /// Parses a method type encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedSignature`] if the encoding is empty, has an
    /// unknown type character, unbalanced aggregates, a `void` argument, or
    /// does not start its arguments with `@` and `:`.
    pub fn parse(types: &str) -> Result<Self> {
        let mut parser = Parser::new(types);
        if parser.at_end() {
            return Err(parser.error("empty encoding"));
        }

        let return_info = parser.parse_argument(0)?;

        let mut arguments = Vec::new();
        let mut offset = 0;
        let mut slots = return_info.ty.slots;
        while !parser.at_end() {
            let mut info = parser.parse_argument(offset)?;
            if info.ty.kind == TypeKind::Void {
                return Err(parser.error("void is not a valid argument type"));
            }
            info.offset = offset;
            offset += align_up(info.size, FRAME_WORD);
            slots += info.ty.slots;
            parser.check_bounds(offset, slots)?;
            arguments.push(info);
        }

        if arguments.len() < 2 {
            return Err(parser.error("missing self and _cmd arguments"));
        }
        if !matches!(arguments[0].ty.kind, TypeKind::Object | TypeKind::Class) {
            return Err(parser.error("first argument must be the receiver"));
        }
        if arguments[1].ty.kind != TypeKind::Selector {
            return Err(parser.error("second argument must be the selector"));
        }

        Ok(MethodSignature {
            inner: Arc::new(SignatureInner {
                types: types.to_owned(),
                return_info,
                arguments,
                frame_length: offset,
            }),
        })
    }

    /// The encoding this signature was parsed from.
    #[must_use]
    pub fn types(&self) -> &str {
        &self.inner.types
    }

    /// Number of arguments including self and _cmd.
    #[must_use]
    pub fn number_of_arguments(&self) -> usize {
        self.inner.arguments.len()
    }

    /// Total frame length: the sum of all word-aligned argument sizes.
    #[must_use]
    pub fn frame_length(&self) -> usize {
        self.inner.frame_length
    }

    /// Layout of the argument at `index` (0 = self, 1 = _cmd).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgumentIndexOutOfRange`] past the last argument.
    pub fn argument_info(&self, index: usize) -> Result<&ArgumentInfo> {
        self.inner
            .arguments
            .get(index)
            .ok_or(Error::ArgumentIndexOutOfRange {
                index,
                count: self.inner.arguments.len(),
            })
    }

    /// Type text of the argument at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgumentIndexOutOfRange`] past the last argument.
    pub fn argument_type(&self, index: usize) -> Result<&str> {
        self.argument_info(index).map(ArgumentInfo::type_string)
    }

    /// Every argument including self and _cmd.
    #[must_use]
    pub fn arguments(&self) -> &[ArgumentInfo] {
        &self.inner.arguments
    }

    /// Only the explicit arguments; empty for a zero-argument method.
    #[must_use]
    pub fn explicit_arguments(&self) -> &[ArgumentInfo] {
        &self.inner.arguments[2..]
    }

    /// Layout of the return value (logical index -1).
    #[must_use]
    pub fn return_info(&self) -> &ArgumentInfo {
        &self.inner.return_info
    }

    /// Byte size of the return value.
    #[must_use]
    pub fn method_return_length(&self) -> usize {
        self.inner.return_info.size
    }

    /// Type text of the return value.
    #[must_use]
    pub fn method_return_type(&self) -> &str {
        &self.inner.return_info.type_string
    }

    /// Whether the method was declared `oneway`.
    #[must_use]
    pub fn is_oneway(&self) -> bool {
        self.inner.return_info.qualifiers.contains(Qualifiers::ONEWAY)
    }

    /// Whether any explicit argument is qualified `byref`.
    #[must_use]
    pub fn has_byref_arguments(&self) -> bool {
        self.explicit_arguments()
            .iter()
            .any(|a| a.qualifiers.contains(Qualifiers::BYREF))
    }

    /// Checks that `self` lays out the same types as `other`. Qualifiers,
    /// offsets and class names of object types are not compared.
    ///
    /// # Errors
    ///
    /// [`Error::ArgumentIndexOutOfRange`] if the argument counts differ, or
    /// [`Error::ArgumentTypeMismatch`] naming the first differing slot
    /// (`usize::MAX` for the return type).
    pub fn check_compatible(&self, other: &MethodSignature) -> Result<()> {
        if self.number_of_arguments() != other.number_of_arguments() {
            return Err(Error::ArgumentIndexOutOfRange {
                index: self.number_of_arguments(),
                count: other.number_of_arguments(),
            });
        }
        let slots = std::iter::once((usize::MAX, self.return_info(), other.return_info())).chain(
            self.arguments()
                .iter()
                .zip(other.arguments())
                .enumerate()
                .map(|(index, (ours, theirs))| (index, ours, theirs)),
        );
        for (index, ours, theirs) in slots {
            if ours.ty != theirs.ty {
                return Err(Error::ArgumentTypeMismatch {
                    expected: theirs.tag(),
                    got: ours.tag(),
                    index,
                });
            }
        }
        Ok(())
    }
}

impl FromStr for MethodSignature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MethodSignature::parse(s)
    }
}

impl fmt::Debug for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSignature")
            .field("types", &self.inner.types)
            .field("arguments", &self.inner.arguments.len())
            .field("frame_length", &self.inner.frame_length)
            .finish()
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, want: u8, reason: &'static str) -> Result<()> {
        if self.bump() == Some(want) {
            Ok(())
        } else {
            Err(self.error(reason))
        }
    }

    fn error(&self, reason: &'static str) -> Error {
        Error::MalformedSignature {
            encoding: self.src.to_owned(),
            reason,
        }
    }

    fn check_bounds(&self, size: usize, slots: usize) -> Result<()> {
        if size > MAX_TYPE_SIZE {
            return Err(self.error("type too large"));
        }
        if slots > MAX_TYPE_SLOTS {
            return Err(self.error("type has too many elements"));
        }
        Ok(())
    }

    fn parse_number(&mut self) -> Option<usize> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        self.src[start..self.pos].parse().ok()
    }

    /// Qualifiers, one type, then an optional `[+-]digits` frame offset.
    fn parse_argument(&mut self, offset: usize) -> Result<ArgumentInfo> {
        let mut qualifiers = Qualifiers::NONE;
        while let Some(q) = self.peek().and_then(|b| Qualifiers::from_char(b as char)) {
            qualifiers.insert(q);
            self.pos += 1;
        }

        let start = self.pos;
        let ty = self.parse_type(0)?;
        let type_string = self.src[start..self.pos].to_owned();

        let mut is_register = false;
        match self.peek() {
            Some(b'+') => {
                is_register = true;
                self.pos += 1;
            }
            Some(b'-') => self.pos += 1,
            _ => {}
        }
        // Compiler-provided offsets are informational only.
        let _ = self.parse_number();

        Ok(ArgumentInfo {
            offset,
            size: ty.size,
            align: ty.align,
            ty,
            qualifiers,
            is_register,
            type_string,
        })
    }

    fn parse_type(&mut self, depth: usize) -> Result<TypeEncoding> {
        if depth > MAX_TYPE_DEPTH {
            return Err(self.error("type nesting too deep"));
        }
        let Some(c) = self.bump() else {
            return Err(self.error("unexpected end of encoding"));
        };

        let ty = match c as char {
            types::VOID => TypeEncoding::scalar(TypeKind::Void, 0),
            types::CHAR => TypeEncoding::scalar(TypeKind::Char, 1),
            types::UCHAR => TypeEncoding::scalar(TypeKind::UChar, 1),
            types::SHORT => TypeEncoding::scalar(TypeKind::Short, 2),
            types::USHORT => TypeEncoding::scalar(TypeKind::UShort, 2),
            types::INT => TypeEncoding::scalar(TypeKind::Int, 4),
            types::UINT => TypeEncoding::scalar(TypeKind::UInt, 4),
            types::LONG => TypeEncoding::scalar(TypeKind::Long, 8),
            types::ULONG => TypeEncoding::scalar(TypeKind::ULong, 8),
            types::LONG_LONG => TypeEncoding::scalar(TypeKind::LongLong, 8),
            types::ULONG_LONG => TypeEncoding::scalar(TypeKind::ULongLong, 8),
            types::FLOAT => TypeEncoding::scalar(TypeKind::Float, 4),
            types::DOUBLE => TypeEncoding::scalar(TypeKind::Double, 8),
            types::BOOL => TypeEncoding::scalar(TypeKind::Bool, 1),
            types::C_STRING => TypeEncoding::scalar(TypeKind::CString, POINTER_SIZE),
            types::CLASS => TypeEncoding::scalar(TypeKind::Class, POINTER_SIZE),
            types::SELECTOR => TypeEncoding::scalar(TypeKind::Selector, POINTER_SIZE),
            types::UNKNOWN => TypeEncoding::scalar(TypeKind::Unknown, POINTER_SIZE),
            types::OBJECT => {
                match self.peek() {
                    // @"ClassName"
                    Some(b'"') => {
                        self.pos += 1;
                        while self.bump().ok_or_else(|| self.error("unterminated class name"))?
                            != b'"'
                        {}
                    }
                    // @? is a block; it travels as an opaque pointer.
                    Some(b'?') => {
                        self.pos += 1;
                        return Ok(TypeEncoding::scalar(TypeKind::Unknown, POINTER_SIZE));
                    }
                    _ => {}
                }
                TypeEncoding::scalar(TypeKind::Object, POINTER_SIZE)
            }
            types::POINTER => {
                let pointee = self.parse_type(depth + 1)?;
                TypeEncoding {
                    slots: pointee.slots + 1,
                    kind: TypeKind::Pointer(Box::new(pointee)),
                    size: POINTER_SIZE,
                    align: POINTER_SIZE,
                }
            }
            types::STRUCT_BEGIN => self.parse_aggregate(depth, b'}', false)?,
            types::UNION_BEGIN => self.parse_aggregate(depth, b')', true)?,
            types::ARRAY_BEGIN => {
                let len = self
                    .parse_number()
                    .ok_or_else(|| self.error("array without length"))?;
                let element = self.parse_type(depth + 1)?;
                self.expect(b']', "unterminated array")?;
                let size = len
                    .checked_mul(element.size)
                    .ok_or_else(|| self.error("type too large"))?;
                let slots = len
                    .checked_mul(element.slots)
                    .and_then(|n| n.checked_add(1))
                    .ok_or_else(|| self.error("type has too many elements"))?;
                self.check_bounds(size, slots)?;
                TypeEncoding {
                    align: element.align,
                    slots,
                    kind: TypeKind::Array {
                        len,
                        element: Box::new(element),
                    },
                    size,
                }
            }
            _ => return Err(self.error("unknown type character")),
        };
        Ok(ty)
    }

    fn parse_aggregate(&mut self, depth: usize, close: u8, union: bool) -> Result<TypeEncoding> {
        let name_start = self.pos;
        loop {
            match self.peek() {
                Some(b'=') => break,
                Some(b) if b == close => break,
                Some(_) => self.pos += 1,
                None => return Err(self.error("unterminated aggregate")),
            }
        }
        let name = self.src[name_start..self.pos].to_owned();

        let mut fields = Vec::new();
        let (mut total_size, mut total_slots) = (0, 1);
        if self.peek() == Some(b'=') {
            self.pos += 1;
            while self.peek() != Some(close) {
                if self.at_end() {
                    return Err(self.error("unterminated aggregate"));
                }
                let field = self.parse_type(depth + 1)?;
                // Both terms are already bounded; the sums cannot overflow.
                total_size += field.size;
                total_slots += field.slots;
                self.check_bounds(total_size, total_slots)?;
                fields.push(field);
            }
        }
        self.expect(close, "unterminated aggregate")?;

        let align = fields.iter().map(|f| f.align).max().unwrap_or(1);
        let size = if union {
            align_up(fields.iter().map(|f| f.size).max().unwrap_or(0), align)
        } else {
            let mut offset = 0;
            for field in &fields {
                offset = align_up(offset, field.align) + field.size;
            }
            align_up(offset, align)
        };

        // Unions zero-fill as raw bytes.
        let slots = if union {
            1
        } else {
            1 + fields.iter().map(|f| f.slots).sum::<usize>()
        };
        self.check_bounds(size, slots)?;

        let kind = if union {
            TypeKind::Union { name, fields }
        } else {
            TypeKind::Struct { name, fields }
        };
        Ok(TypeEncoding {
            kind,
            size,
            align,
            slots,
        })
    }
}

/// Byte offsets of each field of a struct, following C layout rules.
#[must_use]
pub fn struct_field_offsets(fields: &[TypeEncoding]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(fields.len());
    let mut offset = 0;
    for field in fields {
        offset = align_up(offset, field.align);
        offsets.push(offset);
        offset += field.size;
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_argument_method() {
        let sig = MethodSignature::parse("v@:").unwrap();
        assert!(sig.explicit_arguments().is_empty());
        assert_eq!(sig.number_of_arguments(), 2);
        assert_eq!(sig.frame_length(), PROLOGUE_SIZE);
        assert_eq!(sig.method_return_length(), 0);
    }

    #[test]
    fn test_scalar_sizes_and_offsets() {
        let sig = MethodSignature::parse("i@:csilqfdB").unwrap();
        let sizes: Vec<usize> = sig.explicit_arguments().iter().map(|a| a.size()).collect();
        assert_eq!(sizes, vec![1, 2, 4, 8, 8, 4, 8, 1]);

        let offsets: Vec<usize> = sig.arguments().iter().map(|a| a.offset()).collect();
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sig.frame_length(), 10 * FRAME_WORD);
    }

    #[test]
    fn test_compiler_offsets_are_ignored() {
        let with = MethodSignature::parse("v24@0:8i16").unwrap();
        let without = MethodSignature::parse("v@:i").unwrap();
        assert_eq!(with.frame_length(), without.frame_length());
        assert_eq!(with.argument_type(2).unwrap(), "i");
    }

    #[test]
    fn test_register_marker() {
        let sig = MethodSignature::parse("v@+8:+12i+16").unwrap();
        assert!(sig.argument_info(2).unwrap().is_register());
    }

    #[test]
    fn test_struct_layout() {
        let ty = TypeEncoding::parse("{Mixed=cdi}").unwrap();
        // c at 0, d at 8, i at 16, padded to 24
        assert_eq!(ty.size(), 24);
        assert_eq!(ty.align(), 8);
        if let TypeKind::Struct { name, fields } = ty.kind() {
            assert_eq!(name, "Mixed");
            assert_eq!(struct_field_offsets(fields), vec![0, 8, 16]);
        } else {
            panic!("expected struct");
        }
    }

    #[test]
    fn test_nested_struct_and_array() {
        let ty = TypeEncoding::parse("{Rect={Point=dd}{Size=dd}}").unwrap();
        assert_eq!(ty.size(), 32);

        let arr = TypeEncoding::parse("[4{Pair=si}]").unwrap();
        assert_eq!(arr.size(), 32);
        assert_eq!(arr.align(), 4);
    }

    #[test]
    fn test_union_and_opaque_struct() {
        let u = TypeEncoding::parse("(Num=iqc)").unwrap();
        assert_eq!(u.size(), 8);

        let opaque = TypeEncoding::parse("^{Opaque}").unwrap();
        assert_eq!(opaque.size(), POINTER_SIZE);
    }

    #[test]
    fn test_qualifiers() {
        let sig = MethodSignature::parse("Vv@:O@n^iN^do^qR@").unwrap();
        assert!(sig.is_oneway());
        let q: Vec<Qualifiers> = sig
            .explicit_arguments()
            .iter()
            .map(ArgumentInfo::qualifiers)
            .collect();
        assert!(q[0].contains(Qualifiers::BYCOPY));
        assert!(q[1].contains(Qualifiers::IN));
        assert!(!q[1].returns_pointee());
        assert!(q[2].contains(Qualifiers::INOUT));
        assert!(q[2].sends_pointee() && q[2].returns_pointee());
        assert!(!q[3].sends_pointee());
        assert!(sig.has_byref_arguments());
    }

    #[test]
    fn test_object_with_class_name() {
        let sig = MethodSignature::parse("@\"NSString\"@:@\"NSArray\"").unwrap();
        assert_eq!(sig.return_info().tag(), types::OBJECT);
        assert_eq!(sig.argument_type(2).unwrap(), "@\"NSArray\"");
    }

    #[test]
    fn test_compatible_signatures() {
        let local = MethodSignature::parse("i@:io^{P=ii}").unwrap();
        let sent = MethodSignature::parse("i24@0:8i16^{P=ii}20").unwrap();
        sent.check_compatible(&local).unwrap();

        let wider = MethodSignature::parse("i@:i^{P=ii}i").unwrap();
        assert!(matches!(
            wider.check_compatible(&local),
            Err(Error::ArgumentIndexOutOfRange { index: 5, count: 4 })
        ));
        let other = MethodSignature::parse("i@:d^{P=ii}").unwrap();
        assert!(matches!(
            other.check_compatible(&local),
            Err(Error::ArgumentTypeMismatch {
                expected: 'i',
                got: 'd',
                index: 2
            })
        ));
        let returns = MethodSignature::parse("v@:io^{P=ii}").unwrap();
        assert!(matches!(
            returns.check_compatible(&local),
            Err(Error::ArgumentTypeMismatch { index: usize::MAX, .. })
        ));
    }

    #[test]
    fn test_oversized_types_are_rejected() {
        for bad in [
            "v@:[4000000000000c]",
            "v@:[99999999999999999999999c]",
            "v@:[4096[4096i]]",
            "v@:[2000000{E=}]",
            "v@:[1024[1024^[1024c]]]",
        ] {
            assert!(
                matches!(
                    MethodSignature::parse(bad),
                    Err(Error::MalformedSignature { .. })
                ),
                "{bad:?} should be rejected"
            );
        }

        // Each argument fits on its own; together they do not.
        assert!(MethodSignature::parse("v@:[600000d]").is_ok());
        assert!(matches!(
            MethodSignature::parse("v@:[600000d][600000d]"),
            Err(Error::MalformedSignature { .. })
        ));
    }

    #[test]
    fn test_slots_count_zero_filled_values() {
        assert_eq!(TypeEncoding::parse("i").unwrap().slots(), 1);
        assert_eq!(TypeEncoding::parse("{P=ii}").unwrap().slots(), 3);
        assert_eq!(TypeEncoding::parse("[4i]").unwrap().slots(), 5);
        assert_eq!(TypeEncoding::parse("^{P=ii}").unwrap().slots(), 4);
        assert_eq!(TypeEncoding::parse("(U=id)").unwrap().slots(), 1);
        assert_eq!(TypeEncoding::parse("[3{E=}]").unwrap().size(), 0);
    }

    #[test]
    fn test_malformed_encodings() {
        for bad in [
            "", "x@:", "v@", "v:@", "v@:x", "v@:{Open=ii", "v@:[i]", "v@:v", "v@:[3i",
            "@\"Unterminated@:",
        ] {
            assert!(
                matches!(
                    MethodSignature::parse(bad),
                    Err(Error::MalformedSignature { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_argument_index_out_of_range() {
        let sig = MethodSignature::parse("v@:i").unwrap();
        assert!(matches!(
            sig.argument_info(3),
            Err(Error::ArgumentIndexOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_parse_is_idempotent() {
        let text = "{Big=[3d]ic}@:^{Node=i^v}O@[2[2s]]";
        let a = MethodSignature::parse(text).unwrap();
        let b = MethodSignature::parse(text).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.arguments(), b.arguments());
        assert_eq!(a.frame_length(), b.frame_length());
    }
}
