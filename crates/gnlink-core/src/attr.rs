//! Typed attribute views.
//!
//! The wire carries only `(type, payload)`; the kind of an attribute is what
//! its family schema declares. String attributes follow a strict policy: the
//! payload must end in exactly one NUL byte and contain no other NUL. Text
//! with an embedded NUL is rejected when building an attribute, and payloads
//! with a missing or embedded terminator are rejected when reading one.

use std::fmt;

/// Attribute type selector. Type `0` is reserved.
pub type AttrType = u16;

/// Width of a fixed-width integer attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    U8,
    U16,
    U32,
    U64,
}

impl IntWidth {
    pub const fn bytes(self) -> usize {
        match self {
            IntWidth::U8 => 1,
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
            IntWidth::U64 => 8,
        }
    }
}

/// The value kind a schema expects for an attribute type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// Any payload.
    Unspecified,
    /// NUL-terminated string.
    String,
    /// Opaque bytes, optionally bounded.
    Raw { max_len: Option<usize> },
    /// Little-endian integer of the given width.
    Integer(IntWidth),
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeKind::Unspecified => f.write_str("unspecified"),
            AttributeKind::String => f.write_str("string"),
            AttributeKind::Raw { max_len: None } => f.write_str("raw"),
            AttributeKind::Raw { max_len: Some(max) } => write!(f, "raw(<= {max})"),
            AttributeKind::Integer(width) => write!(f, "u{}", width.bytes() * 8),
        }
    }
}

/// Errors from reading or building typed attribute values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute {0} is missing")]
    Missing(AttrType),

    #[error("string attribute {ty} has no NUL terminator")]
    MissingTerminator { ty: AttrType },

    #[error("string attribute {ty} has an embedded NUL at byte {position}")]
    EmbeddedNul { ty: AttrType, position: usize },

    #[error("string attribute {ty} is not valid UTF-8")]
    NotUtf8 { ty: AttrType },

    #[error("integer attribute {ty} has {actual} bytes, expected {expected}")]
    WidthMismatch {
        ty: AttrType,
        expected: usize,
        actual: usize,
    },
}

/// Check the string policy and return the text bytes without the terminator.
pub fn nul_terminated(ty: AttrType, payload: &[u8]) -> Result<&[u8], AttributeError> {
    let Some((&0, text)) = payload.split_last() else {
        return Err(AttributeError::MissingTerminator { ty });
    };
    match text.iter().position(|&b| b == 0) {
        Some(position) => Err(AttributeError::EmbeddedNul { ty, position }),
        None => Ok(text),
    }
}

/// A single `(type, payload)` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    ty: AttrType,
    payload: Vec<u8>,
}

impl Attribute {
    /// Create an attribute with a raw payload.
    pub fn new(ty: AttrType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            ty,
            payload: payload.into(),
        }
    }

    /// Create a NUL-terminated string attribute.
    pub fn string(ty: AttrType, value: &str) -> Result<Self, AttributeError> {
        if let Some(position) = value.bytes().position(|b| b == 0) {
            return Err(AttributeError::EmbeddedNul { ty, position });
        }
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        Ok(Self { ty, payload })
    }

    pub fn u8(ty: AttrType, value: u8) -> Self {
        Self::new(ty, vec![value])
    }

    pub fn u16(ty: AttrType, value: u16) -> Self {
        Self::new(ty, value.to_le_bytes())
    }

    pub fn u32(ty: AttrType, value: u32) -> Self {
        Self::new(ty, value.to_le_bytes())
    }

    pub fn u64(ty: AttrType, value: u64) -> Self {
        Self::new(ty, value.to_le_bytes())
    }

    pub fn ty(&self) -> AttrType {
        self.ty
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Read the payload as a string.
    pub fn as_str(&self) -> Result<&str, AttributeError> {
        let text = nul_terminated(self.ty, &self.payload)?;
        std::str::from_utf8(text).map_err(|_| AttributeError::NotUtf8 { ty: self.ty })
    }

    pub fn as_u8(&self) -> Result<u8, AttributeError> {
        self.fixed::<1>().map(|b| b[0])
    }

    pub fn as_u16(&self) -> Result<u16, AttributeError> {
        self.fixed::<2>().map(u16::from_le_bytes)
    }

    pub fn as_u32(&self) -> Result<u32, AttributeError> {
        self.fixed::<4>().map(u32::from_le_bytes)
    }

    pub fn as_u64(&self) -> Result<u64, AttributeError> {
        self.fixed::<8>().map(u64::from_le_bytes)
    }

    fn fixed<const N: usize>(&self) -> Result<[u8; N], AttributeError> {
        self.payload
            .as_slice()
            .try_into()
            .map_err(|_| AttributeError::WidthMismatch {
                ty: self.ty,
                expected: N,
                actual: self.payload.len(),
            })
    }
}

/// The ordered attribute records of one message.
///
/// Every record is kept in wire order. Lookups by type return the first
/// occurrence; later duplicates are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    records: Vec<Attribute>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, attribute: Attribute) {
        self.records.push(attribute);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.records.push(attribute);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attribute> {
        self.records.iter()
    }

    /// First attribute of the given type.
    pub fn get(&self, ty: AttrType) -> Option<&Attribute> {
        self.records.iter().find(|a| a.ty == ty)
    }

    pub fn contains(&self, ty: AttrType) -> bool {
        self.get(ty).is_some()
    }

    fn require(&self, ty: AttrType) -> Result<&Attribute, AttributeError> {
        self.get(ty).ok_or(AttributeError::Missing(ty))
    }

    pub fn get_str(&self, ty: AttrType) -> Result<&str, AttributeError> {
        self.require(ty)?.as_str()
    }

    pub fn get_u16(&self, ty: AttrType) -> Result<u16, AttributeError> {
        self.require(ty)?.as_u16()
    }

    pub fn get_u32(&self, ty: AttrType) -> Result<u32, AttributeError> {
        self.require(ty)?.as_u32()
    }

    pub fn get_u64(&self, ty: AttrType) -> Result<u64, AttributeError> {
        self.require(ty)?.as_u64()
    }
}

impl FromIterator<Attribute> for Attributes {
    fn from_iter<I: IntoIterator<Item = Attribute>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Attributes {
    type Item = &'a Attribute;
    type IntoIter = std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
