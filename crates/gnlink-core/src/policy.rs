//! Attribute policy. Validates decoded attributes against a family schema.
//!
//! A schema maps attribute types to the [`AttributeKind`] they must hold.
//! [`validate`] walks the attributes once in wire order and reports the first
//! violation. It has no side effects.

use std::collections::BTreeMap;

use tracing::warn;

use crate::attr::{self, AttrType, Attributes, AttributeKind};

/// How strictly a command's request attributes are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validation {
    /// Unknown attribute types are rejected.
    #[default]
    Strict,
    /// Unknown attribute types are skipped; known ones are still checked.
    Relaxed,
}

/// A policy violation found by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("attribute type {ty} is not part of the family schema")]
    UnknownAttribute { ty: AttrType },

    #[error("attribute type {ty} does not hold a valid {expected}: {reason}")]
    TypeMismatch {
        ty: AttrType,
        expected: AttributeKind,
        reason: String,
    },
}

/// Per-family mapping from attribute type to expected kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSchema {
    kinds: BTreeMap<AttrType, AttributeKind>,
}

impl AttributeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the kind of an attribute type.
    ///
    /// Type `0` is reserved and is never added to a schema.
    pub fn with(mut self, ty: AttrType, kind: AttributeKind) -> Self {
        self.insert(ty, kind);
        self
    }

    pub fn insert(&mut self, ty: AttrType, kind: AttributeKind) {
        if ty == 0 {
            warn!("ignoring schema entry for reserved attribute type 0");
            return;
        }
        self.kinds.insert(ty, kind);
    }

    pub fn kind(&self, ty: AttrType) -> Option<AttributeKind> {
        self.kinds.get(&ty).copied()
    }

    /// Highest declared attribute type, or 0 for an empty schema.
    pub fn max_type(&self) -> AttrType {
        self.kinds.keys().next_back().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Check every attribute against `schema`.
pub fn validate(
    attributes: &Attributes,
    schema: &AttributeSchema,
    mode: Validation,
) -> Result<(), PolicyViolation> {
    for attribute in attributes {
        let ty = attribute.ty();
        let Some(kind) = schema.kind(ty) else {
            match mode {
                Validation::Strict => return Err(PolicyViolation::UnknownAttribute { ty }),
                Validation::Relaxed => continue,
            }
        };
        check_kind(ty, kind, attribute.payload())?;
    }
    Ok(())
}

fn check_kind(ty: AttrType, kind: AttributeKind, payload: &[u8]) -> Result<(), PolicyViolation> {
    let mismatch = |reason: String| PolicyViolation::TypeMismatch {
        ty,
        expected: kind,
        reason,
    };
    match kind {
        AttributeKind::Unspecified => Ok(()),
        AttributeKind::String => attr::nul_terminated(ty, payload)
            .map(|_| ())
            .map_err(|e| mismatch(e.to_string())),
        AttributeKind::Integer(width) if payload.len() != width.bytes() => Err(mismatch(format!(
            "{} bytes, expected {}",
            payload.len(),
            width.bytes()
        ))),
        AttributeKind::Integer(_) => Ok(()),
        AttributeKind::Raw { max_len: Some(max) } if payload.len() > max => Err(mismatch(
            format!("{} bytes, at most {max} allowed", payload.len()),
        )),
        AttributeKind::Raw { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{Attribute, IntWidth};

    fn schema() -> AttributeSchema {
        AttributeSchema::new()
            .with(1, AttributeKind::String)
            .with(2, AttributeKind::Integer(IntWidth::U32))
            .with(3, AttributeKind::Raw { max_len: Some(4) })
            .with(4, AttributeKind::Unspecified)
    }

    #[test]
    fn test_valid_attributes_pass() {
        let attrs = Attributes::new()
            .with(Attribute::string(1, "hello").unwrap())
            .with(Attribute::u32(2, 9))
            .with(Attribute::new(3, vec![1, 2, 3]))
            .with(Attribute::new(4, vec![0; 40]));
        assert_eq!(validate(&attrs, &schema(), Validation::Strict), Ok(()));
    }

    #[test]
    fn test_unknown_attribute_strict_vs_relaxed() {
        let attrs = Attributes::new().with(Attribute::u8(9, 1));
        assert_eq!(
            validate(&attrs, &schema(), Validation::Strict),
            Err(PolicyViolation::UnknownAttribute { ty: 9 })
        );
        assert_eq!(validate(&attrs, &schema(), Validation::Relaxed), Ok(()));
    }

    #[test]
    fn test_reserved_type_is_unknown() {
        let attrs = Attributes::new().with(Attribute::new(0, Vec::new()));
        assert_eq!(
            validate(&attrs, &schema(), Validation::Strict),
            Err(PolicyViolation::UnknownAttribute { ty: 0 })
        );
    }

    #[test]
    fn test_string_without_terminator_is_mismatch() {
        let attrs = Attributes::new().with(Attribute::new(1, b"abc".to_vec()));
        let err = validate(&attrs, &schema(), Validation::Strict).unwrap_err();
        assert!(matches!(err, PolicyViolation::TypeMismatch { ty: 1, .. }));
    }

    #[test]
    fn test_integer_width_mismatch() {
        let attrs = Attributes::new().with(Attribute::u16(2, 1));
        let err = validate(&attrs, &schema(), Validation::Relaxed).unwrap_err();
        assert!(matches!(
            err,
            PolicyViolation::TypeMismatch {
                ty: 2,
                expected: AttributeKind::Integer(IntWidth::U32),
                ..
            }
        ));
    }

    #[test]
    fn test_raw_over_max_len() {
        let attrs = Attributes::new().with(Attribute::new(3, vec![0; 5]));
        assert!(validate(&attrs, &schema(), Validation::Strict).is_err());
    }

    #[test]
    fn test_schema_ignores_reserved_type() {
        let schema = AttributeSchema::new().with(0, AttributeKind::String);
        assert!(schema.is_empty());
        assert_eq!(schema.max_type(), 0);
        assert_eq!(self::schema().max_type(), 4);
    }
}
