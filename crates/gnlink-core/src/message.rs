//! Message model shared by the codec, the dispatcher and the client.
//!
//! A [`Message`] is the decoded form of one datagram: the outer header fields,
//! the family sub-header and an ordered list of attributes. The `kind` field
//! carries the frame marker, so a receiver branches on [`Message::is_error`]
//! before it looks at attributes at all.

use std::fmt;
use std::ops::BitOr;

use crate::attr::{Attribute, Attributes};

/// Numeric id of a registered family, carried in the outer header.
pub type FamilyId = u16;

/// Negative errno-style codes carried by error frames.
pub mod errno {
    pub const EINTR: i32 = 4;
    pub const ENOENT: i32 = 2;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EMSGSIZE: i32 = 90;
    pub const EOPNOTSUPP: i32 = 95;

    /// Turn a handler status of either sign into an error-frame code.
    ///
    /// `0` is not a failure code and becomes `-EINVAL`; `i32::MIN` has no
    /// positive counterpart and is kept as is.
    pub fn negative(code: i32) -> i32 {
        match code.checked_abs() {
            Some(0) => -EINVAL,
            Some(abs) => -abs,
            None => i32::MIN,
        }
    }
}

/// Header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u16);

impl Flags {
    /// The frame is a request.
    pub const REQUEST: Flags = Flags(0x0001);
    /// The frame is one part of a multi-part reply.
    pub const MULTI: Flags = Flags(0x0002);
    /// The requester wants a reply even on silent success.
    pub const ACK: Flags = Flags(0x0004);
    /// Request a dump of the whole entity.
    pub const DUMP: Flags = Flags(0x0300);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// What the outer `type_marker` field says about a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A request to, or reply from, the given family.
    Family(FamilyId),
    /// An error frame carrying a negative errno-style code.
    Error(i32),
    /// End of a multi-part dump.
    Done,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub flags: Flags,
    pub sequence: u32,
    /// Endpoint id of the requester; replies are addressed to it.
    pub origin: u32,
    pub command: u8,
    pub version: u8,
    pub attributes: Attributes,
}

impl Message {
    /// Create a request for `command` on `family`.
    pub fn request(family: FamilyId, command: u8, version: u8) -> Self {
        Self {
            kind: MessageKind::Family(family),
            flags: Flags::REQUEST,
            sequence: 0,
            origin: 0,
            command,
            version,
            attributes: Attributes::new(),
        }
    }

    /// Build a normal reply to `request`, addressed to its origin with the
    /// next sequence number.
    pub fn reply_to(
        request: &Message,
        family: FamilyId,
        version: u8,
        command: u8,
        attributes: Attributes,
    ) -> Self {
        Self {
            kind: MessageKind::Family(family),
            flags: Flags::empty(),
            sequence: request.sequence.wrapping_add(1),
            origin: request.origin,
            command,
            version,
            attributes,
        }
    }

    /// Build an error frame answering `request`.
    ///
    /// Error frames echo the request's sequence number and never carry
    /// attributes.
    pub fn error_reply(request: &Message, code: i32) -> Self {
        Self {
            kind: MessageKind::Error(code),
            flags: Flags::empty(),
            sequence: request.sequence,
            origin: request.origin,
            command: request.command,
            version: request.version,
            attributes: Attributes::new(),
        }
    }

    /// Build the frame that terminates a dump.
    pub fn done(origin: u32, sequence: u32, command: u8, version: u8) -> Self {
        Self {
            kind: MessageKind::Done,
            flags: Flags::MULTI,
            sequence,
            origin,
            command,
            version,
            attributes: Attributes::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_origin(mut self, origin: u32) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Error(_))
    }

    pub fn is_done(&self) -> bool {
        matches!(self.kind, MessageKind::Done)
    }

    /// Family id, if this is a family frame.
    pub fn family(&self) -> Option<FamilyId> {
        match self.kind {
            MessageKind::Family(id) => Some(id),
            _ => None,
        }
    }

    /// Error code, if this is an error frame.
    pub fn error_code(&self) -> Option<i32> {
        match self.kind {
            MessageKind::Error(code) => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Family(id) => write!(f, "family {id:#06x}"),
            MessageKind::Error(code) => write!(f, "error {code}"),
            MessageKind::Done => f.write_str("done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_contains() {
        let flags = Flags::REQUEST | Flags::DUMP;
        assert!(flags.contains(Flags::REQUEST));
        assert!(flags.contains(Flags::DUMP));
        assert!(!flags.contains(Flags::ACK));
        assert_eq!(flags.bits(), 0x0301);
    }

    #[test]
    fn test_negative_errno() {
        assert_eq!(errno::negative(errno::EBUSY), -errno::EBUSY);
        assert_eq!(errno::negative(-errno::EBUSY), -errno::EBUSY);
        assert_eq!(errno::negative(0), -errno::EINVAL);
        assert_eq!(errno::negative(i32::MIN), i32::MIN);
    }

    #[test]
    fn test_reply_addresses_origin_with_next_sequence() {
        let request = Message::request(0x20, 1, 1)
            .with_origin(77)
            .with_sequence(41);
        let reply = Message::reply_to(&request, 0x20, 1, 1, Attributes::new());
        assert_eq!(reply.origin, 77);
        assert_eq!(reply.sequence, 42);
        assert!(!reply.is_error());
    }

    #[test]
    fn test_error_reply_has_no_attributes() {
        let request = Message::request(0x20, 2, 1)
            .with_attribute(Attribute::u32(1, 5))
            .with_sequence(9);
        let reply = Message::error_reply(&request, -errno::EINVAL);
        assert!(reply.is_error());
        assert_eq!(reply.error_code(), Some(-errno::EINVAL));
        assert!(reply.attributes.is_empty());
        assert_eq!(reply.sequence, 9);
        assert_eq!(reply.family(), None);
    }

    #[test]
    fn test_sequence_wraps() {
        let request = Message::request(0x20, 1, 1).with_sequence(u32::MAX);
        let reply = Message::reply_to(&request, 0x20, 1, 1, Attributes::new());
        assert_eq!(reply.sequence, 0);
    }
}
