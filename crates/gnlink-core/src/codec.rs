//! Wire format for protocol frames.
//!
//! Frame format (all integers little-endian):
//!
//! ```text
//! outer header   [total_length:4][type_marker:2][flags:2][sequence:4][origin:4]
//! family header  [command:1][version:1][reserved:2]
//! attributes     ([type:2][record_length:2][payload:N][pad to 4])*
//! ```
//!
//! - **total_length**: size of the whole frame including the outer header
//! - **type_marker**: [`ERROR_MARKER`], [`DONE_MARKER`] or a family id
//! - **record_length**: attribute header plus payload, excluding padding
//!
//! Error frames replace the attribute section with a leading
//! `[error_code:4]` (signed) before the family header. Done frames carry the
//! family header only.

use crate::attr::{AttrType, Attribute, Attributes};
use crate::message::{Flags, Message, MessageKind};

/// Outer header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Family sub-header size in bytes.
pub const FAMILY_HEADER_LEN: usize = 4;

/// Attribute record header size in bytes.
pub const ATTR_HEADER_LEN: usize = 4;

/// Every attribute record and every frame is padded to this boundary.
pub const ALIGNTO: usize = 4;

/// Default maximum frame size.
pub const DEFAULT_MTU: usize = 8192;

/// `type_marker` of an error frame.
pub const ERROR_MARKER: u16 = 0x2;

/// `type_marker` of the frame ending a dump.
pub const DONE_MARKER: u16 = 0x3;

/// Lowest `type_marker` usable as a family id.
pub const MIN_FAMILY_ID: u16 = 0x10;

const ERROR_BODY_LEN: usize = 4 + FAMILY_HEADER_LEN;

/// Round `len` up to the record alignment.
pub const fn align(len: usize) -> usize {
    (len + ALIGNTO - 1) & !(ALIGNTO - 1)
}

/// Codec error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The buffer ends before the data it declares.
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes required by the declared lengths.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// A record or the frame end is off the 4-byte boundary.
    #[error("misaligned record at byte {offset}")]
    Misaligned {
        /// Position of the offending record or tail.
        offset: usize,
    },

    /// A declared length disagrees with the frame layout.
    #[error("length mismatch: declared {declared}, expected {expected}")]
    LengthMismatch {
        /// The length found in the frame.
        declared: usize,
        /// The length the layout requires.
        expected: usize,
    },

    /// The encoded frame would exceed the transport MTU.
    #[error("frame of {size} bytes exceeds the MTU of {mtu}")]
    TooLarge {
        /// Size of the encoded frame.
        size: usize,
        /// Configured MTU.
        mtu: usize,
    },

    /// Attribute type 0 never carries data.
    #[error("attribute type 0 is reserved")]
    ReservedAttribute,

    /// The payload does not fit the 16-bit record length.
    #[error("attribute {ty} payload of {len} bytes does not fit a record")]
    AttributeTooLarge {
        /// Attribute type.
        ty: AttrType,
        /// Payload length.
        len: usize,
    },

    /// Family ids below [`MIN_FAMILY_ID`] collide with frame markers.
    #[error("family id {0:#06x} is reserved for frame markers")]
    ReservedFamily(u16),
}

/// Fixed outer header of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub marker: u16,
    pub flags: u16,
    pub sequence: u32,
    pub origin: u32,
}

impl FrameHeader {
    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.marker.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.origin.to_le_bytes());
    }

    /// Parse the outer header without looking at the rest of the frame.
    ///
    /// # Errors
    ///
    /// Returns `Truncated` if the buffer is shorter than [`HEADER_LEN`].
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                needed: HEADER_LEN,
                have: buf.len(),
            });
        }
        Ok(Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            marker: u16::from_le_bytes([buf[4], buf[5]]),
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            sequence: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            origin: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// Bounds-checked walk over the attribute section of a frame.
///
/// Yields `(type, payload)` views. After the first error the cursor is
/// exhausted.
pub struct AttributeCursor<'a> {
    rest: &'a [u8],
    offset: usize,
}

impl<'a> AttributeCursor<'a> {
    fn new(section: &'a [u8], offset: usize) -> Self {
        Self {
            rest: section,
            offset,
        }
    }

    fn fail(&mut self, err: CodecError) -> Option<Result<(AttrType, &'a [u8]), CodecError>> {
        self.rest = &[];
        Some(Err(err))
    }
}

impl<'a> Iterator for AttributeCursor<'a> {
    type Item = Result<(AttrType, &'a [u8]), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < ATTR_HEADER_LEN {
            return self.fail(CodecError::Misaligned {
                offset: self.offset,
            });
        }

        let ty = u16::from_le_bytes([self.rest[0], self.rest[1]]);
        let record_len = u16::from_le_bytes([self.rest[2], self.rest[3]]) as usize;

        if record_len < ATTR_HEADER_LEN {
            return self.fail(CodecError::LengthMismatch {
                declared: record_len,
                expected: ATTR_HEADER_LEN,
            });
        }
        if record_len > self.rest.len() {
            return self.fail(CodecError::Truncated {
                needed: self.offset + record_len,
                have: self.offset + self.rest.len(),
            });
        }
        let padded = align(record_len);
        if padded > self.rest.len() {
            return self.fail(CodecError::Misaligned {
                offset: self.offset,
            });
        }

        let payload = &self.rest[ATTR_HEADER_LEN..record_len];
        self.rest = &self.rest[padded..];
        self.offset += padded;
        Some(Ok((ty, payload)))
    }
}

/// Serialize a message into one frame.
///
/// Error and done frames never carry attributes; any attributes on such a
/// message are not written.
///
/// # Errors
///
/// - `TooLarge`: the frame exceeds `mtu`
/// - `ReservedAttribute`: an attribute uses type 0
/// - `AttributeTooLarge`: a payload does not fit a record
/// - `ReservedFamily`: the family id collides with a frame marker
pub fn encode(message: &Message, mtu: usize) -> Result<Vec<u8>, CodecError> {
    let (marker, body_len) = match message.kind {
        MessageKind::Error(_) => (ERROR_MARKER, ERROR_BODY_LEN),
        MessageKind::Done => (DONE_MARKER, FAMILY_HEADER_LEN),
        MessageKind::Family(id) => {
            if id < MIN_FAMILY_ID {
                return Err(CodecError::ReservedFamily(id));
            }
            let mut len = FAMILY_HEADER_LEN;
            for attr in &message.attributes {
                if attr.ty() == 0 {
                    return Err(CodecError::ReservedAttribute);
                }
                let record_len = ATTR_HEADER_LEN + attr.payload().len();
                if record_len > u16::MAX as usize {
                    return Err(CodecError::AttributeTooLarge {
                        ty: attr.ty(),
                        len: attr.payload().len(),
                    });
                }
                len += align(record_len);
            }
            (id, len)
        }
    };

    let total = HEADER_LEN + body_len;
    if total > mtu {
        return Err(CodecError::TooLarge { size: total, mtu });
    }

    let mut buf = Vec::with_capacity(total);
    FrameHeader {
        length: total as u32,
        marker,
        flags: message.flags.bits(),
        sequence: message.sequence,
        origin: message.origin,
    }
    .write(&mut buf);

    if let MessageKind::Error(code) = message.kind {
        buf.extend_from_slice(&code.to_le_bytes());
    }
    buf.extend_from_slice(&[message.command, message.version, 0, 0]);

    if let MessageKind::Family(_) = message.kind {
        for attr in &message.attributes {
            let record_len = ATTR_HEADER_LEN + attr.payload().len();
            buf.extend_from_slice(&attr.ty().to_le_bytes());
            buf.extend_from_slice(&(record_len as u16).to_le_bytes());
            buf.extend_from_slice(attr.payload());
            buf.resize(buf.len() + align(record_len) - record_len, 0);
        }
    }

    debug_assert_eq!(buf.len(), total);
    Ok(buf)
}

/// Deserialize exactly one frame.
///
/// # Errors
///
/// - `Truncated`: the buffer ends before the header or the declared length,
///   or a record reads past the end
/// - `LengthMismatch`: the declared length disagrees with the buffer or the
///   frame layout
/// - `Misaligned`: the frame or a record is off the 4-byte boundary
/// - `ReservedFamily`: the marker is below [`MIN_FAMILY_ID`] but is not a
///   known frame marker
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    let header = FrameHeader::parse(buf)?;
    let total = header.length as usize;

    if total < HEADER_LEN + FAMILY_HEADER_LEN {
        return Err(CodecError::LengthMismatch {
            declared: total,
            expected: HEADER_LEN + FAMILY_HEADER_LEN,
        });
    }
    if buf.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            have: buf.len(),
        });
    }
    if buf.len() > total {
        return Err(CodecError::LengthMismatch {
            declared: total,
            expected: buf.len(),
        });
    }
    if total % ALIGNTO != 0 {
        return Err(CodecError::Misaligned { offset: total });
    }

    let body = &buf[HEADER_LEN..total];
    let (kind, family_header, attributes) = match header.marker {
        ERROR_MARKER => {
            if body.len() != ERROR_BODY_LEN {
                return Err(CodecError::LengthMismatch {
                    declared: total,
                    expected: HEADER_LEN + ERROR_BODY_LEN,
                });
            }
            let code = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            (MessageKind::Error(code), &body[4..], Attributes::new())
        }
        DONE_MARKER => {
            if body.len() != FAMILY_HEADER_LEN {
                return Err(CodecError::LengthMismatch {
                    declared: total,
                    expected: HEADER_LEN + FAMILY_HEADER_LEN,
                });
            }
            (MessageKind::Done, body, Attributes::new())
        }
        id if id < MIN_FAMILY_ID => return Err(CodecError::ReservedFamily(id)),
        id => {
            let section = &body[FAMILY_HEADER_LEN..];
            let attributes = AttributeCursor::new(section, HEADER_LEN + FAMILY_HEADER_LEN)
                .map(|record| record.map(|(ty, payload)| Attribute::new(ty, payload)))
                .collect::<Result<Attributes, CodecError>>()?;
            (MessageKind::Family(id), &body[..FAMILY_HEADER_LEN], attributes)
        }
    };

    Ok(Message {
        kind,
        flags: Flags::from_bits(header.flags),
        sequence: header.sequence,
        origin: header.origin,
        command: family_header[0],
        version: family_header[1],
        attributes,
    })
}
