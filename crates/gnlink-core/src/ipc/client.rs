//! Requester side of the protocol.
//!
//! A [`Client`] owns one transport endpoint and talks to one responder port.
//! It runs one conversation at a time, which the `&mut self` receivers
//! enforce. Frames are matched to the request by sequence number, so a late
//! answer to an abandoned request is dropped instead of being returned for
//! the next one.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::transport::{Transport, TransportError};
use crate::attr::{Attribute, AttributeError};
use crate::codec::{self, CodecError};
use crate::control::{self, FamilyInfo};
use crate::message::{errno, FamilyId, Flags, Message};

/// Default time to wait for a reply, or for each part of a dump.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("responder returned error {code}")]
    Remote { code: i32 },

    #[error("family {0:?} is not registered")]
    FamilyNotFound(String),

    #[error("malformed reply: {0}")]
    Attribute(#[from] AttributeError),

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

pub struct Client<T: Transport> {
    transport: T,
    responder: u32,
    mtu: usize,
    sequence: u32,
    reply_timeout: Duration,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, responder: u32, mtu: usize) -> Self {
        Self {
            transport,
            responder,
            mtu,
            sequence: 0,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn local_port(&self) -> u32 {
        self.transport.local_port()
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    async fn send(&mut self, message: Message) -> Result<u32, ClientError> {
        let sequence = self.next_sequence();
        let message = message
            .with_sequence(sequence)
            .with_origin(self.transport.local_port());
        let bytes = codec::encode(&message, self.mtu)?;
        self.transport.send(bytes, self.responder).await?;
        debug!(
            sequence,
            kind = %message.kind,
            command = message.command,
            "sent request"
        );
        Ok(sequence)
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.reply_timeout
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Message, ClientError> {
        let datagram = tokio::time::timeout_at(deadline, self.transport.receive())
            .await
            .map_err(|_| ClientError::Timeout(self.reply_timeout))??;
        Ok(codec::decode(&datagram.payload)?)
    }

    /// Send a request that expects exactly one answer.
    ///
    /// The ACK flag is always set so that silent success still produces a
    /// reply. An error frame becomes [`ClientError::Remote`].
    pub async fn request(&mut self, request: Message) -> Result<Message, ClientError> {
        let flags = request.flags | Flags::REQUEST | Flags::ACK;
        let sequence = self.send(request.with_flags(flags)).await?;
        let deadline = self.deadline();
        loop {
            let reply = self.receive(deadline).await?;
            match reply.error_code() {
                Some(code) if reply.sequence == sequence => {
                    return Err(ClientError::Remote { code });
                }
                None if answers(&reply, sequence) => return Ok(reply),
                _ => discard(&reply, sequence),
            }
        }
    }

    /// Send a request without waiting for any answer.
    pub async fn notify(&mut self, request: Message) -> Result<(), ClientError> {
        let flags = request.flags | Flags::REQUEST;
        self.send(request.with_flags(flags)).await?;
        Ok(())
    }

    /// Start a dump and collect every part until the done frame.
    ///
    /// Parts must arrive in index order and belong to the requested family;
    /// the error or done frame must echo the request's sequence number.
    pub async fn dump(&mut self, request: Message) -> Result<Vec<Message>, ClientError> {
        let family = request.family();
        let flags = request.flags | Flags::REQUEST | Flags::DUMP;
        let sequence = self.send(request.with_flags(flags)).await?;
        let mut parts: Vec<Message> = Vec::new();
        let mut deadline = self.deadline();
        loop {
            let frame = self.receive(deadline).await?;
            if frame.sequence == sequence {
                if let Some(code) = frame.error_code() {
                    return Err(ClientError::Remote { code });
                }
                if frame.is_done() {
                    debug!(parts = parts.len(), "dump complete");
                    return Ok(parts);
                }
            }
            let next = u32::try_from(parts.len()).ok();
            if frame.flags.contains(Flags::MULTI)
                && frame.family().is_some()
                && frame.family() == family
                && Some(frame.sequence) == next
            {
                parts.push(frame);
                deadline = self.deadline();
            } else {
                discard(&frame, sequence);
            }
        }
    }

    /// Describe a family through the control family.
    pub async fn family_info(&mut self, name: &str) -> Result<FamilyInfo, ClientError> {
        let request = Message::request(
            control::CONTROL_FAMILY_ID,
            control::CMD_GET_FAMILY,
            control::CONTROL_VERSION,
        )
        .with_attribute(Attribute::string(control::ATTR_FAMILY_NAME, name)?);
        match self.request(request).await {
            Ok(reply) => Ok(FamilyInfo::from_attributes(&reply.attributes)?),
            Err(ClientError::Remote { code }) if code == -errno::ENOENT => {
                Err(ClientError::FamilyNotFound(name.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Look up the numeric id of a family by name.
    pub async fn resolve_family(&mut self, name: &str) -> Result<FamilyId, ClientError> {
        self.family_info(name).await.map(|info| info.id)
    }

    /// List every registered family.
    pub async fn list_families(&mut self) -> Result<Vec<FamilyInfo>, ClientError> {
        let request = Message::request(
            control::CONTROL_FAMILY_ID,
            control::CMD_LIST_FAMILIES,
            control::CONTROL_VERSION,
        );
        self.dump(request)
            .await?
            .iter()
            .map(|part| FamilyInfo::from_attributes(&part.attributes).map_err(Into::into))
            .collect()
    }
}

/// Whether `reply` is the normal answer to the request sent as `sequence`.
fn answers(reply: &Message, sequence: u32) -> bool {
    reply.family().is_some()
        && !reply.flags.contains(Flags::MULTI)
        && reply.sequence == sequence.wrapping_add(1)
}

/// Log and drop a frame that belongs to an earlier conversation.
fn discard(frame: &Message, sequence: u32) {
    debug!(
        expected = sequence,
        got = frame.sequence,
        kind = %frame.kind,
        "discarding stale frame"
    );
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("port", &self.transport.local_port())
            .field("responder", &self.responder)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}
