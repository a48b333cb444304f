//! Families, commands and the handler traits they bind.
//!
//! A [`Family`] is built once with [`FamilyBuilder`] and is immutable after
//! that. Each [`Command`] is either one-shot or streaming, fixed at
//! construction.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::attr::{AttrType, Attributes, AttributeKind};
use crate::message::{errno, Message};
use crate::policy::{AttributeSchema, Validation};

/// Longest accepted family name, in bytes.
pub const MAX_NAME_LEN: usize = 15;

/// Outcome of a one-shot handler.
///
/// A negative `status` produces an error frame; a positive one produces a
/// reply; zero produces a reply only if the request asked for an ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResult {
    pub status: i32,
    pub attributes: Attributes,
    /// Command id for the reply. Defaults to the request's command.
    pub command: Option<u8>,
}

impl HandlerResult {
    /// Reply with the given attributes.
    pub fn reply(attributes: Attributes) -> Self {
        Self {
            status: 1,
            attributes,
            command: None,
        }
    }

    /// Succeed silently.
    pub fn ok() -> Self {
        Self {
            status: 0,
            attributes: Attributes::new(),
            command: None,
        }
    }

    /// Fail with an errno-style code. Positive codes are negated and `0`
    /// becomes `-EINVAL`.
    pub fn failed(code: i32) -> Self {
        Self {
            status: errno::negative(code),
            attributes: Attributes::new(),
            command: None,
        }
    }

    pub fn with_command(mut self, command: u8) -> Self {
        self.command = Some(command);
        self
    }

    pub fn is_failure(&self) -> bool {
        self.status < 0
    }
}

/// Handler for a command that answers with at most one reply.
pub trait OneShotHandler: Send + Sync {
    fn handle(&self, request: &Message) -> HandlerResult;
}

impl<F> OneShotHandler for F
where
    F: Fn(&Message) -> HandlerResult + Send + Sync,
{
    fn handle(&self, request: &Message) -> HandlerResult {
        self(request)
    }
}

/// Opaque state owned by one stream session.
pub type SessionData = Box<dyn Any + Send>;

/// What a stream handler hands back from `start`.
pub struct StreamPlan {
    pub total: u32,
    pub data: SessionData,
    /// Command id for the parts. Defaults to the request's command.
    pub reply_command: Option<u8>,
}

impl StreamPlan {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            data: Box::new(()),
            reply_command: None,
        }
    }

    pub fn with_data<T: Any + Send>(mut self, data: T) -> Self {
        self.data = Box::new(data);
        self
    }

    pub fn with_reply_command(mut self, command: u8) -> Self {
        self.reply_command = Some(command);
        self
    }
}

impl std::fmt::Debug for StreamPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPlan")
            .field("total", &self.total)
            .field("reply_command", &self.reply_command)
            .finish_non_exhaustive()
    }
}

/// Handler for a command that answers with a bounded sequence of parts.
pub trait StreamHandler: Send + Sync {
    /// Plan the dump. Runs with the session lock held. An `Err` carries an
    /// errno-style code.
    fn start(&self, request: &Message) -> Result<StreamPlan, i32>;

    /// Attributes of part `index` (0-based).
    fn produce(&self, data: &mut SessionData, index: u32) -> Attributes;

    /// Runs exactly once per started session, including aborted ones.
    fn done(&self, _data: &mut SessionData) {}
}

/// The handler bound to a command.
#[derive(Clone)]
pub enum Handler {
    OneShot(Arc<dyn OneShotHandler>),
    Streaming(Arc<dyn StreamHandler>),
}

/// One entry of a family's command table.
#[derive(Clone)]
pub struct Command {
    id: u8,
    handler: Handler,
    validation: Validation,
}

impl Command {
    pub fn one_shot(id: u8, handler: impl OneShotHandler + 'static) -> Self {
        Self {
            id,
            handler: Handler::OneShot(Arc::new(handler)),
            validation: Validation::Strict,
        }
    }

    pub fn streaming(id: u8, handler: impl StreamHandler + 'static) -> Self {
        Self {
            id,
            handler: Handler::Streaming(Arc::new(handler)),
            validation: Validation::Strict,
        }
    }

    /// Skip unknown attributes instead of rejecting the request.
    pub fn relaxed(mut self) -> Self {
        self.validation = Validation::Relaxed;
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn validation(&self) -> Validation {
        self.validation
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.handler, Handler::Streaming(_))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("streaming", &self.is_streaming())
            .field("validation", &self.validation)
            .finish()
    }
}

/// Errors from building a family.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FamilyError {
    #[error("family name must be 1..={MAX_NAME_LEN} bytes, got {0:?}")]
    InvalidName(String),

    #[error("command id 0 is reserved")]
    ReservedCommand,

    #[error("command {0} is bound twice")]
    DuplicateCommand(u8),
}

/// A protocol namespace: name, version, schema and command table.
#[derive(Debug)]
pub struct Family {
    name: String,
    version: u8,
    schema: AttributeSchema,
    commands: BTreeMap<u8, Command>,
}

impl Family {
    pub fn builder(name: impl Into<String>, version: u8) -> FamilyBuilder {
        FamilyBuilder {
            name: name.into(),
            version,
            schema: AttributeSchema::new(),
            commands: Vec::new(),
        }
    }

    /// Assemble a family from parts already known to be well-formed.
    pub(crate) fn from_parts(
        name: &str,
        version: u8,
        schema: AttributeSchema,
        commands: impl IntoIterator<Item = Command>,
    ) -> Self {
        Self {
            name: name.to_string(),
            version,
            schema,
            commands: commands.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    /// Look up a bound command. Command 0 is never bound.
    pub fn command(&self, id: u8) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }
}

/// Builder for [`Family`].
pub struct FamilyBuilder {
    name: String,
    version: u8,
    schema: AttributeSchema,
    commands: Vec<Command>,
}

impl FamilyBuilder {
    pub fn attribute(mut self, ty: AttrType, kind: AttributeKind) -> Self {
        self.schema.insert(ty, kind);
        self
    }

    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn build(self) -> Result<Family, FamilyError> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN || self.name.contains('\0') {
            return Err(FamilyError::InvalidName(self.name));
        }
        let mut commands = BTreeMap::new();
        for command in self.commands {
            if command.id == 0 {
                return Err(FamilyError::ReservedCommand);
            }
            let id = command.id;
            if commands.insert(id, command).is_some() {
                return Err(FamilyError::DuplicateCommand(id));
            }
        }
        Ok(Family {
            name: self.name,
            version: self.version,
            schema: self.schema,
            commands,
        })
    }
}
