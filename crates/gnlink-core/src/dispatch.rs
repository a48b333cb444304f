//! Request dispatch.
//!
//! [`Dispatcher::dispatch`] turns one decoded request into the replies it
//! produces. Every failure becomes an error frame; nothing is propagated to
//! the caller. Streaming commands keep their [`StreamSession`] in a per-origin
//! table, so a repeated request from the same origin for the same
//! family/command yields the next part of the dump.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::codec::CodecError;
use crate::family::{Family, Handler, OneShotHandler, StreamHandler};
use crate::message::{errno, FamilyId, Flags, Message};
use crate::policy::{self, PolicyViolation};
use crate::registry::Registry;
use crate::session::{Produced, SessionError, SessionOwner, StreamSession, StreamSessionManager};

/// Why a request could not be served.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown family {0:#06x}")]
    UnknownFamily(FamilyId),

    #[error("family {family:#06x} has no command {command}")]
    UnknownCommand { family: FamilyId, command: u8 },

    #[error("frame is not a family request")]
    InvalidRequest,

    #[error("policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    #[error("handler failed with status {0}")]
    HandlerFailed(i32),

    #[error("stream session: {0}")]
    Session(#[from] SessionError),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

impl DispatchError {
    /// Negative errno-style code carried by the error frame.
    pub fn errno(&self) -> i32 {
        match self {
            DispatchError::UnknownFamily(_) => -errno::ENOENT,
            DispatchError::UnknownCommand { .. } => -errno::EOPNOTSUPP,
            DispatchError::InvalidRequest
            | DispatchError::Policy(_)
            | DispatchError::Codec(_) => -errno::EINVAL,
            DispatchError::HandlerFailed(status) => *status,
            DispatchError::Session(err) => err.errno(),
        }
    }
}

/// Routes requests to family handlers and owns the stream sessions.
pub struct Dispatcher {
    registry: Registry,
    sessions: StreamSessionManager,
    active: Mutex<HashMap<u32, StreamSession>>,
}

impl Dispatcher {
    pub fn new(registry: Registry, sessions: StreamSessionManager) -> Self {
        Self {
            registry,
            sessions,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sessions(&self) -> &StreamSessionManager {
        &self.sessions
    }

    fn active(&self) -> MutexGuard<'_, HashMap<u32, StreamSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `origin` has an unfinished dump.
    pub fn has_session(&self, origin: u32) -> bool {
        self.active().contains_key(&origin)
    }

    /// Serve one request. Returns zero or more replies, in send order.
    pub async fn dispatch(&self, request: &Message) -> Vec<Message> {
        match self.try_dispatch(request).await {
            Ok(reply) => reply.into_iter().collect(),
            Err(err) => {
                debug!(
                    origin = request.origin,
                    sequence = request.sequence,
                    command = request.command,
                    error = %err,
                    "request failed"
                );
                vec![Message::error_reply(request, err.errno())]
            }
        }
    }

    /// Drop the unfinished dump of `origin`, if any. The stream handler's
    /// `done` still runs. Returns whether a session was dropped.
    pub fn abort(&self, origin: u32) -> bool {
        let session = self.active().remove(&origin);
        match session {
            Some(session) => {
                info!(origin, family = session.owner().family, "aborting stream session");
                drop(session);
                true
            }
            None => false,
        }
    }

    async fn try_dispatch(&self, request: &Message) -> Result<Option<Message>, DispatchError> {
        if let Some(reply) = self.continue_session(request) {
            return Ok(Some(reply));
        }

        let family_id = request.family().ok_or(DispatchError::InvalidRequest)?;
        let family = self
            .registry
            .get(family_id)
            .ok_or(DispatchError::UnknownFamily(family_id))?;
        let command = family
            .command(request.command)
            .ok_or(DispatchError::UnknownCommand {
                family: family_id,
                command: request.command,
            })?
            .clone();
        policy::validate(&request.attributes, family.schema(), command.validation())?;

        match command.handler() {
            Handler::OneShot(handler) => one_shot(handler.as_ref(), request, family_id, &family),
            Handler::Streaming(handler) => self
                .start_session(handler.clone(), request, family_id, &family)
                .await
                .map(Some),
        }
    }

    /// Produce the next part if `request` continues the origin's dump.
    ///
    /// The session is taken out of the map while its handler runs.
    fn continue_session(&self, request: &Message) -> Option<Message> {
        let mut session = {
            let mut active = self.active();
            if !active.get(&request.origin)?.owner().continues(request) {
                return None;
            }
            active.remove(&request.origin)?
        };
        match session.produce() {
            Produced::Continue(part) => {
                let replaced = self.active().insert(request.origin, session);
                drop(replaced);
                Some(part)
            }
            Produced::Done(done) => Some(done),
        }
    }

    async fn start_session(
        &self,
        handler: std::sync::Arc<dyn StreamHandler>,
        request: &Message,
        family_id: FamilyId,
        family: &Family,
    ) -> Result<Message, DispatchError> {
        // A new dump from an origin replaces its unfinished one.
        self.abort(request.origin);

        let owner = SessionOwner::of(request, family_id, family.version());
        let mut session = self.sessions.start(owner, handler, request).await?;
        match session.produce() {
            Produced::Continue(part) => {
                let replaced = self.active().insert(request.origin, session);
                drop(replaced);
                Ok(part)
            }
            Produced::Done(done) => Ok(done),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("sessions", &self.sessions)
            .field("active", &self.active().len())
            .finish()
    }
}

fn one_shot(
    handler: &dyn OneShotHandler,
    request: &Message,
    family_id: FamilyId,
    family: &Family,
) -> Result<Option<Message>, DispatchError> {
    let result = handler.handle(request);
    if result.status < 0 {
        warn!(
            family = family.name(),
            command = request.command,
            status = result.status,
            "handler failed"
        );
        return Err(DispatchError::HandlerFailed(result.status));
    }
    if result.status == 0 && !request.flags.contains(Flags::ACK) {
        return Ok(None);
    }
    Ok(Some(Message::reply_to(
        request,
        family_id,
        family.version(),
        result.command.unwrap_or(request.command),
        result.attributes,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{Attribute, AttributeKind, Attributes};
    use crate::family::{Command, HandlerResult, SessionData, StreamPlan};
    use crate::session::SessionOptions;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, OnceLock, Weak};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Calls {
        one_shot: AtomicU32,
        done: AtomicU32,
    }

    struct Parts(Arc<Calls>);

    impl StreamHandler for Parts {
        fn start(&self, _request: &Message) -> Result<StreamPlan, i32> {
            Ok(StreamPlan::new(2).with_reply_command(1))
        }

        fn produce(&self, _data: &mut SessionData, index: u32) -> Attributes {
            Attributes::new().with(Attribute::u32(2, index))
        }

        fn done(&self, _data: &mut SessionData) {
            self.0.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (Dispatcher, FamilyId, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let counter = calls.clone();
        let family = Family::builder("test", 1)
            .attribute(1, AttributeKind::String)
            .command(Command::one_shot(1, move |request: &Message| {
                counter.one_shot.fetch_add(1, Ordering::SeqCst);
                HandlerResult::reply(request.attributes.clone())
            }))
            .command(Command::one_shot(2, |_: &Message| HandlerResult::ok()))
            .command(Command::one_shot(4, |_: &Message| HandlerResult::failed(errno::EINVAL)))
            .command(Command::streaming(3, Parts(calls.clone())))
            .build()
            .unwrap();
        let registry = Registry::new();
        let id = registry.register(family).unwrap();
        let sessions = StreamSessionManager::new(SessionOptions::default(), CancellationToken::new());
        (Dispatcher::new(registry, sessions), id, calls)
    }

    fn request(family: FamilyId, command: u8) -> Message {
        Message::request(family, command, 1)
            .with_origin(42)
            .with_sequence(10)
    }

    #[tokio::test]
    async fn test_one_shot_reply() {
        let (dispatcher, id, _) = setup();
        let req = request(id, 1).with_attribute(Attribute::string(1, "hi").unwrap());
        let replies = dispatcher.dispatch(&req).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].sequence, 11);
        assert_eq!(replies[0].origin, 42);
        assert_eq!(replies[0].attributes.get_str(1).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_unknown_family_and_command() {
        let (dispatcher, id, calls) = setup();
        let replies = dispatcher.dispatch(&request(0x7f, 1)).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].error_code(), Some(-errno::ENOENT));

        for command in [0, 9] {
            let replies = dispatcher.dispatch(&request(id, command)).await;
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].error_code(), Some(-errno::EOPNOTSUPP));
        }
        assert_eq!(calls.one_shot.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_policy_violation_skips_handler() {
        let (dispatcher, id, calls) = setup();
        let req = request(id, 1).with_attribute(Attribute::u8(7, 1));
        let replies = dispatcher.dispatch(&req).await;
        assert_eq!(replies[0].error_code(), Some(-errno::EINVAL));
        assert!(replies[0].attributes.is_empty());
        assert_eq!(calls.one_shot.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_silent_success_and_ack() {
        let (dispatcher, id, _) = setup();
        assert!(dispatcher.dispatch(&request(id, 2)).await.is_empty());

        let acked = request(id, 2).with_flags(Flags::REQUEST | Flags::ACK);
        let replies = dispatcher.dispatch(&acked).await;
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].is_error());
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_frame() {
        let (dispatcher, id, _) = setup();
        let replies = dispatcher.dispatch(&request(id, 4)).await;
        assert_eq!(replies[0].error_code(), Some(-errno::EINVAL));
        assert_eq!(replies[0].sequence, 10);
    }

    #[tokio::test]
    async fn test_error_frame_is_not_a_request() {
        let (dispatcher, _, _) = setup();
        let bogus = Message::error_reply(&request(0x20, 1), -1);
        let replies = dispatcher.dispatch(&bogus).await;
        assert_eq!(replies[0].error_code(), Some(-errno::EINVAL));
    }

    #[tokio::test]
    async fn test_stream_continue_until_done() {
        let (dispatcher, id, calls) = setup();
        let req = request(id, 3);

        let first = dispatcher.dispatch(&req).await;
        assert_eq!(first[0].sequence, 0);
        assert_eq!(first[0].command, 1);
        assert!(dispatcher.has_session(42));

        let second = dispatcher.dispatch(&req).await;
        assert_eq!(second[0].sequence, 1);

        let done = dispatcher.dispatch(&req).await;
        assert!(done[0].is_done());
        assert!(!dispatcher.has_session(42));
        assert_eq!(calls.done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_runs_done_once() {
        let (dispatcher, id, calls) = setup();
        dispatcher.dispatch(&request(id, 3)).await;
        assert!(dispatcher.abort(42));
        assert!(!dispatcher.abort(42));
        assert_eq!(calls.done.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.sessions().is_active());
    }

    #[tokio::test]
    async fn test_one_shot_does_not_disturb_dump() {
        let (dispatcher, id, _) = setup();
        dispatcher.dispatch(&request(id, 3)).await;
        let replies = dispatcher
            .dispatch(&request(id, 1).with_attribute(Attribute::string(1, "x").unwrap()))
            .await;
        assert!(!replies[0].is_error());
        let next = dispatcher.dispatch(&request(id, 3)).await;
        assert_eq!(next[0].sequence, 1);
    }

    struct Reentrant {
        dispatcher: Arc<OnceLock<Weak<Dispatcher>>>,
        unseen: Arc<AtomicU32>,
    }

    impl StreamHandler for Reentrant {
        fn start(&self, _request: &Message) -> Result<StreamPlan, i32> {
            Ok(StreamPlan::new(2))
        }

        fn produce(&self, _data: &mut SessionData, index: u32) -> Attributes {
            if let Some(dispatcher) = self.dispatcher.get().and_then(Weak::upgrade) {
                if !dispatcher.has_session(42) {
                    self.unseen.fetch_add(1, Ordering::SeqCst);
                }
                dispatcher.abort(7);
            }
            Attributes::new().with(Attribute::u32(2, index))
        }
    }

    #[tokio::test]
    async fn test_stream_handler_may_call_back_into_dispatcher() {
        let slot = Arc::new(OnceLock::new());
        let unseen = Arc::new(AtomicU32::new(0));
        let family = Family::builder("reentrant", 1)
            .command(Command::streaming(
                1,
                Reentrant {
                    dispatcher: slot.clone(),
                    unseen: unseen.clone(),
                },
            ))
            .build()
            .unwrap();
        let registry = Registry::new();
        let id = registry.register(family).unwrap();
        let sessions = StreamSessionManager::new(SessionOptions::default(), CancellationToken::new());
        let dispatcher = Arc::new(Dispatcher::new(registry, sessions));
        slot.set(Arc::downgrade(&dispatcher)).unwrap();

        let req = request(id, 1);
        assert_eq!(dispatcher.dispatch(&req).await[0].sequence, 0);
        assert_eq!(dispatcher.dispatch(&req).await[0].sequence, 1);
        assert!(dispatcher.dispatch(&req).await[0].is_done());
        // The running session is out of the map while it produces.
        assert_eq!(unseen.load(Ordering::SeqCst), 2);
    }
}
