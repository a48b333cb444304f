//! Stream ("dump") sessions.
//!
//! A [`StreamSessionManager`] owns one lock. Starting a session acquires it as
//! an owned guard that lives inside the returned [`StreamSession`], so at most
//! one session is active per manager and the lock is released exactly when
//! the session finishes or is dropped.
//!
//! ```text
//! Idle ──start──▶ Active ──produce (remaining == 0)──▶ Exhausted ──done──▶ Idle
//! ```

use std::sync::Arc;
use std::time::Duration;

use gnlink_config::{Contention, SessionConfig};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::family::{SessionData, StreamHandler};
use crate::message::{errno, Flags, FamilyId, Message, MessageKind};

/// What `start` does when another session holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentionPolicy {
    /// Wait until the lock is free, the manager is cancelled or the acquire
    /// timeout elapses.
    #[default]
    Block,
    /// Return [`SessionError::Busy`] immediately.
    FailFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub contention: ContentionPolicy,
    /// Upper bound on a blocking acquire. `None` waits until cancelled.
    pub acquire_timeout: Option<Duration>,
}

impl SessionOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            contention: match config.contention {
                Contention::Block => ContentionPolicy::Block,
                Contention::FailFast => ContentionPolicy::FailFast,
            },
            acquire_timeout: (config.acquire_timeout_ms > 0)
                .then(|| Duration::from_millis(config.acquire_timeout_ms)),
        }
    }
}

/// Errors from starting a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("another stream session holds the lock")]
    Busy,

    #[error("interrupted while waiting for the session lock")]
    Interrupted,

    #[error("stream handler refused to start (status {0})")]
    Rejected(i32),
}

impl SessionError {
    /// Negative errno-style code for an error frame.
    pub fn errno(&self) -> i32 {
        match self {
            SessionError::Busy => -errno::EBUSY,
            SessionError::Interrupted => -errno::EINTR,
            SessionError::Rejected(status) => errno::negative(*status),
        }
    }
}

/// Identity of the conversation a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOwner {
    pub family: FamilyId,
    pub command: u8,
    pub version: u8,
    pub origin: u32,
    /// Sequence number of the request that started the dump.
    pub sequence: u32,
}

impl SessionOwner {
    pub fn of(request: &Message, family: FamilyId, version: u8) -> Self {
        Self {
            family,
            command: request.command,
            version,
            origin: request.origin,
            sequence: request.sequence,
        }
    }

    /// Whether `request` continues this owner's conversation.
    pub fn continues(&self, request: &Message) -> bool {
        request.origin == self.origin
            && request.family() == Some(self.family)
            && request.command == self.command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Exhausted,
}

/// Result of one [`StreamSession::produce`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Produced {
    /// One part of the dump.
    Continue(Message),
    /// The terminating frame. The session is finished.
    Done(Message),
}

/// Hands out stream sessions under a single lock.
#[derive(Clone)]
pub struct StreamSessionManager {
    lock: Arc<Mutex<()>>,
    options: SessionOptions,
    cancel: CancellationToken,
}

impl StreamSessionManager {
    pub fn new(options: SessionOptions, cancel: CancellationToken) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            options,
            cancel,
        }
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Whether some session currently holds the lock.
    pub fn is_active(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Acquire the session lock and plan a dump for `request`.
    ///
    /// If the handler's `start` fails the lock is released again and its
    /// `done` is not called.
    pub async fn start(
        &self,
        owner: SessionOwner,
        handler: Arc<dyn StreamHandler>,
        request: &Message,
    ) -> Result<StreamSession, SessionError> {
        let guard = match self.options.contention {
            ContentionPolicy::FailFast => {
                self.lock.clone().try_lock_owned().map_err(|_| {
                    debug!(origin = owner.origin, "session lock busy");
                    SessionError::Busy
                })?
            }
            ContentionPolicy::Block => self.acquire().await?,
        };

        let plan = handler.start(request).map_err(|status| {
            warn!(
                family = owner.family,
                command = owner.command,
                status,
                "stream start rejected"
            );
            SessionError::Rejected(status)
        })?;
        debug!(
            family = owner.family,
            command = owner.command,
            origin = owner.origin,
            total = plan.total,
            "stream session started"
        );
        Ok(StreamSession {
            owner,
            handler,
            data: plan.data,
            total: plan.total,
            remaining: plan.total,
            reply_command: plan.reply_command.unwrap_or(owner.command),
            state: SessionState::Active,
            guard: Some(guard),
        })
    }

    async fn acquire(&self) -> Result<OwnedMutexGuard<()>, SessionError> {
        let lock = self.lock.clone().lock_owned();
        let wait = async {
            match self.options.acquire_timeout {
                Some(limit) => tokio::time::timeout(limit, lock).await.ok(),
                None => Some(lock.await),
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Interrupted),
            guard = wait => guard.ok_or(SessionError::Interrupted),
        }
    }
}

impl std::fmt::Debug for StreamSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSessionManager")
            .field("options", &self.options)
            .field("active", &self.is_active())
            .finish()
    }
}

/// One active dump. Holds the manager's lock until finished or dropped.
pub struct StreamSession {
    owner: SessionOwner,
    handler: Arc<dyn StreamHandler>,
    data: SessionData,
    total: u32,
    remaining: u32,
    reply_command: u8,
    state: SessionState,
    guard: Option<OwnedMutexGuard<()>>,
}

impl StreamSession {
    pub fn owner(&self) -> &SessionOwner {
        &self.owner
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Produce the next part, or the done frame once every part was sent.
    pub fn produce(&mut self) -> Produced {
        if self.state != SessionState::Active || self.remaining == 0 {
            if self.state == SessionState::Active {
                self.state = SessionState::Exhausted;
            }
            self.done();
            return Produced::Done(Message::done(
                self.owner.origin,
                self.owner.sequence,
                self.reply_command,
                self.owner.version,
            ));
        }
        self.remaining -= 1;
        let index = self.total - self.remaining - 1;
        debug!(
            origin = self.owner.origin,
            index,
            remaining = self.remaining,
            "stream part"
        );
        let attributes = self.handler.produce(&mut self.data, index);
        Produced::Continue(Message {
            kind: MessageKind::Family(self.owner.family),
            flags: Flags::MULTI,
            sequence: index,
            origin: self.owner.origin,
            command: self.reply_command,
            version: self.owner.version,
            attributes,
        })
    }

    /// Finish the session. Runs the handler's `done` and releases the lock
    /// the first time; later calls do nothing.
    pub fn done(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        self.handler.done(&mut self.data);
        self.guard.take();
        self.state = SessionState::Idle;
        debug!(
            origin = self.owner.origin,
            family = self.owner.family,
            "stream session finished"
        );
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.done();
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("total", &self.total)
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{Attribute, Attributes};
    use crate::family::StreamPlan;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        done_calls: AtomicU32,
    }

    impl StreamHandler for Counting {
        fn start(&self, request: &Message) -> Result<StreamPlan, i32> {
            match request.attributes.get(1) {
                Some(attr) => attr.as_u32().map(StreamPlan::new).map_err(|_| -errno::EINVAL),
                None => Err(-errno::EINVAL),
            }
        }

        fn produce(&self, _data: &mut SessionData, index: u32) -> Attributes {
            Attributes::new().with(Attribute::u32(2, index))
        }

        fn done(&self, _data: &mut SessionData) {
            self.done_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(total: u32, origin: u32) -> Message {
        Message::request(0x20, 3, 1)
            .with_origin(origin)
            .with_sequence(7)
            .with_attribute(Attribute::u32(1, total))
    }

    fn manager(contention: ContentionPolicy) -> StreamSessionManager {
        StreamSessionManager::new(
            SessionOptions {
                contention,
                acquire_timeout: None,
            },
            CancellationToken::new(),
        )
    }

    async fn start(
        manager: &StreamSessionManager,
        handler: &Arc<Counting>,
        total: u32,
        origin: u32,
    ) -> Result<StreamSession, SessionError> {
        let request = request(total, origin);
        let owner = SessionOwner::of(&request, 0x20, 1);
        manager.start(owner, handler.clone(), &request).await
    }

    #[tokio::test]
    async fn test_three_parts_then_done() {
        let manager = manager(ContentionPolicy::Block);
        let handler = Arc::new(Counting::default());
        let mut session = start(&manager, &handler, 3, 9).await.unwrap();
        assert!(manager.is_active());

        for expected in 0..3 {
            match session.produce() {
                Produced::Continue(part) => {
                    assert_eq!(part.sequence, expected);
                    assert_eq!(part.origin, 9);
                    assert!(part.flags.contains(Flags::MULTI));
                    assert_eq!(part.attributes.get_u32(2).unwrap(), expected);
                }
                Produced::Done(_) => panic!("finished early at part {expected}"),
            }
        }
        let Produced::Done(done) = session.produce() else {
            panic!("expected done after three parts");
        };
        assert!(done.is_done());
        assert_eq!(done.sequence, 7);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(handler.done_calls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_active());

        drop(session);
        assert_eq!(handler.done_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_total_is_done_immediately() {
        let manager = manager(ContentionPolicy::Block);
        let handler = Arc::new(Counting::default());
        let mut session = start(&manager, &handler, 0, 1).await.unwrap();
        assert!(matches!(session.produce(), Produced::Done(_)));
        assert_eq!(handler.done_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_runs_done_once() {
        let manager = manager(ContentionPolicy::Block);
        let handler = Arc::new(Counting::default());
        let mut session = start(&manager, &handler, 5, 1).await.unwrap();
        let _ = session.produce();
        session.done();
        session.done();
        drop(session);
        assert_eq!(handler.done_calls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_fail_fast_reports_busy() {
        let manager = manager(ContentionPolicy::FailFast);
        let handler = Arc::new(Counting::default());
        let first = start(&manager, &handler, 2, 1).await.unwrap();
        let err = start(&manager, &handler, 2, 2).await.unwrap_err();
        assert_eq!(err, SessionError::Busy);
        assert_eq!(err.errno(), -errno::EBUSY);
        drop(first);
        assert!(start(&manager, &handler, 2, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_block_waits_for_release() {
        let manager = manager(ContentionPolicy::Block);
        let handler = Arc::new(Counting::default());
        let first = start(&manager, &handler, 1, 1).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            let handler = handler.clone();
            tokio::spawn(async move { start(&manager, &handler, 1, 2).await.map(|s| s.owner().origin) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), Ok(2));
        assert_eq!(handler.done_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_block_interrupted_by_cancel() {
        let cancel = CancellationToken::new();
        let manager = StreamSessionManager::new(SessionOptions::default(), cancel.clone());
        let handler = Arc::new(Counting::default());
        let _first = start(&manager, &handler, 1, 1).await.unwrap();

        cancel.cancel();
        let err = start(&manager, &handler, 1, 2).await.unwrap_err();
        assert_eq!(err, SessionError::Interrupted);
        assert_eq!(err.errno(), -errno::EINTR);
    }

    #[tokio::test]
    async fn test_block_acquire_timeout() {
        let manager = StreamSessionManager::new(
            SessionOptions {
                contention: ContentionPolicy::Block,
                acquire_timeout: Some(Duration::from_millis(20)),
            },
            CancellationToken::new(),
        );
        let handler = Arc::new(Counting::default());
        let _first = start(&manager, &handler, 1, 1).await.unwrap();
        let err = start(&manager, &handler, 1, 2).await.unwrap_err();
        assert_eq!(err, SessionError::Interrupted);
    }

    #[tokio::test]
    async fn test_rejected_start_releases_lock() {
        let manager = manager(ContentionPolicy::FailFast);
        let handler = Arc::new(Counting::default());
        let bad = Message::request(0x20, 3, 1);
        let owner = SessionOwner::of(&bad, 0x20, 1);
        let err = manager.start(owner, handler.clone(), &bad).await.unwrap_err();
        assert_eq!(err, SessionError::Rejected(-errno::EINVAL));
        assert!(!manager.is_active());
        assert_eq!(handler.done_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejected_errno_is_negative() {
        assert_eq!(SessionError::Rejected(5).errno(), -5);
        assert_eq!(SessionError::Rejected(-5).errno(), -5);
        assert_eq!(SessionError::Rejected(0).errno(), -errno::EINVAL);
        assert_eq!(SessionError::Rejected(i32::MIN).errno(), i32::MIN);
    }

    #[test]
    fn test_options_from_config() {
        let config = SessionConfig {
            contention: Contention::FailFast,
            acquire_timeout_ms: 250,
        };
        let options = SessionOptions::from_config(&config);
        assert_eq!(options.contention, ContentionPolicy::FailFast);
        assert_eq!(options.acquire_timeout, Some(Duration::from_millis(250)));
        assert_eq!(
            SessionOptions::from_config(&SessionConfig::default()).acquire_timeout,
            None
        );
    }
}
