//! Responder: serves requests arriving on a [`Transport`].
//!
//! Each datagram is handled in its own task. A streaming request is drained
//! in that task: the dispatcher is re-invoked until the dump's done frame is
//! sent, so the requester only sends the initial request. If a send fails the
//! requester is treated as gone and its session is aborted.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{Datagram, Transport, TransportError};
use crate::attr::Attributes;
use crate::codec::{self, CodecError, FrameHeader};
use crate::dispatch::Dispatcher;
use crate::message::{errno, Flags, Message, MessageKind};

/// Serves a [`Dispatcher`] over a transport endpoint.
pub struct Responder<T: Transport> {
    transport: Arc<T>,
    dispatcher: Arc<Dispatcher>,
    mtu: usize,
    shutdown: CancellationToken,
}

impl<T: Transport> Responder<T> {
    pub fn new(
        transport: T,
        dispatcher: Arc<Dispatcher>,
        mtu: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            dispatcher,
            mtu,
            shutdown,
        }
    }

    pub fn local_port(&self) -> u32 {
        self.transport.local_port()
    }

    /// Run until the shutdown token fires or the transport closes.
    ///
    /// In-flight requests are allowed to finish before this returns.
    pub async fn serve(self) -> Result<(), TransportError> {
        info!(port = self.transport.local_port(), "responder listening");
        let mut tasks = JoinSet::new();
        let result = loop {
            let datagram = tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                received = self.transport.receive() => received,
            };
            match datagram {
                Ok(datagram) => {
                    let transport = Arc::clone(&self.transport);
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let mtu = self.mtu;
                    tasks.spawn(async move {
                        handle_datagram(transport.as_ref(), &dispatcher, mtu, datagram).await;
                    });
                }
                Err(TransportError::Closed) => break Ok(()),
                Err(err) => break Err(err),
            }
            // Reap finished tasks so the set does not grow without bound.
            while tasks.try_join_next().is_some() {}
        };
        while tasks.join_next().await.is_some() {}
        info!("responder stopped");
        result
    }
}

async fn handle_datagram<T: Transport>(
    transport: &T,
    dispatcher: &Dispatcher,
    mtu: usize,
    datagram: Datagram,
) {
    let Datagram { source, payload } = datagram;
    let mut request = match codec::decode(&payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(source, error = %err, "undecodable datagram");
            let reply = undecodable_reply(&payload, source);
            let _ = send(transport, &reply, mtu).await;
            return;
        }
    };
    // Replies go back to the endpoint that actually sent the datagram.
    request.origin = source;
    debug!(
        origin = source,
        sequence = request.sequence,
        kind = %request.kind,
        command = request.command,
        "request"
    );

    let mut replies = dispatcher.dispatch(&request).await;
    loop {
        let mut more = false;
        for reply in &replies {
            if let Err(err) = send(transport, reply, mtu).await {
                warn!(origin = source, error = %err, "reply not delivered");
                dispatcher.abort(source);
                return;
            }
            more = reply.flags.contains(Flags::MULTI) && !reply.is_done() && !reply.is_error();
        }
        if !more {
            break;
        }
        replies = dispatcher.dispatch(&request).await;
    }
}

/// Error frame answering a datagram that did not decode.
fn undecodable_reply(payload: &[u8], source: u32) -> Message {
    let sequence = FrameHeader::parse(payload).map(|h| h.sequence).unwrap_or(0);
    Message {
        kind: MessageKind::Error(-errno::EINVAL),
        flags: Flags::empty(),
        sequence,
        origin: source,
        command: 0,
        version: 0,
        attributes: Attributes::new(),
    }
}

#[derive(Debug, thiserror::Error)]
enum SendError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

async fn send<T: Transport>(transport: &T, reply: &Message, mtu: usize) -> Result<(), SendError> {
    let bytes = match codec::encode(reply, mtu) {
        Ok(bytes) => bytes,
        Err(err @ CodecError::TooLarge { .. }) => {
            // Tell the requester instead of leaving it waiting.
            warn!(origin = reply.origin, error = %err, "reply exceeds mtu");
            let error = Message::error_reply(reply, -errno::EMSGSIZE);
            transport.send(codec::encode(&error, mtu)?, reply.origin).await?;
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };
    transport.send(bytes, reply.origin).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::transport::MemoryBus;
    use crate::registry::Registry;
    use crate::session::{SessionOptions, StreamSessionManager};

    fn dispatcher() -> Arc<Dispatcher> {
        let sessions = StreamSessionManager::new(SessionOptions::default(), CancellationToken::new());
        Arc::new(Dispatcher::new(Registry::new(), sessions))
    }

    #[tokio::test]
    async fn test_garbage_gets_error_frame() {
        let bus = MemoryBus::default();
        let server = bus.bind(0).unwrap();
        let client = bus.bind_any().unwrap();
        let shutdown = CancellationToken::new();
        let responder = Responder::new(server, dispatcher(), codec::DEFAULT_MTU, shutdown.clone());
        let task = tokio::spawn(responder.serve());

        client.send(vec![1, 2, 3], 0).await.unwrap();
        let reply = client.receive().await.unwrap();
        let message = codec::decode(&reply.payload).unwrap();
        assert_eq!(message.error_code(), Some(-errno::EINVAL));

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[test]
    fn test_undecodable_reply_keeps_sequence_when_header_parses() {
        let mut frame = vec![0u8; 16];
        frame[8..12].copy_from_slice(&77u32.to_le_bytes());
        let reply = undecodable_reply(&frame, 5);
        assert_eq!(reply.sequence, 77);
        assert_eq!(reply.origin, 5);
        assert_eq!(undecodable_reply(&[0; 3], 5).sequence, 0);
    }
}
