//! Runner protocol endpoint and change-event publisher.
//!
//! The endpoint serves the request/reply side of the runner protocol on a
//! REP socket. It owns no scheduler state: every decoded request is handed
//! to the dispatcher over a channel together with a one-shot reply slot, so
//! requests are answered strictly in arrival order by a single serial
//! handler. Change events go out on a separate PUB socket.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use zeromq::{PubSocket, RepSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use kiln_kernel::message::{EVENT_CHANGED, Message};

use crate::scheduler::DispatcherEvent;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EndpointError {
    #[error("transport error: {0}")]
    Transport(#[from] zeromq::ZmqError),
}

// ---------------------------------------------------------------------------
// Change-event publication
// ---------------------------------------------------------------------------

/// Sink for the one-shot "queue changed" marker.
///
/// The dispatcher publishes through this trait so that tests can observe
/// events without a socket.
#[async_trait]
pub trait EventPublisher: Send {
    async fn publish(&mut self) -> Result<(), EndpointError>;
}

/// PUB-socket publisher; subscribers receive a fixed marker and re-query.
pub struct ZmqEventPublisher {
    socket: PubSocket,
}

impl ZmqEventPublisher {
    pub async fn bind(endpoint: &str) -> Result<Self, EndpointError> {
        let mut socket = PubSocket::new();
        socket.bind(endpoint).await?;
        tracing::info!(endpoint, "event publisher bound");
        Ok(Self { socket })
    }
}

#[async_trait]
impl EventPublisher for ZmqEventPublisher {
    async fn publish(&mut self) -> Result<(), EndpointError> {
        self.socket.send(ZmqMessage::from(EVENT_CHANGED)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request/reply endpoint
// ---------------------------------------------------------------------------

/// The REP side of the runner protocol.
pub struct RunnerEndpoint {
    socket: RepSocket,
}

impl RunnerEndpoint {
    pub async fn bind(endpoint: &str) -> Result<Self, EndpointError> {
        let mut socket = RepSocket::new();
        socket.bind(endpoint).await?;
        tracing::info!(endpoint, "runner endpoint bound");
        Ok(Self { socket })
    }

    /// Receive, decode, dispatch, reply — until the dispatcher goes away.
    ///
    /// Failures never take the endpoint down: an undecodable message is
    /// logged and dropped without a reply, and an I/O error only loses the
    /// affected request.
    pub async fn serve(mut self, dispatcher: mpsc::Sender<DispatcherEvent>) {
        loop {
            let raw = match self.socket.recv().await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(error = %e, "endpoint receive failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };

            let text: String = match raw.try_into() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "received non-text message");
                    continue;
                }
            };

            let message = match Message::decode(&text) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, raw = %text, "received invalid message");
                    continue;
                }
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            if dispatcher
                .send(DispatcherEvent::Request { message, reply: reply_tx })
                .await
                .is_err()
            {
                // Dispatcher stopped; shut the endpoint down with it.
                return;
            }

            match reply_rx.await {
                Ok(Some(reply)) => match reply.encode() {
                    Ok(encoded) => {
                        if let Err(e) = self.socket.send(ZmqMessage::from(encoded)).await {
                            tracing::warn!(error = %e, "could not send reply");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "could not encode reply"),
                },
                Ok(None) => tracing::warn!("request dropped without reply"),
                Err(_) => return,
            }
        }
    }
}
