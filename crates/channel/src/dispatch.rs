//! Request/response dispatcher for the device command channel.
//!
//! Outgoing commands are posted through a [`DeviceTransport`]; responses
//! arrive asynchronously on an incoming frame stream and are matched back to
//! their caller through a pending table keyed by correlation id. A fixed
//! per-call bound guards against a device that never answers, and a
//! cancellation token lets a pipeline stop tear down an in-flight call
//! without leaking its table entry.

use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc::UnboundedReceiver, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::port::DevicePort;
use crate::protocol::{CommandRequest, ImageMatchRequest, ImageMatchResult, IncomingMessage, OutgoingMessage};

/// Response bound for dispatched commands.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingCommands = Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>;
type PendingMatch = Arc<Mutex<Option<oneshot::Sender<ImageMatchResult>>>>;

/// Outgoing seam implemented by the external connection to the device.
///
/// The transport only emits frames; incoming frames are pushed into the
/// dispatcher through the receiver handed to [`CommandDispatcher::new`].
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Emits one frame on the persistent connection.
    async fn send(&self, message: OutgoingMessage) -> anyhow::Result<()>;
}

/// Correlates command requests with their asynchronous responses.
///
/// One dispatcher serves one connection. Correlation ids come from a
/// monotonic counter; the background router task resolves pending callers as
/// frames arrive and logs unmatched or late frames at debug level.
pub struct CommandDispatcher {
    transport: Arc<dyn DeviceTransport>,
    pending: PendingCommands,
    pending_match: PendingMatch,
    id_counter: AtomicU64,
    response_timeout: Duration,
    router: JoinHandle<()>,
}

impl CommandDispatcher {
    /// Creates a dispatcher over the given transport and incoming stream,
    /// spawning the router task.
    pub fn new(transport: Arc<dyn DeviceTransport>, incoming: UnboundedReceiver<IncomingMessage>) -> Self {
        let pending: PendingCommands = Arc::new(Mutex::new(HashMap::new()));
        let pending_match: PendingMatch = Arc::new(Mutex::new(None));
        let router = spawn_router(Arc::clone(&pending), Arc::clone(&pending_match), incoming);
        Self {
            transport,
            pending,
            pending_match,
            id_counter: AtomicU64::new(1),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            router,
        }
    }

    /// Overrides the per-command response bound.
    pub fn with_response_timeout(mut self, bound: Duration) -> Self {
        self.response_timeout = bound;
        self
    }

    /// Number of commands currently awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn send_command(&self, command: &str, id: &str) -> Result<(), ChannelError> {
        let request = OutgoingMessage::Command(CommandRequest {
            command: command.to_string(),
            request_id: id.to_string(),
        });
        self.transport
            .send(request)
            .await
            .map_err(|error| ChannelError::Transport(error.to_string()))
    }
}

#[async_trait]
impl DevicePort for CommandDispatcher {
    async fn dispatch(&self, command: &str, cancel: &CancellationToken) -> Result<String, ChannelError> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Stopped);
        }

        let id = self.id_counter.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.pending.lock().await;
            table.insert(id.clone(), tx);
        }

        if let Err(error) = self.send_command(command, &id).await {
            take_pending(&self.pending, &id).await;
            return Err(error);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                take_pending(&self.pending, &id).await;
                Err(ChannelError::Stopped)
            }
            outcome = timeout(self.response_timeout, rx) => match outcome {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(_)) => {
                    take_pending(&self.pending, &id).await;
                    Err(ChannelError::Closed)
                }
                Err(_) => {
                    take_pending(&self.pending, &id).await;
                    Err(ChannelError::Timeout { after: self.response_timeout })
                }
            }
        }
    }

    async fn match_image(
        &self,
        template_path: &str,
        bound: Duration,
        cancel: &CancellationToken,
    ) -> Result<ImageMatchResult, ChannelError> {
        if cancel.is_cancelled() {
            return Err(ChannelError::Stopped);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.pending_match.lock().await;
            if slot.is_some() {
                return Err(ChannelError::MatchBusy);
            }
            *slot = Some(tx);
        }

        let request = OutgoingMessage::ImageMatch(ImageMatchRequest {
            template_path: template_path.to_string(),
            timeout_ms: u64::try_from(bound.as_millis()).unwrap_or(u64::MAX),
        });
        if let Err(error) = self.transport.send(request).await {
            self.pending_match.lock().await.take();
            return Err(ChannelError::Transport(error.to_string()));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.pending_match.lock().await.take();
                Err(ChannelError::Stopped)
            }
            outcome = timeout(bound, rx) => match outcome {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_)) => {
                    self.pending_match.lock().await.take();
                    Err(ChannelError::Closed)
                }
                Err(_) => {
                    self.pending_match.lock().await.take();
                    Err(ChannelError::Timeout { after: bound })
                }
            }
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Spawns the task that resolves pending callers as frames arrive.
fn spawn_router(pending: PendingCommands, pending_match: PendingMatch, mut incoming: UnboundedReceiver<IncomingMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = incoming.recv().await {
            match message {
                IncomingMessage::CommandOutput { request_id, output } => {
                    if let Some(tx) = take_pending(&pending, &request_id).await {
                        if tx.send(output).is_err() {
                            tracing::debug!(target: "rig_channel", "caller for id={} went away before the response", request_id);
                        }
                    } else {
                        tracing::debug!(target: "rig_channel", "unmatched response for id={}", request_id);
                    }
                }
                IncomingMessage::CommandDebug { request_id, message } => {
                    // Informational only; the pending call stays open.
                    tracing::debug!(target: "rig_channel", "debug frame for id={}: {}", request_id, message);
                }
                IncomingMessage::ImageMatch(result) => {
                    if let Some(tx) = pending_match.lock().await.take() {
                        if tx.send(result).is_err() {
                            tracing::debug!(target: "rig_channel", "match caller went away before the result");
                        }
                    } else {
                        tracing::debug!(target: "rig_channel", "image match result with no match in flight");
                    }
                }
            }
        }
        tracing::debug!(target: "rig_channel", "incoming stream closed; router exiting");
    })
}

/// Atomically removes a pending command sender from the table.
async fn take_pending(pending: &PendingCommands, id: &str) -> Option<oneshot::Sender<String>> {
    let mut table = pending.lock().await;
    table.remove(id)
}
