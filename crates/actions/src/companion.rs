//! Companion link: request/reply messaging with the paired device.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    dashmap::DashMap,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::{mpsc, oneshot},
    tracing::{debug, warn},
    uuid::Uuid,
};

use crate::{error::LinkError, reachability::LinkReachability};

/// Message identifier for firing an action on the paired device.
pub const ACTION_ROW_PRESSED: &str = "ActionRowPressed";

/// Sends one message and waits for its single reply.
#[async_trait]
pub trait CompanionLink: Send + Sync {
    /// Must give up with [`LinkError::Timeout`] once `timeout` has elapsed.
    async fn send_message(
        &self,
        identifier: &str,
        content: Value,
        timeout: Duration,
    ) -> Result<Value, LinkError>;
}

/// A frame on the wire between the two devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkFrame {
    Message {
        id: String,
        identifier: String,
        content: Value,
    },
    Reply {
        id: String,
        #[serde(default)]
        content: Value,
    },
}

/// [`CompanionLink`] over a frame channel owned by the connection task.
/// Replies are matched to requests by frame id.
pub struct PeerLink {
    outbound: mpsc::Sender<LinkFrame>,
    pending: DashMap<String, oneshot::Sender<Value>>,
    reachability: Arc<LinkReachability>,
}

impl PeerLink {
    pub fn new(outbound: mpsc::Sender<LinkFrame>) -> Self {
        Self {
            outbound,
            pending: DashMap::new(),
            reachability: Arc::new(LinkReachability::default()),
        }
    }

    /// Reachability reported by this link, for the dispatcher.
    pub fn reachability(&self) -> Arc<LinkReachability> {
        Arc::clone(&self.reachability)
    }

    pub fn connected(&self) {
        debug!("companion link connected");
        self.reachability.set(true);
    }

    /// Mark the peer gone and fail every outstanding request.
    pub fn disconnected(&self) {
        let outstanding = self.pending.len();
        self.reachability.set(false);
        self.pending.clear();
        debug!(outstanding, "companion link disconnected");
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Feed a frame received from the peer.
    pub fn handle_frame(&self, frame: LinkFrame) -> Result<(), LinkError> {
        match frame {
            LinkFrame::Reply { id, content } => {
                let (_, tx) = self
                    .pending
                    .remove(&id)
                    .ok_or_else(|| LinkError::UnknownReply(id.clone()))?;
                if tx.send(content).is_err() {
                    debug!(%id, "reply arrived after the requester gave up");
                }
                Ok(())
            },
            LinkFrame::Message { identifier, .. } => {
                warn!(%identifier, "ignoring unsolicited companion message");
                Ok(())
            },
        }
    }

    /// Parse and feed a raw JSON frame.
    pub fn handle_text(&self, text: &str) -> Result<(), LinkError> {
        let frame: LinkFrame = serde_json::from_str(text)?;
        self.handle_frame(frame)
    }
}

/// Drops the pending entry when the request finishes or is abandoned.
struct PendingReply<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Value>>,
    id: String,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[async_trait]
impl CompanionLink for PeerLink {
    async fn send_message(
        &self,
        identifier: &str,
        content: Value,
        timeout: Duration,
    ) -> Result<Value, LinkError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let _entry = PendingReply {
            pending: &self.pending,
            id: id.clone(),
        };

        debug!(%id, %identifier, "sending companion message");
        self.outbound
            .send(LinkFrame::Message {
                id,
                identifier: identifier.to_string(),
                content,
            })
            .await
            .map_err(|_| LinkError::Closed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Err(_) => Err(LinkError::Timeout),
        }
    }
}
