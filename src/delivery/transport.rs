use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::error::TransportError;
use crate::protocol::{Message, Response, SenderInfo, TabId};

/// Point-to-point channel to a page, one request and one response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to_destination(&self, id: TabId, message: Message) -> Result<Response, TransportError>;
}

/// A request as seen by the page: the message plus a way to answer it.
#[derive(Debug)]
pub struct InboundRequest {
    pub message: Message,
    pub sender: SenderInfo,
    pub respond: oneshot::Sender<Response>,
}

impl InboundRequest {
    pub fn reply(self, response: Response) {
        // Sender may have given up waiting.
        let _ = self.respond.send(response);
    }
}

const INBOX_CAPACITY: usize = 32;

/// In-process router from the coordinator to registered page inboxes.
#[derive(Default)]
pub struct LocalRouter {
    pages: RwLock<HashMap<TabId, mpsc::Sender<InboundRequest>>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page and return its inbox. Re-registering replaces the old inbox.
    pub fn register(&self, id: TabId) -> mpsc::Receiver<InboundRequest> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.pages.write().insert(id, tx);
        debug!("router registered tab {}", id);
        rx
    }

    pub fn unregister(&self, id: TabId) {
        self.pages.write().remove(&id);
    }

    pub fn is_registered(&self, id: TabId) -> bool {
        self.pages.read().contains_key(&id)
    }
}

#[async_trait]
impl Transport for LocalRouter {
    async fn send_to_destination(&self, id: TabId, message: Message) -> Result<Response, TransportError> {
        let inbox = self
            .pages
            .read()
            .get(&id)
            .cloned()
            .ok_or(TransportError::NoReceiver)?;

        let (respond, reply) = oneshot::channel();
        let request = InboundRequest {
            message,
            sender: SenderInfo::default(),
            respond,
        };
        inbox
            .send(request)
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        reply.await.map_err(|_| TransportError::PortClosed)
    }
}
