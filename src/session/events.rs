use super::SessionId;
use crate::context::SessionContext;
use crate::core::{Result, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A side-effect notification queued on a session until its transaction
/// commits. The payload is opaque; consumers downcast it.
#[derive(Clone)]
pub struct PostCommitEvent {
    type_name: &'static str,
    queued_at: DateTime<Utc>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl PostCommitEvent {
    pub fn new<E>(event: E) -> Self
    where
        E: Any + Send + Sync,
    {
        Self {
            type_name: std::any::type_name::<E>(),
            queued_at: Utc::now(),
            payload: Arc::new(event),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn queued_at(&self) -> DateTime<Utc> {
        self.queued_at
    }

    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }

    pub fn is<E: Any>(&self) -> bool {
        self.payload.is::<E>()
    }
}

impl fmt::Debug for PostCommitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostCommitEvent")
            .field("type", &self.type_name)
            .field("queued_at", &self.queued_at)
            .finish()
    }
}

/// Events released by a successful commit, in registration order.
#[derive(Debug, Clone)]
pub struct CommittedEvents {
    session: SessionId,
    events: Vec<PostCommitEvent>,
}

impl CommittedEvents {
    pub(crate) fn new(session: SessionId, events: Vec<PostCommitEvent>) -> Self {
        Self { session, events }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PostCommitEvent> {
        self.events.iter()
    }

    /// Hands every event to `bus` in order. A failed publish is logged and
    /// the remaining events are still delivered; the transaction that
    /// produced them is already committed.
    pub(crate) async fn dispatch(self, ctx: &SessionContext, bus: Option<&Arc<dyn EventBus>>) {
        if self.events.is_empty() {
            return;
        }
        let Some(bus) = bus else {
            debug!(
                parent: ctx.span(),
                session = %self.session,
                events = self.events.len(),
                "no event bus configured, dropping committed events"
            );
            return;
        };

        for event in &self.events {
            if let Err(err) = bus.publish(ctx, event).await {
                error!(
                    parent: ctx.span(),
                    session = %self.session,
                    event = event.type_name(),
                    error = %err,
                    "failed to publish post-commit event"
                );
            }
        }
    }
}

impl IntoIterator for CommittedEvents {
    type Item = PostCommitEvent;
    type IntoIter = std::vec::IntoIter<PostCommitEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

/// Destination of committed events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, ctx: &SessionContext, event: &PostCommitEvent) -> Result<()>;
}

/// Forwards committed events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelEventBus {
    sender: mpsc::UnboundedSender<PostCommitEvent>,
}

impl ChannelEventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PostCommitEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn publish(&self, _ctx: &SessionContext, event: &PostCommitEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| StoreError::Other(anyhow::anyhow!("event receiver dropped")))
    }
}
