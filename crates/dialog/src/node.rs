//! Active nodes: live, tracked instances of a [`NodeTemplate`].

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::handler::{DialogHandler, Shared};
use crate::session::Session;
use crate::template::NodeTemplate;

/// Unique identifier of an active node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of an active node.
///
/// ```text
/// Inactive ──track──► Active ──close──► Closing ──► Closed
///     │                                               ▲
///     └──────────────── session cascade ──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Constructed, not yet tracked.
    Inactive,
    /// Tracked: receives events and can expire.
    Active,
    /// Close actions are running.
    Closing,
    /// Terminal. Removed from every registry.
    Closed,
}

/// A runtime instance of a node template.
///
/// Shared as `Arc<ActiveNode>` between the handler registries, the session
/// it belongs to and any callbacks currently running on it.
pub struct ActiveNode {
    id: NodeId,
    template: Arc<NodeTemplate>,
    status: Mutex<NodeStatus>,
    expiry: Option<Instant>,
    activated_at: DateTime<Utc>,
    session: OnceLock<Arc<Session>>,
    handler: Mutex<Option<Weak<Shared>>>,
}

impl ActiveNode {
    /// Activate `template`, optionally against an existing session.
    ///
    /// The node starts `Inactive`; it only receives events once tracked.
    pub(crate) fn activate(
        template: Arc<NodeTemplate>,
        session: Option<Arc<Session>>,
    ) -> Arc<Self> {
        let expiry = template.expiry_from(Instant::now());
        let slot = OnceLock::new();
        if let Some(session) = session {
            let _ = slot.set(session);
        }
        Arc::new(Self {
            id: NodeId::new(),
            template,
            status: Mutex::new(NodeStatus::Inactive),
            expiry,
            activated_at: Utc::now(),
            session: slot,
            handler: Mutex::new(None),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn template(&self) -> &Arc<NodeTemplate> {
        &self.template
    }

    pub fn template_id(&self) -> &str {
        &self.template.id
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.status() == NodeStatus::Active
    }

    pub fn is_closed(&self) -> bool {
        self.status() == NodeStatus::Closed
    }

    /// Absolute expiry; `None` means the node never expires.
    pub fn expiry(&self) -> Option<Instant> {
        self.expiry
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }

    /// Time left before expiry, saturating at zero.
    pub fn time_left(&self) -> Option<Duration> {
        self.expiry
            .map(|expiry| expiry.saturating_duration_since(Instant::now()))
    }

    pub fn activated_at(&self) -> DateTime<Utc> {
        self.activated_at
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.get()
    }

    /// The handler tracking this node, while it is tracked.
    pub fn handler(&self) -> Option<DialogHandler> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
            .map(DialogHandler::from_shared)
    }

    /// Bind a session to a node that was activated without one.
    pub(crate) fn attach_session(&self, session: Arc<Session>) -> bool {
        self.session.set(session).is_ok()
    }

    /// `Inactive → Active`. Refused for any other state.
    pub(crate) fn begin_tracking(&self, handler: Weak<Shared>) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status != NodeStatus::Inactive {
            return false;
        }
        *status = NodeStatus::Active;
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        true
    }

    /// Move to `Closing`, returning the prior state.
    ///
    /// Callers only proceed with the close when the prior state was
    /// `Inactive` or `Active`; otherwise another close owns the node.
    pub(crate) fn begin_close(&self) -> NodeStatus {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let prior = *status;
        if matches!(prior, NodeStatus::Inactive | NodeStatus::Active) {
            *status = NodeStatus::Closing;
        }
        prior
    }

    pub(crate) fn mark_closed(&self) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = NodeStatus::Closed;
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for ActiveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveNode")
            .field("id", &self.id)
            .field("template", &self.template.id)
            .field("status", &self.status())
            .field("session", &self.session().map(|session| session.id()))
            .finish()
    }
}
