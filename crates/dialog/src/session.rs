//! Sessions: groups of active nodes whose lifetimes are linked.
//!
//! A session does not own its members. It only remembers them so that the
//! whole group can be closed once none of them is active any more.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::node::{ActiveNode, NodeId, NodeStatus};

/// Unique identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct SessionState {
    members: Vec<Arc<ActiveNode>>,
    closed: bool,
    data: Map<String, Value>,
}

/// A logical conversation spanning several active nodes.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Members in the order they joined.
    pub fn members(&self) -> Vec<Arc<ActiveNode>> {
        self.state().members.clone()
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.state().members.iter().map(|node| node.id()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Read a value shared between the nodes of this session.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state().data.get(key).cloned()
    }

    /// Store a value shared between the nodes of this session.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state().data.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.state().data.remove(key)
    }

    /// Add a member. Refused once the session has closed; duplicates are ignored.
    pub(crate) fn add_member(&self, node: Arc<ActiveNode>) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        if !state.members.iter().any(|member| member.id() == node.id()) {
            state.members.push(node);
        }
        true
    }

    /// Whether any member is still `Active`.
    ///
    /// Members that are mid-close do not hold the session open.
    pub(crate) fn any_active(&self) -> bool {
        self.state()
            .members
            .iter()
            .any(|member| member.status() == NodeStatus::Active)
    }

    /// Mark closed and hand back the members to close.
    ///
    /// Returns `None` when the session was already closed.
    pub(crate) fn begin_close(&self) -> Option<Vec<Arc<ActiveNode>>> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        state.closed = true;
        Some(state.members.clone())
    }

    pub(crate) fn clear_members(&self) {
        self.state().members.clear();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("members", &state.members.iter().map(|node| node.id()).collect::<Vec<_>>())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::NodeTemplate;
    use serde_json::json;
    use std::sync::Weak;

    fn node() -> Arc<ActiveNode> {
        ActiveNode::activate(Arc::new(NodeTemplate::new("T")), None)
    }

    #[test]
    fn members_are_unique_and_ordered() {
        let session = Session::new();
        let (a, b) = (node(), node());
        assert!(session.add_member(a.clone()));
        assert!(session.add_member(b.clone()));
        assert!(session.add_member(a.clone()));
        assert_eq!(session.member_ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn only_active_members_hold_the_session_open() {
        let session = Session::new();
        let member = node();
        session.add_member(member.clone());
        assert!(!session.any_active(), "inactive members do not count");

        member.begin_tracking(Weak::new());
        assert!(session.any_active());

        member.begin_close();
        assert!(!session.any_active(), "closing members do not count");
    }

    #[test]
    fn close_happens_once_and_refuses_new_members() {
        let session = Session::new();
        session.add_member(node());
        assert_eq!(session.begin_close().map(|members| members.len()), Some(1));
        assert!(session.begin_close().is_none());
        assert!(!session.add_member(node()));
        session.clear_members();
        assert!(session.members().is_empty());
        assert!(session.is_closed());
    }

    #[test]
    fn data_is_shared_by_key() {
        let session = Session::new();
        assert!(session.set("name", json!("ada")).is_none());
        assert_eq!(session.get("name"), Some(json!("ada")));
        assert_eq!(session.remove("name"), Some(json!("ada")));
        assert!(session.get("name").is_none());
    }
}
