//! Handler-owned registries of live nodes and sessions.
//!
//! All three maps sit behind one lock in the handler. Every method here is
//! synchronous, so the guard can never be held across a suspension point.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;

use crate::node::{ActiveNode, NodeId};
use crate::session::{Session, SessionId};

#[derive(Default)]
pub(crate) struct Registry {
    active: HashMap<NodeId, Arc<ActiveNode>>,
    interest: HashMap<String, HashMap<NodeId, Arc<ActiveNode>>>,
    sessions: HashMap<SessionId, Arc<Session>>,
}

impl Registry {
    /// Register `node` for delivery of every event its template lists.
    pub(crate) fn track(&mut self, node: Arc<ActiveNode>) {
        for event_key in node.template().event_keys() {
            self.interest
                .entry(event_key.to_string())
                .or_default()
                .insert(node.id(), node.clone());
        }
        self.active.insert(node.id(), node);
    }

    /// Strip `node` from the active registry and every interest entry.
    pub(crate) fn untrack(&mut self, node: &ActiveNode) -> bool {
        let removed = self.active.remove(&node.id()).is_some();
        for event_key in node.template().event_keys() {
            if let Some(waiting) = self.interest.get_mut(event_key) {
                waiting.remove(&node.id());
                if waiting.is_empty() {
                    self.interest.remove(event_key);
                }
            }
        }
        removed
    }

    pub(crate) fn waiting(&self, event_key: &str) -> Vec<Arc<ActiveNode>> {
        self.interest
            .get(event_key)
            .map(|waiting| waiting.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn active(&self) -> Vec<Arc<ActiveNode>> {
        self.active.values().cloned().collect()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn get(&self, id: &NodeId) -> Option<Arc<ActiveNode>> {
        self.active.get(id).cloned()
    }

    /// Nodes whose expiry is set and has passed.
    pub(crate) fn expired(&self, now: Instant) -> Vec<Arc<ActiveNode>> {
        self.active
            .values()
            .filter(|node| node.is_expired(now))
            .cloned()
            .collect()
    }

    pub(crate) fn open_session(&mut self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    pub(crate) fn remove_session(&mut self, id: &SessionId) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub(crate) fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).cloned()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{EventSpec, NodeTemplate};
    use std::time::Duration;

    fn listening(keys: &[&str], ttl: i64) -> Arc<ActiveNode> {
        let template = keys.iter().fold(NodeTemplate::new("T").with_ttl(ttl), |t, key| {
            t.with_event(*key, EventSpec::default())
        });
        ActiveNode::activate(Arc::new(template), None)
    }

    #[test]
    fn track_indexes_every_listed_event() {
        let mut registry = Registry::default();
        let node = listening(&["a", "b"], 10);
        registry.track(node.clone());

        assert_eq!(registry.waiting("a").len(), 1);
        assert_eq!(registry.waiting("b").len(), 1);
        assert!(registry.waiting("c").is_empty());
        assert!(registry.get(&node.id()).is_some());

        assert!(registry.untrack(&node));
        assert!(registry.waiting("a").is_empty());
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.untrack(&node), "second removal finds nothing");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_skips_never_expiring_nodes() {
        let mut registry = Registry::default();
        let short = listening(&["a"], 1);
        let forever = listening(&["a"], -1);
        registry.track(short.clone());
        registry.track(forever);

        tokio::time::advance(Duration::from_secs(5)).await;
        let expired = registry.expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), short.id());
    }
}
