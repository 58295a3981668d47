//! Event entry points and the per-node pipeline.
//!
//! ```text
//! notify(key, payload)
//!     │
//!     ├─► node 1: filter ─► actions ─► transitions ─► close
//!     ├─► node 2: filter ─► actions ─► transitions ─► close
//!     └─► node N: ...
//! ```
//!
//! Each interested node runs its pipeline in its own task. Stages inside one
//! pipeline are strictly sequential; pipelines of different nodes are not
//! ordered relative to each other.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::filter::FilterScope;
use crate::function::Purpose;
use crate::handler::DialogHandler;
use crate::node::ActiveNode;
use crate::template::FilterSpec;
use crate::{HANDLER_TARGET, REPORTING_TARGET};

impl DialogHandler {
    /// Deliver an event to every active node registered for `event_key`.
    ///
    /// Returns once every node's pipeline has finished, with the number of
    /// nodes the event was delivered to.
    pub async fn notify(&self, event_key: &str, payload: Value) -> usize {
        let waiting = self.waiting_nodes(event_key);
        debug!(
            target: HANDLER_TARGET,
            event = event_key,
            nodes = waiting.len(),
            "notifying waiting nodes"
        );
        if waiting.is_empty() {
            return 0;
        }

        let payload = Arc::new(payload);
        let event_key: Arc<str> = Arc::from(event_key);
        let delivered = waiting.len();
        let mut pipelines = JoinSet::new();
        for node in waiting {
            let handler = self.clone();
            let event_key = event_key.clone();
            let payload = payload.clone();
            pipelines.spawn(async move {
                handler.run_event_on_node(node, &event_key, &payload).await;
            });
        }
        while let Some(joined) = pipelines.join_next().await {
            if let Err(join_error) = joined {
                error!(
                    target: REPORTING_TARGET,
                    event = %event_key,
                    error = %join_error,
                    "node pipeline aborted"
                );
            }
        }
        delivered
    }

    /// Originate a new active node from a start-capable template.
    ///
    /// Returns the tracked node, or `None` when the template is unknown, not
    /// start-capable for `event_key`, or its start filters or setup did not pass.
    pub async fn start(
        &self,
        template_id: &str,
        event_key: &str,
        payload: Value,
    ) -> Option<Arc<ActiveNode>> {
        let Some(template) = self.template(template_id) else {
            warn!(
                target: REPORTING_TARGET,
                template = template_id,
                "cannot start at unknown template"
            );
            return None;
        };
        if !template.can_start(event_key) {
            warn!(
                target: REPORTING_TARGET,
                template = template_id,
                event = event_key,
                "cannot start, template is not an entry point for this event"
            );
            return None;
        }

        let payload = Arc::new(payload);
        let node = ActiveNode::activate(template.clone(), None);
        if !self.filters_pass(
            &node,
            event_key,
            template.start_filters(event_key),
            Purpose::Filter,
            &payload,
            None,
        ) {
            debug!(
                target: HANDLER_TARGET,
                template = template_id,
                event = event_key,
                "start filters did not pass"
            );
            return None;
        }

        if template.starts_with_session(event_key) {
            let session = self.open_session();
            session.add_member(node.clone());
            node.attach_session(session);
        }

        if let Err(fault) = self
            .run_actions(&node, template.start_setup(event_key), Purpose::Action, &payload, None)
            .await
        {
            self.report_fault(&node, "start setup", &fault);
            self.emergency_remove(&node);
            if let Some(session) = node.session() {
                self.close_session(session).await;
            }
            return None;
        }

        if !self.track_node(node.clone(), &payload).await {
            return None;
        }
        info!(
            target: REPORTING_TARGET,
            template = template_id,
            node = %node.id(),
            "started active node"
        );
        Some(node)
    }

    /// Filter, action, transition and close stages for one node and event.
    async fn run_event_on_node(
        &self,
        node: Arc<ActiveNode>,
        event_key: &str,
        payload: &Arc<Value>,
    ) {
        if !node.is_active() {
            debug!(
                target: HANDLER_TARGET,
                node = %node.id(),
                status = ?node.status(),
                "node left the active state before delivery, skipping"
            );
            return;
        }
        debug!(
            target: REPORTING_TARGET,
            node = %node.id(),
            template = node.template_id(),
            event = event_key,
            "running event on node"
        );
        let template = node.template().clone();

        if !self.filters_pass(
            &node,
            event_key,
            template.event_filters(event_key),
            Purpose::Filter,
            payload,
            None,
        ) {
            return;
        }
        debug!(target: HANDLER_TARGET, node = %node.id(), "passed filter stage");

        if let Err(fault) = self
            .run_actions(&node, template.event_actions(event_key), Purpose::Action, payload, None)
            .await
        {
            self.report_fault(&node, "event actions", &fault);
            return;
        }

        let requested = match self.run_transitions(&node, event_key, payload).await {
            Ok(requested) => requested,
            Err(fault) => {
                self.report_fault(&node, "transitions", &fault);
                return;
            }
        };

        let directives = template.close_flags(event_key) | requested;
        if directives.node {
            self.close_or_remove(node.clone(), false).await;
        }
        if directives.session {
            match node.session() {
                Some(session) => {
                    debug!(
                        target: REPORTING_TARGET,
                        node = %node.id(),
                        session = %session.id(),
                        "event handling closing session"
                    );
                    self.close_session(session).await;
                }
                None => debug!(
                    target: HANDLER_TARGET,
                    node = %node.id(),
                    "session close requested but node has no session"
                ),
            }
        }
    }

    /// Evaluate a filter list, treating any fault as `false`.
    pub(crate) fn filters_pass(
        &self,
        node: &Arc<ActiveNode>,
        event_key: &str,
        filters: &[FilterSpec],
        purpose: Purpose,
        payload: &Arc<Value>,
        destination: Option<&str>,
    ) -> bool {
        let scope = FilterScope {
            functions: &self.shared.functions,
            purpose,
            node,
            event: payload,
            destination,
        };
        match scope.evaluate(filters) {
            Ok(passed) => passed,
            Err(fault) => {
                error!(
                    target: REPORTING_TARGET,
                    node = %node.id(),
                    template = node.template_id(),
                    event = event_key,
                    destination,
                    error = %fault,
                    "fault while evaluating filters, assuming skip"
                );
                false
            }
        }
    }
}
