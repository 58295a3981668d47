//! Tracking, closing and session bookkeeping for active nodes.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::ExceptionLevel;
use crate::error::{DialogError, Result};
use crate::function::{Destination, Purpose};
use crate::handler::DialogHandler;
use crate::node::{ActiveNode, NodeStatus};
use crate::session::Session;
use crate::template::FunctionCall;
use crate::{HANDLER_TARGET, REPORTING_TARGET};

impl DialogHandler {
    /// Run an action list in order. The first failure abandons the rest.
    pub(crate) async fn run_actions(
        &self,
        node: &Arc<ActiveNode>,
        actions: &[FunctionCall],
        purpose: Purpose,
        event: &Arc<Value>,
        destination: Option<&Arc<ActiveNode>>,
    ) -> Result<()> {
        for action in actions {
            self.shared
                .functions
                .run_action(
                    action,
                    purpose,
                    node,
                    event,
                    destination.map(|dest| Destination::Node(dest.clone())),
                )
                .await?;
        }
        Ok(())
    }

    /// Report a fault caught at a stage boundary.
    pub(crate) fn report_fault(
        &self,
        node: &ActiveNode,
        stage: &'static str,
        fault: &DialogError,
    ) {
        match self.shared.config.settings.exception_level {
            ExceptionLevel::Ignore => error!(
                target: REPORTING_TARGET,
                node = %node.id(),
                template = node.template_id(),
                stage,
                error = %fault,
                "fault while handling node, skipping rest of stage"
            ),
        }
    }

    /// Register `node` for event delivery, then run its entry actions.
    ///
    /// Only `Inactive` nodes can be tracked. Returns whether tracking happened.
    pub(crate) async fn track_node(&self, node: Arc<ActiveNode>, event: &Arc<Value>) -> bool {
        let tracked = {
            let mut registry = self.registry();
            let tracked = node.begin_tracking(Arc::downgrade(&self.shared));
            if tracked {
                registry.track(node.clone());
            }
            tracked
        };
        if !tracked {
            warn!(
                target: REPORTING_TARGET,
                node = %node.id(),
                template = node.template_id(),
                status = ?node.status(),
                "node is not inactive, refusing to track it"
            );
            return false;
        }
        info!(
            target: HANDLER_TARGET,
            node = %node.id(),
            template = node.template_id(),
            "tracking node"
        );

        let template = node.template().clone();
        if let Err(fault) = self
            .run_actions(&node, &template.actions, Purpose::Action, event, None)
            .await
        {
            self.report_fault(&node, "enter actions", &fault);
        }
        true
    }

    /// Close a node, falling back to emergency removal if its close actions fail.
    ///
    /// Idempotent: closing a node that is closing or closed does nothing.
    pub async fn close_node(&self, node: &Arc<ActiveNode>) {
        self.close_or_remove(node.clone(), false).await;
    }

    /// Close every remaining member of `session` and forget it.
    pub async fn close_session(&self, session: &Arc<Session>) {
        self.close_session_boxed(session.clone()).await;
    }

    pub(crate) async fn close_or_remove(&self, node: Arc<ActiveNode>, timed_out: bool) {
        if let Err(fault) = self.try_close(node.clone(), timed_out).await {
            warn!(
                target: REPORTING_TARGET,
                node = %node.id(),
                template = node.template_id(),
                error = %fault,
                "close failed, removing node without close actions"
            );
            self.emergency_remove(&node);
        }
    }

    /// Regular close: close actions, registry removal, session cascade.
    ///
    /// Resolves to `false` when another close already owns the node.
    pub(crate) fn try_close(
        &self,
        node: Arc<ActiveNode>,
        timed_out: bool,
    ) -> BoxFuture<'_, Result<bool>> {
        async move {
            let prior = node.begin_close();
            if matches!(prior, NodeStatus::Closing | NodeStatus::Closed) {
                debug!(
                    target: HANDLER_TARGET,
                    node = %node.id(),
                    status = ?prior,
                    "node already closing, nothing to do"
                );
                return Ok(false);
            }
            info!(
                target: REPORTING_TARGET,
                node = %node.id(),
                template = node.template_id(),
                timed_out,
                "closing node"
            );

            if prior == NodeStatus::Active {
                let template = node.template().clone();
                let payload = Arc::new(json!({ "timed_out": timed_out }));
                self.run_actions(&node, &template.close_actions, Purpose::Action, &payload, None)
                    .await
                    .map_err(|source| DialogError::CloseFailed {
                        node: node.id(),
                        source: Box::new(source),
                    })?;
            }

            self.finish_close(&node);

            if let Some(session) = node.session() {
                if !session.is_closed() && !session.any_active() {
                    debug!(
                        target: HANDLER_TARGET,
                        session = %session.id(),
                        "no active members left, closing session"
                    );
                    self.close_session_boxed(session.clone()).await;
                }
            }
            Ok(true)
        }
        .boxed()
    }

    /// Strip a node from every registry without running close actions or
    /// checking its session.
    pub(crate) fn emergency_remove(&self, node: &ActiveNode) {
        self.finish_close(node);
        warn!(
            target: REPORTING_TARGET,
            node = %node.id(),
            template = node.template_id(),
            "node removed by emergency path"
        );
    }

    fn finish_close(&self, node: &ActiveNode) {
        let mut registry = self.registry();
        node.mark_closed();
        registry.untrack(node);
    }

    pub(crate) fn open_session(&self) -> Arc<Session> {
        let session = Session::new();
        self.registry().open_session(session.clone());
        info!(target: HANDLER_TARGET, session = %session.id(), "opened session");
        session
    }

    fn close_session_boxed(&self, session: Arc<Session>) -> BoxFuture<'_, ()> {
        async move {
            let Some(members) = session.begin_close() else {
                return;
            };
            debug!(
                target: REPORTING_TARGET,
                session = %session.id(),
                members = ?session.member_ids(),
                "closing session"
            );
            for member in members {
                if matches!(member.status(), NodeStatus::Inactive | NodeStatus::Active) {
                    self.close_or_remove(member, false).await;
                }
            }
            session.clear_members();
            self.registry().remove_session(&session.id());
            info!(target: HANDLER_TARGET, session = %session.id(), "closed session");
        }
        .boxed()
    }
}
