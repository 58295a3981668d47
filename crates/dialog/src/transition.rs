//! Transition engine: moving from one node to its destination templates.

use std::sync::Arc;

use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::function::Purpose;
use crate::handler::DialogHandler;
use crate::node::ActiveNode;
use crate::template::{CloseDirectives, FunctionCall, SessionChaining};
use crate::{HANDLER_TARGET, REPORTING_TARGET};

/// A destination whose transition filters passed.
#[derive(Debug)]
struct PassedTransition<'a> {
    destination: &'a str,
    actions: &'a [FunctionCall],
    chaining: Option<SessionChaining>,
    close: CloseDirectives,
}

impl DialogHandler {
    /// Evaluate and execute the transitions of `node` for `event_key`.
    ///
    /// Filtering finishes for every candidate before any transition runs.
    /// Steps are independent: a later fault does not undo earlier steps.
    /// Returns the close directives requested by the executed transitions.
    pub(crate) async fn run_transitions(
        &self,
        node: &Arc<ActiveNode>,
        event_key: &str,
        payload: &Arc<Value>,
    ) -> Result<CloseDirectives> {
        let template = node.template().clone();
        let mut passed: SmallVec<[PassedTransition<'_>; 4]> = SmallVec::new();

        for (index, transition) in template.transitions(event_key).iter().enumerate() {
            debug!(
                target: HANDLER_TARGET,
                node = %node.id(),
                transition = index,
                destinations = ?transition.node_names,
                "checking transition"
            );
            for destination in &transition.node_names {
                if !self.has_template(destination) {
                    warn!(
                        target: REPORTING_TARGET,
                        node = %node.id(),
                        template = node.template_id(),
                        destination = %destination,
                        transition = index,
                        "transition destination does not exist, skipping"
                    );
                    continue;
                }
                if !self.filters_pass(
                    node,
                    event_key,
                    &transition.transition_filters,
                    Purpose::TransitionFilter,
                    payload,
                    Some(destination.as_str()),
                ) {
                    continue;
                }
                passed.push(PassedTransition {
                    destination,
                    actions: &transition.transition_actions,
                    chaining: transition.session_chaining,
                    close: transition.schedule_close,
                });
            }
        }
        debug!(
            target: HANDLER_TARGET,
            node = %node.id(),
            passed = ?passed.iter().map(|step| step.destination).collect::<Vec<_>>(),
            "transitions that passed filters"
        );

        let mut directives = CloseDirectives::NONE;
        for step in passed {
            let Some(destination) = self.template(step.destination) else {
                warn!(
                    target: REPORTING_TARGET,
                    destination = step.destination,
                    "destination template disappeared before transition, skipping"
                );
                continue;
            };

            let (session, opened) = match (step.chaining, node.session()) {
                (Some(SessionChaining::Start), _) | (Some(SessionChaining::Chain), None) => {
                    (Some(self.open_session()), true)
                }
                (_, existing) => (existing.cloned(), false),
            };

            let next = ActiveNode::activate(destination, session.clone());
            info!(
                target: REPORTING_TARGET,
                from = %node.id(),
                from_template = node.template_id(),
                to = %next.id(),
                to_template = step.destination,
                session = ?session.as_ref().map(|session| session.id()),
                "transitioning"
            );
            if step.chaining != Some(SessionChaining::End) {
                if let Some(session) = &session {
                    if !session.add_member(next.clone()) {
                        warn!(
                            target: REPORTING_TARGET,
                            session = %session.id(),
                            node = %next.id(),
                            "session closed before destination could join"
                        );
                    }
                }
            }

            if let Err(fault) = self
                .run_actions(node, step.actions, Purpose::TransitionAction, payload, Some(&next))
                .await
            {
                self.emergency_remove(&next);
                if let (true, Some(session)) = (opened, &session) {
                    self.close_session(session).await;
                }
                return Err(fault);
            }

            directives |= step.close;
            self.track_node(next, payload).await;
        }
        Ok(directives)
    }
}
