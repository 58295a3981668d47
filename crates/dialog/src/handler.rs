//! The dialog handler: registries plus the entry points that drive them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::cleanup::CleanupTask;
use crate::config::HandlerConfig;
use crate::error::Result;
use crate::function::{FunctionRegistry, Purpose, Registration};
use crate::node::{ActiveNode, NodeId};
use crate::registry::Registry;
use crate::session::{Session, SessionId};
use crate::template::NodeTemplate;
use crate::{HANDLER_TARGET, REPORTING_TARGET};

/// State shared by every clone of a handler.
pub(crate) struct Shared {
    pub(crate) templates: DashMap<String, Arc<NodeTemplate>>,
    pub(crate) functions: FunctionRegistry,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) config: HandlerConfig,
    pub(crate) cleanup: Mutex<Option<CleanupTask>>,
}

/// Runtime engine for dialog graphs.
///
/// Cheap to clone; clones share all state. Active nodes keep a weak
/// reference back to the handler that tracks them.
#[derive(Clone)]
pub struct DialogHandler {
    pub(crate) shared: Arc<Shared>,
}

impl DialogHandler {
    /// A handler with default configuration and nothing registered.
    pub fn new() -> Self {
        DialogHandlerBuilder::new().build()
    }

    pub fn builder() -> DialogHandlerBuilder {
        DialogHandlerBuilder::new()
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------------

    /// Add templates. Ids that are already known are reported and ignored.
    pub fn add_templates(&self, templates: impl IntoIterator<Item = NodeTemplate>) -> usize {
        let mut added = 0;
        for template in templates {
            if self.shared.templates.contains_key(&template.id) {
                warn!(
                    target: REPORTING_TARGET,
                    template = %template.id,
                    "tried adding duplicate template, ignoring it"
                );
                continue;
            }
            self.shared
                .templates
                .insert(template.id.clone(), Arc::new(template));
            added += 1;
        }
        added
    }

    /// Add or replace templates.
    ///
    /// Nodes already activated keep the template they were created from.
    pub fn reload_templates(&self, templates: impl IntoIterator<Item = NodeTemplate>) {
        for template in templates {
            info!(target: REPORTING_TARGET, template = %template.id, "updated/created template");
            self.shared
                .templates
                .insert(template.id.clone(), Arc::new(template));
        }
    }

    pub fn template(&self, id: &str) -> Option<Arc<NodeTemplate>> {
        self.shared
            .templates
            .get(id)
            .map(|entry| entry.value().clone())
    }

    pub fn has_template(&self, id: &str) -> bool {
        self.shared.templates.contains_key(id)
    }

    pub fn template_ids(&self) -> Vec<String> {
        self.shared
            .templates
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    // ------------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------------

    /// Register a callable. See [`FunctionRegistry::register`].
    pub fn register(&self, registration: Registration) -> Result<()> {
        self.shared.functions.register(registration)
    }

    pub fn register_module(&self, module: impl IntoIterator<Item = Registration>) -> usize {
        self.shared.functions.register_module(module)
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.shared.functions
    }

    pub fn is_permitted(&self, name: &str, purpose: Purpose) -> bool {
        self.shared.functions.is_permitted(name, purpose)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn active_nodes(&self) -> Vec<Arc<ActiveNode>> {
        self.registry().active()
    }

    pub fn active_count(&self) -> usize {
        self.registry().active_count()
    }

    pub fn active_node(&self, id: &NodeId) -> Option<Arc<ActiveNode>> {
        self.registry().get(id)
    }

    /// Active nodes currently registered for `event_key`.
    pub fn waiting_nodes(&self, event_key: &str) -> Vec<Arc<ActiveNode>> {
        self.registry().waiting(event_key)
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.registry().sessions()
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.registry().session(id)
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Check that every template reference resolves.
    ///
    /// Problems are reported and returned; none of them stop the handler,
    /// which skips unknown references at runtime.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let templates: Vec<Arc<NodeTemplate>> = self
            .shared
            .templates
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut issues = Vec::new();
        for template in &templates {
            let refs = template.references();
            for destination in refs.destinations {
                if !self.has_template(destination) {
                    issues.push(ValidationIssue::UnknownDestination {
                        template: template.id.clone(),
                        destination: destination.to_string(),
                    });
                }
            }
            for (function, purpose, location) in refs.functions {
                if !self.shared.functions.contains(function) {
                    issues.push(ValidationIssue::UnknownFunction {
                        template: template.id.clone(),
                        function: function.to_string(),
                        location,
                    });
                } else if !self.is_permitted(function, purpose) {
                    issues.push(ValidationIssue::NotPermitted {
                        template: template.id.clone(),
                        function: function.to_string(),
                        purpose,
                        location,
                    });
                }
            }
        }
        for issue in &issues {
            warn!(target: REPORTING_TARGET, %issue, "template validation");
        }
        issues
    }
}

impl Default for DialogHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// A dangling reference found by [`DialogHandler::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("template `{template}` transitions to unknown template `{destination}`")]
    UnknownDestination {
        template: String,
        destination: String,
    },
    #[error("template `{template}` uses unregistered function `{function}` in {location}")]
    UnknownFunction {
        template: String,
        function: String,
        location: String,
    },
    #[error("template `{template}` may not use `{function}` as {purpose} in {location}")]
    NotPermitted {
        template: String,
        function: String,
        purpose: Purpose,
        location: String,
    },
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`DialogHandler`].
///
/// ```
/// use dialog_core::{CallEnvelope, DialogHandler, NodeTemplate, Purpose, Registration};
///
/// let handler = DialogHandler::builder()
///     .with_template(NodeTemplate::new("greeting").with_ttl(60))
///     .with_function(
///         Registration::filter("always", |_: &CallEnvelope| Ok(true)).permit([Purpose::Filter]),
///     )
///     .build();
/// assert!(handler.has_template("greeting"));
/// ```
#[derive(Default)]
pub struct DialogHandlerBuilder {
    templates: Vec<NodeTemplate>,
    functions: Vec<Registration>,
    config: HandlerConfig,
}

impl DialogHandlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template: NodeTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn with_templates(mut self, templates: impl IntoIterator<Item = NodeTemplate>) -> Self {
        self.templates.extend(templates);
        self
    }

    pub fn with_function(mut self, registration: Registration) -> Self {
        self.functions.push(registration);
        self
    }

    pub fn with_functions(mut self, registrations: impl IntoIterator<Item = Registration>) -> Self {
        self.functions.extend(registrations);
        self
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> DialogHandler {
        let handler = DialogHandler::from_shared(Arc::new(Shared {
            templates: DashMap::new(),
            functions: FunctionRegistry::new(),
            registry: Mutex::new(Registry::default()),
            config: self.config,
            cleanup: Mutex::new(None),
        }));
        let templates = handler.add_templates(self.templates);
        let functions = handler.register_module(self.functions);
        info!(
            target: HANDLER_TARGET,
            templates,
            functions,
            clean_interval_secs = handler.config().clean_interval_seconds,
            "dialog handler built"
        );
        handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::CallEnvelope;
    use crate::template::{EventSpec, FilterSpec, FunctionCall, TransitionSpec};

    fn yes(_: &CallEnvelope) -> anyhow::Result<bool> {
        Ok(true)
    }

    #[test]
    fn duplicate_templates_are_ignored_until_reloaded() {
        let handler = DialogHandler::new();
        assert_eq!(handler.add_templates([NodeTemplate::new("A").with_ttl(5)]), 1);
        assert_eq!(handler.add_templates([NodeTemplate::new("A").with_ttl(9)]), 0);
        assert_eq!(handler.template("A").unwrap().ttl, 5);

        handler.reload_templates([NodeTemplate::new("A").with_ttl(9)]);
        assert_eq!(handler.template("A").unwrap().ttl, 9);
    }

    #[test]
    fn builder_registers_templates_and_functions() {
        let handler = DialogHandler::builder()
            .with_templates([NodeTemplate::new("A"), NodeTemplate::new("B")])
            .with_function(Registration::filter("yes", yes).permit([Purpose::Filter]))
            .with_function(Registration::filter("rejected", yes))
            .build();
        let mut ids = handler.template_ids();
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);
        assert!(handler.is_permitted("yes", Purpose::Filter));
        assert!(!handler.functions().contains("rejected"));
    }

    #[test]
    fn validate_reports_dangling_references() {
        let template = NodeTemplate::new("A").with_event(
            "next",
            EventSpec {
                filters: vec![FilterSpec::call("yes"), FilterSpec::call("ghost")],
                transitions: vec![TransitionSpec {
                    transition_actions: vec![FunctionCall::new("yes")],
                    ..TransitionSpec::to(["B", "Nowhere"])
                }],
                ..EventSpec::default()
            },
        );
        let handler = DialogHandler::builder()
            .with_templates([template, NodeTemplate::new("B")])
            .with_function(Registration::filter("yes", yes).permit([Purpose::Filter]))
            .build();

        let issues = handler.validate();
        assert_eq!(issues.len(), 3, "{issues:?}");
        assert!(issues.contains(&ValidationIssue::UnknownDestination {
            template: "A".into(),
            destination: "Nowhere".into(),
        }));
        assert!(issues.iter().any(|issue| matches!(
            issue,
            ValidationIssue::UnknownFunction { function, .. } if function == "ghost"
        )));
        assert!(issues.iter().any(|issue| matches!(
            issue,
            ValidationIssue::NotPermitted { purpose: Purpose::TransitionAction, .. }
        )));
    }
}
