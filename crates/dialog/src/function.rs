//! Function registry: named filters and actions referenced by templates.
//!
//! Templates refer to callbacks by name. Each registration declares
//!
//! - **what it is**: a synchronous [`Filter`] or an asynchronous [`Action`],
//! - **which purposes it may serve** ([`Purpose`]), and
//! - **which calling shape it accepts** ([`Signature`]).
//!
//! The registry assembles a [`CallEnvelope`] per invocation from the shape,
//! so a single function can be reused in transition and non-transition
//! contexts without inspecting its signature at runtime.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::{DialogError, Result};
use crate::node::ActiveNode;
use crate::template::{FunctionCall, COMBINATORS};
use crate::{HANDLER_TARGET, REPORTING_TARGET};

/// Names that can never be registered: filter combinators and the
/// registration entry point itself.
pub const RESERVED_NAMES: [&str; 3] = [COMBINATORS[0], COMBINATORS[1], "register"];

// ============================================================================
// Purposes
// ============================================================================

/// The stage a function is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Filter,
    Action,
    TransitionFilter,
    TransitionAction,
}

impl Purpose {
    pub const ALL: [Purpose; 4] = [
        Purpose::Filter,
        Purpose::Action,
        Purpose::TransitionFilter,
        Purpose::TransitionAction,
    ];

    pub fn is_transition(self) -> bool {
        matches!(self, Purpose::TransitionFilter | Purpose::TransitionAction)
    }

    pub fn is_filter(self) -> bool {
        matches!(self, Purpose::Filter | Purpose::TransitionFilter)
    }

    fn bit(self) -> u8 {
        match self {
            Purpose::Filter => 1,
            Purpose::Action => 1 << 1,
            Purpose::TransitionFilter => 1 << 2,
            Purpose::TransitionAction => 1 << 3,
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Purpose::Filter => "filter",
            Purpose::Action => "action",
            Purpose::TransitionFilter => "transition_filter",
            Purpose::TransitionAction => "transition_action",
        })
    }
}

/// Set of purposes a function is permitted for.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Purposes(u8);

impl Purposes {
    pub fn contains(&self, purpose: Purpose) -> bool {
        self.0 & purpose.bit() != 0
    }

    pub fn insert(&mut self, purpose: Purpose) {
        self.0 |= purpose.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Purpose> {
        let set = *self;
        Purpose::ALL
            .into_iter()
            .filter(move |purpose| set.contains(*purpose))
    }

    /// Permitted both inside and outside transitions.
    pub fn crosses_transitions(&self) -> bool {
        self.iter().any(Purpose::is_transition) && self.iter().any(|p| !p.is_transition())
    }
}

impl FromIterator<Purpose> for Purposes {
    fn from_iter<I: IntoIterator<Item = Purpose>>(iter: I) -> Self {
        let mut purposes = Self::default();
        for purpose in iter {
            purposes.insert(purpose);
        }
        purposes
    }
}

impl fmt::Debug for Purposes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// ============================================================================
// Calling shapes
// ============================================================================

/// Argument slots a function accepts beyond `(node, event)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Signature {
    /// `(node, event)`
    #[default]
    Event,
    /// `(node, event, destination)`
    Destination,
    /// `(node, event, args)`
    Arguments,
    /// `(node, event, destination, args)`
    DestinationArguments,
}

impl Signature {
    pub fn takes_destination(self) -> bool {
        matches!(self, Signature::Destination | Signature::DestinationArguments)
    }

    pub fn takes_arguments(self) -> bool {
        matches!(self, Signature::Arguments | Signature::DestinationArguments)
    }
}

/// Destination of a transition, as seen by transition callbacks.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Candidate template name, while transition filters decide.
    Template(String),
    /// Freshly activated node, while transition actions run.
    Node(Arc<ActiveNode>),
}

impl Destination {
    pub fn template_id(&self) -> &str {
        match self {
            Destination::Template(name) => name,
            Destination::Node(node) => node.template_id(),
        }
    }

    pub fn node(&self) -> Option<&Arc<ActiveNode>> {
        match self {
            Destination::Node(node) => Some(node),
            Destination::Template(_) => None,
        }
    }
}

/// Arguments handed to a callback, filled in according to its [`Signature`].
///
/// `destination` is `None` outside transitions even for shapes that have the
/// slot; `args` is `None` when the template supplied none.
#[derive(Debug, Clone)]
pub struct CallEnvelope {
    pub node: Arc<ActiveNode>,
    pub event: Arc<Value>,
    pub destination: Option<Destination>,
    pub args: Option<Value>,
}

// ============================================================================
// Callables
// ============================================================================

/// Synchronous boolean check.
///
/// Implemented for any `Fn(&CallEnvelope) -> anyhow::Result<bool>`.
pub trait Filter: Send + Sync + 'static {
    fn check(&self, call: &CallEnvelope) -> anyhow::Result<bool>;
}

impl<F> Filter for F
where
    F: Fn(&CallEnvelope) -> anyhow::Result<bool> + Send + Sync + 'static,
{
    fn check(&self, call: &CallEnvelope) -> anyhow::Result<bool> {
        self(call)
    }
}

/// Side-effecting callback. May suspend.
///
/// Implemented for any `Fn(CallEnvelope) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    async fn run(&self, call: CallEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Action for F
where
    F: Fn(CallEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, call: CallEnvelope) -> anyhow::Result<()> {
        self(call).await
    }
}

#[derive(Clone)]
pub enum Callable {
    Filter(Arc<dyn Filter>),
    Action(Arc<dyn Action>),
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Callable::Filter(_) => "Callable::Filter",
            Callable::Action(_) => "Callable::Action",
        })
    }
}

/// A named callable with its permitted purposes and calling shape.
#[derive(Debug, Clone)]
pub struct Registration {
    name: String,
    callable: Callable,
    signature: Signature,
    purposes: Purposes,
}

impl Registration {
    /// Register a synchronous filter closure. Filters may also serve action purposes.
    pub fn filter<F>(name: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&CallEnvelope) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::from_filter(name, filter)
    }

    /// Register an asynchronous action closure.
    pub fn action<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(CallEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_action(name, action)
    }

    pub fn from_filter(name: impl Into<String>, filter: impl Filter) -> Self {
        Self::with_callable(name, Callable::Filter(Arc::new(filter)))
    }

    pub fn from_action(name: impl Into<String>, action: impl Action) -> Self {
        Self::with_callable(name, Callable::Action(Arc::new(action)))
    }

    fn with_callable(name: impl Into<String>, callable: Callable) -> Self {
        Self {
            name: name.into(),
            callable,
            signature: Signature::Event,
            purposes: Purposes::default(),
        }
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    pub fn permit(mut self, purposes: impl IntoIterator<Item = Purpose>) -> Self {
        for purpose in purposes {
            self.purposes.insert(purpose);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn purposes(&self) -> Purposes {
        self.purposes
    }

    pub fn callable_signature(&self) -> Signature {
        self.signature
    }

    /// Build the envelope for one invocation.
    ///
    /// Transition purposes require a destination slot. Extra arguments that
    /// the shape has no room for are discarded with a warning.
    fn envelope(
        &self,
        purpose: Purpose,
        node: Arc<ActiveNode>,
        event: Arc<Value>,
        destination: Option<Destination>,
        args: Option<Value>,
    ) -> Result<CallEnvelope> {
        let destination = if purpose.is_transition() {
            if !self.signature.takes_destination() {
                return Err(DialogError::SignatureMismatch {
                    name: self.name.clone(),
                    purpose,
                    reason: "signature has no destination slot",
                });
            }
            let Some(destination) = destination else {
                return Err(DialogError::SignatureMismatch {
                    name: self.name.clone(),
                    purpose,
                    reason: "missing required destination",
                });
            };
            Some(destination)
        } else {
            None
        };

        let args = match args {
            Some(args) if self.signature.takes_arguments() => Some(args),
            Some(_) => {
                warn!(
                    target: REPORTING_TARGET,
                    function = %self.name,
                    %purpose,
                    "extra arguments supplied but signature has no room, discarding"
                );
                None
            }
            None => None,
        };

        Ok(CallEnvelope {
            node,
            event,
            destination,
            args,
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, Registration>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function. Rejected registrations have no effect.
    ///
    /// Re-registering a name overwrites the previous entry with a warning.
    pub fn register(&self, registration: Registration) -> Result<()> {
        let reject = |reason: &'static str| {
            warn!(
                target: REPORTING_TARGET,
                function = %registration.name,
                reason,
                "function registration rejected"
            );
            Err(DialogError::RegistrationRejected {
                name: registration.name.clone(),
                reason,
            })
        };

        if registration.purposes.is_empty() {
            return reject("no permitted purposes");
        }
        if RESERVED_NAMES.contains(&registration.name.as_str()) {
            return reject("name is reserved");
        }
        if matches!(registration.callable, Callable::Action(_))
            && registration.purposes.iter().any(Purpose::is_filter)
        {
            return reject("asynchronous actions cannot be permitted as filters");
        }

        if self.functions.contains_key(&registration.name) {
            warn!(
                target: REPORTING_TARGET,
                function = %registration.name,
                "function already registered under this name, overwriting"
            );
        }
        debug!(
            target: HANDLER_TARGET,
            function = %registration.name,
            purposes = ?registration.purposes,
            signature = ?registration.signature,
            "registered function"
        );
        self.functions
            .insert(registration.name.clone(), registration);
        Ok(())
    }

    /// Register a batch of functions, returning how many were accepted.
    pub fn register_module(&self, module: impl IntoIterator<Item = Registration>) -> usize {
        module
            .into_iter()
            .filter(|registration| self.register(registration.clone()).is_ok())
            .count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Permitted purposes of every registered function.
    pub fn purposes(&self) -> HashMap<String, Purposes> {
        self.functions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().purposes))
            .collect()
    }

    /// Look up `name` for `purpose`, reporting why it cannot run.
    pub fn permitted(&self, name: &str, purpose: Purpose) -> Result<Registration> {
        let Some(registration) = self.functions.get(name).map(|entry| entry.value().clone())
        else {
            error!(
                target: REPORTING_TARGET,
                function = name,
                %purpose,
                "function is not registered"
            );
            return Err(DialogError::UnknownFunction(name.to_string()));
        };
        if !registration.purposes.contains(purpose) {
            warn!(
                target: REPORTING_TARGET,
                function = name,
                %purpose,
                "function is not permitted for this purpose"
            );
            return Err(DialogError::NotPermitted {
                name: name.to_string(),
                purpose,
            });
        }
        Ok(registration)
    }

    pub fn is_permitted(&self, name: &str, purpose: Purpose) -> bool {
        self.functions
            .get(name)
            .is_some_and(|entry| entry.value().purposes.contains(purpose))
    }

    /// Evaluate one filter leaf.
    ///
    /// Unknown or non-permitted functions evaluate to `false`.
    pub fn run_filter(
        &self,
        call: &FunctionCall,
        purpose: Purpose,
        node: &Arc<ActiveNode>,
        event: &Arc<Value>,
        destination: Option<Destination>,
    ) -> Result<bool> {
        debug!(
            target: HANDLER_TARGET,
            function = %call.name,
            node = %node.id(),
            template = node.template_id(),
            %purpose,
            "running filter"
        );
        let Ok(registration) = self.permitted(&call.name, purpose) else {
            return Ok(false);
        };
        let Callable::Filter(filter) = &registration.callable else {
            return Err(DialogError::NotSynchronous(call.name.clone()));
        };
        let envelope = registration.envelope(
            purpose,
            node.clone(),
            event.clone(),
            destination,
            call.args.clone(),
        )?;
        filter
            .check(&envelope)
            .map_err(|source| DialogError::callback(&call.name, source))
    }

    /// Run one action.
    ///
    /// Unknown or non-permitted functions are a no-op.
    pub async fn run_action(
        &self,
        call: &FunctionCall,
        purpose: Purpose,
        node: &Arc<ActiveNode>,
        event: &Arc<Value>,
        destination: Option<Destination>,
    ) -> Result<()> {
        debug!(
            target: HANDLER_TARGET,
            function = %call.name,
            node = %node.id(),
            template = node.template_id(),
            %purpose,
            "running action"
        );
        let Ok(registration) = self.permitted(&call.name, purpose) else {
            return Ok(());
        };
        let envelope = registration.envelope(
            purpose,
            node.clone(),
            event.clone(),
            destination,
            call.args.clone(),
        )?;
        let outcome = match &registration.callable {
            Callable::Filter(filter) => filter.check(&envelope).map(drop),
            Callable::Action(action) => action.run(envelope).await,
        };
        outcome.map_err(|source| DialogError::callback(&call.name, source))
    }
}
