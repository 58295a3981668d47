//! Testing utilities for the dialog runtime.
//!
//! - [`Recorder`] hands out filters and actions that log every invocation
//! - [`Gate`] is an action that suspends until released
//! - [`template`] builds a [`NodeTemplate`] from an inline JSON definition
//!
//! ```
//! use dialog_core::{DialogHandler, Purpose};
//! use dialog_testing::Recorder;
//!
//! let recorder = Recorder::new();
//! let handler = DialogHandler::builder()
//!     .with_function(recorder.action("greet", [Purpose::Action]))
//!     .build();
//! assert!(handler.is_permitted("greet", Purpose::Action));
//! assert!(recorder.calls().is_empty());
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dialog_core::{
    Action, CallEnvelope, NodeId, NodeTemplate, Purpose, Registration, Signature,
};
use serde_json::Value;
use tokio::sync::Notify;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub function: String,
    pub template: String,
    pub node: NodeId,
    pub destination: Option<String>,
    pub event: Value,
    pub args: Option<Value>,
}

impl RecordedCall {
    fn from_envelope(function: &str, call: &CallEnvelope) -> Self {
        Self {
            function: function.to_string(),
            template: call.node.template_id().to_string(),
            node: call.node.id(),
            destination: call
                .destination
                .as_ref()
                .map(|destination| destination.template_id().to_string()),
            event: call.event.as_ref().clone(),
            args: call.args.clone(),
        }
    }
}

/// Shared log of callback invocations.
///
/// Every registration handed out takes the full
/// [`Signature::DestinationArguments`] shape, so it can be permitted for any
/// purpose.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: RecordedCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    /// An action that records its invocation and succeeds.
    pub fn action(
        &self,
        name: &str,
        purposes: impl IntoIterator<Item = Purpose>,
    ) -> Registration {
        let recorder = self.clone();
        let function = name.to_string();
        Registration::action(name, move |call: CallEnvelope| {
            recorder.push(RecordedCall::from_envelope(&function, &call));
            async { anyhow::Ok(()) }
        })
        .signature(Signature::DestinationArguments)
        .permit(purposes)
    }

    /// A filter that records its invocation and answers `result`.
    pub fn filter(
        &self,
        name: &str,
        result: bool,
        purposes: impl IntoIterator<Item = Purpose>,
    ) -> Registration {
        self.filter_with(name, purposes, move |_| result)
    }

    /// A filter that records its invocation and answers with `check`.
    pub fn filter_with<F>(
        &self,
        name: &str,
        purposes: impl IntoIterator<Item = Purpose>,
        check: F,
    ) -> Registration
    where
        F: Fn(&CallEnvelope) -> bool + Send + Sync + 'static,
    {
        let recorder = self.clone();
        let function = name.to_string();
        Registration::filter(name, move |call: &CallEnvelope| {
            recorder.push(RecordedCall::from_envelope(&function, call));
            Ok(check(call))
        })
        .signature(Signature::DestinationArguments)
        .permit(purposes)
    }

    /// An action that records its invocation, then fails.
    pub fn failing_action(
        &self,
        name: &str,
        purposes: impl IntoIterator<Item = Purpose>,
    ) -> Registration {
        let recorder = self.clone();
        let function = name.to_string();
        Registration::action(name, move |call: CallEnvelope| {
            recorder.push(RecordedCall::from_envelope(&function, &call));
            let function = function.clone();
            async move { Err::<(), _>(anyhow::anyhow!("{function} failed on purpose")) }
        })
        .signature(Signature::DestinationArguments)
        .permit(purposes)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of the invoked functions, in invocation order.
    pub fn names(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.function).collect()
    }

    pub fn count(&self, function: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.function == function)
            .count()
    }

    pub fn calls_to(&self, function: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.function == function)
            .collect()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// An action that suspends until [`Gate::open`] is called.
///
/// Used to hold one node's pipeline mid-stage while others run.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    notify: Arc<Notify>,
    entered: Arc<Notify>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every pipeline waiting at the gate, and the next one to arrive.
    pub fn open(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Resolves once a pipeline has reached the gate.
    pub async fn reached(&self) {
        self.entered.notified().await;
    }

    pub fn registration(
        &self,
        name: &str,
        purposes: impl IntoIterator<Item = Purpose>,
    ) -> Registration {
        Registration::from_action(name, self.clone()).permit(purposes)
    }
}

#[async_trait]
impl Action for Gate {
    async fn run(&self, _call: CallEnvelope) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.notify.notified().await;
        Ok(())
    }
}

/// Build a template from an inline definition.
///
/// # Panics
///
/// Panics when the definition does not map onto a template.
pub fn template(definition: Value) -> NodeTemplate {
    match NodeTemplate::from_value(definition) {
        Ok(template) => template,
        Err(error) => panic!("invalid test template: {error}"),
    }
}
