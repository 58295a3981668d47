//! Error types for the dialog runtime.

use thiserror::Error;

use crate::function::Purpose;
use crate::node::NodeId;

/// Result alias used across the crate.
pub type Result<T, E = DialogError> = std::result::Result<T, E>;

/// Errors raised by the dialog runtime.
///
/// Most of these never reach the caller of [`notify`](crate::DialogHandler::notify):
/// the pipeline catches them at the stage boundary, reports them on the
/// `dialog::reporting` target and degrades the stage to its safe default.
#[derive(Debug, Error)]
pub enum DialogError {
    /// No template registered under this id.
    #[error("unknown node template `{0}`")]
    UnknownTemplate(String),

    /// No callable registered under this name.
    #[error("function `{0}` is not registered")]
    UnknownFunction(String),

    /// Callable exists but may not run for this purpose.
    #[error("function `{name}` is not permitted for purpose `{purpose}`")]
    NotPermitted { name: String, purpose: Purpose },

    /// Callable signature has no slot for a required argument.
    #[error("function `{name}` cannot be called for `{purpose}`: {reason}")]
    SignatureMismatch {
        name: String,
        purpose: Purpose,
        reason: &'static str,
    },

    /// An async action was referenced from a filter list.
    #[error("function `{0}` is asynchronous and cannot be evaluated as a filter")]
    NotSynchronous(String),

    /// A registered callable returned an error.
    #[error("function `{name}` failed: {source}")]
    Callback {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Close actions of a node failed.
    #[error("closing node {node} failed: {source}")]
    CloseFailed {
        node: NodeId,
        #[source]
        source: Box<DialogError>,
    },

    /// Registration was refused and had no effect.
    #[error("registration of `{name}` rejected: {reason}")]
    RegistrationRejected { name: String, reason: &'static str },

    /// Template definition could not be mapped onto the typed record.
    #[error("invalid node template definition: {0}")]
    InvalidTemplate(#[from] serde_json::Error),

    /// Handler configuration could not be read.
    #[error("invalid handler configuration: {0}")]
    InvalidConfig(String),

    /// The cleanup sweep could not be scheduled.
    #[error("cleanup scheduler: {0}")]
    Cleanup(String),
}

impl DialogError {
    /// Wraps a callback failure with the name of the function that raised it.
    pub(crate) fn callback(name: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Callback {
            name: name.into(),
            source,
        }
    }
}
