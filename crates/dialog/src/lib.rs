//! # Dialog
//!
//! A runtime for stateful conversation and workflow graphs: templates
//! describe what a node reacts to, active nodes carry that description at
//! runtime, and events move the graph forward.
//!
//! ## Core Concepts
//!
//! - [`NodeTemplate`] = Description (events, filters, actions, transitions)
//! - [`ActiveNode`] = Instance (a tracked copy of a template with its own TTL)
//! - [`Session`] = Grouping (active nodes that belong to one conversation)
//!
//! Templates only ever name functions. Every name resolves through the
//! [`FunctionRegistry`], which also decides what each function may be used
//! for ([`Purpose`]).
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!     │
//!     ▼ notify(event, payload)
//! DialogHandler ─── interest index ───┐
//!     │                               │
//!     ├─► node A: filters ─► actions ─► transitions ─┐
//!     │                                               │
//!     ├─► node B: filters ─✗ (skipped)                │
//!     │                                               ▼
//!     └─► node C: ...                          activate + track
//!                                                     │
//!                           close directives ◄────────┘
//!                                  │
//!                                  ▼
//!                         close node / session
//!
//! Cleanup task ── every interval ──► sweep() ──► close expired nodes
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Only tracked nodes see events** - activation alone registers nothing
//! 2. **Stages are sequential per node** - filters resolve before any action runs
//! 3. **Nodes are independent** - a fault in one pipeline never touches another
//! 4. **Closing is idempotent** - a node closes once, a session closes once
//! 5. **Unknown names are skipped** - missing templates and functions are reported, never fatal
//!
//! ## Example
//!
//! ```
//! use dialog_core::{CallEnvelope, DialogHandler, NodeTemplate, Purpose, Registration};
//! use serde_json::json;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let greeting = NodeTemplate::from_value(json!({
//!     "id": "greeting",
//!     "graph_start": { "hello": null },
//!     "events": {
//!         "bye": {
//!             "filters": ["polite"],
//!             "transitions": [{ "node_names": "farewell", "schedule_close": "node" }]
//!         }
//!     }
//! }))
//! .unwrap();
//! let farewell = NodeTemplate::from_value(json!({ "id": "farewell", "TTL": 30 })).unwrap();
//!
//! let handler = DialogHandler::builder()
//!     .with_templates([greeting, farewell])
//!     .with_function(
//!         Registration::filter("polite", |call: &CallEnvelope| {
//!             Ok(call.event["please"] == json!(true))
//!         })
//!         .permit([Purpose::Filter]),
//!     )
//!     .build();
//!
//! handler.start("greeting", "hello", json!({})).await.unwrap();
//! handler.notify("bye", json!({ "please": true })).await;
//!
//! let active = handler.active_nodes();
//! assert_eq!(active.len(), 1);
//! assert_eq!(active[0].template_id(), "farewell");
//! # });
//! ```

// Core modules
mod cleanup;
mod config;
mod dispatch;
mod error;
mod filter;
mod function;
mod handler;
mod lifecycle;
mod node;
mod registry;
mod session;
mod template;
mod transition;

/// Tracing target for engine flow.
pub(crate) const HANDLER_TARGET: &str = "dialog::handler";

/// Tracing target for execution reports: unknown references, denials, faults.
pub(crate) const REPORTING_TARGET: &str = "dialog::reporting";

// Re-export handler types (primary entry point)
pub use handler::{DialogHandler, DialogHandlerBuilder, ValidationIssue};

// Re-export configuration
pub use config::{ExceptionLevel, HandlerConfig, Settings, DEFAULT_CLEAN_INTERVAL_SECS};

// Re-export error types
pub use error::{DialogError, Result};

// Re-export function registry types
pub use function::{
    Action, CallEnvelope, Callable, Destination, Filter, FunctionRegistry, Purpose, Purposes,
    Registration, Signature, RESERVED_NAMES,
};

// Re-export runtime instance types
pub use node::{ActiveNode, NodeId, NodeStatus};
pub use session::{Session, SessionId};

// Re-export template types
pub use template::{
    CloseDirectives, EventSpec, FilterSpec, FunctionCall, NodeTemplate, SessionChaining,
    StartSpec, TemplateReferences, TransitionSpec, DEFAULT_TTL_SECS, NEVER_EXPIRES,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
