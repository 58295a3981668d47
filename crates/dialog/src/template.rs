//! Node templates: immutable descriptions of how a dialog node behaves.
//!
//! Templates are produced by an external loader. This module only maps an
//! already-parsed definition (a `serde_json::Value`) onto typed records, with
//! explicit per-field defaults:
//!
//! | field           | default |
//! |-----------------|---------|
//! | `graph_start`   | none    |
//! | `TTL`           | `180`   |
//! | `actions`       | `[]`    |
//! | `events`        | `{}`    |
//! | `close_actions` | `[]`    |

use std::collections::{BTreeSet, HashMap};
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Result;
use crate::function::Purpose;

/// Default time-to-live of an activated node, in seconds.
pub const DEFAULT_TTL_SECS: i64 = 180;

/// TTL value meaning "never expires".
pub const NEVER_EXPIRES: i64 = -1;

/// Keys reserved for logical combinators inside filter lists.
pub(crate) const COMBINATORS: [&str; 2] = ["and", "or"];

// ============================================================================
// Function references
// ============================================================================

/// Reference to a registered function, with optional extra arguments.
///
/// Written either as a bare name (`"is_admin"`) or a single-key mapping
/// (`{"has_role": ["mod", "admin"]}`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct FunctionCall {
    pub name: String,
    pub args: Option<Value>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }
}

impl TryFrom<Value> for FunctionCall {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::String(name) => Ok(Self::new(name)),
            Value::Object(map) if map.len() == 1 => {
                let (name, args) = map.into_iter().next().ok_or("empty function mapping")?;
                Ok(Self {
                    name,
                    args: (!args.is_null()).then_some(args),
                })
            }
            other => Err(format!(
                "expected a function name or a single-key mapping, got `{other}`"
            )),
        }
    }
}

/// A filter tree: a function leaf or a logical combinator over sub-trees.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum FilterSpec {
    Call(FunctionCall),
    And(Vec<FilterSpec>),
    Or(Vec<FilterSpec>),
}

impl FilterSpec {
    pub fn call(name: impl Into<String>) -> Self {
        Self::Call(FunctionCall::new(name))
    }

    pub fn call_with(name: impl Into<String>, args: Value) -> Self {
        Self::Call(FunctionCall::new(name).with_args(args))
    }

    pub fn and(children: Vec<FilterSpec>) -> Self {
        Self::And(children)
    }

    pub fn or(children: Vec<FilterSpec>) -> Self {
        Self::Or(children)
    }

    /// Every function leaf in the tree, depth first.
    pub fn leaves(&self) -> Vec<&FunctionCall> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a FunctionCall>) {
        match self {
            Self::Call(call) => out.push(call),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

impl TryFrom<Value> for FilterSpec {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some((key, inner)) = map.iter().next() {
                    if COMBINATORS.contains(&key.as_str()) {
                        let Value::Array(items) = inner else {
                            return Err(format!("`{key}` expects a list of filters"));
                        };
                        let children = items
                            .iter()
                            .cloned()
                            .map(FilterSpec::try_from)
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        return Ok(if key == "and" {
                            Self::And(children)
                        } else {
                            Self::Or(children)
                        });
                    }
                }
            }
        }
        FunctionCall::try_from(value).map(Self::Call)
    }
}

// ============================================================================
// Close directives and session chaining
// ============================================================================

/// Which closes to perform once an event finishes processing on a node.
///
/// Written as `"node"`, `"session"` or a list of both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Value")]
pub struct CloseDirectives {
    pub node: bool,
    pub session: bool,
}

impl CloseDirectives {
    pub const NONE: Self = Self {
        node: false,
        session: false,
    };

    pub fn node() -> Self {
        Self {
            node: true,
            session: false,
        }
    }

    pub fn session() -> Self {
        Self {
            node: false,
            session: true,
        }
    }

    pub fn any(&self) -> bool {
        self.node || self.session
    }

    fn apply(&mut self, flag: &str) -> std::result::Result<(), String> {
        match flag {
            "node" => self.node = true,
            "session" => self.session = true,
            other => return Err(format!("unknown close target `{other}`")),
        }
        Ok(())
    }
}

impl BitOr for CloseDirectives {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            node: self.node || rhs.node,
            session: self.session || rhs.session,
        }
    }
}

impl BitOrAssign for CloseDirectives {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

impl TryFrom<Value> for CloseDirectives {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let mut directives = Self::default();
        match value {
            Value::Null => {}
            Value::String(flag) => directives.apply(&flag)?,
            Value::Array(flags) => {
                for flag in flags {
                    let Value::String(flag) = flag else {
                        return Err(format!("close targets must be strings, got `{flag}`"));
                    };
                    directives.apply(&flag)?;
                }
            }
            other => return Err(format!("invalid schedule_close value `{other}`")),
        }
        Ok(directives)
    }
}

/// How a transition relates the destination node to sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionChaining {
    /// Always open a fresh session.
    Start,
    /// Reuse the source node's session, opening one if it has none.
    Chain,
    /// Do not add the destination to any session.
    End,
}

// ============================================================================
// Template sections
// ============================================================================

/// Entry-point settings for one event key.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StartSpec {
    #[serde(default, deserialize_with = "nullable")]
    pub filters: Vec<FilterSpec>,
    #[serde(default, deserialize_with = "nullable")]
    pub setup: Vec<FunctionCall>,
    #[serde(default)]
    pub session_chaining: Option<SessionChaining>,
}

/// One transition rule of an event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransitionSpec {
    #[serde(deserialize_with = "one_or_many")]
    pub node_names: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub transition_filters: Vec<FilterSpec>,
    #[serde(
        default,
        alias = "transition_callbacks",
        deserialize_with = "nullable"
    )]
    pub transition_actions: Vec<FunctionCall>,
    #[serde(default)]
    pub schedule_close: CloseDirectives,
    #[serde(default)]
    pub session_chaining: Option<SessionChaining>,
}

impl TransitionSpec {
    pub fn to(node_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            node_names: node_names.into_iter().map(Into::into).collect(),
            transition_filters: Vec::new(),
            transition_actions: Vec::new(),
            schedule_close: CloseDirectives::NONE,
            session_chaining: None,
        }
    }
}

/// How a node reacts to one event key.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EventSpec {
    #[serde(default, deserialize_with = "nullable")]
    pub filters: Vec<FilterSpec>,
    #[serde(default, deserialize_with = "nullable")]
    pub actions: Vec<FunctionCall>,
    #[serde(default, deserialize_with = "nullable")]
    pub transitions: Vec<TransitionSpec>,
    #[serde(default)]
    pub schedule_close: CloseDirectives,
}

/// Immutable description of a dialog node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeTemplate {
    pub id: String,
    #[serde(default)]
    pub graph_start: Option<HashMap<String, Option<StartSpec>>>,
    #[serde(
        rename = "TTL",
        alias = "ttl",
        default = "default_ttl",
        deserialize_with = "ttl_seconds"
    )]
    pub ttl: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub actions: Vec<FunctionCall>,
    #[serde(default, deserialize_with = "nullable")]
    pub events: HashMap<String, Option<EventSpec>>,
    #[serde(default, deserialize_with = "nullable")]
    pub close_actions: Vec<FunctionCall>,
}

impl NodeTemplate {
    /// A template with every optional field at its default.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            graph_start: None,
            ttl: DEFAULT_TTL_SECS,
            actions: Vec::new(),
            events: HashMap::new(),
            close_actions: Vec::new(),
        }
    }

    /// Map an already-parsed definition onto a template.
    pub fn from_value(definition: Value) -> Result<Self> {
        Ok(serde_json::from_value(definition)?)
    }

    /// Parse a JSON document holding one definition.
    pub fn from_json(definition: &str) -> Result<Self> {
        Ok(serde_json::from_str(definition)?)
    }

    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_start(mut self, event_key: impl Into<String>, start: StartSpec) -> Self {
        self.graph_start
            .get_or_insert_with(HashMap::new)
            .insert(event_key.into(), Some(start));
        self
    }

    pub fn with_event(mut self, event_key: impl Into<String>, event: EventSpec) -> Self {
        self.events.insert(event_key.into(), Some(event));
        self
    }

    pub fn with_action(mut self, action: FunctionCall) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_close_action(mut self, action: FunctionCall) -> Self {
        self.close_actions.push(action);
        self
    }

    pub fn can_start(&self, event_key: &str) -> bool {
        self.graph_start
            .as_ref()
            .is_some_and(|starts| starts.contains_key(event_key))
    }

    pub fn start_spec(&self, event_key: &str) -> Option<&StartSpec> {
        self.graph_start.as_ref()?.get(event_key)?.as_ref()
    }

    pub fn start_filters(&self, event_key: &str) -> &[FilterSpec] {
        self.start_spec(event_key)
            .map_or(&[], |start| start.filters.as_slice())
    }

    pub fn start_setup(&self, event_key: &str) -> &[FunctionCall] {
        self.start_spec(event_key)
            .map_or(&[], |start| start.setup.as_slice())
    }

    /// Whether starting on this event opens a session for the new node.
    pub fn starts_with_session(&self, event_key: &str) -> bool {
        matches!(
            self.start_spec(event_key).and_then(|start| start.session_chaining),
            Some(SessionChaining::Start | SessionChaining::Chain)
        )
    }

    /// Event keys this template listens for.
    pub fn event_keys(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    pub fn event(&self, event_key: &str) -> Option<&EventSpec> {
        self.events.get(event_key)?.as_ref()
    }

    pub fn event_filters(&self, event_key: &str) -> &[FilterSpec] {
        self.event(event_key)
            .map_or(&[], |event| event.filters.as_slice())
    }

    pub fn event_actions(&self, event_key: &str) -> &[FunctionCall] {
        self.event(event_key)
            .map_or(&[], |event| event.actions.as_slice())
    }

    pub fn transitions(&self, event_key: &str) -> &[TransitionSpec] {
        self.event(event_key)
            .map_or(&[], |event| event.transitions.as_slice())
    }

    pub fn close_flags(&self, event_key: &str) -> CloseDirectives {
        self.event(event_key)
            .map_or(CloseDirectives::NONE, |event| event.schedule_close)
    }

    /// Absolute expiry for a node activated at `now`; `None` never expires.
    pub fn expiry_from(&self, now: Instant) -> Option<Instant> {
        let secs = u64::try_from(self.ttl).ok()?;
        Some(now + Duration::from_secs(secs))
    }

    /// Every template and function this template refers to.
    pub fn references(&self) -> TemplateReferences<'_> {
        let mut refs = TemplateReferences::default();
        if let Some(starts) = &self.graph_start {
            for (key, start) in starts {
                let Some(start) = start else { continue };
                refs.filters(
                    &start.filters,
                    Purpose::Filter,
                    format!("graph start `{key}` filters"),
                );
                refs.calls(&start.setup, Purpose::Action, format!("graph start `{key}` setup"));
            }
        }
        refs.calls(&self.actions, Purpose::Action, "enter actions".to_string());
        refs.calls(&self.close_actions, Purpose::Action, "close actions".to_string());
        for (key, event) in &self.events {
            let Some(event) = event else { continue };
            refs.filters(&event.filters, Purpose::Filter, format!("event `{key}` filters"));
            refs.calls(&event.actions, Purpose::Action, format!("event `{key}` actions"));
            for (index, transition) in event.transitions.iter().enumerate() {
                refs.destinations
                    .extend(transition.node_names.iter().map(String::as_str));
                refs.filters(
                    &transition.transition_filters,
                    Purpose::TransitionFilter,
                    format!("event `{key}` transition {index} filters"),
                );
                refs.calls(
                    &transition.transition_actions,
                    Purpose::TransitionAction,
                    format!("event `{key}` transition {index} actions"),
                );
            }
        }
        refs
    }
}

/// Outgoing references of one template, used for validation.
#[derive(Debug, Default)]
pub struct TemplateReferences<'a> {
    pub destinations: BTreeSet<&'a str>,
    /// `(function, purpose, where it is referenced)`.
    pub functions: Vec<(&'a str, Purpose, String)>,
}

impl<'a> TemplateReferences<'a> {
    fn calls(&mut self, calls: &'a [FunctionCall], purpose: Purpose, location: String) {
        for call in calls {
            self.functions.push((call.name.as_str(), purpose, location.clone()));
        }
    }

    fn filters(&mut self, filters: &'a [FilterSpec], purpose: Purpose, location: String) {
        for filter in filters {
            for leaf in filter.leaves() {
                self.functions.push((leaf.name.as_str(), purpose, location.clone()));
            }
        }
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

fn default_ttl() -> i64 {
    DEFAULT_TTL_SECS
}

fn ttl_seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    let ttl = Option::<i64>::deserialize(deserializer)?.unwrap_or(DEFAULT_TTL_SECS);
    if ttl < NEVER_EXPIRES {
        return Err(serde::de::Error::custom(format!(
            "TTL must be -1 or a non-negative number of seconds, got {ttl}"
        )));
    }
    Ok(ttl)
}

fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn one_or_many<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}
