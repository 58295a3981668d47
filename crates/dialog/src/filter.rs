//! Recursive evaluation of and/or filter trees.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::function::{Destination, FunctionRegistry, Purpose};
use crate::node::ActiveNode;
use crate::template::{FilterSpec, FunctionCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
}

/// Everything a leaf needs to call its function.
pub(crate) struct FilterScope<'a> {
    pub functions: &'a FunctionRegistry,
    pub purpose: Purpose,
    pub node: &'a Arc<ActiveNode>,
    pub event: &'a Arc<Value>,
    /// Candidate destination, for transition filters.
    pub destination: Option<&'a str>,
}

impl FilterScope<'_> {
    /// Evaluate a filter list. The top level is an implicit `and`.
    ///
    /// Short-circuits: `and` stops at the first `false`, `or` at the first
    /// `true`. An empty `and` is `true`, an empty `or` is `false`.
    pub(crate) fn evaluate(&self, filters: &[FilterSpec]) -> Result<bool> {
        self.evaluate_list(filters, Combinator::And)
    }

    fn evaluate_list(&self, filters: &[FilterSpec], combinator: Combinator) -> Result<bool> {
        for filter in filters {
            let passed = match filter {
                FilterSpec::Call(call) => self.leaf(call)?,
                FilterSpec::And(children) => self.evaluate_list(children, Combinator::And)?,
                FilterSpec::Or(children) => self.evaluate_list(children, Combinator::Or)?,
            };
            match combinator {
                Combinator::And if !passed => return Ok(false),
                Combinator::Or if passed => return Ok(true),
                _ => {}
            }
        }
        Ok(combinator == Combinator::And)
    }

    fn leaf(&self, call: &FunctionCall) -> Result<bool> {
        let destination = self
            .destination
            .map(|name| Destination::Template(name.to_string()));
        self.functions
            .run_filter(call, self.purpose, self.node, self.event, destination)
    }
}
