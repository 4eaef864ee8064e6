//! Ordered predicate chain applied to each [`Message`] before it is emitted.
//!
//! `filter(message)` is a logical OR over the installed steps with
//! short-circuit on the first positive match, exactly as specified: a
//! message is dropped (silently acked) the moment any step says it should
//! be. Steps are immutable once installed; the chain itself can have steps
//! added or removed between `next_tuple` calls by the supervisor.

use serde_json_path::JsonPath;

use crate::message::Message;

/// A single predicate step in a [`FilterChain`].
pub trait FilterStep: Send + Sync {
    /// Returns true if this step says the message should be dropped.
    fn matches(&self, message: &Message) -> bool;
}

/// Filters messages whose JSON-decoded value matches a JSONPath expression.
///
/// Generalizes `Record::matches` / `FilterableRecord` (`kafka.rs`), which
/// used `serde_json_path` to let a human filter records for display. Here
/// the same query decides whether the engine should skip a record entirely,
/// advancing the commit frontier without emitting it downstream.
pub struct JsonPathFilterStep {
    path: JsonPath,
}

impl JsonPathFilterStep {
    /// Builds a step from a JSONPath expression string.
    pub fn parse(expr: impl AsRef<str>) -> Result<Self, serde_json_path::ParseError> {
        let path = JsonPath::parse(expr.as_ref())?;
        Ok(Self { path })
    }
}

impl FilterStep for JsonPathFilterStep {
    fn matches(&self, message: &Message) -> bool {
        let Ok(text) = std::str::from_utf8(&message.values) else {
            return false;
        };

        let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
            return false;
        };

        !self.path.query(&json).is_empty()
    }
}

/// Filters messages using an arbitrary predicate closure, for filter steps
/// constructed programmatically by the sideline trigger subsystem rather
/// than parsed from configuration.
pub struct PredicateFilterStep<F>
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateFilterStep<F>
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FilterStep for PredicateFilterStep<F>
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn matches(&self, message: &Message) -> bool {
        (self.predicate)(message)
    }
}

/// Ordered, mutable sequence of [`FilterStep`]s.
#[derive(Default)]
pub struct FilterChain {
    steps: Vec<Box<dyn FilterStep>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Box<dyn FilterStep>) {
        self.steps.push(step);
    }

    pub fn remove_last(&mut self) -> Option<Box<dyn FilterStep>> {
        self.steps.pop()
    }

    /// Number of installed steps; observable for metrics.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns true iff any step matches, short-circuiting on the first hit.
    pub fn filter(&self, message: &Message) -> bool {
        self.steps.iter().any(|step| step.matches(message))
    }
}
