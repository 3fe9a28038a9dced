//! Trace context propagation through message application properties.
//!
//! There is no process-wide tracer. Receivers and senders are handed a
//! [`TracePropagator`] when they are built; received messages are turned into
//! a [`TraceContext`] before the handler runs and outgoing messages carry the
//! caller's context in their properties.

use std::collections::HashMap;
use std::fmt;

/// B3 header carrying the 128-bit trace id
pub const TRACE_ID: &str = "x-b3-traceid";
/// B3 header carrying the 64-bit span id
pub const SPAN_ID: &str = "x-b3-spanid";
/// B3 header carrying the parent span id
pub const PARENT_SPAN_ID: &str = "x-b3-parentspanid";
/// B3 header carrying the sampling decision
pub const SAMPLED: &str = "x-b3-sampled";

/// Identity of one span within a distributed trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    sampled: bool,
}

impl TraceContext {
    /// Start a new trace
    pub fn new_root() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
            sampled: true,
        }
    }

    /// Rebuild a context from its parts, as found on the wire
    pub fn from_parts(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        parent_span_id: Option<String>,
        sampled: bool,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id,
            sampled,
        }
    }

    /// Create a child span in the same trace
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.trace_id, self.span_id)
    }
}

fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Moves trace contexts in and out of message properties
pub trait TracePropagator: Send + Sync {
    /// Read a context from received message properties, if one is present
    fn extract(&self, properties: &HashMap<String, String>) -> Option<TraceContext>;

    /// Write a context into outgoing message properties
    fn inject(&self, context: &TraceContext, properties: &mut HashMap<String, String>);
}

/// Zipkin B3 multi-header propagation
#[derive(Debug, Clone, Copy, Default)]
pub struct B3Propagator;

impl TracePropagator for B3Propagator {
    fn extract(&self, properties: &HashMap<String, String>) -> Option<TraceContext> {
        let trace_id = properties.get(TRACE_ID).filter(|v| !v.is_empty())?;
        let span_id = properties.get(SPAN_ID).filter(|v| !v.is_empty())?;
        let parent_span_id = properties
            .get(PARENT_SPAN_ID)
            .filter(|v| !v.is_empty())
            .cloned();
        let sampled = properties
            .get(SAMPLED)
            .map_or(true, |v| v == "1" || v.eq_ignore_ascii_case("true"));

        Some(TraceContext::from_parts(
            trace_id.clone(),
            span_id.clone(),
            parent_span_id,
            sampled,
        ))
    }

    fn inject(&self, context: &TraceContext, properties: &mut HashMap<String, String>) {
        properties.insert(TRACE_ID.to_string(), context.trace_id.clone());
        properties.insert(SPAN_ID.to_string(), context.span_id.clone());
        if let Some(parent) = &context.parent_span_id {
            properties.insert(PARENT_SPAN_ID.to_string(), parent.clone());
        }
        properties.insert(
            SAMPLED.to_string(),
            if context.sampled { "1" } else { "0" }.to_string(),
        );
    }
}

/// Propagator used when tracing is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPropagator;

impl TracePropagator for NoopPropagator {
    fn extract(&self, _properties: &HashMap<String, String>) -> Option<TraceContext> {
        None
    }

    fn inject(&self, _context: &TraceContext, _properties: &mut HashMap<String, String>) {}
}

#[cfg(test)]
#[path = "trace_tests.rs"]
mod tests;
