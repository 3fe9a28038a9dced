//! Tests for trace context propagation.

use super::*;

#[test]
fn test_root_context_ids() {
    let root = TraceContext::new_root();
    assert_eq!(root.trace_id().len(), 32);
    assert_eq!(root.span_id().len(), 16);
    assert!(root.parent_span_id().is_none());
    assert!(root.is_sampled());
}

#[test]
fn test_child_shares_trace_id() {
    let root = TraceContext::new_root();
    let child = root.child();

    assert_eq!(child.trace_id(), root.trace_id());
    assert_ne!(child.span_id(), root.span_id());
    assert_eq!(child.parent_span_id(), Some(root.span_id()));
}

#[test]
fn test_b3_inject_then_extract() {
    let propagator = B3Propagator;
    let context = TraceContext::new_root().child();
    let mut properties = HashMap::new();

    propagator.inject(&context, &mut properties);
    assert_eq!(properties.get(SAMPLED), Some(&"1".to_string()));

    let extracted = propagator.extract(&properties).expect("context should be present");
    assert_eq!(extracted, context);
}

#[test]
fn test_b3_extract_requires_trace_and_span() {
    let propagator = B3Propagator;
    let mut properties = HashMap::new();
    properties.insert(TRACE_ID.to_string(), "abc".to_string());

    assert!(propagator.extract(&properties).is_none());

    properties.insert(SPAN_ID.to_string(), String::new());
    assert!(propagator.extract(&properties).is_none());
}

#[test]
fn test_b3_extract_sampling_flag() {
    let propagator = B3Propagator;
    let mut properties = HashMap::new();
    properties.insert(TRACE_ID.to_string(), "abc".to_string());
    properties.insert(SPAN_ID.to_string(), "def".to_string());
    properties.insert(SAMPLED.to_string(), "0".to_string());

    let extracted = propagator.extract(&properties).unwrap();
    assert!(!extracted.is_sampled());
}

#[test]
fn test_noop_propagator() {
    let propagator = NoopPropagator;
    let mut properties = HashMap::new();
    propagator.inject(&TraceContext::new_root(), &mut properties);

    assert!(properties.is_empty());
    assert!(propagator.extract(&properties).is_none());
}
