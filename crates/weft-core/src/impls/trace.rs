//! Trace propagators.

use crate::domain::Execution;
use crate::ports::trace::TRACESTATE;
use crate::ports::{TraceContext, TracePropagator};

/// Writes W3C `traceparent` and `tracestate` headers onto the execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct W3cTracePropagator;

impl TracePropagator for W3cTracePropagator {
    fn inject(&self, context: &TraceContext, execution: &mut Execution) {
        execution.trace_headers.remove(TRACESTATE);
        execution.trace_headers.extend(context.to_headers());
    }
}

/// Leaves executions untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracePropagator;

impl TracePropagator for NoopTracePropagator {
    fn inject(&self, _context: &TraceContext, _execution: &mut Execution) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::trace::TRACEPARENT;
    use crate::domain::{ExecutionId, Flow};
    use std::collections::HashMap;

    #[test]
    fn child_spans_stay_in_the_parent_trace() {
        let mut parent = Execution::new_execution(
            ExecutionId::random(),
            &Flow::new("ns", "parent"),
            HashMap::new(),
            Vec::new(),
        );
        let root = TraceContext::child_of(&parent);
        W3cTracePropagator.inject(&root, &mut parent);

        let mut child = parent.clone();
        let span = TraceContext::child_of(&parent);
        W3cTracePropagator.inject(&span, &mut child);

        let header = TraceContext::parse(&child.trace_headers[TRACEPARENT]).unwrap();
        assert_eq!(header.trace_id, root.trace_id);
        assert_eq!(header.span_id, span.span_id);
    }

    #[test]
    fn tracestate_follows_the_parent() {
        let mut parent = Execution::new_execution(
            ExecutionId::random(),
            &Flow::new("ns", "parent"),
            HashMap::new(),
            Vec::new(),
        );
        parent.trace_headers.insert(
            TRACEPARENT.to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        parent
            .trace_headers
            .insert(TRACESTATE.to_string(), "weft=demo".to_string());

        let mut child = Execution::new_execution(
            ExecutionId::random(),
            &Flow::new("ns", "child"),
            HashMap::new(),
            Vec::new(),
        );
        let span = TraceContext::child_of(&parent);
        W3cTracePropagator.inject(&span, &mut child);

        assert_eq!(child.trace_headers[TRACESTATE], "weft=demo");
        assert_eq!(span.parent_span_id, Some(0x00f067aa0ba902b7));
        assert!(child.trace_headers[TRACEPARENT].starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
    }

    #[test]
    fn noop_does_nothing() {
        let mut exec = Execution::new_execution(
            ExecutionId::random(),
            &Flow::new("ns", "f"),
            HashMap::new(),
            Vec::new(),
        );
        NoopTracePropagator.inject(&TraceContext::child_of(&exec), &mut exec);
        assert!(exec.trace_headers.is_empty());
    }
}
