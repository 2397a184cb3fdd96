//! TracePropagator port: distributed-trace context carried on executions.
//!
//! Executions carry W3C Trace Context headers (`traceparent`, and
//! `tracestate` when the trace has vendor state). A child execution joins its
//! parent's trace with a new span.

use std::collections::BTreeMap;

use crate::domain::Execution;

/// W3C Trace Context traceparent header.
pub const TRACEPARENT: &str = "traceparent";
/// W3C Trace Context tracestate header.
pub const TRACESTATE: &str = "tracestate";

/// The span a dispatch runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: u128,
    pub span_id: u64,
    /// Span of the execution this one was dispatched from, if any.
    pub parent_span_id: Option<u64>,
    pub sampled: bool,
    /// Vendor state, propagated untouched.
    pub tracestate: Option<String>,
}

impl TraceContext {
    pub fn new_root() -> Self {
        Self {
            trace_id: rand::random::<u128>().max(1),
            span_id: non_zero_span(),
            parent_span_id: None,
            sampled: true,
            tracestate: None,
        }
    }

    /// Same trace, new span whose parent is this one.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: non_zero_span(),
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
            tracestate: self.tracestate.clone(),
        }
    }

    /// New span inside the trace of `execution`, or a new trace when the
    /// execution carries none.
    pub fn child_of(execution: &Execution) -> Self {
        Self::from_headers(&execution.trace_headers)
            .map(|parent| parent.child())
            .unwrap_or_else(Self::new_root)
    }

    /// `None` without a well-formed `traceparent`.
    pub fn from_headers(headers: &BTreeMap<String, String>) -> Option<Self> {
        let mut context = Self::parse(headers.get(TRACEPARENT)?)?;
        context.tracestate = headers.get(TRACESTATE).cloned();
        Some(context)
    }

    pub fn to_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(TRACEPARENT.to_string(), self.traceparent());
        if let Some(state) = &self.tracestate {
            headers.insert(TRACESTATE.to_string(), state.clone());
        }
        headers
    }

    /// `00-<trace>-<span>-<flags>`
    pub fn traceparent(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{}",
            self.trace_id,
            self.span_id,
            if self.sampled { "01" } else { "00" }
        )
    }

    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split('-');
        let (version, trace, span, flags) =
            (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
        if version != "00" || parts.next().is_some() || trace.len() != 32 || span.len() != 16 {
            return None;
        }
        let trace_id = u128::from_str_radix(trace, 16).ok()?;
        let span_id = u64::from_str_radix(span, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;
        if trace_id == 0 || span_id == 0 {
            return None;
        }
        Some(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            sampled: flags & 1 == 1,
            tracestate: None,
        })
    }
}

fn non_zero_span() -> u64 {
    rand::random::<u64>().max(1)
}

/// Attaches trace headers to an execution. Opaque to the engine.
pub trait TracePropagator: Send + Sync {
    fn inject(&self, context: &TraceContext, execution: &mut Execution);
}
