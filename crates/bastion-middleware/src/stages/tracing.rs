//! Tracing adapter.
//!
//! Opens a server-kind `tracing` span per request, publishes the trace and
//! span ids on the context, and reports them on the response for
//! client-side correlation.
//!
//! ## Trace Context Propagation
//!
//! Supports the [W3C Trace Context](https://www.w3.org/TR/trace-context/)
//! `traceparent` header. A valid inbound header supplies the trace id and
//! parent span; otherwise a new 128-bit trace id is generated.
//!
//! ## Span Attributes
//!
//! - `http.method`, `http.target`, `http.route`, `service.name`,
//!   `service.version`, `request_id`
//! - `http.user_agent`, `http.client_ip` (only for sampled requests)
//! - on completion: `http.status_code`, `http.response_bytes`,
//!   `duration_ms`, and `otel.status_code = "ERROR"` for status >= 400
//!
//! ## Response Headers
//!
//! `X-Trace-ID`, `X-Span-ID`, `X-Response-Time` and `X-Request-Duration-Ms`.

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response, ResponseExt};
use bastion_core::client_ip;
use http::header::{HeaderName, USER_AGENT};
use http_body::Body;
use std::fmt;
use std::sync::Arc;
use tracing::field::Empty;
use tracing::Instrument;
use uuid::Uuid;

/// The W3C Trace Context header for trace propagation.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Response header carrying the trace id.
pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");

/// Response header carrying the span id.
pub const SPAN_ID_HEADER: HeaderName = HeaderName::from_static("x-span-id");

/// Response header carrying the human-readable duration.
pub const RESPONSE_TIME_HEADER: HeaderName = HeaderName::from_static("x-response-time");

/// Response header carrying the duration in whole milliseconds.
pub const DURATION_MS_HEADER: HeaderName = HeaderName::from_static("x-request-duration-ms");

/// Resolves the route pattern used as the span name.
pub type RouteResolver = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// Opens a span per request and emits trace headers.
#[derive(Clone)]
pub struct TracingMiddleware {
    service_name: String,
    service_version: String,
    route_resolver: Option<RouteResolver>,
}

impl fmt::Debug for TracingMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingMiddleware")
            .field("service_name", &self.service_name)
            .field("service_version", &self.service_version)
            .field("route_resolver", &self.route_resolver.is_some())
            .finish()
    }
}

impl TracingMiddleware {
    /// Creates a tracing stage for the named service.
    #[must_use]
    pub fn new(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            route_resolver: None,
        }
    }

    /// Names spans by route pattern instead of the raw path.
    #[must_use]
    pub fn with_route_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        self.route_resolver = Some(Arc::new(resolver));
        self
    }

    fn extract_trace_context(request: &Request) -> Option<TraceContext> {
        let header = request.headers().get(TRACEPARENT_HEADER)?;
        TraceContext::parse(header.to_str().ok()?)
    }

    fn route(&self, request: &Request) -> String {
        self.route_resolver
            .as_ref()
            .and_then(|resolve| resolve(request))
            .unwrap_or_else(|| request.uri().path().to_string())
    }

    /// Generates a new trace ID (128-bit).
    fn generate_trace_id() -> String {
        Uuid::now_v7().simple().to_string()
    }

    /// Generates a new span ID (64-bit).
    fn generate_span_id() -> String {
        let bytes = Uuid::now_v7().into_bytes();
        bytes[8..].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Default for TracingMiddleware {
    fn default() -> Self {
        Self::new("unknown", "0.0.0")
    }
}

impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let trace_context = Self::extract_trace_context(&request).unwrap_or_else(|| TraceContext {
                trace_id: Self::generate_trace_id(),
                parent_span_id: None,
                flags: TraceFlags::SAMPLED,
            });
            let span_id = Self::generate_span_id();

            if let Err(err) = ctx.set_trace(trace_context.trace_id.clone(), span_id.clone()) {
                tracing::warn!(error = %err, "trace context already set");
            }
            let trace_id = ctx.trace_id().unwrap_or(trace_context.trace_id.as_str()).to_string();
            let span_id = ctx.span_id().unwrap_or(span_id.as_str()).to_string();

            let route = self.route(&request);
            let method = request.method().clone();
            let target = request
                .uri()
                .path_and_query()
                .map_or_else(|| request.uri().path().to_string(), ToString::to_string);

            let span = tracing::info_span!(
                "http.request",
                otel.kind = "server",
                otel.name = %format!("{method} {route}"),
                otel.status_code = Empty,
                http.method = %method,
                http.target = %target,
                http.route = %route,
                http.user_agent = Empty,
                http.client_ip = Empty,
                http.status_code = Empty,
                http.response_bytes = Empty,
                duration_ms = Empty,
                service.name = %self.service_name,
                service.version = %self.service_version,
                request_id = %ctx.request_id(),
                trace_id = %trace_id,
                span_id = %span_id,
                parent_span_id = trace_context.parent_span_id.as_deref().unwrap_or(""),
                sampled = ctx.is_sampled(),
            );

            if ctx.is_sampled() {
                if let Some(agent) = request.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
                    span.record("http.user_agent", agent);
                }
                if let Some(ip) = client_ip(&request) {
                    span.record("http.client_ip", ip.as_str());
                }
            }

            ctx.set_extension(SpanInfo {
                service_name: self.service_name.clone(),
                method: method.to_string(),
                route: route.clone(),
                parent_span_id: trace_context.parent_span_id.clone(),
                flags: trace_context.flags,
            });

            let mut response = next.run(ctx, request).instrument(span.clone()).await;

            let elapsed = ctx.elapsed();
            let status = response.status();
            let duration_ms = elapsed.as_millis() as u64;
            span.record("http.status_code", status.as_u16());
            if let Some(bytes) = response.body().size_hint().exact() {
                span.record("http.response_bytes", bytes);
            }
            span.record("duration_ms", duration_ms);
            if status.as_u16() >= 400 {
                span.record("otel.status_code", "ERROR");
            }

            metrics::counter!("bastion_requests_total", "status" => status.as_u16().to_string())
                .increment(1);
            metrics::histogram!("bastion_request_duration_seconds").record(elapsed.as_secs_f64());

            response.set_header(TRACE_ID_HEADER, &trace_id);
            response.set_header(SPAN_ID_HEADER, &span_id);
            response.set_header(RESPONSE_TIME_HEADER, format!("{elapsed:?}"));
            response.set_header(DURATION_MS_HEADER, duration_ms);
            response
        })
    }
}

/// Parsed trace context from W3C Trace Context headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// The 128-bit trace ID as a hex string.
    pub trace_id: String,
    /// The parent span ID (if propagated from upstream).
    pub parent_span_id: Option<String>,
    /// Trace flags (sampling, etc.).
    pub flags: TraceFlags,
}

impl TraceContext {
    /// Parses a `traceparent` header value.
    ///
    /// Format: `{version}-{trace-id}-{parent-span-id}-{flags}`. All-zero
    /// trace and span ids are invalid.
    pub fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() != 4 || parts[0] != "00" {
            return None;
        }

        let is_hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
        let (trace_id, parent_span_id, flags) = (parts[1], parts[2], parts[3]);
        if !is_hex(trace_id, 32) || !is_hex(parent_span_id, 16) || !is_hex(flags, 2) {
            return None;
        }
        if trace_id.bytes().all(|b| b == b'0') || parent_span_id.bytes().all(|b| b == b'0') {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            parent_span_id: Some(parent_span_id.to_ascii_lowercase()),
            flags: TraceFlags(u8::from_str_radix(flags, 16).ok()?),
        })
    }
}

/// W3C Trace Context flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// No flags set.
    pub const NONE: Self = Self(0x00);
    /// The trace is sampled.
    pub const SAMPLED: Self = Self(0x01);

    /// Returns true if the sampled flag is set.
    #[must_use]
    pub const fn is_sampled(self) -> bool {
        self.0 & 0x01 != 0
    }
}

/// Span details stored as a context extension.
#[derive(Debug, Clone)]
pub struct SpanInfo {
    /// The service name.
    pub service_name: String,
    /// The HTTP method.
    pub method: String,
    /// The route the span is named after.
    pub route: String,
    /// The parent span ID (if propagated).
    pub parent_span_id: Option<String>,
    /// Upstream trace flags.
    pub flags: TraceFlags,
}
