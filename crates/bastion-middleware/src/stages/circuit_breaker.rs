//! Circuit breaker stage.
//!
//! Wraps the rest of the pipeline in a named [`CircuitBreaker`]. While the
//! circuit is open, requests are answered with `503 SERVICE_UNAVAILABLE`
//! and a `Retry-After` hint without reaching the handler. Otherwise the
//! downstream status is recorded: anything below 500 counts as success,
//! so client errors such as 401 and 403 keep the circuit closed.

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response, ResponseExt};
use bastion_control::{BreakerRegistry, CircuitBreaker};
use bastion_core::ApiError;
use std::fmt;
use std::sync::Arc;

/// Maps a request to the name of the dependency it calls.
pub type BreakerNameFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

enum Target {
    Fixed(Arc<CircuitBreaker>),
    PerRequest(BreakerNameFn),
}

/// Fails fast while a dependency is unhealthy.
pub struct CircuitBreakerMiddleware {
    registry: Arc<BreakerRegistry>,
    target: Target,
}

impl fmt::Debug for CircuitBreakerMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Fixed(breaker) => breaker.name().to_string(),
            Target::PerRequest(_) => "<per-request>".to_string(),
        };
        f.debug_struct("CircuitBreakerMiddleware")
            .field("target", &target)
            .field("breakers", &self.registry.len())
            .finish()
    }
}

impl CircuitBreakerMiddleware {
    /// Guards every request with the breaker called `name`.
    #[must_use]
    pub fn new(registry: Arc<BreakerRegistry>, name: &str) -> Self {
        let breaker = registry.get_or_create(name);
        Self {
            registry,
            target: Target::Fixed(breaker),
        }
    }

    /// Picks the breaker per request, creating it on first use.
    #[must_use]
    pub fn per_request<F>(registry: Arc<BreakerRegistry>, name_for: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        Self {
            registry,
            target: Target::PerRequest(Arc::new(name_for)),
        }
    }

    /// Returns the breaker table.
    #[must_use]
    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    fn breaker_for(&self, request: &Request) -> Arc<CircuitBreaker> {
        match &self.target {
            Target::Fixed(breaker) => Arc::clone(breaker),
            Target::PerRequest(name_for) => self.registry.get_or_create(&name_for(request)),
        }
    }
}

impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let breaker = self.breaker_for(&request);

            if let Err(open) = breaker.allow() {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    method = %request.method(),
                    path = %request.uri().path(),
                    breaker = %open.name,
                    retry_after_ms = open.retry_after.as_millis() as u64,
                    "circuit open, request rejected"
                );
                metrics::counter!("bastion_circuit_rejections_total", "breaker" => open.name.clone())
                    .increment(1);

                let error = ApiError::service_unavailable(
                    "Service temporarily unavailable",
                    Some(open.retry_after),
                )
                .with_detail("breaker", open.name);
                return Response::from_error(error, ctx);
            }

            let response = next.run(ctx, request).await;
            breaker.record_status(response.status().as_u16());
            response
        })
    }
}
