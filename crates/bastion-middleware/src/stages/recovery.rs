//! Panic recovery.
//!
//! Recovery is the outermost stage. It polls the rest of the pipeline
//! inside `catch_unwind`; a panic anywhere below it becomes a `500` error
//! envelope with code `INTERNAL_ERROR` and the process keeps serving.
//!
//! The panic message and a stack trace, truncated to
//! [`DEFAULT_MAX_STACK_BYTES`] by default, are logged at `error` with the
//! request method and path. The stack is captured where the panic happened
//! when [`install_panic_hook`] has been called, and at the recovery site
//! otherwise.

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response, ResponseExt};
use bastion_core::ApiError;
use futures_util::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

/// Default stack-trace budget in bytes.
pub const DEFAULT_MAX_STACK_BYTES: usize = 8 * 1024;

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Installs a process-wide panic hook that records the backtrace of the
/// panicking thread for [`RecoveryMiddleware`].
///
/// The previous hook still runs. Calling this more than once has no
/// further effect.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<String> {
    PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Extracts a printable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Truncates `text` to at most `max` bytes on a character boundary.
fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("\n... (truncated)");
    }
    text
}

/// Converts panics into `500 INTERNAL_ERROR` responses.
#[derive(Debug, Clone)]
pub struct RecoveryMiddleware {
    max_stack_bytes: usize,
    capture_stack: bool,
}

impl Default for RecoveryMiddleware {
    fn default() -> Self {
        Self {
            max_stack_bytes: DEFAULT_MAX_STACK_BYTES,
            capture_stack: true,
        }
    }
}

impl RecoveryMiddleware {
    /// Creates a recovery stage with the default stack budget.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stack-trace budget in bytes.
    #[must_use]
    pub fn max_stack_bytes(mut self, max: usize) -> Self {
        self.max_stack_bytes = max;
        self
    }

    /// Enables or disables stack capture.
    #[must_use]
    pub fn capture_stack(mut self, capture: bool) -> Self {
        self.capture_stack = capture;
        self
    }
}

impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let method = request.method().clone();
            let path = request.uri().path().to_string();

            // The slot may hold a trace from a panic no recovery stage consumed.
            take_backtrace();
            let outcome = AssertUnwindSafe(next.run(ctx, request)).catch_unwind().await;
            match outcome {
                Ok(response) => response,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    let recorded = take_backtrace();
                    let stack = if self.capture_stack {
                        let trace = recorded.unwrap_or_else(|| Backtrace::force_capture().to_string());
                        truncate(trace, self.max_stack_bytes)
                    } else {
                        String::new()
                    };

                    tracing::error!(
                        request_id = %ctx.request_id(),
                        method = %method,
                        path = %path,
                        panic = %message,
                        stack = %stack,
                        "recovered from panic"
                    );
                    metrics::counter!("bastion_panics_recovered_total").increment(1);

                    Response::from_error(ApiError::internal("Internal server error"), ctx)
                }
            }
        })
    }
}
