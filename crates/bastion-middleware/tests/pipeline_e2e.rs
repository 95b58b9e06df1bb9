//! End-to-end pipeline integration tests.
//!
//! These tests run every stage together in canonical order:
//!
//! 1. Recovery
//! 2. Sampling
//! 3. Tracing
//! 4. CORS
//! 5. Rate limit
//! 6. Circuit breaker
//! 7. Authenticate
//! 8. Authorize
//! 9. Timeout

use bastion_auth::{JwtConfig, JwtKey, JwtVerifier, RbacStore, TokenSubject};
use bastion_control::{BreakerConfig, BreakerRegistry, BucketConfig, BucketRegistry, Sampler};
use bastion_core::empty_response;
use bastion_middleware::{
    context::MiddlewareContext,
    middleware::BoxFuture,
    pipeline::{Pipeline, Stage},
    skip::SkipPaths,
    stages::{
        tracing::TRACE_ID_HEADER, AuthenticateMiddleware, AuthorizeMiddleware,
        CircuitBreakerMiddleware, CorsMiddleware, RateLimitMiddleware, RecoveryMiddleware,
        Requirement, SamplingMiddleware, TimeoutMiddleware, TracingMiddleware,
    },
    types::{Request, Response},
};
use bytes::Bytes;
use http::{Method, Request as HttpRequest, Response as HttpResponse, StatusCode};
use http_body_util::{BodyExt, Full};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "e2e-secret-0123456789abcdef012345";

struct Fixture {
    pipeline: Pipeline,
    verifier: Arc<JwtVerifier>,
}

/// Builds a full nine-stage pipeline.
fn build_full_pipeline(rps: u32, burst: u32) -> Fixture {
    let verifier = Arc::new(JwtVerifier::new(JwtConfig::default(), JwtKey::hmac(SECRET)).unwrap());
    let buckets = Arc::new(BucketRegistry::new(BucketConfig::from_rate(
        rps,
        Some(burst),
        Duration::from_secs(1),
    )));
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
    let cors = CorsMiddleware::builder()
        .allow_origin("https://app.example.com")
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(["Authorization", "Content-Type"])
        .build()
        .unwrap();
    let public = SkipPaths::new(["/health", "/login"]);

    let pipeline = Pipeline::builder()
        .add_stage(RecoveryMiddleware::new())
        .add_stage(SamplingMiddleware::new(Arc::new(Sampler::Always)).emit_header(true))
        .add_stage(TracingMiddleware::new("e2e-test-service", "1.0.0"))
        .add_stage(cors)
        .add_stage(RateLimitMiddleware::new(buckets))
        .add_stage(CircuitBreakerMiddleware::new(breakers, "app"))
        .add_stage_skipping(AuthenticateMiddleware::new(Arc::clone(&verifier)), public.clone())
        .add_stage_skipping(
            AuthorizeMiddleware::new(Arc::new(RbacStore::with_default_policy()))
                .route(Some(Method::DELETE), "/users*", Requirement::permission("user", "delete"))
                .require_permission("/users*", "user", "read"),
            public,
        )
        .add_stage(TimeoutMiddleware::new(Some(Duration::from_secs(5))))
        .build();

    Fixture { pipeline, verifier }
}

fn make_request(method: Method, path: &str, token: Option<&str>) -> Request {
    let mut builder = HttpRequest::builder()
        .method(method)
        .uri(path)
        .header("x-forwarded-for", "203.0.113.9");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

fn success_response() -> Response {
    HttpResponse::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(r#"{"code":200,"message":"success"}"#)))
        .unwrap()
}

fn counting_handler(
    calls: Arc<AtomicUsize>,
) -> impl FnOnce(&mut MiddlewareContext, Request) -> BoxFuture<'static, Response> + Send + 'static {
    move |_ctx, _req| {
        calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { success_response() })
    }
}

async fn explode() -> Response {
    panic!("boom")
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[test]
fn test_stage_ordering() {
    let fixture = build_full_pipeline(100, 100);
    let expected: Vec<&str> = Stage::all().iter().map(|s| s.name()).collect();
    assert_eq!(fixture.pipeline.stage_names(), expected);
}

#[tokio::test]
async fn test_authenticated_request_reaches_handler() {
    let fixture = build_full_pipeline(100, 100);
    let token = fixture
        .verifier
        .issue_access_token(&TokenSubject::new("u-42").with_role("user"))
        .unwrap();

    let response = fixture
        .pipeline
        .handle(make_request(Method::GET, "/users", Some(&token)), |ctx: &mut MiddlewareContext, _req| {
            let user = ctx.user_id().map(String::from);
            let traced = ctx.trace_id().is_some();
            Box::pin(async move {
                assert_eq!(user.as_deref(), Some("u-42"));
                assert!(traced);
                success_response()
            }) as BoxFuture<'static, Response>
        })
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert!(headers.contains_key("x-request-id"));
    assert!(headers.contains_key(TRACE_ID_HEADER));
    assert!(headers.contains_key("x-span-id"));
    assert!(headers.contains_key("x-response-time"));
    assert_eq!(headers.get("x-sampling-decision").unwrap(), "sampled");
    assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
}

#[tokio::test]
async fn test_missing_token_short_circuits() {
    let fixture = build_full_pipeline(100, 100);
    let calls = Arc::new(AtomicUsize::new(0));

    let response = fixture
        .pipeline
        .handle(make_request(Method::GET, "/users", None), counting_handler(calls.clone()))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let trace_header = response
        .headers()
        .get(TRACE_ID_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let json = json_body(response).await;
    assert_eq!(json["code"], 401);
    assert_eq!(json["message"], "error");
    assert_eq!(json["error"]["code"], "UNAUTHORIZED");
    assert_eq!(json["trace_id"], trace_header.as_str());
}

#[tokio::test]
async fn test_forbidden_permission() {
    let fixture = build_full_pipeline(100, 100);
    let token = fixture
        .verifier
        .issue_access_token(&TokenSubject::new("u-42").with_role("user"))
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let response = fixture
        .pipeline
        .handle(make_request(Method::DELETE, "/users/7", Some(&token)), counting_handler(calls.clone()))
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(json_body(response).await["error"]["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_public_path_skips_auth_only() {
    let fixture = build_full_pipeline(100, 100);
    let calls = Arc::new(AtomicUsize::new(0));

    let response = fixture
        .pipeline
        .handle(make_request(Method::GET, "/health", None), counting_handler(calls.clone()))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(response.headers().contains_key(TRACE_ID_HEADER));
    assert!(response.headers().contains_key("x-ratelimit-remaining"));
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let fixture = build_full_pipeline(100, 100);
    let request = HttpRequest::builder()
        .uri("/health")
        .header("x-request-id", "client-req-0001")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let response = fixture
        .pipeline
        .handle(request, |ctx: &mut MiddlewareContext, _req| {
            assert_eq!(ctx.request_id().as_str(), "client-req-0001");
            Box::pin(async { success_response() }) as BoxFuture<'static, Response>
        })
        .await;

    assert_eq!(response.headers().get("x-request-id").unwrap(), "client-req-0001");
}

#[tokio::test]
async fn test_preflight_answered_before_auth() {
    let fixture = build_full_pipeline(100, 100);
    let calls = Arc::new(AtomicUsize::new(0));
    let request = HttpRequest::builder()
        .method(Method::OPTIONS)
        .uri("/users")
        .header("origin", "https://app.example.com")
        .header("access-control-request-method", "DELETE")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let response = fixture.pipeline.handle(request, counting_handler(calls.clone())).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "https://app.example.com"
    );
}

#[tokio::test]
async fn test_rate_limit_applies_before_auth() {
    let fixture = build_full_pipeline(1, 2);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = fixture
            .pipeline
            .handle(make_request(Method::GET, "/users", None), counting_handler(calls.clone()))
            .await;
        statuses.push(response.status());
    }

    assert_eq!(
        statuses,
        vec![StatusCode::UNAUTHORIZED, StatusCode::UNAUTHORIZED, StatusCode::TOO_MANY_REQUESTS]
    );
}

#[tokio::test]
async fn test_panic_is_contained() {
    bastion_middleware::stages::recovery::install_panic_hook();
    let fixture = build_full_pipeline(100, 100);

    let response = fixture
        .pipeline
        .handle(make_request(Method::GET, "/health", None), |_ctx: &mut MiddlewareContext, _req| {
            Box::pin(explode()) as BoxFuture<'static, Response>
        })
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"]["code"], "INTERNAL_ERROR");

    let response = fixture
        .pipeline
        .handle(make_request(Method::GET, "/health", None), |_ctx: &mut MiddlewareContext, _req| {
            Box::pin(async { empty_response(StatusCode::OK) }) as BoxFuture<'static, Response>
        })
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}
