//! Concrete request scenarios, run through a configured gateway.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bastion::auth::TokenSubject;
use bastion::config::{FlagRule, GateRule, RouteRule};
use bastion::core::{empty_response, Envelope};
use bastion::middleware::{Request, RequestContext, Response};
use bastion::{BastionConfig, Gateway};
use bytes::Bytes;
use http::{Method, Request as HttpRequest, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::json;

const SECRET: &str = "scenario-secret-0123456789abcdef";

fn base_config() -> BastionConfig {
    let mut config = BastionConfig::default();
    config.service.name = "scenarios".to_string();
    config.jwt.enabled = true;
    config.jwt.secret = Some(SECRET.to_string());
    config.authorization.routes = vec![
        RouteRule {
            path: "/users".to_string(),
            method: Some("GET".to_string()),
            permission: Some("user:read".to_string()),
            ..RouteRule::default()
        },
        RouteRule {
            path: "/users/*".to_string(),
            method: Some("DELETE".to_string()),
            permission: Some("user:delete".to_string()),
            ..RouteRule::default()
        },
    ];
    config
}

fn request(method: Method, path: &str, token: Option<&str>) -> Request {
    let mut builder = HttpRequest::builder()
        .method(method)
        .uri(path)
        .header("x-forwarded-for", "198.51.100.7");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn user_token(gateway: &Gateway) -> String {
    gateway
        .stack()
        .verifier()
        .unwrap()
        .issue_access_token(&TokenSubject::new("u-1").with_role("user"))
        .unwrap()
}

async fn app(ctx: RequestContext, request: Request) -> Response {
    match request.uri().path() {
        "/health" => {
            assert!(ctx.claims().is_none());
            Envelope::success(StatusCode::OK, json!({"status": "healthy"})).into_response()
        }
        "/users" => {
            let roles: Vec<&str> = ctx
                .user_roles()
                .map(|roles| roles.iter().map(String::as_str).collect())
                .unwrap_or_default();
            Envelope::success(
                StatusCode::OK,
                json!({"user": ctx.user_id(), "roles": roles}),
            )
            .into_response()
        }
        _ => empty_response(StatusCode::NO_CONTENT),
    }
}

#[tokio::test]
async fn unauthenticated_skip_path() {
    let gateway = Gateway::from_config(&base_config(), app).unwrap();

    let response = gateway.handle(request(Method::GET, "/health", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = json_body(response).await;
    assert_eq!(json["code"], 200);
    assert_eq!(json["message"], "success");
    assert_eq!(json["data"], json!({"status": "healthy"}));
}

#[tokio::test]
async fn valid_token_permitted() {
    let gateway = Gateway::from_config(&base_config(), app).unwrap();
    let token = user_token(&gateway);

    let response = gateway.handle(request(Method::GET, "/users", Some(&token))).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["data"]["user"], "u-1");
    assert_eq!(json["data"]["roles"], json!(["user"]));
}

#[tokio::test]
async fn valid_token_forbidden() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let gateway = Gateway::from_config(&base_config(), move |_ctx, _request| {
        seen.fetch_add(1, Ordering::SeqCst);
        async { empty_response(StatusCode::OK) }
    })
    .unwrap();
    let token = user_token(&gateway);

    let response = gateway
        .handle(request(Method::DELETE, "/users/7", Some(&token)))
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "FORBIDDEN");
    assert!(json["trace_id"].is_string());
}

#[tokio::test]
async fn rate_limit_rejects_after_burst() {
    let mut config = base_config();
    config.jwt.enabled = false;
    config.rate_limit.requests_per_second = 2;
    config.rate_limit.burst = Some(2);
    config.rate_limit.skip_paths.clear();
    let gateway = Gateway::from_config(&config, app).unwrap();

    let mut statuses = Vec::new();
    let mut codes = Vec::new();
    for _ in 0..5 {
        let response = gateway.handle(request(Method::GET, "/health", None)).await;
        statuses.push(response.status());
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            assert!(response.headers().contains_key("retry-after"));
            codes.push(json_body(response).await["error"]["code"].clone());
        }
    }

    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );
    assert!(codes.iter().all(|code| code == "RATE_LIMIT_EXCEEDED"));
}

#[tokio::test]
async fn circuit_breaker_trips_and_probes() {
    let mut config = base_config();
    config.jwt.enabled = false;
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.timeout_ms = 100;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let gateway = Gateway::from_config(&config, move |_ctx, _request| {
        seen.fetch_add(1, Ordering::SeqCst);
        async { empty_response(StatusCode::INTERNAL_SERVER_ERROR) }
    })
    .unwrap();

    for _ in 0..3 {
        let response = gateway.handle(request(Method::GET, "/orders", None)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let response = gateway.handle(request(Method::GET, "/orders", None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(json_body(response).await["error"]["code"], "SERVICE_UNAVAILABLE");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(150)).await;

    gateway.handle(request(Method::GET, "/orders", None)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn breaker_skip_path_served_while_open() {
    let mut config = base_config();
    config.jwt.enabled = false;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.skip_paths = vec!["/health".to_string()];

    let gateway = Gateway::from_config(&config, |_ctx, request: Request| async move {
        if request.uri().path() == "/health" {
            empty_response(StatusCode::OK)
        } else {
            empty_response(StatusCode::BAD_GATEWAY)
        }
    })
    .unwrap();

    for _ in 0..2 {
        gateway.handle(request(Method::GET, "/orders", None)).await;
    }
    let response = gateway.handle(request(Method::GET, "/orders", None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let response = gateway.handle(request(Method::GET, "/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        gateway.stack().breaker_states(),
        vec![("upstream".to_string(), bastion::control::CircuitState::Open)]
    );
}

#[tokio::test]
async fn disabled_feature_is_unavailable() {
    let mut config = base_config();
    config.jwt.enabled = false;
    config.features.enabled = true;
    config.features.flags = vec![FlagRule {
        name: "export".to_string(),
        enabled: false,
        description: "CSV export".to_string(),
    }];
    config.features.gates = vec![GateRule {
        path: "/export*".to_string(),
        flag: "export".to_string(),
    }];
    let gateway = Gateway::from_config(&config, app).unwrap();

    let response = gateway.handle(request(Method::GET, "/export/users.csv", None)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["error"]["details"]["feature"], "export");

    gateway.stack().features().unwrap().enable("export").unwrap();
    let response = gateway.handle(request(Method::GET, "/export/users.csv", None)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn panic_is_recovered() {
    let mut config = base_config();
    config.jwt.enabled = false;
    let gateway = Gateway::from_config(&config, |_ctx, request: Request| async move {
        if request.uri().path() == "/boom" {
            panic!("boom");
        }
        empty_response(StatusCode::OK)
    })
    .unwrap();

    let response = gateway.handle(request(Method::GET, "/boom", None)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "INTERNAL_ERROR");
    assert!(!json.to_string().contains("boom"));

    let response = gateway.handle(request(Method::GET, "/after", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
}
