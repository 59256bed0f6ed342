//! API routes

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and self-monitoring
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))

        // Usage sync, triggered by an external cron caller
        .route("/api/sync", get(handlers::sync).post(handlers::sync))

        // Usage overview
        .route("/api/overview", get(handlers::overview))

        // Prices
        .route(
            "/api/prices",
            get(handlers::list_prices)
                .post(handlers::upsert_price)
                .delete(handlers::delete_price),
        )

        // Administration
        .route("/api/reset", post(handlers::reset))

        // Rollup analytics
        .route("/api/analytics/errors/timeseries", get(handlers::error_timeseries))
        .route("/api/analytics/errors/top", get(handlers::top_failures))
        .route("/api/analytics/tokens/breakdown", get(handlers::token_breakdown))
        .route("/api/analytics/cost/trend-by-model", get(handlers::cost_trend))

        // Web vitals
        .route("/api/vitals", post(handlers::ingest_vitals))
        .route("/api/vitals/summary", get(handlers::vitals_summary))
        .route("/api/vitals/timeseries", get(handlers::vitals_timeseries))

        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Environment};
    use crate::db::{MemoryUsageStore, UsageStore};
    use crate::rollup::BucketClock;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "s3cret";

    fn config() -> Config {
        let mut config = Config::default();
        config.database.url = "memory://".to_string();
        config.auth.password = Some(SECRET.to_string());
        config.upstream.base_url = String::new();
        config
    }

    fn app_with(config: &Config) -> (Arc<MemoryUsageStore>, Router) {
        let clock = BucketClock::from_config(&config.rollup).unwrap();
        let store = Arc::new(MemoryUsageStore::new(clock));
        let state = AppState::new(config, store.clone()).unwrap();
        (store, create_router(state))
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn authed(mut req: Request<Body>) -> Request<Body> {
        req.headers_mut().insert(
            header::AUTHORIZATION,
            format!("Bearer {SECRET}").parse().unwrap(),
        );
        req
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = app_with(&config());
        let (status, body) = send(&app, request(Method::GET, "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_overview_sets_cache_control() {
        let (_, app) = app_with(&config());
        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/overview?days=7&pageSize=20", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            handlers::OVERVIEW_CACHE_CONTROL
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["empty"], true);
        assert_eq!(body["days"], 7);
        assert_eq!(body["meta"]["pageSize"], 20);
        assert_eq!(body["overview"]["successRate"], 1.0);
    }

    #[tokio::test]
    async fn test_overview_rejects_malformed_params() {
        let (_, app) = app_with(&config());
        let (status, body) = send(&app, request(Method::GET, "/api/overview?days=abc", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"][0]["path"], "days");
    }

    #[tokio::test]
    async fn test_prices_require_authorization() {
        let (_, app) = app_with(&config());
        let (status, _) = send(&app, request(Method::GET, "/api/prices", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut open = config();
        open.auth.password = None;
        let (_, app) = app_with(&open);
        let (status, body) = send(&app, request(Method::GET, "/api/prices", None)).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(body["error"], "PASSWORD is missing");
    }

    #[tokio::test]
    async fn test_price_crud() {
        let (_, app) = app_with(&config());
        let price = json!({"model": "gpt-4o", "inputPricePer1M": 2.5, "outputPricePer1M": 10});
        let (status, _) = send(&app, authed(request(Method::POST, "/api/prices", Some(price)))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(&app, authed(request(Method::GET, "/api/prices", None))).await;
        assert_eq!(body["prices"][0]["model"], "gpt-4o");
        assert_eq!(body["prices"][0]["cachedInputPricePer1M"], 0.0);

        let bad = json!({"model": "", "inputPricePer1M": -1});
        let (status, body) = send(&app, authed(request(Method::POST, "/api/prices", Some(bad)))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"].as_array().unwrap().len() >= 2);

        let (_, body) = send(
            &app,
            authed(request(Method::DELETE, "/api/prices", Some(json!({"model": "gpt-4o"})))),
        )
        .await;
        assert_eq!(body["deleted"], true);
    }

    #[tokio::test]
    async fn test_reset_guards() {
        let (store, app) = app_with(&config());
        let (status, _) = send(&app, authed(request(Method::POST, "/api/reset", None))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut req = authed(request(Method::POST, "/api/reset?rollups=true", None));
        req.headers_mut().insert(
            handlers::CONFIRM_RESET_HEADER,
            handlers::CONFIRM_RESET_VALUE.parse().unwrap(),
        );
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(store.raw_count(), 0);

        let mut production = config();
        production.environment = Environment::Production;
        let (_, app) = app_with(&production);
        let (status, _) = send(&app, authed(request(Method::POST, "/api/reset", None))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_sync_pulls_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/usage"))
            .and(header_is("authorization", "Bearer upstream-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "usage": {"apis": {"/v1/chat/completions": {"models": {"gpt-4o": {"details": [
                    {"timestamp": "2024-03-01T10:15:00Z", "tokens": {"input_tokens": 10, "output_tokens": 5, "total_tokens": 15}, "failed": false}
                ]}}}}}
            })))
            .mount(&server)
            .await;

        let mut config = config();
        config.upstream.base_url = format!("{}/", server.uri());
        config.upstream.api_key = Some("upstream-key".to_string());
        let (store, app) = app_with(&config);

        let (status, _) = send(&app, request(Method::POST, "/api/sync", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, authed(request(Method::POST, "/api/sync", None))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "inserted": 1, "attempted": 1, "rejected": 0}));

        let (_, body) = send(&app, authed(request(Method::GET, "/api/sync", None))).await;
        assert_eq!(body["inserted"], 0);
        assert_eq!(store.raw_count(), 1);
    }

    #[tokio::test]
    async fn test_upstream_failure_status_is_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut config = config();
        config.upstream.base_url = server.uri();
        let (_, app) = app_with(&config);

        let (status, _) = send(&app, authed(request(Method::POST, "/api/sync", None))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_vitals_ingest_and_summary() {
        let (store, app) = app_with(&config());
        let beacon = json!({"metrics": [
            {"name": "LCP", "id": "v4-1", "value": 1800.0, "delta": 1800.0, "pathname": "/"}
        ]});
        let (status, body) = send(&app, request(Method::POST, "/api/vitals", Some(beacon))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true, "accepted": 1, "sampledOut": 0}));
        assert_eq!(store.vitals_snapshot().len(), 1);

        let (status, body) = send(
            &app,
            request(Method::GET, "/api/vitals/summary?groupBy=page", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["groupBy"], "page");
        assert_eq!(body["data"][0]["pathname"], "/");
        assert_eq!(body["data"][0]["metrics"][0]["rating"], "good");

        let bad = json!({"metrics": []});
        let (status, _) = send(&app, request(Method::POST, "/api/vitals", Some(bad))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analytics_endpoints_echo_params() {
        let (_, app) = app_with(&config());
        let (status, body) = send(
            &app,
            request(Method::GET, "/api/analytics/errors/top?groupBy=route&limit=3", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["groupBy"], "route");
        assert_eq!(body["limit"], 3);
        assert_eq!(body["data"], json!([]));

        let (status, body) = send(
            &app,
            request(Method::GET, "/api/analytics/tokens/breakdown", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["interval"], "hour");
        assert_eq!(body["hours"], 24);

        let (status, _) = send(
            &app,
            request(Method::GET, "/api/analytics/cost/trend-by-model?interval=week", None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder_is_not_found() {
        let (store, app) = app_with(&config());
        store.health_check().await.unwrap();
        let response = app
            .oneshot(request(Method::GET, "/metrics", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
