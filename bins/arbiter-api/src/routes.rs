// Router assembly for the Arbiter API

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use arbiter_common::types::MAX_SOURCE_CODE_BYTES;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

/// Room for JSON escaping on top of the largest accepted source file
const MAX_BODY_BYTES: usize = MAX_SOURCE_CODE_BYTES * 4;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/submit", post(handlers::submit))
        .route("/status", get(handlers::status))
        .route("/jobs/:id", get(handlers::job_status))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::export_metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::store::memory::MemoryJobStore;
    use arbiter_common::store::JobStore;
    use arbiter_common::types::{Verdict, VerdictKind};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn app(store: Arc<MemoryJobStore>) -> Router {
        routes().with_state(Arc::new(AppState { store }))
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn submit_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_poll_until_completed() {
        let store = Arc::new(MemoryJobStore::new());
        let router = app(Arc::clone(&store));

        let resp = router
            .clone()
            .oneshot(submit_request(serde_json::json!({
                "problemId": "two-sum",
                "code": "int main() {}"
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let job_id = body_json(resp).await["jobId"].as_str().unwrap().to_string();

        let resp = router
            .clone()
            .oneshot(get(&format!("/status?jobId={}", job_id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["state"], "queued");

        let job = store.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(job.id.to_string(), job_id);
        let verdict = Verdict {
            verdict: VerdictKind::Accepted,
            error: None,
            failed_test: None,
            tests: Some(vec![]),
        };
        store.complete(job.id, &verdict).await.unwrap();

        let resp = router.oneshot(get(&format!("/jobs/{}", job_id))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["state"], "completed");
        assert_eq!(body["verdict"]["verdict"], "Accepted");
    }

    #[tokio::test]
    async fn test_missing_fields_are_bad_request() {
        let store = Arc::new(MemoryJobStore::new());
        let router = app(Arc::clone(&store));

        for body in [
            serde_json::json!({ "problemId": "p" }),
            serde_json::json!({ "code": "int main() {}" }),
            serde_json::json!({ "problemId": "", "code": "   " }),
        ] {
            let resp = router.clone().oneshot(submit_request(body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(body_json(resp).await["error"], "Missing code/problemId");
        }
        assert_eq!(store.count(arbiter_common::types::JobState::Queued), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let router = app(Arc::new(MemoryJobStore::new()));
        let req = Request::builder()
            .method(Method::POST)
            .uri("/submit")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_oversized_source_is_rejected() {
        let router = app(Arc::new(MemoryJobStore::new()));
        let code = "a".repeat(MAX_SOURCE_CODE_BYTES + 1);

        let resp = router
            .oneshot(submit_request(serde_json::json!({ "problemId": "p", "code": code })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_lookup_errors() {
        let router = app(Arc::new(MemoryJobStore::new()));

        let resp = router.clone().oneshot(get("/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router.clone().oneshot(get("/status?jobId=not-a-uuid")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let unknown = uuid::Uuid::new_v4();
        let resp = router.oneshot(get(&format!("/status?jobId={}", unknown))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let router = app(Arc::new(MemoryJobStore::new()));

        let resp = router.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("arbiter_submissions_total"));
    }
}
