use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use crate::metrics;
use crate::server::Server;

pub(crate) const HEALTH_BODY: &str =
    "All systems are functioning within normal specifications.\n";

/// Responds to health checks for this program.
pub(crate) async fn health() -> &'static str {
    HEALTH_BODY
}

/// Serves the metric exposition for scrapes.
pub(crate) async fn metrics(State(server): State<Arc<Server>>) -> Response {
    match server.metrics().gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!("failed to gather metrics: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Responds to webhook requests from Alertmanager.
///
/// Note that Alertmanager treats non-200 responses as a failure to notify
/// and may re-dispatch the alert to us.
pub(crate) async fn webhook(State(server): State<Arc<Server>>, request: Request) -> Response {
    if server.config().verbose {
        debug!("webhook triggered");
    }

    let body = match to_bytes(request.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(err) => {
            server
                .metrics()
                .errors
                .with_label_values(&[metrics::ERR_READ])
                .inc();
            error!("failed to read webhook body: {err}");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    server.handle_webhook(&body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::config::Config;
    use crate::payload::testdata::firing_payload;
    use axum::body::Body;
    use tower::ServiceExt;

    fn test_router() -> axum::Router {
        let config = Config {
            listen_address: "localhost:0".to_string(),
            commands: vec![Command {
                cmd: "echo".to_string(),
                ..Command::default()
            }],
            ..Config::default()
        };
        Arc::new(Server::new(config).unwrap()).router()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_normal_operation() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/_health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, HEALTH_BODY);
    }

    #[tokio::test]
    async fn metrics_exposes_the_registry() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/plain; version=0.0.4")
        );
        let body = body_text(response).await;
        for name in [
            "am_executor_process_duration_seconds",
            "am_executor_processes_current",
            "am_executor_errors_total",
            "am_executor_signalled_total",
            "am_executor_skipped_total",
        ] {
            assert!(body.contains(name), "missing {name}");
        }
    }

    #[tokio::test]
    async fn webhook_accepts_posts() {
        let payload = serde_json::to_vec(&firing_payload()).unwrap();
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_accepts_other_methods_too() {
        let payload = serde_json::to_vec(&firing_payload()).unwrap();
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
