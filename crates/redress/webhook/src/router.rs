use crate::echo::echo_body;
use crate::handler::WebhookHandler;
use crate::payload::WebhookPayload;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Form, Router};
use std::sync::Arc;
use tracing::{error, info};

/// Router exposing the notification ingress.
///
/// The response is always HTTP 200 with the XML echo, whatever happened
/// internally; the gateway only stops retrying once it sees the echo.
pub fn webhook_router(handler: Arc<WebhookHandler>) -> Router {
    Router::new()
        .route("/webhooks/emp", post(receive))
        .with_state(handler)
}

async fn receive(
    State(handler): State<Arc<WebhookHandler>>,
    Form(payload): Form<WebhookPayload>,
) -> impl IntoResponse {
    let unique_id = payload.unique_id.clone().unwrap_or_default();
    match handler.handle(&payload).await {
        Ok(disposition) => {
            info!(unique_id, ?disposition, "notification acknowledged");
        }
        Err(error) => {
            // Still echo: a retry storm is worse than a missed event the
            // reconciler will pick up.
            error!(unique_id, %error, "notification processing failed");
        }
    }
    (
        [(header::CONTENT_TYPE, "application/xml")],
        echo_body(&unique_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use redress_cache::MemoryKv;
    use redress_store::memory::MemoryStore;
    use redress_types::RedressConfig;
    use tower::ServiceExt;

    #[tokio::test]
    async fn unknown_events_still_get_their_echo() {
        let handler = Arc::new(WebhookHandler::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryKv::new()),
            Arc::new(RedressConfig::default()),
        ));
        let app = webhook_router(handler);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/webhooks/emp")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(axum::body::Body::from(
                "unique_id=ghost-1&transaction_type=chargeback",
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("<unique_id>ghost-1</unique_id>"));
    }
}
