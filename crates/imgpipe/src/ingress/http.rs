//! HTTP surface of the ingress service.

use std::future::Future;
use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::Ingress;
use crate::broker::queue_depths;
use crate::error::IngressError;

const FILE_FIELD: &str = "file";
/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct IngressState {
    ingress: Arc<Ingress>,
    /// Queues reported by `GET /queues`.
    queues: Arc<Vec<String>>,
}

pub fn router(ingress: Arc<Ingress>, queues: Vec<String>) -> Router {
    let body_limit = ingress.max_upload_bytes().saturating_add(MULTIPART_OVERHEAD);
    let state = IngressState {
        ingress,
        queues: Arc::new(queues),
    };

    Router::new()
        .route("/upload", post(upload).layer(DefaultBodyLimit::max(body_limit)))
        .route("/queues", get(list_queues))
        .route("/health", get(health))
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Ingress listening on {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

fn ingress_error_response(err: IngressError) -> Response {
    let status = match &err {
        IngressError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        IngressError::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ if err.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!("Upload failed: {}", err);
    } else {
        warn!("Upload rejected: {}", err);
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Reads the `file` part. `Ok(None)` means the request has no such part.
async fn read_file_field(
    multipart: &mut Multipart,
) -> Result<Option<(Option<String>, Vec<u8>)>, MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await?;
        return Ok(Some((filename, bytes.to_vec())));
    }
    Ok(None)
}

async fn upload(
    State(state): State<IngressState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    // A body that is not multipart has no file part either.
    let mut multipart = match multipart {
        Ok(multipart) => multipart,
        Err(_) => return ingress_error_response(IngressError::MissingFile),
    };

    let (filename, bytes) = match read_file_field(&mut multipart).await {
        Ok(Some(part)) => part,
        Ok(None) => return ingress_error_response(IngressError::MissingFile),
        Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return ingress_error_response(IngressError::TooLarge {
                limit: state.ingress.max_upload_bytes(),
            });
        }
        Err(e) => {
            warn!("Malformed multipart body: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.body_text() })))
                .into_response();
        }
    };

    match state.ingress.accept(filename.as_deref(), &bytes).await {
        Ok(envelope) => (
            StatusCode::OK,
            Json(json!({
                "message": "File uploaded successfully",
                "job": envelope,
            })),
        )
            .into_response(),
        Err(e) => ingress_error_response(e),
    }
}

async fn list_queues(State(state): State<IngressState>) -> Response {
    match queue_depths(state.ingress.broker().as_ref(), &state.queues).await {
        Ok(depths) => Json(json!({ "queues": depths })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::storage::UploadStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "imgpipe-test-boundary";

    fn app(broker: &MemoryBroker, dir: &std::path::Path) -> Router {
        app_with_limit(broker, dir, crate::ingress::DEFAULT_MAX_UPLOAD_BYTES)
    }

    fn app_with_limit(broker: &MemoryBroker, dir: &std::path::Path, limit: usize) -> Router {
        let ingress = Ingress::new(
            Arc::new(broker.clone()),
            "upload_queue",
            UploadStore::new(dir.join("uploads")),
        )
        .with_publish_attempts(1, Duration::from_millis(1))
        .with_max_upload_bytes(limit);
        router(
            Arc::new(ingress),
            vec!["upload_queue".to_string(), "blur_queue".to_string()],
        )
    }

    fn multipart_request(field: &str, filename: Option<&str>, content: &[u8]) -> Request<Body> {
        let disposition = match filename {
            Some(name) => format!("form-data; name=\"{}\"; filename=\"{}\"", field, name),
            None => format!("form-data; name=\"{}\"", field),
        };
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(format!("Content-Disposition: {}\r\n", disposition).as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_ok() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();

        let response = app(&broker, temp.path())
            .oneshot(multipart_request("file", Some("photo.png"), b"pixels"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "File uploaded successfully");
        assert!(body["job"]["image_id"].as_str().unwrap().ends_with(".png"));
        assert_eq!(broker.depth("upload_queue"), Some(1));
    }

    #[tokio::test]
    async fn test_upload_larger_than_two_mebibytes() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let photo = vec![0xAB; 3 * 1024 * 1024];

        let response = app(&broker, temp.path())
            .oneshot(multipart_request("file", Some("big.png"), &photo))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let stored = body["job"]["original_path"].as_str().unwrap().to_string();
        assert_eq!(std::fs::metadata(stored).unwrap().len(), photo.len() as u64);
        assert_eq!(broker.depth("upload_queue"), Some(1));
    }

    #[tokio::test]
    async fn test_upload_over_limit_is_payload_too_large() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let app = app_with_limit(&broker, temp.path(), 1024);

        // Past the body limit, cut off while streaming.
        let response = app
            .clone()
            .oneshot(multipart_request("file", Some("big.png"), &vec![1; 256 * 1024]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            json_body(response).await["error"],
            "Upload exceeds the 1024 byte limit"
        );

        // Within the body limit but over the file limit.
        let response = app
            .oneshot(multipart_request("file", Some("big.png"), &vec![1; 2048]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        assert_eq!(broker.depth("upload_queue"), None);
    }

    #[tokio::test]
    async fn test_upload_without_file_part() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();

        let response = app(&broker, temp.path())
            .oneshot(multipart_request("other", Some("photo.png"), b"pixels"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No file found");
    }

    #[tokio::test]
    async fn test_upload_not_multipart() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::from("plain"))
            .unwrap();

        let response = app(&broker, temp.path()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No file found");
    }

    #[tokio::test]
    async fn test_upload_with_empty_filename() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();

        let response = app(&broker, temp.path())
            .oneshot(multipart_request("file", Some(""), b"pixels"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "No selected file");
    }

    #[tokio::test]
    async fn test_upload_with_broker_down() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let response = app(&broker, temp.path())
            .oneshot(multipart_request("file", Some("photo.png"), b"pixels"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_queues_endpoint() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();
        let app = app(&broker, temp.path());

        app.clone()
            .oneshot(multipart_request("file", Some("photo.png"), b"pixels"))
            .await
            .unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/queues")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["queues"][0]["queue"], "upload_queue");
        assert_eq!(body["queues"][0]["messages"], 1);
        assert!(body["queues"][1]["messages"].is_null());
    }

    #[tokio::test]
    async fn test_health() {
        let temp = TempDir::new().unwrap();
        let broker = MemoryBroker::new();

        let response = app(&broker, temp.path())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
