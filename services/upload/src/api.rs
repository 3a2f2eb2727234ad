use crate::config::ApiConfig;
use crate::service::{UploadError, UploadService};
use crate::store::{StoreError, UploadRequest};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        ConnectInfo, DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{Future, TryStreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Extra request bytes allowed on top of the file limit for multipart framing
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

const LANDING_PAGE: &str = include_str!("../static/index.html");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<UploadService>,
    pub public_base_url: Option<String>,
}

impl AppState {
    pub fn new(service: Arc<UploadService>) -> Self {
        let public_base_url = service
            .config()
            .api
            .public_base_url
            .as_ref()
            .map(|url| url.trim_end_matches('/').to_string());

        Self {
            service,
            public_base_url,
        }
    }

    /// Base for returned URLs, without trailing slash
    fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(base) = &self.public_base_url {
            return base.clone();
        }

        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{host}")
    }
}

/// Successful upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub url: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: code.to_string(),
            retry_after: None,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        match self {
            UploadError::RateLimited { retry_after_secs } => {
                let body = ErrorResponse {
                    retry_after: Some(retry_after_secs),
                    ..ErrorResponse::new(self.to_string(), "RATE_LIMITED")
                };
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, HeaderValue::from(retry_after_secs))],
                    Json(body),
                )
                    .into_response()
            }
            UploadError::Store(e) => e.into_response(),
        }
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            StoreError::NoFile => (StatusCode::BAD_REQUEST, "NO_FILE"),
            StoreError::EmptyFile => (StatusCode::BAD_REQUEST, "EMPTY_FILE"),
            StoreError::TooLarge { .. } => (StatusCode::BAD_REQUEST, "FILE_TOO_LARGE"),
            StoreError::UnsupportedType { .. } => (StatusCode::BAD_REQUEST, "UNSUPPORTED_TYPE"),
            StoreError::TypeMismatch { .. } => (StatusCode::BAD_REQUEST, "TYPE_MISMATCH"),
            StoreError::Body(_) => (StatusCode::BAD_REQUEST, "BAD_UPLOAD"),
            StoreError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            StoreError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
        };

        let message = match &self {
            StoreError::Io(_) => "Failed to store file".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorResponse::new(message, code))).into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let csp = HeaderValue::from_str(&config.content_security_policy).unwrap_or_else(|e| {
        warn!(error = %e, "Invalid Content-Security-Policy, using default");
        HeaderValue::from_static("default-src 'self'; img-src 'self' data: https:; script-src 'self'")
    });

    let body_limit = state
        .service
        .max_file_size()
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/upload", post(upload_file))
        .route("/file/:shard/:name", get(serve_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            csp,
        ))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "upload-service"
    }))
}

/// Accept one multipart upload in field `file`
#[instrument(skip_all, fields(client = %addr.ip()))]
async fn upload_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, UploadError> {
    let client = addr.ip().to_string();

    // Admission comes before any byte of the body is read
    state.service.admit(&client)?;

    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => {
            warn!(error = %rejection, "Upload is not a multipart form");
            return Err(state.service.reject(&client, StoreError::NoFile));
        }
    };

    let stored = receive_file(&state, &client, multipart).await?;
    let url = format!("{}/{}", state.base_url(&headers), stored.object.url_path());

    Ok(Json(UploadResponse { url }))
}

async fn receive_file(
    state: &AppState,
    client: &str,
    mut multipart: Multipart,
) -> Result<crate::store::StoredObject, UploadError> {
    let limit = state.service.max_file_size();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(state.service.reject(client, StoreError::NoFile)),
            Err(e) => return Err(state.service.reject(client, body_error(e, limit))),
        };

        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let body = field.map_err(move |e| body_error(e, limit));

        return state
            .service
            .accept(UploadRequest {
                client: client.to_string(),
                filename,
                body,
            })
            .await;
    }
}

/// Map multipart read failures; hitting the body limit means the file was too large
fn body_error(err: MultipartError, limit: u64) -> StoreError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        StoreError::TooLarge { limit }
    } else {
        StoreError::Body(err.body_text())
    }
}

/// Stream a stored object back to the client
#[instrument(skip(state))]
async fn serve_file(
    State(state): State<AppState>,
    Path((shard, name)): Path<(String, String)>,
) -> Result<Response, StoreError> {
    let stored = state.service.retrieve(&shard, &name).await?;

    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static(stored.content_type)),
        (header::CONTENT_LENGTH, HeaderValue::from(stored.size_bytes)),
        (header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
    ];
    let body = Body::from_stream(ReaderStream::new(stored.file));

    Ok((headers, body).into_response())
}

/// Start the upload API server and run until `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| {
        error!(error = %e, "API server error");
        e
    })
    .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::Config;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-MEDIADROP-BOUNDARY";
    const MP4_BYTES: &[u8] = b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom-payload";

    fn service(root: &std::path::Path, tweak: impl FnOnce(&mut Config)) -> Arc<UploadService> {
        let mut config = Config::default();
        config.storage.upload_root = root.to_path_buf();
        tweak(&mut config);
        Arc::new(UploadService::new(config, AuditLog::disabled()))
    }

    fn router(service: Arc<UploadService>, peer: [u8; 4]) -> Router {
        let config = service.config().api.clone();
        create_router(AppState::new(service), &config)
            .layer(MockConnectInfo(SocketAddr::from((peer, 40000))))
    }

    fn multipart_body(field: &str, filename: &str, bytes: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::HOST, "drop.example")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), |_| {}), [10, 0, 0, 1]);

        let response = app
            .clone()
            .oneshot(upload_request(multipart_body("file", "clip.mp4", MP4_BYTES)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key(header::CONTENT_SECURITY_POLICY));

        let url = json_body(response).await["url"].as_str().unwrap().to_string();
        let path = url.strip_prefix("http://drop.example").unwrap().to_string();
        assert!(path.starts_with("/file/"));
        assert!(path.ends_with(".mp4"));

        let response = app
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], MP4_BYTES);
    }

    #[tokio::test]
    async fn test_second_upload_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), |_| {}), [10, 0, 0, 2]);

        let first = app
            .clone()
            .oneshot(upload_request(multipart_body("file", "a.mp4", MP4_BYTES)))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(upload_request(multipart_body("file", "b.mp4", MP4_BYTES)))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));

        let body = json_body(second).await;
        let retry_after = body["retry_after"].as_u64().unwrap();
        assert!(retry_after > 0 && retry_after <= 10);
        assert_eq!(body["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_missing_file_field() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), |_| {}), [10, 0, 0, 3]);

        let response = app
            .oneshot(upload_request(multipart_body("other", "a.mp4", MP4_BYTES)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "NO_FILE");
    }

    #[tokio::test]
    async fn test_oversize_upload_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(
            service(dir.path(), |c| c.storage.max_file_size_bytes = 16),
            [10, 0, 0, 4],
        );

        let response = app
            .oneshot(upload_request(multipart_body("file", "big.mp4", MP4_BYTES)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "FILE_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_body_over_request_limit_is_file_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(
            service(dir.path(), |c| c.storage.max_file_size_bytes = 16),
            [10, 0, 0, 8],
        );

        // Padding in an earlier field pushes the request past the body limit
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"padding\"\r\n\r\n"
        )
        .into_bytes();
        body.extend(std::iter::repeat(b'x').take(2 * 1024 * 1024));
        body.extend_from_slice(b"\r\n");
        body.extend(multipart_body("file", "clip.mp4", MP4_BYTES));

        let response = app.oneshot(upload_request(body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "FILE_TOO_LARGE");
        assert!(!dir.path().read_dir().unwrap().any(|e| e.unwrap().path().is_file()));
    }

    #[tokio::test]
    async fn test_extension_contradicting_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), |_| {}), [10, 0, 0, 9]);

        let response = app
            .oneshot(upload_request(multipart_body("file", "x.png", MP4_BYTES)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "TYPE_MISMATCH");
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), |_| {}), [10, 0, 0, 5]);

        let response = app
            .oneshot(
                Request::get("/file/ab/0123456789abcdef0123456789abcdef.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response
            .headers()
            .contains_key(header::CONTENT_SECURITY_POLICY));
    }

    #[tokio::test]
    async fn test_public_base_url_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(
            service(dir.path(), |c| {
                c.api.public_base_url = Some("https://files.example/".to_string())
            }),
            [10, 0, 0, 6],
        );

        let response = app
            .oneshot(upload_request(multipart_body("file", "clip.mp4", MP4_BYTES)))
            .await
            .unwrap();

        let url = json_body(response).await["url"].as_str().unwrap().to_string();
        assert!(url.starts_with("https://files.example/file/"));
    }

    #[tokio::test]
    async fn test_landing_page() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(service(dir.path(), |_| {}), [10, 0, 0, 7]);

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_SECURITY_POLICY],
            "default-src 'self'; img-src 'self' data: https:; script-src 'self'"
        );
    }
}
