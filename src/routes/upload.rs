//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol.
//!
//! Endpoints:
//! - POST /api/oss/upload/init - Start an upload, or finish it instantly on a checksum hit
//! - POST /api/oss/upload/:upload_id/chunk/:index - Upload a chunk (raw body or multipart `chunk` field)
//! - POST /api/oss/upload/:upload_id/complete - Merge chunks and publish the file
//! - GET /api/oss/upload/:upload_id/status - Get upload status

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequest, Multipart, Path, Request, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{
    ChunkUploadResponse, CompleteResponse, InitRequest, InitResponse, StatusResponse, UploadError,
};

/// Multipart field carrying the chunk bytes
const CHUNK_FIELD: &str = "chunk";

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if self.is_retryable() {
            tracing::error!(error = %self, "Upload request failed; client may retry");
        } else {
            tracing::debug!(error = %self, code = self.code(), "Upload request rejected");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload/init", post(init_upload))
        .route("/upload/:upload_id/chunk/:index", post(upload_chunk))
        .route("/upload/:upload_id/complete", post(complete_upload))
        .route("/upload/:upload_id/status", get(upload_status))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/oss/upload/init
///
/// Start an upload. Returns the upload ID and how many chunks to send;
/// zero chunks means the server already holds the file.
async fn init_upload(
    State(state): State<AppState>,
    payload: Result<Json<InitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InitResponse>), UploadError> {
    let Json(request) = payload.map_err(|e| UploadError::InvalidArgument(e.body_text()))?;

    let session = state.coordinator().init(&request).await?;

    Ok((StatusCode::CREATED, Json(InitResponse::from(&session))))
}

/// POST /api/oss/upload/:upload_id/chunk/:index
///
/// Upload a single chunk.
async fn upload_chunk(
    State(state): State<AppState>,
    Path((upload_id, index)): Path<(String, String)>,
    request: Request,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let chunk_index: usize = index
        .parse()
        .map_err(|_| UploadError::InvalidArgument(format!("invalid chunk index: {}", index)))?;

    let data = read_chunk_body(request, &state).await?;

    let receipt = state
        .coordinator()
        .accept_chunk(&upload_id, chunk_index, &data)
        .await?;

    Ok(Json(receipt))
}

/// POST /api/oss/upload/:upload_id/complete
///
/// Merge all chunks and publish the file.
async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<CompleteResponse>, UploadError> {
    let session = state.coordinator().complete(&upload_id).await?;
    Ok(Json(CompleteResponse::from(&session)))
}

/// GET /api/oss/upload/:upload_id/status
async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<StatusResponse>, UploadError> {
    let status = state.coordinator().status(&upload_id).await?;
    Ok(Json(status))
}

// ============================================================================
// Helpers
// ============================================================================

/// Extract chunk bytes from a raw body or a multipart `chunk` field
async fn read_chunk_body(request: Request, state: &AppState) -> Result<Bytes, UploadError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));

    if !is_multipart {
        return Bytes::from_request(request, state)
            .await
            .map_err(|e| UploadError::InvalidArgument(e.body_text()));
    }

    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| UploadError::InvalidArgument(e.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::InvalidArgument(e.body_text()))?
    {
        if field.name() == Some(CHUNK_FIELD) {
            return field
                .bytes()
                .await
                .map_err(|e| UploadError::InvalidArgument(e.body_text()));
        }
    }

    Err(UploadError::InvalidArgument(format!(
        "missing multipart field \"{}\"",
        CHUNK_FIELD
    )))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{body_json, test_app};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use md5::{Digest, Md5};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn send(app: &Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    fn post_json(uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_bytes(uri: &str, data: &[u8]) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(data.to_vec()))
            .unwrap()
    }

    fn post_multipart(uri: &str, data: &[u8]) -> HttpRequest<Body> {
        let boundary = "oss-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                b = boundary
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        HttpRequest::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> HttpRequest<Body> {
        HttpRequest::get(uri).body(Body::empty()).unwrap()
    }

    fn init_body(data: &[u8], chunk_size: usize, md5: bool) -> Value {
        let mut body = json!({
            "file_name": "notes.txt",
            "file_size": data.len(),
            "file_type": "text/plain",
            "chunk_size": chunk_size,
        });
        if md5 {
            body["file_md5"] = json!(hex::encode(Md5::digest(data)));
        }
        body
    }

    #[tokio::test]
    async fn test_upload_flow_over_http() {
        let app = test_app();
        let data = b"HelloSwiftStreamTestFile".repeat(5);

        let (status, init) = send(&app, post_json("/api/oss/upload/init", init_body(&data, 50, true))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(init["chunkCount"], 3);
        assert!(init.get("instantUpload").is_none());
        let id = init["uploadId"].as_str().unwrap().to_string();

        let (status, chunk) = send(
            &app,
            post_multipart(&format!("/api/oss/upload/{}/chunk/2", id), &data[100..]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chunk["chunkIndex"], 2);
        assert_eq!(chunk["receivedCount"], 1);
        assert_eq!(chunk["progress"], 33);

        let (status, err) = send(&app, post_json(&format!("/api/oss/upload/{}/complete", id), json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["code"], "INCOMPLETE_UPLOAD");

        for (index, range) in [(0, 0..50), (1, 50..100)] {
            let (status, _) = send(
                &app,
                post_bytes(&format!("/api/oss/upload/{}/chunk/{}", id, index), &data[range]),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, status_body) = send(&app, get(&format!("/api/oss/upload/{}/status", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(status_body["status"], "in_progress");
        assert_eq!(status_body["missingCount"], 0);
        assert_eq!(status_body["missingChunks"], json!([]));

        let (status, done) = send(&app, post_json(&format!("/api/oss/upload/{}/complete", id), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(done["status"], "completed");
        assert_eq!(done["fileSize"], data.len());
        let file_url = done["fileUrl"].as_str().unwrap().to_string();

        let response = app.clone().oneshot(get(&file_url)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), data.as_slice());

        // Same content again is satisfied without chunks
        let (status, again) = send(&app, post_json("/api/oss/upload/init", init_body(&data, 50, true))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(again["chunkCount"], 0);
        assert_eq!(again["instantUpload"], true);
        assert_eq!(again["fileUrl"], file_url.as_str());
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let app = test_app();

        let (status, err) = send(&app, post_json("/api/oss/upload/init", json!({"file_name": "a"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "INVALID_ARGUMENT");

        let (status, err) = send(
            &app,
            post_json("/api/oss/upload/init", json!({"file_name": "a", "file_size": 0, "chunk_size": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "INVALID_ARGUMENT");

        let (status, err) = send(&app, get("/api/oss/upload/not-a-uuid/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["code"], "NOT_FOUND");

        let (_, init) = send(&app, post_json("/api/oss/upload/init", init_body(b"0123456789", 4, false))).await;
        let id = init["uploadId"].as_str().unwrap();

        let (status, err) = send(&app, post_bytes(&format!("/api/oss/upload/{}/chunk/abc", id), b"0123")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "INVALID_ARGUMENT");

        let (status, err) = send(&app, post_bytes(&format!("/api/oss/upload/{}/chunk/9", id), b"0123")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "INVALID_ARGUMENT");

        // Full chunks could never fit in a request body
        let (status, err) = send(
            &app,
            post_json(
                "/api/oss/upload/init",
                json!({"file_name": "big.iso", "file_size": 200_000_000u64, "chunk_size": 100_000_000u64}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["code"], "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_integrity_mismatch_over_http() {
        let app = test_app();
        let data = b"0123456789";

        let (_, init) = send(&app, post_json("/api/oss/upload/init", init_body(data, 10, true))).await;
        let id = init["uploadId"].as_str().unwrap();

        send(&app, post_bytes(&format!("/api/oss/upload/{}/chunk/0", id), b"9876543210")).await;

        let (status, err) = send(&app, post_json(&format!("/api/oss/upload/{}/complete", id), json!({}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["code"], "INTEGRITY_MISMATCH");

        let (_, status_body) = send(&app, get(&format!("/api/oss/upload/{}/status", id))).await;
        assert_eq!(status_body["status"], "failed");
    }
}
