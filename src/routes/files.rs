//! File serving routes
//!
//! Serves published files from object storage, streamed rather than
//! buffered.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Router,
};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::storage::guess_content_type;
use tokio_util::io::ReaderStream;

/// Create the files router
pub fn router() -> Router<AppState> {
    Router::new().route("/*path", get(serve_file))
}

/// Serve a published file
async fn serve_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response> {
    let object = state.objects().get_object(&path).await?;

    // Determine content type
    let content_type = object
        .metadata
        .content_type
        .filter(|ct| !ct.is_empty())
        .unwrap_or_else(|| guess_content_type(&path));

    // Get filename for Content-Disposition
    let filename = path.rsplit('/').next().unwrap_or(&path);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, object.metadata.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", filename.replace('"', "")),
        )
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(Body::from_stream(ReaderStream::new(object.reader)))
        .map_err(|e| AppError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{body_json, test_state, test_state_with_objects};
    use crate::storage::LocalObjectStorage;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn publish(state: &AppState, key: &str, data: &[u8]) {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("object");
        tokio::fs::write(&source, data).await.unwrap();
        state.objects().put_file(key, &source, "").await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_file() {
        let state = test_state();
        publish(&state, "2024/01/02/id/a.pdf", b"%PDF").await;
        let app = crate::app(state);

        let response = app
            .clone()
            .oneshot(Request::get("/files/2024/01/02/id/a.pdf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"%PDF");

        let response = app
            .oneshot(Request::get("/files/2024/missing.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_serve_large_file_from_disk() {
        let objects_dir = tempfile::TempDir::new().unwrap();
        let state = test_state_with_objects(Arc::new(LocalObjectStorage::new(
            objects_dir.path().to_path_buf(),
        )));
        let data: Vec<u8> = (0..=255u8).cycle().take(3 * 1024 * 1024 + 17).collect();
        publish(&state, "2024/01/02/id/big.bin", &data).await;
        let app = crate::app(state);

        let response = app
            .oneshot(Request::get("/files/2024/01/02/id/big.bin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            data.len().to_string().as_str()
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), data.len());
        assert!(bytes.as_ref() == data.as_slice());
    }
}
