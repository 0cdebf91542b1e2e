//! MJPEG relay — `GET /api/video_feed?id=<camera>`.
//!
//! Re-emits the requested camera's latest annotated JPEG at ~20 Hz as a
//! `multipart/x-mixed-replace` stream, the format dashboards drop straight
//! into an `<img>` tag.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;

use crate::config::defaults::BROADCAST_INTERVAL_MS;

use super::handlers::ApiState;
use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct VideoQuery {
    pub id: String,
}

fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 96);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    part.extend_from_slice(jpeg.len().to_string().as_bytes());
    part.extend_from_slice(b"\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

pub async fn video_feed(
    State(state): State<ApiState>,
    Query(query): Query<VideoQuery>,
) -> Result<Response, ApiError> {
    if state.vision.camera_url(&query.id).is_none() {
        return Err(ApiError::not_found(format!(
            "no camera '{}' registered",
            query.id
        )));
    }

    let vision = state.vision.clone();
    let cancel = state.cancel.clone();
    let camera_id = query.id;

    let stream = futures::stream::unfold(
        (vision, cancel, camera_id),
        |(vision, cancel, camera_id)| async move {
            if cancel.is_cancelled() {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(BROADCAST_INTERVAL_MS)).await;
            let chunk = vision
                .latest_frame(&camera_id)
                .map_or_else(Bytes::new, |jpeg| multipart_chunk(&jpeg));
            Some((Ok::<Bytes, Infallible>(chunk), (vision, cancel, camera_id)))
        },
    );

    Response::builder()
        .header(CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::bad_request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_declares_payload_length() {
        let jpeg = vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9];
        let chunk = multipart_chunk(&jpeg);
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Length: 6"));
        assert!(chunk.ends_with(b"\r\n"));
    }
}
