use axum::body::{Body, Bytes};
use axum::BoxError;
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::error::ApiError;

/// Reads the whole body, refusing anything over `max_bytes`.
pub async fn buffer_body(body: Body, max_bytes: usize) -> Result<Bytes, ApiError> {
    Limited::new(body, max_bytes)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| body_error(e, max_bytes))
}

// only the length limit is a 413; a broken stream is the client's fault
fn body_error(err: BoxError, max_bytes: usize) -> ApiError {
    if err.downcast_ref::<LengthLimitError>().is_some() {
        ApiError::PayloadTooLarge(max_bytes)
    } else {
        ApiError::BadRequest(format!("reading request body: {}", err))
    }
}
