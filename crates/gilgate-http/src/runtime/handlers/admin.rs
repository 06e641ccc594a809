//! Notification ingress for parked and retrying requests

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use gilgate_core::{Gateway, ParkAction};
use tracing::info;

use crate::runtime::types::{ErrorResponse, NotifyRequest, NotifyResponse, RetryResponse};

type ApiError = (StatusCode, Json<ErrorResponse>);

/// POST /notify - Wake requests parked under any of the given keys
pub async fn notify(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<NotifyRequest>,
) -> Result<Json<NotifyResponse>, ApiError> {
    let action: ParkAction = request.action.parse().map_err(|message: String| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid_action", message)),
        )
    })?;

    if request.keys.split(',').all(|key| key.trim().is_empty()) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "missing_keys",
                "At least one correlation key is required",
            )),
        ));
    }

    let delivered = gateway.notify_parked(&request.keys, action, request.arg);
    info!(keys = %request.keys, %action, delivered, "Notification received");
    Ok(Json(NotifyResponse { delivered }))
}

/// POST /retry/{id} - Resume the request waiting on a retry id
pub async fn retry(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    if gateway.notify_retry(&id) {
        Ok(Json(RetryResponse { id, resumed: true }))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                "retry_not_found",
                format!("No request is waiting on retry id '{id}'"),
            )),
        ))
    }
}
