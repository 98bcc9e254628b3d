//! Maps `DatalayerError` onto HTTP responses (spec §4.11, §7).

use crate::error::DatalayerError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for DatalayerError {
    fn into_response(self) -> Response {
        let status = match &self {
            DatalayerError::UnknownDataset(_) => StatusCode::NOT_FOUND,
            DatalayerError::Malformed(_)
            | DatalayerError::MissingId
            | DatalayerError::Unsupported(_)
            | DatalayerError::SessionConflict(_)
            | DatalayerError::Timeout(_)
            | DatalayerError::Codec(_) => StatusCode::BAD_REQUEST,
            DatalayerError::UpstreamIo(_) | DatalayerError::Config(_) | DatalayerError::Downstream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = self.client_message();
        (status, Json(ErrorBody { message })).into_response()
    }
}
