use axum::{http::StatusCode, response::IntoResponse, Json};

use super::{metrics::record_auth_failure, types::ErrorBody};

#[derive(Debug)]
pub(crate) enum ChatFailure {
    InvalidRequest,
    Unauthorized,
    NotFound,
    Internal,
}

impl std::fmt::Display for ChatFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl IntoResponse for ChatFailure {
    fn into_response(self) -> axum::response::Response {
        if matches!(self, Self::Unauthorized) {
            record_auth_failure("unauthorized");
        }

        match self {
            Self::InvalidRequest => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "invalid_request",
                }),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: "invalid_credentials",
                }),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody { error: "not_found" }),
            )
                .into_response(),
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "internal_error",
                }),
            )
                .into_response(),
        }
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
