use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::error::WardenError;

impl WardenError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WardenError::AlreadyInProgress { .. } => StatusCode::CONFLICT,
            WardenError::NotFound(_) => StatusCode::NOT_FOUND,
            WardenError::InvalidInput(_) | WardenError::UnableToCancel { .. } => {
                StatusCode::BAD_REQUEST
            }
            WardenError::UnexpectedStatus { .. } => StatusCode::CONFLICT,
            WardenError::Queue(_) | WardenError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for WardenError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let mut body = json!({
            "error": {
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        });
        if let WardenError::AlreadyInProgress { job_id, .. } = &self {
            body["error"]["job_id"] = json!(job_id);
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            WardenError::AlreadyInProgress {
                what: "discovery".into(),
                job_id: JobId(1)
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            WardenError::not_found("job 4").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WardenError::invalid("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WardenError::Internal(anyhow::anyhow!("db down")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
