use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::JobError;
use serde_json::{json, Value};
use tracing::{error, info};

/// Error de la API con el sobre `{"error": {...}, "requestId": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            details: json!({}),
        }
    }

    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        error!("error interno: {}", message);
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Internal server error.",
        )
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = match &err {
            JobError::NotFound(_) | JobError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            JobError::InvalidState { .. } | JobError::NotReady(_) | JobError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            JobError::Validation {
                code: "PAYLOAD_TOO_LARGE",
                ..
            } => StatusCode::PAYLOAD_TOO_LARGE,
            JobError::Validation { .. } | JobError::Bundle(_) | JobError::PathTraversal { .. } => {
                StatusCode::BAD_REQUEST
            }
            JobError::Store(_) | JobError::Io(_) | JobError::Json(_) => {
                return ApiError::internal(err.to_string());
            }
        };

        let details = match &err {
            JobError::Bundle(e) if !e.groups.is_empty() => json!({ "groups": e.groups }),
            _ => json!({}),
        };

        Self {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        info!(
            "respondiendo {} {} ({}): {}",
            self.status.as_u16(),
            self.code,
            request_id,
            self.message
        );
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "details": self.details,
            },
            "requestId": request_id,
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::JobStatus;

    #[test]
    fn mapea_errores_del_motor_a_status_http() {
        let cases = [
            (JobError::NotFound("j".into()), StatusCode::NOT_FOUND, "NOT_FOUND"),
            (
                JobError::InvalidState {
                    job_id: "j".into(),
                    status: JobStatus::Completed,
                },
                StatusCode::CONFLICT,
                "INVALID_STATE",
            ),
            (JobError::NotReady("j".into()), StatusCode::CONFLICT, "NOT_READY"),
            (
                JobError::validation("MISSING_FILE", "file1 is required"),
                StatusCode::BAD_REQUEST,
                "MISSING_FILE",
            ),
            (
                JobError::validation("PAYLOAD_TOO_LARGE", "too big"),
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
            ),
            (
                JobError::Io(std::io::Error::other("disco lleno")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
            ),
        ];

        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status, status);
            assert_eq!(api.code, code);
        }
    }

    #[test]
    fn mensaje_interno_no_se_filtra() {
        let api = ApiError::from(JobError::Io(std::io::Error::other("/ruta/secreta")));
        assert!(!api.message.contains("secreta"));
    }
}
