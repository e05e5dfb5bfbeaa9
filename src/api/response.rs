use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Standard response envelope (spec §6 "all JSON endpoints share an
/// envelope").
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = if self.success { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_response_carries_data() {
        let response = ApiResponse::success("payload");
        assert!(response.success);
        assert_eq!(response.data, Some("payload"));
    }

    #[test]
    fn error_response_carries_message() {
        let response = ApiResponse::<()>::error("bad thing");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("bad thing"));
    }
}
