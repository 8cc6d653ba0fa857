use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;
use serde_json::Value;

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorBody>);

/// Stable error codes surfaced to callers. Upstream compute codes keep the provider's spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    InvalidCredential,
    UnknownIssuer,
    SignatureInvalid,
    UnresolvedAgent,
    Unauthorized,
    NotFound,
    InvalidScheduling,
    TooManyPendingTasks,
    ResourceNotFoundException,
    TooManyRequestsException,
    TooLargeDelayException,
    FunctionTimeout,
    FunctionError,
    TransportError,
    InvalidRequest,
    InternalError,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredential => "invalid_credential",
            Self::UnknownIssuer => "unknown_issuer",
            Self::SignatureInvalid => "signature_invalid",
            Self::UnresolvedAgent => "unresolved_agent",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::InvalidScheduling => "invalid_scheduling",
            Self::TooManyPendingTasks => "too_many_pending_tasks",
            Self::ResourceNotFoundException => "ResourceNotFoundException",
            Self::TooManyRequestsException => "TooManyRequestsException",
            Self::TooLargeDelayException => "TooLargeDelayException",
            Self::FunctionTimeout => "function_timeout",
            Self::FunctionError => "function_error",
            Self::TransportError => "transport_error",
            Self::InvalidRequest => "invalid_request",
            Self::InternalError => "internal_error",
        }
    }

    pub fn default_status(self) -> StatusCode {
        match self {
            Self::InvalidCredential | Self::UnknownIssuer | Self::SignatureInvalid => {
                StatusCode::UNAUTHORIZED
            }
            Self::UnresolvedAgent | Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::NotFound | Self::ResourceNotFoundException => StatusCode::NOT_FOUND,
            Self::InvalidScheduling | Self::TooLargeDelayException | Self::InvalidRequest => {
                StatusCode::BAD_REQUEST
            }
            Self::TooManyPendingTasks => StatusCode::TOO_MANY_REQUESTS,
            Self::TooManyRequestsException => StatusCode::SERVICE_UNAVAILABLE,
            Self::FunctionTimeout => function_timeout_status(),
            Self::FunctionError | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TransportError => StatusCode::BAD_GATEWAY,
        }
    }
}

/// 522 has no named constant in `http`.
pub fn function_timeout_status() -> StatusCode {
    StatusCode::from_u16(522).unwrap_or(StatusCode::GATEWAY_TIMEOUT)
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

pub fn error_response(code: ApiErrorCode, message: impl Into<String>) -> ApiErrorTuple {
    error_response_with_status(code.default_status(), code, message)
}

pub fn error_response_with_status(
    status: StatusCode,
    code: ApiErrorCode,
    message: impl Into<String>,
) -> ApiErrorTuple {
    error_response_with_detail(status, code, message, None)
}

pub fn error_response_with_detail(
    status: StatusCode,
    code: ApiErrorCode,
    message: impl Into<String>,
    error: Option<Value>,
) -> ApiErrorTuple {
    (
        status,
        Json(ApiErrorBody {
            code: code.as_str(),
            message: message.into(),
            error,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_contract_statuses() {
        let expectations = [
            (ApiErrorCode::InvalidCredential, 401),
            (ApiErrorCode::UnknownIssuer, 401),
            (ApiErrorCode::Unauthorized, 403),
            (ApiErrorCode::ResourceNotFoundException, 404),
            (ApiErrorCode::TooManyRequestsException, 503),
            (ApiErrorCode::TooLargeDelayException, 400),
            (ApiErrorCode::TooManyPendingTasks, 429),
            (ApiErrorCode::FunctionTimeout, 522),
            (ApiErrorCode::FunctionError, 500),
            (ApiErrorCode::TransportError, 502),
        ];
        for (code, status) in expectations {
            assert_eq!(code.default_status().as_u16(), status, "{}", code.as_str());
        }
    }

    #[test]
    fn error_body_omits_missing_detail() {
        let (status, payload) = error_response(ApiErrorCode::NotFound, "function not found");
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["code"], "not_found");
        assert_eq!(body["message"], "function not found");
        assert!(body.get("error").is_none());
    }

    #[test]
    fn error_body_carries_upstream_detail() {
        let (_, payload) = error_response_with_detail(
            StatusCode::NOT_FOUND,
            ApiErrorCode::ResourceNotFoundException,
            "redirect target responded with 500",
            Some(serde_json::json!({"status": 500, "body": {"msg": "x"}})),
        );
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["error"]["body"]["msg"], "x");
    }
}
