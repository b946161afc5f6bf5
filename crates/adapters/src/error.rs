use ebook_core::{LanguageModelError, LanguageModelErrorKind, ProviderKind};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("no API key for {provider}; set one of {}", .variables.join(", "))]
    MissingApiKey {
        provider: ProviderKind,
        variables: Vec<&'static str>,
    },
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("provider stream reported an error: {0}")]
    Stream(String),
    #[error("API returned an empty response")]
    EmptyResponse,
}

impl AdapterError {
    pub fn missing_api_key(provider: ProviderKind) -> Self {
        AdapterError::MissingApiKey {
            provider,
            variables: provider.api_key_env_vars().to_vec(),
        }
    }

    pub fn kind(&self) -> LanguageModelErrorKind {
        match self {
            AdapterError::MissingApiKey { .. } => LanguageModelErrorKind::Auth,
            AdapterError::HttpStatus { status, .. } => classify_status(*status),
            AdapterError::Http(err) if err.is_timeout() => LanguageModelErrorKind::Timeout,
            AdapterError::Http(err) if err.is_decode() => LanguageModelErrorKind::InvalidResponse,
            AdapterError::Http(_) => LanguageModelErrorKind::Unavailable,
            AdapterError::InvalidConfig(_) => LanguageModelErrorKind::UnsupportedCapability,
            AdapterError::Json(_) | AdapterError::Stream(_) | AdapterError::EmptyResponse => {
                LanguageModelErrorKind::InvalidResponse
            }
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == LanguageModelErrorKind::Auth
    }
}

/// 401/403 are credential problems; 408, 429 and 5xx are worth retrying.
/// Any other 4xx means the request itself is wrong.
pub(crate) fn classify_status(status: StatusCode) -> LanguageModelErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LanguageModelErrorKind::Auth,
        StatusCode::REQUEST_TIMEOUT => LanguageModelErrorKind::Timeout,
        StatusCode::TOO_MANY_REQUESTS => LanguageModelErrorKind::Unavailable,
        status if status.is_server_error() => LanguageModelErrorKind::Unavailable,
        status if status.is_client_error() => LanguageModelErrorKind::BadRequest,
        _ => LanguageModelErrorKind::InvalidResponse,
    }
}

impl From<AdapterError> for LanguageModelError {
    fn from(err: AdapterError) -> Self {
        let kind = err.kind();
        LanguageModelError::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_gateway_kinds() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            LanguageModelErrorKind::Auth
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            LanguageModelErrorKind::Auth
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            LanguageModelErrorKind::Unavailable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            LanguageModelErrorKind::Unavailable
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            LanguageModelErrorKind::Timeout
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            LanguageModelErrorKind::BadRequest
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            LanguageModelErrorKind::BadRequest
        );
        assert_eq!(
            classify_status(StatusCode::PERMANENT_REDIRECT),
            LanguageModelErrorKind::InvalidResponse
        );
    }

    #[test]
    fn malformed_request_is_not_retryable() {
        let err = AdapterError::HttpStatus {
            status: StatusCode::BAD_REQUEST,
            body: "unknown field `max_tokns`".into(),
        };
        let converted: LanguageModelError = err.into();
        assert!(!converted.kind().is_retryable());
    }

    #[test]
    fn missing_key_is_an_auth_failure() {
        let err = AdapterError::missing_api_key(ProviderKind::Gemini);
        assert!(err.is_auth());
        assert_eq!(
            err.to_string(),
            "no API key for gemini; set one of GOOGLE_API_KEY, GEMINI_API_KEY"
        );
        let converted: LanguageModelError = err.into();
        assert_eq!(converted.kind(), LanguageModelErrorKind::Auth);
    }
}
