use std::error::Error as StdError;
use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod gateway;
mod mock;

pub use gateway::{Completion, Gateway, GatewayError, GatewayPolicy};
pub use mock::MockLanguageModel;

/// Incrementally delivered completion text. Restartable only by calling `stream` again.
pub type TextStream = BoxStream<'static, Result<String, LanguageModelError>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageModelErrorKind {
    /// Missing or rejected credential. Never retried.
    Auth,
    /// Network failure, rate limit or 5xx.
    Unavailable,
    Timeout,
    /// The backend cannot perform the requested operation (usually streaming).
    UnsupportedCapability,
    /// The backend answered but the payload could not be understood.
    InvalidResponse,
    /// The backend refused the request itself (4xx). Resending it cannot help.
    BadRequest,
}

impl LanguageModelErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::Timeout | Self::InvalidResponse
        )
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Auth => "authentication failed",
            Self::Unavailable => "provider unavailable",
            Self::Timeout => "provider timed out",
            Self::UnsupportedCapability => "unsupported capability",
            Self::InvalidResponse => "invalid provider response",
            Self::BadRequest => "request rejected by provider",
        }
    }
}

impl fmt::Display for LanguageModelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug)]
pub struct LanguageModelError {
    kind: LanguageModelErrorKind,
    inner: Box<dyn StdError + Send + Sync>,
}

impl LanguageModelError {
    pub fn new<E>(kind: LanguageModelErrorKind, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            kind,
            inner: Box::new(error),
        }
    }

    pub fn message(kind: LanguageModelErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, Message(message.into()))
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::message(LanguageModelErrorKind::Auth, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::message(LanguageModelErrorKind::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::message(LanguageModelErrorKind::Timeout, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::message(LanguageModelErrorKind::UnsupportedCapability, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::message(LanguageModelErrorKind::InvalidResponse, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::message(LanguageModelErrorKind::BadRequest, message)
    }

    pub fn kind(&self) -> LanguageModelErrorKind {
        self.kind
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.inner
    }

    pub fn as_inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }
}

impl fmt::Display for LanguageModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.inner)
    }
}

impl StdError for LanguageModelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Text generation capability shared by every backend and the offline mock.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LanguageModelError>;

    /// Backends without streaming keep this default; the gateway then falls back to `complete`.
    async fn stream(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<TextStream, LanguageModelError> {
        let _ = (prompt, options);
        Err(LanguageModelError::unsupported(format!(
            "{} does not support streaming",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(LanguageModelErrorKind::Unavailable.is_retryable());
        assert!(LanguageModelErrorKind::Timeout.is_retryable());
        assert!(!LanguageModelErrorKind::Auth.is_retryable());
        assert!(!LanguageModelErrorKind::UnsupportedCapability.is_retryable());
        assert!(!LanguageModelErrorKind::BadRequest.is_retryable());
    }

    #[test]
    fn error_display_includes_kind() {
        let err = LanguageModelError::auth("missing OPENAI_API_KEY");
        assert_eq!(err.kind(), LanguageModelErrorKind::Auth);
        assert_eq!(
            err.to_string(),
            "authentication failed: missing OPENAI_API_KEY"
        );
    }
}
