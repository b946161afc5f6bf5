use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, warn};
use thiserror::Error;
use tokio::time::{timeout, timeout_at, Instant};

use crate::cancel::CancellationToken;
use crate::config::PipelineSettings;

use super::{GenerationOptions, LanguageModel, LanguageModelError, LanguageModelErrorKind};

#[derive(Clone, Debug, PartialEq)]
pub struct GatewayPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub completion_timeout: Duration,
    pub stream_ceiling: Duration,
}

impl GatewayPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_attempts: settings.provider_attempts.max(1),
            base_delay: Duration::from_millis(settings.backoff_base_ms),
            max_delay: Duration::from_millis(settings.backoff_max_ms),
            completion_timeout: Duration::from_secs(settings.completion_timeout_secs.max(1)),
            stream_ceiling: Duration::from_secs(settings.stream_ceiling_secs.max(1)),
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from `base_delay` up to `max_delay`.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let multiplier = 1u32 << exponent;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    /// Invocations beyond the first that this completion needed.
    pub retries: u32,
    pub streamed: bool,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("provider rejected credentials: {0}")]
    Auth(#[source] LanguageModelError),
    #[error("provider unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: usize,
        #[source]
        source: LanguageModelError,
    },
    #[error("provider refused the request: {0}")]
    Rejected(#[source] LanguageModelError),
    #[error("run cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Invocations beyond the first that were spent before giving up.
    pub fn retries(&self) -> u32 {
        match self {
            Self::Unavailable { attempts, .. } => attempts.saturating_sub(1) as u32,
            _ => 0,
        }
    }
}

enum AttemptError {
    Model(LanguageModelError),
    Cancelled,
}

impl From<LanguageModelError> for AttemptError {
    fn from(err: LanguageModelError) -> Self {
        Self::Model(err)
    }
}

/// Uniform front for a [`LanguageModel`]: timeouts, bounded exponential backoff,
/// cancellation and the stream-to-complete fallback.
#[derive(Clone)]
pub struct Gateway {
    model: Arc<dyn LanguageModel>,
    options: GenerationOptions,
    policy: GatewayPolicy,
}

impl Gateway {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            options: GenerationOptions::default(),
            policy: GatewayPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: GatewayPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn policy(&self) -> &GatewayPolicy {
        &self.policy
    }

    pub async fn complete(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Completion, GatewayError> {
        self.invoke(prompt, cancel, None).await
    }

    /// Streams the completion into `on_chunk`. Backends that cannot stream deliver
    /// the whole text as a single chunk.
    pub async fn stream(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Completion, GatewayError> {
        self.invoke(prompt, cancel, Some(on_chunk)).await
    }

    async fn invoke(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        mut on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<Completion, GatewayError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            let outcome = match on_chunk.as_deref_mut() {
                Some(observer) => self.stream_once(prompt, cancel, observer).await,
                None => self
                    .complete_once(prompt)
                    .await
                    .map(|text| (text, false))
                    .map_err(AttemptError::from),
            };

            let err = match outcome {
                Ok((text, streamed)) => {
                    return Ok(Completion {
                        text,
                        retries: (attempt - 1) as u32,
                        streamed,
                    })
                }
                Err(AttemptError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(AttemptError::Model(err)) => err,
            };

            match err.kind() {
                LanguageModelErrorKind::Auth => return Err(GatewayError::Auth(err)),
                kind if !kind.is_retryable() => return Err(GatewayError::Rejected(err)),
                _ => {}
            }

            warn!(
                "[gateway:{}] attempt {}/{} failed: {}",
                self.model.name(),
                attempt,
                max_attempts,
                err
            );
            if attempt >= max_attempts {
                return Err(GatewayError::Unavailable {
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.policy.backoff(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn complete_once(&self, prompt: &str) -> Result<String, LanguageModelError> {
        match timeout(
            self.policy.completion_timeout,
            self.model.complete(prompt, &self.options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LanguageModelError::timeout(format!(
                "no completion within {:?}",
                self.policy.completion_timeout
            ))),
        }
    }

    async fn stream_once(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(String, bool), AttemptError> {
        let opened = match timeout(
            self.policy.completion_timeout,
            self.model.stream(prompt, &self.options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                return Err(AttemptError::Model(LanguageModelError::timeout(
                    "stream did not open in time",
                )))
            }
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) if err.kind() == LanguageModelErrorKind::UnsupportedCapability => {
                debug!(
                    "[gateway:{}] streaming unsupported, using complete",
                    self.model.name()
                );
                let text = self.complete_once(prompt).await?;
                on_chunk(&text);
                return Ok((text, false));
            }
            Err(err) => return Err(AttemptError::Model(err)),
        };

        let deadline = Instant::now() + self.policy.stream_ceiling;
        let mut text = String::new();
        loop {
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = timeout_at(deadline, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    return Err(AttemptError::Model(LanguageModelError::timeout(format!(
                        "stream exceeded {:?}",
                        self.policy.stream_ceiling
                    ))))
                }
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => {
                    on_chunk(&chunk);
                    text.push_str(&chunk);
                }
                Ok(Some(Err(err))) if err.kind() == LanguageModelErrorKind::Auth => {
                    return Err(AttemptError::Model(err))
                }
                Ok(Some(Err(err))) => {
                    warn!(
                        "[gateway:{}] stream broke after {} bytes ({}), retrying once without streaming",
                        self.model.name(),
                        text.len(),
                        err
                    );
                    drop(stream);
                    let full = self.complete_once(prompt).await?;
                    match full.strip_prefix(text.as_str()) {
                        Some(rest) if !rest.is_empty() => on_chunk(rest),
                        Some(_) => {}
                        None => debug!(
                            "[gateway:{}] fallback text diverges from the streamed prefix",
                            self.model.name()
                        ),
                    }
                    return Ok((full, false));
                }
            }
        }

        Ok((text, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TextStream;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fast_policy() -> GatewayPolicy {
        GatewayPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            completion_timeout: Duration::from_secs(5),
            stream_ceiling: Duration::from_secs(5),
        }
    }

    struct ScriptedModel {
        completions: Mutex<VecDeque<Result<String, LanguageModelError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(script: Vec<Result<String, LanguageModelError>>) -> Self {
            Self {
                completions: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<String, LanguageModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LanguageModelError::unavailable("script exhausted")))
        }
    }

    /// Streams "partial " then breaks; `complete` answers with `full`.
    struct BrokenStreamModel {
        full: &'static str,
    }

    #[async_trait]
    impl LanguageModel for BrokenStreamModel {
        fn name(&self) -> &str {
            "broken-stream"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<String, LanguageModelError> {
            Ok(self.full.to_string())
        }

        async fn stream(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<TextStream, LanguageModelError> {
            let items = vec![
                Ok("partial ".to_string()),
                Err(LanguageModelError::invalid_response("malformed event")),
            ];
            Ok(Box::pin(stream::iter(items)))
        }
    }

    #[tokio::test]
    async fn retries_unavailable_until_success() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LanguageModelError::unavailable("429")),
            Err(LanguageModelError::unavailable("503")),
            Ok("done".to_string()),
        ]));
        let gateway = Gateway::new(model.clone()).with_policy(fast_policy());

        let completion = gateway
            .complete("prompt", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.text, "done");
        assert_eq!(completion.retries, 2);
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LanguageModelError::auth("bad key")),
            Ok("never".to_string()),
        ]));
        let gateway = Gateway::new(model.clone()).with_policy(fast_policy());

        let err = gateway
            .complete("prompt", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let gateway = Gateway::new(model.clone()).with_policy(fast_policy());

        match gateway.complete("prompt", &CancellationToken::new()).await {
            Err(err @ GatewayError::Unavailable { .. }) => assert_eq!(err.retries(), 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stream_falls_back_to_single_chunk_when_unsupported() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("whole answer".to_string())]));
        let gateway = Gateway::new(model).with_policy(fast_policy());

        let mut chunks = Vec::new();
        let completion = gateway
            .stream("prompt", &CancellationToken::new(), &mut |chunk: &str| {
                chunks.push(chunk.to_string())
            })
            .await
            .unwrap();
        assert_eq!(completion.text, "whole answer");
        assert!(!completion.streamed);
        assert_eq!(chunks, vec!["whole answer".to_string()]);
    }

    #[tokio::test]
    async fn malformed_stream_is_replaced_by_one_complete_call() {
        let gateway = Gateway::new(Arc::new(BrokenStreamModel {
            full: "complete text",
        }))
        .with_policy(fast_policy());

        let completion = gateway
            .stream("prompt", &CancellationToken::new(), &mut |_chunk: &str| {})
            .await
            .unwrap();
        assert_eq!(completion.text, "complete text");
        assert!(!completion.streamed);
    }

    #[tokio::test]
    async fn fallback_only_delivers_text_not_yet_streamed() {
        let gateway = Gateway::new(Arc::new(BrokenStreamModel {
            full: "partial answer, finished",
        }))
        .with_policy(fast_policy());

        let mut chunks = Vec::new();
        let completion = gateway
            .stream("prompt", &CancellationToken::new(), &mut |chunk: &str| {
                chunks.push(chunk.to_string())
            })
            .await
            .unwrap();
        assert_eq!(completion.text, "partial answer, finished");
        assert_eq!(chunks.concat(), "partial answer, finished");
    }

    #[tokio::test]
    async fn diverging_fallback_adds_nothing_to_the_observer() {
        let gateway = Gateway::new(Arc::new(BrokenStreamModel {
            full: "complete text",
        }))
        .with_policy(fast_policy());

        let mut chunks = Vec::new();
        let completion = gateway
            .stream("prompt", &CancellationToken::new(), &mut |chunk: &str| {
                chunks.push(chunk.to_string())
            })
            .await
            .unwrap();
        assert_eq!(completion.text, "complete text");
        assert_eq!(chunks, vec!["partial ".to_string()]);
    }

    #[tokio::test]
    async fn bad_requests_are_not_resent() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LanguageModelError::bad_request("400 unknown field")),
            Ok("never".to_string()),
        ]));
        let gateway = Gateway::new(model.clone()).with_policy(fast_policy());

        let err = gateway
            .complete("prompt", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_invoking() {
        let model = Arc::new(ScriptedModel::new(vec![Ok("unused".to_string())]));
        let gateway = Gateway::new(model.clone()).with_policy(fast_policy());
        let token = CancellationToken::new();
        token.cancel();

        let err = gateway.complete("prompt", &token).await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = GatewayPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..fast_policy()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }
}
