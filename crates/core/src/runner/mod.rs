//! Stage execution: prompt rendering, provider invocation, output validation
//! with bounded same-prompt retries, and the run-level state machine.

mod pipeline;
mod stages;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::config::PipelineSettings;
use crate::context::{ContextError, StageKey};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::parser::ParseError;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::prompts::{PromptArguments, PromptError, PromptRegistry};
use crate::provider::{Completion, Gateway, GatewayError};
use crate::stage::{ExecutionMode, StageId};

pub use pipeline::Pipeline;
pub use stages::{
    validate_cover, validate_draft, validate_optimized, validate_outline, validate_prompt,
    validate_queries, validate_record, validate_toc, Validated, BACKGROUND_FIELDS,
    INTERACTIVE_FIELDS,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    SucceededWithWarning,
    Failed,
}

impl StageStatus {
    pub fn from_warnings(warnings: &[String]) -> Self {
        if warnings.is_empty() {
            Self::Succeeded
        } else {
            Self::SucceededWithWarning
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Where a run currently is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    ConfigReady,
    Stage(StageId),
    /// Stages 6–9 running side by side.
    FanOut,
    Compiled,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Self::Failed | Self::Cancelled) => true,
            (Self::Idle, Self::ConfigReady) => true,
            (Self::ConfigReady, Self::Stage(StageId::SeoQueries)) => true,
            (Self::Stage(current), Self::Stage(following)) => {
                following.ordinal() == current.ordinal() + 1
                    && following.ordinal() <= StageId::ChapterOptimize.ordinal()
            }
            (Self::Stage(StageId::ChapterOptimize), Self::FanOut) => true,
            (Self::FanOut, Self::Compiled) => true,
            (Self::Compiled, Self::Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::ConfigReady => f.write_str("config ready"),
            Self::Stage(stage) => write!(f, "{stage}"),
            Self::FanOut => f.write_str("fan-out"),
            Self::Compiled => f.write_str("compiled"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Owns the current [`RunState`] and announces every accepted transition.
pub struct StateTracker<'a> {
    current: Mutex<RunState>,
    progress: &'a dyn ProgressSink,
}

impl<'a> StateTracker<'a> {
    pub fn new(progress: &'a dyn ProgressSink) -> Self {
        Self {
            current: Mutex::new(RunState::Idle),
            progress,
        }
    }

    pub fn current(&self) -> RunState {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves to `next` when the transition is legal; returns whether it happened.
    pub fn advance(&self, next: RunState) -> bool {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !current.can_transition_to(next) {
            return false;
        }
        *current = next;
        drop(current);
        self.progress
            .publish(ProgressEvent::StateChanged { state: next });
        true
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("failed to render prompt for {stage}: {source}")]
    Prompt {
        stage: StageId,
        #[source]
        source: PromptError,
    },
    #[error("{stage} provider call failed: {source}")]
    Gateway {
        stage: StageId,
        retries: u32,
        #[source]
        source: GatewayError,
    },
    #[error("{stage} output rejected after {attempts} attempts: {source}")]
    Validation {
        stage: StageId,
        chapter: Option<u32>,
        attempts: usize,
        retries: u32,
        #[source]
        source: ParseError,
    },
    #[error("missing dependency {dependency} when running {stage}")]
    MissingDependency { stage: StageId, dependency: StageId },
    #[error("{stage} has no {mode:?} implementation")]
    Unsupported { stage: StageId, mode: ExecutionMode },
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("run cancelled")]
    Cancelled,
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Provider retries plus validation re-invocations spent before failing.
    pub fn retries(&self) -> u32 {
        match self {
            Self::Gateway { retries, .. } | Self::Validation { retries, .. } => *retries,
            _ => 0,
        }
    }

    /// Adds retries that earlier invocations of the same stage already used.
    pub(crate) fn after_retries(mut self, prior: u32) -> Self {
        if let Self::Gateway { retries, .. } | Self::Validation { retries, .. } = &mut self {
            *retries += prior;
        }
        self
    }
}

/// Per-stage line of the run report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<u32>,
    pub status: StageStatus,
    pub retries: u32,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Output of [`StageRunner::execute`] that passed validation.
#[derive(Clone, Debug)]
pub struct Executed<T> {
    pub value: T,
    pub raw: String,
    pub warnings: Vec<String>,
    /// Provider retries plus validation re-invocations.
    pub retries: u32,
}

/// Drives one prompt through the gateway until its output validates.
pub struct StageRunner<'a> {
    prompts: &'a PromptRegistry,
    gateway: &'a Gateway,
    settings: &'a PipelineSettings,
    sink: &'a dyn LogSink,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        prompts: &'a PromptRegistry,
        gateway: &'a Gateway,
        settings: &'a PipelineSettings,
        sink: &'a dyn LogSink,
        progress: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            prompts,
            gateway,
            settings,
            sink,
            progress,
            cancel,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        self.settings
    }

    pub fn prompts(&self) -> &PromptRegistry {
        self.prompts
    }

    pub fn gateway(&self) -> &Gateway {
        self.gateway
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.cancel
    }

    pub fn progress(&self) -> &dyn ProgressSink {
        self.progress
    }

    /// Renders the stage prompt once, then invokes and validates it. A rejected
    /// output is retried with the same prompt up to `stage_retries` times.
    pub async fn execute<T, F>(
        &self,
        key: StageKey,
        arguments: &PromptArguments,
        validate: F,
    ) -> Result<Executed<T>, StageError>
    where
        F: Fn(&str) -> Result<Validated<T>, ParseError>,
    {
        let stage = key.stage;
        let prompt = self
            .prompts
            .format(stage.definition().prompt_key, arguments)
            .map_err(|source| StageError::Prompt { stage, source })?;

        let mut retries = 0u32;
        let mut attempt = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            attempt += 1;
            let completion = self
                .invoke(key, &prompt)
                .await
                .map_err(|err| err.after_retries(retries))?;
            retries += completion.retries;

            match validate(&completion.text) {
                Ok(validated) => {
                    return Ok(Executed {
                        value: validated.value,
                        raw: completion.text,
                        warnings: validated.warnings,
                        retries,
                    })
                }
                Err(err) if attempt <= self.settings.stage_retries => {
                    retries += 1;
                    self.log(
                        LogLevel::Warn,
                        format!("{} rejected (attempt {attempt}): {err}", describe(key)),
                    );
                    self.progress.publish(ProgressEvent::StageRetry {
                        stage,
                        chapter: key.chapter,
                        attempt,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    return Err(StageError::Validation {
                        stage,
                        chapter: key.chapter,
                        attempts: attempt,
                        retries,
                        source: err,
                    })
                }
            }
        }
    }

    async fn invoke(&self, key: StageKey, prompt: &str) -> Result<Completion, StageError> {
        let outcome = if self.settings.stream {
            let progress = self.progress;
            let mut on_chunk = |text: &str| {
                progress.publish(ProgressEvent::Chunk {
                    stage: key.stage,
                    chapter: key.chapter,
                    text: text.to_string(),
                })
            };
            self.gateway.stream(prompt, self.cancel, &mut on_chunk).await
        } else {
            self.gateway.complete(prompt, self.cancel).await
        };
        outcome.map_err(|source| match source {
            GatewayError::Cancelled => StageError::Cancelled,
            source => StageError::Gateway {
                stage: key.stage,
                retries: source.retries(),
                source,
            },
        })
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}

pub(crate) fn describe(key: StageKey) -> String {
    match key.chapter {
        Some(chapter) => format!("{} chapter {chapter}", key.stage),
        None => key.stage.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use crate::progress::{NullProgress, RecordingProgress};
    use crate::provider::{GatewayPolicy, GenerationOptions, LanguageModel, LanguageModelError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Sequence {
        replies: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for Sequence {
        fn name(&self) -> &str {
            "sequence"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<String, LanguageModelError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.replies[index.min(self.replies.len() - 1)].to_string())
        }
    }

    fn gateway(replies: Vec<&'static str>) -> (Gateway, Arc<Sequence>) {
        let model = Arc::new(Sequence {
            replies,
            calls: AtomicUsize::new(0),
        });
        let policy = GatewayPolicy {
            base_delay: Duration::ZERO,
            ..GatewayPolicy::default()
        };
        (Gateway::new(model.clone()).with_policy(policy), model)
    }

    fn arguments() -> PromptArguments {
        PromptArguments::from(
            [
                ("topic", "yoga"),
                ("tone", "warm"),
                ("mood", "calm"),
                ("theme", "balance"),
                ("main_keyword", "yoga"),
                ("target_audience", "adults"),
                ("min_search_results", "12000000"),
            ]
            .map(|(key, value)| (key.to_string(), value.to_string())),
        )
    }

    #[test]
    fn run_state_transitions() {
        assert!(RunState::Idle.can_transition_to(RunState::ConfigReady));
        assert!(RunState::ConfigReady.can_transition_to(RunState::Stage(StageId::SeoQueries)));
        assert!(RunState::Stage(StageId::SeoQueries)
            .can_transition_to(RunState::Stage(StageId::Outline)));
        assert!(!RunState::Stage(StageId::SeoQueries)
            .can_transition_to(RunState::Stage(StageId::TableOfContents)));
        assert!(RunState::Stage(StageId::ChapterOptimize).can_transition_to(RunState::FanOut));
        assert!(!RunState::Stage(StageId::ChapterOptimize)
            .can_transition_to(RunState::Stage(StageId::Cover)));
        assert!(RunState::Stage(StageId::Outline).can_transition_to(RunState::Cancelled));
        assert!(!RunState::Done.can_transition_to(RunState::Failed));
        assert!(!RunState::Idle.can_transition_to(RunState::Compiled));
    }

    #[test]
    fn tracker_ignores_illegal_moves() {
        let progress = RecordingProgress::new();
        let tracker = StateTracker::new(&progress);
        assert!(!tracker.advance(RunState::FanOut));
        assert!(tracker.advance(RunState::ConfigReady));
        assert_eq!(tracker.current(), RunState::ConfigReady);
        assert_eq!(progress.events().len(), 1);
    }

    #[tokio::test]
    async fn invalid_output_is_retried_with_same_prompt() {
        let prompts = PromptRegistry::new().unwrap();
        let (gateway, model) = gateway(vec![
            "not a query list",
            "yoga\nyoga guide\nyoga tips\nhow to yoga\nyoga for beginners",
        ]);
        let settings = PipelineSettings {
            stream: false,
            ..PipelineSettings::default()
        };
        let sink = VecLogSink::new();
        let cancel = CancellationToken::new();
        let runner = StageRunner::new(&prompts, &gateway, &settings, &sink, &NullProgress, &cancel);

        let executed = runner
            .execute(StageKey::stage(StageId::SeoQueries), &arguments(), validate_queries)
            .await
            .unwrap();
        assert_eq!(executed.value.len(), 5);
        assert_eq!(executed.retries, 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert!(sink.contains(LogLevel::Warn, "rejected"));
    }

    #[tokio::test]
    async fn validation_failure_is_bounded() {
        let prompts = PromptRegistry::new().unwrap();
        let (gateway, model) = gateway(vec!["still not queries"]);
        let settings = PipelineSettings {
            stream: false,
            stage_retries: 2,
            ..PipelineSettings::default()
        };
        let cancel = CancellationToken::new();
        let runner = StageRunner::new(
            &prompts,
            &gateway,
            &settings,
            &crate::logging::NullLogSink,
            &NullProgress,
            &cancel,
        );

        let err = runner
            .execute(StageKey::stage(StageId::SeoQueries), &arguments(), validate_queries)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Validation { attempts: 3, .. }));
        assert_eq!(err.retries(), 2);
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_binding_fails_before_any_call() {
        let prompts = PromptRegistry::new().unwrap();
        let (gateway, model) = gateway(vec!["unused"]);
        let settings = PipelineSettings::default();
        let cancel = CancellationToken::new();
        let runner = StageRunner::new(
            &prompts,
            &gateway,
            &settings,
            &crate::logging::NullLogSink,
            &NullProgress,
            &cancel,
        );

        let err = runner
            .execute(
                StageKey::stage(StageId::SeoQueries),
                &PromptArguments::new(),
                validate_queries,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Prompt { .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }
}
