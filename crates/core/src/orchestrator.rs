use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::compile::{BookCompiler, CompileError, CompiledBook};
use crate::config::PipelineSettings;
use crate::context::{ArtifactStore, ContextError, RunContext};
use crate::logging::{LogLevel, LogRecord, NullLogSink, SharedLogSink};
use crate::metadata::{MetadataError, RunMetadata, RunStatus, METADATA_FILE_NAME};
use crate::parameters::{ParameterError, ParameterGenerator, ParameterSet};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::prompts::{PromptError, PromptRegistry};
use crate::provider::Gateway;
use crate::runner::{Pipeline, RunState, StageError, StageReport, StageRunner, StateTracker};
use crate::stage::{required_prompt_keys, StageId};
use crate::template::BookTemplate;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("run `{0}` is already active")]
    DuplicateRun(String),
}

/// Everything `run_pipeline` needs besides the provider, which is fixed at construction.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub run_id: String,
    pub parameters: ParameterSet,
    pub template: BookTemplate,
    pub output_dir: PathBuf,
    /// Stop after persisting stage 0.
    pub params_only: bool,
}

impl RunRequest {
    pub fn new(parameters: ParameterSet, template: BookTemplate, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            parameters,
            template,
            output_dir: output_dir.into(),
            params_only: false,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn params_only(mut self, params_only: bool) -> Self {
        self.params_only = params_only;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub stages: Vec<StageReport>,
    /// First fatal error when the run failed.
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub output_dir: PathBuf,
    pub document: Option<PathBuf>,
    pub metadata: PathBuf,
}

impl RunResult {
    pub fn stage(&self, stage: StageId) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|report| report.stage == stage && report.chapter.is_none())
    }

    pub fn chapter(&self, stage: StageId, chapter: u32) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|report| report.stage == stage && report.chapter == Some(chapter))
    }
}

enum Halt {
    Cancelled,
    Failed(String),
}

impl From<StageError> for Halt {
    fn from(err: StageError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Failed(err.to_string())
        }
    }
}

impl From<CompileError> for Halt {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Cancelled => Self::Cancelled,
            other => Self::Failed(other.to_string()),
        }
    }
}

/// The three entry points callers use: parameter generation, pipeline runs and cancellation.
pub struct Orchestrator {
    prompts: PromptRegistry,
    gateway: Gateway,
    settings: PipelineSettings,
    sink: SharedLogSink,
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    /// Fails when the registry lacks a prompt that some stage renders, or when a
    /// stage prompt uses a placeholder its stage does not declare.
    pub fn new(
        prompts: PromptRegistry,
        gateway: Gateway,
        settings: PipelineSettings,
    ) -> Result<Self, PromptError> {
        prompts.ensure_keys(required_prompt_keys())?;
        for stage in StageId::ALL {
            let definition = stage.definition();
            prompts.ensure_bound(definition.prompt_key, &definition.argument_names())?;
        }
        Ok(Self {
            prompts,
            gateway,
            settings,
            sink: Arc::new(NullLogSink),
            runs: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_log_sink(mut self, sink: SharedLogSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn prompts(&self) -> &PromptRegistry {
        &self.prompts
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn generate_parameters(&self, topic: &str) -> Result<ParameterSet, ParameterError> {
        self.parameter_generator()
            .generate(&self.gateway, topic, &CancellationToken::new())
            .await
    }

    pub fn parameter_generator(&self) -> ParameterGenerator<'_> {
        ParameterGenerator::new(&self.prompts, self.sink.as_ref())
    }

    /// Signals the run; in-flight calls stop at their next suspension point.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.runs().get(run_id) {
            Some(token) => {
                token.cancel();
                self.log(LogLevel::Warn, format!("Cancellation requested for run {run_id}"));
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<String> {
        self.runs().keys().cloned().collect()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs stages 0–9 and compiles the book. Stage failures are reported in the
    /// result; `Err` is reserved for runs that could not write their artifacts.
    pub async fn run_pipeline(
        &self,
        request: RunRequest,
        progress: &dyn ProgressSink,
    ) -> Result<RunResult, OrchestratorError> {
        let run_id = request.run_id.clone();
        let cancel = {
            let mut runs = self.runs();
            if runs.contains_key(&run_id) {
                return Err(OrchestratorError::DuplicateRun(run_id));
            }
            let token = CancellationToken::new();
            runs.insert(run_id.clone(), token.clone());
            token
        };

        let result = self.drive(request, &cancel, progress).await;
        self.runs().remove(&run_id);
        result
    }

    async fn drive(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RunResult, OrchestratorError> {
        let RunRequest {
            run_id,
            parameters,
            template,
            output_dir,
            params_only,
        } = request;
        let started_at = Utc::now();
        let clock = Instant::now();
        progress.publish(ProgressEvent::RunStarted {
            run_id: run_id.clone(),
        });
        self.log(
            LogLevel::Info,
            format!(
                "Run {run_id}: '{}' with {} template via {}",
                parameters.topic,
                template,
                self.gateway.model_name()
            ),
        );

        let store = ArtifactStore::create(&output_dir)?;
        let context = RunContext::new(run_id.clone(), parameters.clone(), template, store);
        let tracker = StateTracker::new(progress);
        let runner = StageRunner::new(
            &self.prompts,
            &self.gateway,
            &self.settings,
            self.sink.as_ref(),
            progress,
            cancel,
        );
        let pipeline = Pipeline::new(&runner, &context, &tracker);

        let outcome = self
            .advance(&pipeline, &runner, &context, &tracker, params_only)
            .await;

        let mut warnings = pipeline.warnings();
        let mut document = None;
        let (status, error) = match outcome {
            Ok(None) => (RunStatus::ConfigReady, None),
            Ok(Some(book)) => {
                warnings.extend(book.warnings);
                document = Some(book.path);
                tracker.advance(RunState::Done);
                (RunStatus::Done, None)
            }
            Err(Halt::Cancelled) => {
                tracker.advance(RunState::Cancelled);
                (RunStatus::Cancelled, None)
            }
            Err(Halt::Failed(message)) => {
                tracker.advance(RunState::Failed);
                (RunStatus::Failed, Some(message))
            }
        };

        let stages = pipeline.reports();
        let mut artifacts = context.artifacts();
        artifacts.push(METADATA_FILE_NAME.to_string());
        let metadata = RunMetadata {
            run_id: run_id.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            provider: self.gateway.model_name().to_string(),
            template,
            parameters,
            stages: stages.clone(),
            error: error.clone(),
            warnings: warnings.clone(),
            artifacts,
        };
        let metadata_path = metadata.write(context.store().dir())?;

        match &error {
            Some(message) => self.log(LogLevel::Error, format!("Run {run_id} failed: {message}")),
            None => self.log(LogLevel::Info, format!("Run {run_id} finished: {status:?}")),
        }
        progress.publish(ProgressEvent::RunFinished {
            run_id: run_id.clone(),
            state: tracker.current(),
        });

        Ok(RunResult {
            run_id,
            status,
            stages,
            error,
            warnings,
            output_dir,
            document,
            metadata: metadata_path,
        })
    }

    async fn advance(
        &self,
        pipeline: &Pipeline<'_>,
        runner: &StageRunner<'_>,
        context: &RunContext,
        tracker: &StateTracker<'_>,
        params_only: bool,
    ) -> Result<Option<CompiledBook>, Halt> {
        context
            .parameters()
            .validate()
            .map_err(|err| Halt::Failed(err.to_string()))?;
        pipeline.commit_parameters()?;
        tracker.advance(RunState::ConfigReady);
        if params_only {
            return Ok(None);
        }

        pipeline.run().await?;
        let book = BookCompiler::new(runner, context).compile().await?;
        tracker.advance(RunState::Compiled);
        Ok(Some(book))
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}
