pub mod cancel;
pub mod compile;
pub mod config;
pub mod context;
pub mod logging;
pub mod metadata;
pub mod orchestrator;
pub mod parameters;
pub mod parser;
pub mod progress;
pub mod prompts;
pub mod provider;
pub mod runner;
pub mod stage;
pub mod template;

pub use cancel::CancellationToken;
pub use compile::{BookCompiler, CompileError, CompiledBook, FINAL_DOCUMENT_FILE_NAME};
pub use config::{
    Config, ConfigError, ConfigStore, LlmConfig, PipelineSettings, PromptConfig, ProviderKind,
    RecentUsage,
};
pub use context::{
    ArtifactStore, Chapter, ChapterRecord, ContextError, RunContext, StageKey, StageOutput,
    StageResult,
};
pub use logging::{
    LogFacadeSink, LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, StdoutLogSink,
    VecLogSink,
};
pub use metadata::{MetadataError, RunMetadata, RunStatus, METADATA_FILE_NAME};
pub use orchestrator::{Orchestrator, OrchestratorError, RunRequest, RunResult};
pub use parameters::{
    InteractiveElement, ParameterError, ParameterGenerator, ParameterSet, PARAMETERS_FILE_NAME,
};
pub use progress::{ChannelProgress, NullProgress, ProgressEvent, ProgressSink, RecordingProgress};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptTemplate};
pub use provider::{
    Completion, Gateway, GatewayError, GatewayPolicy, GenerationOptions, LanguageModel,
    LanguageModelError, LanguageModelErrorKind, MockLanguageModel, TextStream,
};
pub use runner::{RunState, StageError, StageReport, StageRunner, StageStatus};
pub use stage::{Binding, ExecutionMode, OutputShape, Phase, StageDefinition, StageId};
pub use template::{BookTemplate, SectionKind, WordRange};
