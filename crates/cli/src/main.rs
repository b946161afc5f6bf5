use clap::{Args, Parser, Subcommand};
use ebook_adapters::{create_language_model, AdapterError};
use ebook_core::{
    BookTemplate, ChannelProgress, ConfigError, ConfigStore, Gateway, GatewayPolicy, LlmConfig,
    LogFacadeSink, Orchestrator, OrchestratorError, ParameterError, ParameterSet, ProgressEvent,
    PromptError, PromptRegistry, ProviderKind, RunRequest, RunResult, RunStatus, StageStatus,
};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    match cli.command {
        Command::Params(args) => run_params(&cli.config, args).await,
        Command::Run(args) => run_pipeline(&cli.config, args).await,
    }
}

async fn run_params(config_path: &Path, args: ParamsArgs) -> Result<(), CliError> {
    let (orchestrator, _) = build_orchestrator(config_path, &args.provider, false)?;
    let parameters = orchestrator.generate_parameters(&args.topic).await?;
    let parameters = apply_edits(&orchestrator, parameters, &args.set)?;

    if let Some(dir) = args.output {
        orchestrator.parameter_generator().save(&parameters, dir)?;
    } else {
        print!("{}", parameters.to_yaml()?);
    }
    Ok(())
}

async fn run_pipeline(config_path: &Path, args: RunArgs) -> Result<(), CliError> {
    let (orchestrator, profile) = build_orchestrator(config_path, &args.provider, args.no_stream)?;
    let orchestrator = Arc::new(orchestrator);

    let parameters = match (&args.params, &args.topic) {
        (Some(path), _) => orchestrator.parameter_generator().load_from_file(path)?,
        (None, Some(topic)) => orchestrator.generate_parameters(topic).await?,
        (None, None) => return Err(CliError::MissingTopic),
    };
    let parameters = apply_edits(&orchestrator, parameters, &args.set)?;

    let mut request = RunRequest::new(parameters, args.template, &args.output)
        .params_only(args.params_only);
    if let Some(run_id) = args.run_id {
        request = request.with_run_id(run_id);
    }
    let run_id = request.run_id.clone();
    info!(
        "Run {run_id}: {} template, output in {}",
        request.template,
        args.output.display()
    );

    let interrupt = {
        let orchestrator = Arc::clone(&orchestrator);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling run {run_id}");
                orchestrator.cancel(&run_id);
            }
        })
    };

    let (progress, events) = ChannelProgress::new();
    let reporter = tokio::spawn(report_progress(events));
    let outcome = orchestrator.run_pipeline(request, &progress).await;
    drop(progress);
    interrupt.abort();
    join_reporter(reporter).await;

    let result = outcome?;
    if let Some(name) = profile {
        remember_profile(config_path, name);
    }
    summarize(&result);
    match result.status {
        RunStatus::Done | RunStatus::ConfigReady => Ok(()),
        RunStatus::Cancelled => Err(CliError::Cancelled(result.run_id)),
        RunStatus::Failed => Err(CliError::RunFailed {
            run_id: result.run_id,
            message: result.error.unwrap_or_else(|| "unknown error".to_string()),
        }),
    }
}

/// Provider profile from the config file, overridden by flags.
fn build_orchestrator(
    config_path: &Path,
    flags: &ProviderArgs,
    no_stream: bool,
) -> Result<(Orchestrator, Option<String>), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();
    let config = store.config();

    let (profile, mut llm) = match config.select_llm_profile(flags.profile.as_deref()) {
        Some((name, profile)) => (Some(name.clone()), profile.clone()),
        None if flags.profile.is_some() => {
            return Err(CliError::UnknownProfile(flags.profile.clone().unwrap_or_default()))
        }
        None => (None, LlmConfig::for_provider(ProviderKind::Mock)),
    };
    if let Some(provider) = flags.provider {
        if provider != llm.provider {
            llm = LlmConfig::for_provider(provider);
        }
    }
    if let Some(model) = &flags.model {
        llm.model_name = model.clone();
    }
    if let Some(api_key) = &flags.api_key {
        llm.api_key = api_key.clone();
    }
    if let Some(base_url) = &flags.base_url {
        llm.base_url = base_url.clone();
    }

    let mut settings = config.pipeline.clone();
    if no_stream {
        settings.stream = false;
    }

    let model = create_language_model(&llm)?;
    info!("Using provider {} ({})", llm.provider, model.name());
    let gateway = Gateway::new(model)
        .with_policy(GatewayPolicy::from_settings(&settings))
        .with_options(llm.generation_options());
    let prompts = PromptRegistry::from_prompt_config(&config.prompts)?;
    let orchestrator =
        Orchestrator::new(prompts, gateway, settings)?.with_log_sink(Arc::new(LogFacadeSink::new()));
    Ok((orchestrator, profile))
}

fn remember_profile(config_path: &Path, name: String) {
    let saved = ConfigStore::open(config_path.to_path_buf()).and_then(|mut store| {
        store.touch_llm_profile(name);
        store.save()
    });
    if let Err(err) = saved {
        warn!("Could not record the last used profile: {err}");
    }
}

fn apply_edits(
    orchestrator: &Orchestrator,
    parameters: ParameterSet,
    edits: &[String],
) -> Result<ParameterSet, CliError> {
    if edits.is_empty() {
        return Ok(parameters);
    }
    let overrides = parse_edits(edits)?;
    Ok(orchestrator
        .parameter_generator()
        .merge(&parameters, &overrides)?)
}

fn parse_edits(edits: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    edits
        .iter()
        .map(|edit| match edit.split_once('=') {
            Some((field, value)) if !field.trim().is_empty() => {
                Ok((field.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(CliError::InvalidEdit(edit.clone())),
        })
        .collect()
}

/// Waits for the progress task; returns false when it panicked or was aborted.
async fn join_reporter(reporter: JoinHandle<()>) -> bool {
    match reporter.await {
        Ok(()) => true,
        Err(err) => {
            warn!("Progress reporter stopped abnormally: {err}");
            false
        }
    }
}

async fn report_progress(mut events: UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::StageStarted { stage, chapter } => match chapter {
                Some(chapter) => info!("{stage} (chapter {chapter}) started"),
                None => info!("{stage} started"),
            },
            ProgressEvent::StageRetry {
                stage,
                chapter,
                attempt,
                reason,
            } => warn!(
                "{stage}{} retry {attempt}: {reason}",
                chapter.map(|n| format!(" (chapter {n})")).unwrap_or_default()
            ),
            ProgressEvent::StageFinished {
                stage,
                chapter,
                status,
                retries,
            } => info!(
                "{stage}{} finished: {status:?} after {retries} retries",
                chapter.map(|n| format!(" (chapter {n})")).unwrap_or_default()
            ),
            ProgressEvent::StateChanged { state } => debug!("Run state: {state}"),
            ProgressEvent::Chunk { .. } | ProgressEvent::SectionChunk { .. } => {}
            ProgressEvent::RunStarted { .. } | ProgressEvent::RunFinished { .. } => {}
        }
    }
}

fn summarize(result: &RunResult) {
    for report in &result.stages {
        if report.status == StageStatus::Failed {
            warn!(
                "{} failed: {}",
                report.stage,
                report.error.as_deref().unwrap_or("no detail")
            );
        }
    }
    for warning in &result.warnings {
        warn!("{warning}");
    }
    println!("Run {}: {:?}", result.run_id, result.status);
    println!("Artifacts: {}", result.output_dir.display());
    if let Some(document) = &result.document {
        println!("eBook: {}", document.display());
    }
    println!("Metadata: {}", result.metadata.display());
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("no LLM profile named `{0}`")]
    UnknownProfile(String),
    #[error("provider setup failed: {0}")]
    Adapter(#[from] AdapterError),
    #[error("prompt loading failed: {0}")]
    Prompt(#[from] PromptError),
    #[error("{0}")]
    Parameters(#[from] ParameterError),
    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),
    #[error("invalid edit `{0}`, expected field=value")]
    InvalidEdit(String),
    #[error("either --topic or --params is required")]
    MissingTopic,
    #[error("run {run_id} failed: {message}")]
    RunFailed { run_id: String, message: String },
    #[error("run {0} was cancelled")]
    Cancelled(String),
}

#[derive(Parser)]
#[command(
    name = "ebookgen",
    version,
    about = "Turn a topic into a complete, structured eBook"
)]
struct Cli {
    /// Path to the JSON config file with provider profiles and pipeline settings
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate the parameter set for a topic and print or save it
    Params(ParamsArgs),
    /// Run the full pipeline and compile the eBook
    Run(RunArgs),
}

#[derive(Args)]
struct ProviderArgs {
    /// Named LLM profile from the config file, defaults to the last one used
    #[arg(long)]
    profile: Option<String>,
    /// Provider backend: anthropic, openai, gemini, openrouter, groq, custom or mock
    #[arg(long)]
    provider: Option<ProviderKind>,
    /// Model name, defaults to the provider's default model
    #[arg(long)]
    model: Option<String>,
    /// API key, otherwise read from the provider's environment variable
    #[arg(long)]
    api_key: Option<String>,
    /// Base URL override for OpenAI-compatible servers
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Args)]
struct ParamsArgs {
    /// Topic to analyze
    #[arg(long)]
    topic: String,
    /// Directory to save stage_0_parameters.yaml into; prints to stdout when omitted
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Edit a parameter before saving, as field=value (repeatable)
    #[arg(long, value_name = "FIELD=VALUE")]
    set: Vec<String>,
    #[command(flatten)]
    provider: ProviderArgs,
}

#[derive(Args)]
struct RunArgs {
    /// Topic to generate parameters for
    #[arg(long, conflicts_with = "params")]
    topic: Option<String>,
    /// Previously saved parameter file to use instead of generating one
    #[arg(long, value_name = "FILE")]
    params: Option<PathBuf>,
    /// Book template: standard, quickstart or deepdive
    #[arg(long, default_value = "standard")]
    template: BookTemplate,
    /// Output directory for stage artifacts and the compiled eBook
    #[arg(long, default_value = "./output", value_name = "DIR")]
    output: PathBuf,
    /// Edit a parameter before the run, as field=value (repeatable)
    #[arg(long, value_name = "FIELD=VALUE")]
    set: Vec<String>,
    /// Persist the parameters and stop before stage 1
    #[arg(long)]
    params_only: bool,
    /// Request complete responses instead of token streams
    #[arg(long)]
    no_stream: bool,
    /// Explicit run id, a random one is generated otherwise
    #[arg(long)]
    run_id: Option<String>,
    #[command(flatten)]
    provider: ProviderArgs,
}
