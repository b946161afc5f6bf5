use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::parameters::ParameterSet;
use crate::parser::{Outline, Record, TableOfContents};
use crate::runner::StageStatus;
use crate::stage::StageId;
use crate::template::BookTemplate;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("{stage} already has a committed result{}", chapter_suffix(*.chapter))]
    AlreadyCommitted { stage: StageId, chapter: Option<u32> },
    #[error("failed to prepare artifact directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write artifact `{path}`: {source}")]
    WriteArtifact {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize artifact `{name}`: {message}")]
    Serialize { name: String, message: String },
}

fn chapter_suffix(chapter: Option<u32>) -> String {
    chapter
        .map(|n| format!(" for chapter {n}"))
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct StageKey {
    pub stage: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<u32>,
}

impl StageKey {
    pub fn stage(stage: StageId) -> Self {
        Self {
            stage,
            chapter: None,
        }
    }

    pub fn chapter(stage: StageId, chapter: u32) -> Self {
        Self {
            stage,
            chapter: Some(chapter),
        }
    }

    pub fn artifact_name(&self) -> String {
        self.stage.artifact_name(self.chapter)
    }
}

/// One chapter's entry in the stage 7–9 artifacts.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub chapter: u32,
    pub title: String,
    #[serde(flatten)]
    pub fields: Record,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageOutput {
    Parameters(ParameterSet),
    Queries(Vec<String>),
    Outline(Outline),
    TableOfContents(TableOfContents),
    ChapterText { number: u32, title: String, body: String },
    Prompt(String),
    ChapterRecords(Vec<ChapterRecord>),
}

impl StageOutput {
    /// Text written to the stage's artifact file.
    pub fn render_artifact(&self, raw: &str) -> Result<String, String> {
        match self {
            Self::Parameters(parameters) => parameters.to_yaml().map_err(|err| err.to_string()),
            Self::Queries(queries) => Ok(format!("{}\n", queries.join("\n"))),
            Self::Outline(_) | Self::TableOfContents(_) => Ok(raw.to_string()),
            Self::ChapterText { body, .. } => Ok(body.clone()),
            Self::Prompt(prompt) => Ok(format!("{prompt}\n")),
            Self::ChapterRecords(records) => {
                serde_json::to_string_pretty(records).map_err(|err| err.to_string())
            }
        }
    }
}

/// Validated output of one stage execution. Never mutated after commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub key: StageKey,
    pub raw: String,
    pub output: StageOutput,
    pub status: StageStatus,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub retries: u32,
}

impl StageResult {
    pub fn body(&self) -> Option<&str> {
        match &self.output {
            StageOutput::ChapterText { body, .. } => Some(body),
            StageOutput::Prompt(prompt) => Some(prompt),
            _ => None,
        }
    }
}

/// Directory that receives every artifact of one run.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| ContextError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf, ContextError> {
        let path = self.path(name);
        fs::write(&path, contents).map_err(|source| ContextError::WriteArtifact {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }
}

/// Derived view of a chapter across stages 2, 4 and 5.
#[derive(Clone, Debug, PartialEq)]
pub struct Chapter {
    pub number: u32,
    pub title: String,
    pub goal: String,
    pub draft: Option<Arc<StageResult>>,
    pub optimized: Option<Arc<StageResult>>,
}

impl Chapter {
    pub fn optimized_body(&self) -> Option<&str> {
        self.optimized.as_deref().and_then(StageResult::body)
    }
}

/// Per-run mapping from stage (and chapter) to its committed result.
///
/// Every key is written at most once; concurrent chapter and fan-out tasks
/// write disjoint keys in any order. Each commit also persists the artifact.
pub struct RunContext {
    run_id: String,
    parameters: ParameterSet,
    template: BookTemplate,
    store: ArtifactStore,
    results: Mutex<BTreeMap<StageKey, Arc<StageResult>>>,
    artifacts: Mutex<Vec<String>>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        parameters: ParameterSet,
        template: BookTemplate,
        store: ArtifactStore,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            parameters,
            template,
            store,
            results: Mutex::new(BTreeMap::new()),
            artifacts: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn template(&self) -> BookTemplate {
        self.template
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn results(&self) -> MutexGuard<'_, BTreeMap<StageKey, Arc<StageResult>>> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Persists the artifact and publishes the result. A key can be committed once.
    pub fn commit(&self, result: StageResult) -> Result<Arc<StageResult>, ContextError> {
        let key = result.key;
        if self.results().contains_key(&key) {
            return Err(ContextError::AlreadyCommitted {
                stage: key.stage,
                chapter: key.chapter,
            });
        }

        let name = key.artifact_name();
        let contents = result
            .output
            .render_artifact(&result.raw)
            .map_err(|message| ContextError::Serialize {
                name: name.clone(),
                message,
            })?;
        self.store.write(&name, &contents)?;

        let result = Arc::new(result);
        let mut results = self.results();
        if results.contains_key(&key) {
            return Err(ContextError::AlreadyCommitted {
                stage: key.stage,
                chapter: key.chapter,
            });
        }
        results.insert(key, Arc::clone(&result));
        drop(results);
        self.record_artifact(name);
        Ok(result)
    }

    /// Writes a file that is not a stage result (compiled book, metadata).
    pub fn write_extra(&self, name: &str, contents: &str) -> Result<PathBuf, ContextError> {
        let path = self.store.write(name, contents)?;
        self.record_artifact(name.to_string());
        Ok(path)
    }

    fn record_artifact(&self, name: String) {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            if !artifacts.contains(&name) {
                artifacts.push(name);
            }
        }
    }

    pub fn artifacts(&self) -> Vec<String> {
        self.artifacts
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, key: StageKey) -> Option<Arc<StageResult>> {
        self.results().get(&key).cloned()
    }

    pub fn stage(&self, stage: StageId) -> Option<Arc<StageResult>> {
        self.get(StageKey::stage(stage))
    }

    pub fn contains(&self, key: StageKey) -> bool {
        self.results().contains_key(&key)
    }

    pub fn keys(&self) -> Vec<StageKey> {
        self.results().keys().copied().collect()
    }

    pub fn outline(&self) -> Option<Outline> {
        match self.stage(StageId::Outline)?.output {
            StageOutput::Outline(ref outline) => Some(outline.clone()),
            _ => None,
        }
    }

    pub fn table_of_contents(&self) -> Option<TableOfContents> {
        match self.stage(StageId::TableOfContents)?.output {
            StageOutput::TableOfContents(ref toc) => Some(toc.clone()),
            _ => None,
        }
    }

    pub fn queries(&self) -> Option<Vec<String>> {
        match self.stage(StageId::SeoQueries)?.output {
            StageOutput::Queries(ref queries) => Some(queries.clone()),
            _ => None,
        }
    }

    /// Chapters in outline order, joined with whatever drafts and optimizations exist.
    pub fn chapters(&self) -> Vec<Chapter> {
        let Some(outline) = self.outline() else {
            return Vec::new();
        };
        outline
            .chapters
            .into_iter()
            .map(|chapter| Chapter {
                draft: self.get(StageKey::chapter(StageId::ChapterDraft, chapter.number)),
                optimized: self.get(StageKey::chapter(StageId::ChapterOptimize, chapter.number)),
                number: chapter.number,
                title: chapter.title,
                goal: chapter.goal,
            })
            .collect()
    }
}
