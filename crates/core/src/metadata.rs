use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::parameters::ParameterSet;
use crate::runner::StageReport;
use crate::stage::StageId;
use crate::template::BookTemplate;

pub const METADATA_FILE_NAME: &str = "generation_metadata.json";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to write run metadata `{path}`: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read run metadata `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode run metadata: {0}")]
    Json(#[from] serde_json::Error),
}

/// Terminal outcome of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Parameters-only run that stopped after stage 0.
    ConfigReady,
    Done,
    Failed,
    Cancelled,
}

/// Manifest written next to the artifacts at the end of every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub provider: String,
    pub template: BookTemplate,
    pub parameters: ParameterSet,
    pub stages: Vec<StageReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl RunMetadata {
    pub fn stage(&self, stage: StageId) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|report| report.stage == stage && report.chapter.is_none())
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf, MetadataError> {
        let path = dir.join(METADATA_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|source| MetadataError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, MetadataError> {
        let contents = fs::read_to_string(path).map_err(|source| MetadataError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&contents)?)
    }
}
