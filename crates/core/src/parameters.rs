use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{PromptArguments, PromptError, PromptRegistry};
use crate::provider::{Completion, Gateway, GatewayError};
use crate::stage::StageId;

pub const PARAMETERS_FILE_NAME: &str = "stage_0_parameters.yaml";
pub const MIN_CHAPTER_LENGTH: u32 = 300;
pub const MAX_CHAPTER_LENGTH: u32 = 5000;
pub const DEFAULT_MIN_SEARCH_RESULTS: u64 = 12_000_000;

/// Editable fields in their canonical order.
pub const FIELDS: [&str; 11] = [
    "topic",
    "main_keyword",
    "theme",
    "target_audience",
    "tone",
    "mood",
    "distribution_platform",
    "primary_format",
    "chapter_length",
    "interactive_elements_included",
    "min_search_results",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum InteractiveElement {
    #[serde(rename = "Printable Tracker")]
    PrintableTracker,
    #[serde(rename = "Guided Journal Page")]
    GuidedJournalPage,
    #[serde(rename = "Progress Checklist")]
    ProgressChecklist,
    #[serde(rename = "Habit Worksheet")]
    HabitWorksheet,
    #[serde(rename = "Milestone Calendar")]
    MilestoneCalendar,
}

impl InteractiveElement {
    pub const ALL: [InteractiveElement; 5] = [
        Self::PrintableTracker,
        Self::GuidedJournalPage,
        Self::ProgressChecklist,
        Self::HabitWorksheet,
        Self::MilestoneCalendar,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::PrintableTracker => "Printable Tracker",
            Self::GuidedJournalPage => "Guided Journal Page",
            Self::ProgressChecklist => "Progress Checklist",
            Self::HabitWorksheet => "Habit Worksheet",
            Self::MilestoneCalendar => "Milestone Calendar",
        }
    }
}

impl fmt::Display for InteractiveElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for InteractiveElement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_label(s);
        Self::ALL
            .into_iter()
            .find(|element| normalize_label(element.label()) == wanted)
            .ok_or_else(|| s.trim().to_string())
    }
}

fn normalize_label(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Everything a run needs to know about the book being written.
///
/// Values are never edited in place: [`ParameterSet::set`] and
/// [`ParameterGenerator::merge`] return a new, validated set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub topic: String,
    pub main_keyword: String,
    pub theme: String,
    pub target_audience: String,
    pub tone: String,
    pub mood: String,
    pub distribution_platform: String,
    pub primary_format: String,
    pub chapter_length: u32,
    pub interactive_elements_included: Vec<InteractiveElement>,
    pub min_search_results: u64,
    #[serde(default)]
    pub seo_queries: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("could not read parameter `{field}` from {raw:?}: {reason}")]
    Parse {
        field: String,
        raw: String,
        reason: String,
    },
    #[error("invalid value {value:?} for `{field}`: {reason}")]
    InvalidField {
        field: String,
        value: String,
        reason: String,
    },
    #[error("failed to render parameter prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("parameter generation failed: {0}")]
    Gateway(#[from] GatewayError),
    #[error("failed to read parameter file `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write parameter file `{path}`: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize parameters: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

impl ParameterError {
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Parse { field, .. } | Self::InvalidField { field, .. } => Some(field),
            _ => None,
        }
    }

    fn parse(field: &str, raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            field: field.to_string(),
            raw: raw.into(),
            reason: reason.into(),
        }
    }

    fn invalid(field: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl ParameterSet {
    /// Parses a YAML document (optionally wrapped in a markdown fence) with full
    /// field validation. Missing `seo_queries` are derived from the main keyword.
    pub fn from_yaml_str(text: &str) -> Result<Self, ParameterError> {
        let body = extract_yaml_block(text);
        let document: Value = serde_yaml::from_str(body)
            .map_err(|err| ParameterError::parse("document", text, err.to_string()))?;
        if !document.is_mapping() {
            return Err(ParameterError::parse(
                "document",
                text,
                "expected a mapping of parameter names to values",
            ));
        }

        let text_field = |field: &str| -> Result<String, ParameterError> {
            match document.get(field) {
                None | Some(Value::Null) => {
                    Err(ParameterError::parse(field, text, "field is missing"))
                }
                Some(value) => match scalar_text(value) {
                    Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
                    Some(value) => Err(ParameterError::parse(field, value, "value is empty")),
                    None => Err(ParameterError::parse(
                        field,
                        yaml_snippet(value),
                        "expected a plain value",
                    )),
                },
            }
        };

        let chapter_length = {
            let raw = text_field("chapter_length")?;
            parse_chapter_length(&raw)
                .map_err(|reason| ParameterError::parse("chapter_length", raw, reason))?
        };

        let interactive_elements_included = match document.get("interactive_elements_included")
        {
            None | Some(Value::Null) => {
                return Err(ParameterError::parse(
                    "interactive_elements_included",
                    text,
                    "field is missing",
                ))
            }
            Some(Value::Sequence(items)) => {
                let labels: Vec<String> = items.iter().filter_map(scalar_text).collect();
                parse_elements(labels.iter().map(String::as_str)).map_err(|reason| {
                    ParameterError::parse("interactive_elements_included", labels.join(", "), reason)
                })?
            }
            Some(value) => {
                let raw = scalar_text(value).unwrap_or_else(|| yaml_snippet(value));
                parse_elements(raw.split(',')).map_err(|reason| {
                    ParameterError::parse("interactive_elements_included", raw.clone(), reason)
                })?
            }
        };

        let min_search_results = match document.get("min_search_results") {
            None | Some(Value::Null) => DEFAULT_MIN_SEARCH_RESULTS,
            Some(value) => {
                let raw = scalar_text(value).unwrap_or_else(|| yaml_snippet(value));
                parse_search_results(&raw)
                    .map_err(|reason| ParameterError::parse("min_search_results", raw, reason))?
            }
        };

        let seo_queries = match document.get("seo_queries") {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(scalar_text)
                .map(|query| query.trim().to_string())
                .filter(|query| !query.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        let mut parameters = Self {
            topic: text_field("topic")?,
            main_keyword: text_field("main_keyword")?,
            theme: text_field("theme")?,
            target_audience: text_field("target_audience")?,
            tone: text_field("tone")?,
            mood: text_field("mood")?,
            distribution_platform: text_field("distribution_platform")?,
            primary_format: text_field("primary_format")?,
            chapter_length,
            interactive_elements_included,
            min_search_results,
            seo_queries,
        };
        if parameters.seo_queries.is_empty() {
            parameters.seo_queries = derive_seo_queries(&parameters.main_keyword);
        }
        parameters.validate()?;
        Ok(parameters)
    }

    pub fn to_yaml(&self) -> Result<String, ParameterError> {
        serde_yaml::to_string(self).map_err(ParameterError::Serialize)
    }

    pub fn validate(&self) -> Result<(), ParameterError> {
        for field in FIELDS {
            let value = self.get(field).unwrap_or_default();
            if value.trim().is_empty() {
                return Err(ParameterError::invalid(field, value, "value must not be empty"));
            }
        }
        if !(MIN_CHAPTER_LENGTH..=MAX_CHAPTER_LENGTH).contains(&self.chapter_length) {
            return Err(ParameterError::invalid(
                "chapter_length",
                self.chapter_length.to_string(),
                format!("must be between {MIN_CHAPTER_LENGTH} and {MAX_CHAPTER_LENGTH}"),
            ));
        }
        if self.min_search_results == 0 {
            return Err(ParameterError::invalid(
                "min_search_results",
                "0",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Current value of a field rendered as text, or `None` for unknown names.
    pub fn get(&self, field: &str) -> Option<String> {
        let value = match field {
            "topic" => self.topic.clone(),
            "main_keyword" => self.main_keyword.clone(),
            "theme" => self.theme.clone(),
            "target_audience" => self.target_audience.clone(),
            "tone" => self.tone.clone(),
            "mood" => self.mood.clone(),
            "distribution_platform" => self.distribution_platform.clone(),
            "primary_format" => self.primary_format.clone(),
            "chapter_length" => self.chapter_length.to_string(),
            "interactive_elements_included" => self.interactive_elements(),
            "min_search_results" => self.min_search_results.to_string(),
            "seo_queries" => self.seo_queries.join("; "),
            _ => return None,
        };
        Some(value)
    }

    /// Returns a copy with one field replaced. `self` is left untouched on error.
    pub fn set(&self, field: &str, value: &str) -> Result<Self, ParameterError> {
        let mut next = self.clone();
        let trimmed = value.trim();
        match field {
            "chapter_length" => {
                next.chapter_length = parse_chapter_length(trimmed)
                    .map_err(|reason| ParameterError::invalid(field, value, reason))?;
            }
            "interactive_elements_included" => {
                next.interactive_elements_included = parse_elements(trimmed.split(','))
                    .map_err(|reason| ParameterError::invalid(field, value, reason))?;
            }
            "min_search_results" => {
                next.min_search_results = parse_search_results(trimmed)
                    .map_err(|reason| ParameterError::invalid(field, value, reason))?;
            }
            "seo_queries" => {
                next.seo_queries = trimmed
                    .split([';', '\n'])
                    .map(str::trim)
                    .filter(|query| !query.is_empty())
                    .map(str::to_string)
                    .collect();
                if next.seo_queries.is_empty() {
                    return Err(ParameterError::invalid(field, value, "no queries given"));
                }
            }
            _ => {
                if trimmed.is_empty() {
                    if FIELDS.contains(&field) {
                        return Err(ParameterError::invalid(
                            field,
                            value,
                            "value must not be empty",
                        ));
                    }
                    return Err(ParameterError::invalid(field, value, "unknown field"));
                }
                let slot = match field {
                    "topic" => &mut next.topic,
                    "main_keyword" => &mut next.main_keyword,
                    "theme" => &mut next.theme,
                    "target_audience" => &mut next.target_audience,
                    "tone" => &mut next.tone,
                    "mood" => &mut next.mood,
                    "distribution_platform" => &mut next.distribution_platform,
                    "primary_format" => &mut next.primary_format,
                    _ => return Err(ParameterError::invalid(field, value, "unknown field")),
                };
                *slot = trimmed.to_string();
            }
        }
        next.validate()?;
        Ok(next)
    }

    pub fn interactive_elements(&self) -> String {
        self.interactive_elements_included
            .iter()
            .map(InteractiveElement::label)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Prompt bindings for every field. List fields are joined into one line.
    pub fn bindings(&self) -> PromptArguments {
        let mut arguments = PromptArguments::new();
        for field in FIELDS {
            if let Some(value) = self.get(field) {
                arguments.insert(field.to_string(), value);
            }
        }
        arguments.insert("interactive_elements".into(), self.interactive_elements());
        arguments.insert("seo_queries".into(), self.seo_queries.join("; "));
        arguments
    }
}

/// `kw`, `kw guide`, `kw tips`, `how to kw`, `kw for beginners`.
pub fn derive_seo_queries(main_keyword: &str) -> Vec<String> {
    let keyword = main_keyword.trim();
    vec![
        keyword.to_string(),
        format!("{keyword} guide"),
        format!("{keyword} tips"),
        format!("how to {keyword}"),
        format!("{keyword} for beginners"),
    ]
}

fn extract_yaml_block(text: &str) -> &str {
    let fenced = if let Some((_, rest)) = text.split_once("```yaml") {
        Some(rest)
    } else if let Some((_, rest)) = text.split_once("```yml") {
        Some(rest)
    } else {
        text.split_once("```").map(|(_, rest)| rest)
    };
    match fenced {
        Some(rest) => rest.split("```").next().unwrap_or(rest).trim(),
        None => text.trim(),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn yaml_snippet(value: &Value) -> String {
    serde_yaml::to_string(value)
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

fn parse_chapter_length(raw: &str) -> Result<u32, String> {
    let digits: String = raw.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    let length: u32 = digits
        .parse()
        .map_err(|_| "expected a whole number of words".to_string())?;
    if !(MIN_CHAPTER_LENGTH..=MAX_CHAPTER_LENGTH).contains(&length) {
        return Err(format!(
            "must be between {MIN_CHAPTER_LENGTH} and {MAX_CHAPTER_LENGTH}"
        ));
    }
    Ok(length)
}

fn parse_search_results(raw: &str) -> Result<u64, String> {
    let digits: String = raw.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    match digits.parse::<u64>() {
        Ok(0) => Err("must be positive".to_string()),
        Ok(value) => Ok(value),
        Err(_) => Err("expected a whole number".to_string()),
    }
}

fn parse_elements<'a, I>(labels: I) -> Result<Vec<InteractiveElement>, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut elements = Vec::new();
    for label in labels.into_iter().map(str::trim).filter(|l| !l.is_empty()) {
        let element = label
            .parse::<InteractiveElement>()
            .map_err(|unknown| format!("`{unknown}` is not a recognised interactive element"))?;
        if !elements.contains(&element) {
            elements.push(element);
        }
    }
    if elements.is_empty() {
        return Err("at least one interactive element is required".to_string());
    }
    Ok(elements)
}

/// Stage 0: derives, loads, edits and persists [`ParameterSet`]s.
pub struct ParameterGenerator<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> ParameterGenerator<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    pub async fn generate(
        &self,
        gateway: &Gateway,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<ParameterSet, ParameterError> {
        self.generate_detailed(gateway, topic, cancel)
            .await
            .map(|(parameters, _)| parameters)
    }

    /// Like [`generate`](Self::generate) but also returns the raw completion.
    pub async fn generate_detailed(
        &self,
        gateway: &Gateway,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<(ParameterSet, Completion), ParameterError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ParameterError::invalid("topic", topic, "value must not be empty"));
        }

        self.log(LogLevel::Info, format!("Analyzing topic: '{topic}'"));
        let prompt = self
            .prompts
            .format_with(StageId::Parameters.definition().prompt_key, [("topic", topic)])?;
        let completion = gateway.complete(&prompt, cancel).await?;

        match ParameterSet::from_yaml_str(&completion.text) {
            Ok(parameters) => {
                self.log(
                    LogLevel::Info,
                    format!(
                        "Parameters generated: keyword '{}', {} words per chapter",
                        parameters.main_keyword, parameters.chapter_length
                    ),
                );
                Ok((parameters, completion))
            }
            Err(err) => {
                self.log(LogLevel::Error, format!("Parameter response rejected: {err}"));
                Err(err)
            }
        }
    }

    pub fn load_from_file(&self, path: impl AsRef<Path>) -> Result<ParameterSet, ParameterError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ParameterError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parameters = ParameterSet::from_yaml_str(&contents)?;
        self.log(
            LogLevel::Info,
            format!("Loaded parameters from {}", path.display()),
        );
        Ok(parameters)
    }

    /// Writes `stage_0_parameters.yaml` into `dir` and returns its path.
    pub fn save(
        &self,
        parameters: &ParameterSet,
        dir: impl AsRef<Path>,
    ) -> Result<PathBuf, ParameterError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| ParameterError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(PARAMETERS_FILE_NAME);
        fs::write(&path, parameters.to_yaml()?).map_err(|source| ParameterError::Write {
            path: path.clone(),
            source,
        })?;
        self.log(
            LogLevel::Info,
            format!("Parameters saved to {}", path.display()),
        );
        Ok(path)
    }

    /// Applies `overrides` field by field and re-validates. `base` is never modified.
    pub fn merge(
        &self,
        base: &ParameterSet,
        overrides: &BTreeMap<String, String>,
    ) -> Result<ParameterSet, ParameterError> {
        let mut merged = base.clone();
        for (field, value) in overrides {
            merged = merged.set(field, value)?;
            self.log(LogLevel::Debug, format!("Parameter `{field}` set to {value:?}"));
        }
        Ok(merged)
    }

    pub fn set(
        &self,
        base: &ParameterSet,
        field: &str,
        value: &str,
    ) -> Result<ParameterSet, ParameterError> {
        base.set(field, value)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{NullLogSink, VecLogSink};
    use crate::provider::MockLanguageModel;
    use std::sync::Arc;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"Here you go:
```yaml
topic: "Beginner Yoga"
main_keyword: "beginner yoga"
theme: "gentle progress"
target_audience: "adults new to yoga"
tone: "supportive"
mood: "calming"
distribution_platform: "Amazon KDP"
primary_format: "PDF"
chapter_length: 1800
interactive_elements_included: "printable tracker, Habit Worksheet"
```
"#;

    fn sample() -> ParameterSet {
        ParameterSet::from_yaml_str(SAMPLE).expect("sample parses")
    }

    #[test]
    fn parses_fenced_yaml_and_derives_queries() {
        let parameters = sample();
        assert_eq!(parameters.topic, "Beginner Yoga");
        assert_eq!(parameters.chapter_length, 1800);
        assert_eq!(
            parameters.interactive_elements_included,
            vec![
                InteractiveElement::PrintableTracker,
                InteractiveElement::HabitWorksheet
            ]
        );
        assert_eq!(parameters.min_search_results, DEFAULT_MIN_SEARCH_RESULTS);
        assert_eq!(parameters.seo_queries[3], "how to beginner yoga");
        assert_eq!(parameters.seo_queries.len(), 5);
    }

    #[test]
    fn accepts_element_lists() {
        let text = SAMPLE.replace(
            "interactive_elements_included: \"printable tracker, Habit Worksheet\"",
            "interactive_elements_included:\n  - Milestone Calendar\n  - guided journal page",
        );
        let parameters = ParameterSet::from_yaml_str(&text).unwrap();
        assert_eq!(
            parameters.interactive_elements_included,
            vec![
                InteractiveElement::MilestoneCalendar,
                InteractiveElement::GuidedJournalPage
            ]
        );
    }

    #[test]
    fn missing_field_is_a_parse_error_naming_the_field() {
        let text = SAMPLE.replace("mood: \"calming\"\n", "");
        let err = ParameterSet::from_yaml_str(&text).unwrap_err();
        assert!(matches!(err, ParameterError::Parse { .. }));
        assert_eq!(err.field(), Some("mood"));
    }

    #[test]
    fn malformed_chapter_length_carries_raw_value() {
        let text = SAMPLE.replace("chapter_length: 1800", "chapter_length: \"about two thousand\"");
        match ParameterSet::from_yaml_str(&text).unwrap_err() {
            ParameterError::Parse { field, raw, .. } => {
                assert_eq!(field, "chapter_length");
                assert_eq!(raw, "about two thousand");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let text = SAMPLE.replace("chapter_length: 1800", "chapter_length: 90000");
        assert_eq!(
            ParameterSet::from_yaml_str(&text).unwrap_err().field(),
            Some("chapter_length")
        );
    }

    #[test]
    fn unknown_interactive_element_is_rejected() {
        let text = SAMPLE.replace("Habit Worksheet", "Sticker Sheet");
        let err = ParameterSet::from_yaml_str(&text).unwrap_err();
        assert_eq!(err.field(), Some("interactive_elements_included"));
    }

    #[test]
    fn prose_response_is_rejected() {
        let err = ParameterSet::from_yaml_str("I cannot help with that.").unwrap_err();
        assert_eq!(err.field(), Some("document"));
    }

    #[test]
    fn set_returns_new_value_and_keeps_original_on_error() {
        let base = sample();
        let updated = base.set("tone", "playful").unwrap();
        assert_eq!(updated.tone, "playful");
        assert_eq!(base.tone, "supportive");

        let err = base.set("chapter_length", "12").unwrap_err();
        assert!(matches!(err, ParameterError::InvalidField { .. }));
        assert_eq!(base.chapter_length, 1800);

        let err = base.set("colour", "blue").unwrap_err();
        assert_eq!(err.field(), Some("colour"));
        assert!(base.set("theme", "   ").is_err());
    }

    #[test]
    fn merge_applies_all_overrides() {
        let prompts = PromptRegistry::new().unwrap();
        let generator = ParameterGenerator::new(&prompts, &NullLogSink);
        let overrides = BTreeMap::from([
            ("mood".to_string(), "energetic".to_string()),
            ("chapter_length".to_string(), "2500".to_string()),
        ]);
        let merged = generator.merge(&sample(), &overrides).unwrap();
        assert_eq!(merged.mood, "energetic");
        assert_eq!(merged.chapter_length, 2500);
    }

    #[test]
    fn save_and_load_round_trip() {
        let prompts = PromptRegistry::new().unwrap();
        let generator = ParameterGenerator::new(&prompts, &NullLogSink);
        let dir = tempdir().unwrap();

        let path = generator.save(&sample(), dir.path()).unwrap();
        assert!(path.ends_with(PARAMETERS_FILE_NAME));
        let loaded = generator.load_from_file(&path).unwrap();
        assert_eq!(loaded, sample());
    }

    #[tokio::test]
    async fn generates_from_mock_model() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let generator = ParameterGenerator::new(&prompts, &sink);
        let gateway = Gateway::new(Arc::new(MockLanguageModel::new()));

        let parameters = generator
            .generate(&gateway, "beginner yoga", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(parameters.topic, "beginner yoga");
        assert!((MIN_CHAPTER_LENGTH..=MAX_CHAPTER_LENGTH).contains(&parameters.chapter_length));
        for field in FIELDS {
            assert!(!parameters.get(field).unwrap().is_empty(), "{field} empty");
        }
        assert!(sink.contains(LogLevel::Info, "Analyzing topic"));
    }

    #[tokio::test]
    async fn empty_topic_is_invalid() {
        let prompts = PromptRegistry::new().unwrap();
        let generator = ParameterGenerator::new(&prompts, &NullLogSink);
        let gateway = Gateway::new(Arc::new(MockLanguageModel::new()));
        let err = generator
            .generate(&gateway, "  ", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("topic"));
    }
}
