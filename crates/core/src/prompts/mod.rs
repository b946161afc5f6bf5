//! Prompt templates keyed by stage. The built-in document ships with the crate;
//! TOML or YAML files in configured directories replace individual keys.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("prompt `{key}` uses `{{{argument}}}`, which its stage does not provide")]
    UnboundPlaceholder { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("prompt `{0}` has an empty template")]
    EmptyTemplate(String),
}

#[derive(Clone, Debug, PartialEq)]
enum Piece {
    Text(String),
    Slot(String),
}

/// One parsed template. `{name}` is a placeholder; `{{` and `}}` are literal braces.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    pieces: Vec<Piece>,
}

impl PromptTemplate {
    fn parse(key: String, text: &str) -> Result<Self, PromptError> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(index) = rest.find(['{', '}']) {
            literal.push_str(&rest[..index]);
            let tail = &rest[index..];
            if tail.starts_with("{{") || tail.starts_with("}}") {
                literal.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                literal.push('}');
                rest = &tail[1..];
                continue;
            }
            match tail[1..].find('}') {
                Some(end) if !tail[1..=end].trim().is_empty() => {
                    if !literal.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut literal)));
                    }
                    pieces.push(Piece::Slot(tail[1..=end].trim().to_string()));
                    rest = &tail[end + 2..];
                }
                Some(end) => {
                    literal.push_str(&tail[..end + 2]);
                    rest = &tail[end + 2..];
                }
                None => {
                    literal.push_str(tail);
                    rest = "";
                }
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            pieces.push(Piece::Text(literal));
        }

        if pieces.is_empty() {
            return Err(PromptError::EmptyTemplate(key));
        }
        Ok(Self { key, pieces })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn placeholders(&self) -> BTreeSet<&str> {
        self.pieces
            .iter()
            .filter_map(|piece| match piece {
                Piece::Slot(name) => Some(name.as_str()),
                Piece::Text(_) => None,
            })
            .collect()
    }

    /// The first placeholder in template order without a binding fails the render.
    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        let mut output = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => output.push_str(text),
                Piece::Slot(name) => {
                    let value = arguments.get(name).ok_or_else(|| PromptError::MissingArgument {
                        key: self.key.clone(),
                        argument: name.clone(),
                    })?;
                    output.push_str(value);
                }
            }
        }
        Ok(output.trim_start_matches('\n').to_string())
    }
}

#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
}

impl PromptRegistry {
    /// Built-in prompts only.
    pub fn new() -> Result<Self, PromptError> {
        Self::with_custom_directories::<PathBuf>(&[])
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        Self::with_custom_directories(&config.custom_directories)
    }

    /// Later directories win over earlier ones; all of them win over the built-ins.
    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut prompts = BTreeMap::new();
        let built_in: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        built_in.insert_into(&mut prompts)?;
        for dir in directories {
            load_directory(dir.as_ref(), &mut prompts)?;
        }
        Ok(Self { prompts })
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn format(&self, key: &str, arguments: &PromptArguments) -> Result<String, PromptError> {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render(arguments)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let arguments: PromptArguments = arguments
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        self.format(key, &arguments)
    }

    /// Fails with [`PromptError::NotFound`] naming the first key that has no template.
    pub fn ensure_keys<'a, I>(&self, keys: I) -> Result<(), PromptError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for key in keys {
            if !self.prompts.contains_key(key) {
                return Err(PromptError::NotFound(key.to_string()));
            }
        }
        Ok(())
    }

    /// Fails when the template for `key` uses a placeholder outside `allowed`.
    pub fn ensure_bound(&self, key: &str, allowed: &BTreeSet<&str>) -> Result<(), PromptError> {
        let template = self
            .get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?;
        match template
            .placeholders()
            .into_iter()
            .find(|name| !allowed.contains(name))
        {
            Some(argument) => Err(PromptError::UnboundPlaceholder {
                key: key.to_string(),
                argument: argument.to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn load_directory(
    dir: &Path,
    prompts: &mut BTreeMap<String, PromptTemplate>,
) -> Result<(), PromptError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| PromptError::Io { path, source }
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io(dir))? {
        let path = entry.map_err(io(dir))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    for path in files {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let document: PromptDocument = match extension.as_deref() {
            Some("toml") => {
                let contents = fs::read_to_string(&path).map_err(io(path.as_path()))?;
                toml::from_str(&contents).map_err(|source| PromptError::ParseToml {
                    path: path.clone(),
                    source,
                })?
            }
            Some("yaml" | "yml") => {
                let contents = fs::read_to_string(&path).map_err(io(path.as_path()))?;
                serde_yaml::from_str(&contents).map_err(|source| PromptError::ParseYaml {
                    path: path.clone(),
                    source,
                })?
            }
            _ => continue,
        };
        log::debug!("Loaded prompt overrides from {}", path.display());
        document.insert_into(prompts)?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

impl PromptDocument {
    fn insert_into(self, prompts: &mut BTreeMap<String, PromptTemplate>) -> Result<(), PromptError> {
        for (key, raw) in self.prompts {
            let template = PromptTemplate::parse(key.clone(), &raw.template)?;
            prompts.insert(key, template);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use tempfile::tempdir;

    const STAGE_KEYS: [&str; 13] = [
        "parameters",
        "seo_queries",
        "outline",
        "table_of_contents",
        "chapter_draft",
        "chapter_optimize",
        "cover_prompt",
        "interactive_element",
        "diagram_prompt",
        "background_visual",
        "introduction",
        "final_thoughts",
        "review",
    ];

    #[test]
    fn builtin_document_covers_every_step() -> Result<(), Box<dyn Error>> {
        let registry = PromptRegistry::new()?;
        registry.ensure_keys(STAGE_KEYS)?;
        for key in STAGE_KEYS {
            let rendered = registry.get(key).map(|template| template.key().to_string());
            assert_eq!(rendered.as_deref(), Some(key));
        }
        Ok(())
    }

    #[test]
    fn renders_stage_zero_prompt() -> Result<(), Box<dyn Error>> {
        let registry = PromptRegistry::new()?;
        let output = registry.format_with("parameters", [("topic", "beginner yoga")])?;
        assert!(output.starts_with("Task: parameters"));
        assert!(output.contains("Given Topic: beginner yoga"));
        Ok(())
    }

    #[test]
    fn missing_argument_names_first_placeholder_in_template_order() {
        let registry = PromptRegistry::new().unwrap();
        let args = PromptArguments::from([("topic".into(), "beginner yoga".into())]);
        match registry.format("seo_queries", &args) {
            Err(PromptError::MissingArgument { key, argument }) => {
                assert_eq!(key, "seo_queries");
                assert_eq!(argument, "min_search_results");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn braces_and_placeholders() {
        let template = PromptTemplate::parse("t".into(), "{{raw}} { } {name}}").unwrap();
        assert_eq!(template.placeholders(), BTreeSet::from(["name"]));
        let out = template
            .render(&PromptArguments::from([("name".into(), "x".into())]))
            .unwrap();
        assert_eq!(out, "{raw} { } x}");
    }

    #[test]
    fn blank_template_is_rejected() {
        assert!(matches!(
            PromptTemplate::parse("intro".into(), ""),
            Err(PromptError::EmptyTemplate(key)) if key == "intro"
        ));
    }

    #[test]
    fn custom_directories_override_builtins() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        fs::write(
            dir.path().join("a.toml"),
            "[prompts.review]\ntemplate = \"Review please: {topic}\"\n",
        )?;
        fs::write(
            dir.path().join("b.yaml"),
            "prompts:\n  cover_prompt:\n    template: \"Cover for {topic}\"\n",
        )?;
        fs::write(dir.path().join("notes.txt"), "ignored")?;

        let registry = PromptRegistry::with_custom_directories(&[dir.path()])?;
        assert_eq!(
            registry.format_with("review", [("topic", "yoga")])?,
            "Review please: yoga"
        );
        assert_eq!(
            registry.format_with("cover_prompt", [("topic", "yoga")])?,
            "Cover for yoga"
        );
        Ok(())
    }

    #[test]
    fn placeholder_outside_allowed_set_is_reported() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        fs::write(
            dir.path().join("toc.toml"),
            "[prompts.table_of_contents]\ntemplate = \"{outline} for {topic}\"\n",
        )?;
        let registry = PromptRegistry::with_custom_directories(&[dir.path()])?;
        let allowed = BTreeSet::from(["outline", "chapter_count"]);
        match registry.ensure_bound("table_of_contents", &allowed) {
            Err(PromptError::UnboundPlaceholder { argument, .. }) => assert_eq!(argument, "topic"),
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn unknown_key_is_not_found() {
        let registry = PromptRegistry::new().unwrap();
        assert!(matches!(
            registry.format_with("nope", [("topic", "x")]),
            Err(PromptError::NotFound(key)) if key == "nope"
        ));
    }
}
