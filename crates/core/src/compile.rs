use std::path::PathBuf;
use thiserror::Error;

use crate::context::{ContextError, RunContext};
use crate::logging::LogLevel;
use crate::parser::{extract_chapter_headings, Outline, TableOfContents, WordCountCheck};
use crate::progress::ProgressEvent;
use crate::prompts::PromptError;
use crate::provider::{Completion, GatewayError};
use crate::runner::StageRunner;
use crate::stage::StageId;
use crate::template::SectionKind;

pub const FINAL_DOCUMENT_FILE_NAME: &str = "FINAL_EBOOK.md";

const SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("chapter {0} has no optimized content")]
    MissingChapter(u32),
    #[error("cannot compile without the result of {0}")]
    MissingStage(StageId),
    #[error("failed to render the {section} prompt: {source}")]
    Prompt {
        section: &'static str,
        #[source]
        source: PromptError,
    },
    #[error("{section} generation failed: {source}")]
    Gateway {
        section: &'static str,
        #[source]
        source: GatewayError,
    },
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct CompiledBook {
    pub document: String,
    pub path: PathBuf,
    pub warnings: Vec<String>,
}

struct Sections {
    introduction: String,
    final_thoughts: String,
    review: String,
}

/// Assembles `FINAL_EBOOK.md` from the run context plus three generated sections.
pub struct BookCompiler<'a> {
    runner: &'a StageRunner<'a>,
    context: &'a RunContext,
}

impl<'a> BookCompiler<'a> {
    pub fn new(runner: &'a StageRunner<'a>, context: &'a RunContext) -> Self {
        Self { runner, context }
    }

    pub async fn compile(&self) -> Result<CompiledBook, CompileError> {
        let outline = self
            .context
            .outline()
            .ok_or(CompileError::MissingStage(StageId::Outline))?;
        let toc = self
            .context
            .table_of_contents()
            .ok_or(CompileError::MissingStage(StageId::TableOfContents))?;
        let bodies = self.chapter_bodies(&outline)?;

        let mut warnings = Vec::new();
        let (introduction, final_thoughts, review) = tokio::join!(
            self.section(SectionKind::Introduction, "introduction"),
            self.section(SectionKind::FinalThoughts, "final_thoughts"),
            self.section(SectionKind::Review, "review"),
        );
        let sections = Sections {
            introduction: introduction?,
            final_thoughts: final_thoughts?,
            review: review?,
        };
        for (kind, text) in [
            (SectionKind::Introduction, &sections.introduction),
            (SectionKind::FinalThoughts, &sections.final_thoughts),
            (SectionKind::Review, &sections.review),
        ] {
            let range = self.context.template().range(kind);
            if let Some(warning) = WordCountCheck::new(text, range).warning(kind.label()) {
                warnings.push(warning);
            }
        }

        let document = self.assemble(&outline, &toc, &bodies, &sections);
        warnings.extend(cross_check(&document, &outline));

        let path = self
            .context
            .write_extra(FINAL_DOCUMENT_FILE_NAME, &document)?;
        self.runner.log(
            LogLevel::Info,
            format!("Compiled book written to {}", path.display()),
        );
        Ok(CompiledBook {
            document,
            path,
            warnings,
        })
    }

    /// Optimized text of every outline chapter, in outline order.
    fn chapter_bodies(&self, outline: &Outline) -> Result<Vec<(u32, String, String)>, CompileError> {
        let chapters = self.context.chapters();
        outline
            .chapters
            .iter()
            .map(|planned| {
                chapters
                    .iter()
                    .find(|chapter| chapter.number == planned.number)
                    .and_then(|chapter| chapter.optimized_body())
                    .map(|body| (planned.number, planned.title.clone(), body.to_string()))
                    .ok_or(CompileError::MissingChapter(planned.number))
            })
            .collect()
    }

    async fn section(&self, kind: SectionKind, prompt_key: &'static str) -> Result<String, CompileError> {
        let section = kind.label();
        let mut arguments = self.context.parameters().bindings();
        arguments.extend(self.context.template().section_bindings(kind));
        let prompt = self
            .runner
            .prompts()
            .format(prompt_key, &arguments)
            .map_err(|source| CompileError::Prompt { section, source })?;

        let gateway = self.runner.gateway();
        let cancel = self.runner.cancel_token();
        let outcome: Result<Completion, GatewayError> = if self.runner.settings().stream {
            let progress = self.runner.progress();
            let mut on_chunk = |text: &str| {
                progress.publish(ProgressEvent::SectionChunk {
                    section: section.to_string(),
                    text: text.to_string(),
                })
            };
            gateway.stream(&prompt, cancel, &mut on_chunk).await
        } else {
            gateway.complete(&prompt, cancel).await
        };
        match outcome {
            Ok(completion) => Ok(completion.text.trim().to_string()),
            Err(GatewayError::Cancelled) => Err(CompileError::Cancelled),
            Err(source) => Err(CompileError::Gateway { section, source }),
        }
    }

    fn assemble(
        &self,
        outline: &Outline,
        toc: &TableOfContents,
        bodies: &[(u32, String, String)],
        sections: &Sections,
    ) -> String {
        let parameters = self.context.parameters();
        let mut parts = vec![
            format!(
                "# {}\n\n## {}\n\n*An eBook for {}*",
                parameters.topic,
                outline.full_title(),
                parameters.target_audience
            ),
            format!("# Introduction\n\n{}", sections.introduction),
            toc.render().trim_end().to_string(),
        ];
        parts.extend(
            bodies
                .iter()
                .map(|(number, title, body)| format!("# Chapter {number}: {title}\n\n{body}")),
        );
        parts.push(format!("# Final Thoughts\n\n{}", sections.final_thoughts));
        parts.push(format!("# We'd Love Your Review\n\n{}", sections.review));

        let mut document = parts.join(SEPARATOR);
        document.push('\n');
        document
    }
}

/// Chapter headings found in the finished document must match the outline.
fn cross_check(document: &str, outline: &Outline) -> Vec<String> {
    let found = extract_chapter_headings(document);
    let expected: Vec<(u32, &str)> = outline
        .chapters
        .iter()
        .map(|chapter| (chapter.number, chapter.title.as_str()))
        .collect();
    let actual: Vec<(u32, &str)> = found
        .iter()
        .map(|heading| (heading.number, heading.title.as_str()))
        .collect();
    if actual == expected {
        return Vec::new();
    }
    vec![format!(
        "compiled document lists {} chapter headings, outline has {}",
        actual.len(),
        expected.len()
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::OutlineChapter;

    fn outline() -> Outline {
        Outline {
            title: "Yoga".into(),
            subtitle: None,
            summary: String::new(),
            chapters: vec![
                OutlineChapter {
                    number: 1,
                    title: "Breath".into(),
                    goal: "g".into(),
                },
                OutlineChapter {
                    number: 2,
                    title: "Balance".into(),
                    goal: "g".into(),
                },
            ],
            final_thoughts: None,
        }
    }

    #[test]
    fn cross_check_accepts_matching_headings() {
        let document = "# Chapter 1: Breath\n\n### 1.1 Inhale\n\n# Chapter 2: Balance\n";
        assert!(cross_check(document, &outline()).is_empty());
    }

    #[test]
    fn cross_check_flags_extra_chapters() {
        let document = "# Chapter 1: Breath\n# Chapter 2: Balance\nChapter 3: Bonus material\n";
        let warnings = cross_check(document, &outline());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("3 chapter headings"));
    }
}
