use crate::context::{Chapter, RunContext};
use crate::parser::{
    check_cover_prompt, clean_prompt_text, has_call_to_action, missing_subsections,
    parse_outline, parse_queries, parse_record, parse_table_of_contents, Outline,
    OutlineChapter, ParseError, Record, TableOfContents, WordCountCheck,
};
use crate::prompts::PromptArguments;
use crate::stage::{Binding, StageId, CHAPTER_ARGUMENTS};
use crate::template::{BookTemplate, SectionKind};

use super::StageError;

pub const INTERACTIVE_FIELDS: [&str; 5] = [
    "title",
    "element_type",
    "purpose",
    "how_it_works",
    "visual_style",
];

pub const BACKGROUND_FIELDS: [&str; 3] = ["visual_motif", "emotional_tone", "image_prompt"];

/// A parsed stage output plus any advisory warnings.
#[derive(Clone, Debug, PartialEq)]
pub struct Validated<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> Validated<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }
}

pub fn validate_queries(text: &str) -> Result<Validated<Vec<String>>, ParseError> {
    parse_queries(text).map(Validated::clean)
}

pub fn validate_outline(
    text: &str,
    template: BookTemplate,
) -> Result<Validated<Outline>, ParseError> {
    let outline = parse_outline(text)?;
    outline.validate(template.chapter_count())?;
    Ok(Validated::clean(outline))
}

pub fn validate_toc(
    text: &str,
    outline: &Outline,
) -> Result<Validated<TableOfContents>, ParseError> {
    let toc = parse_table_of_contents(text)?;
    toc.validate_against(outline)?;
    Ok(Validated::clean(toc))
}

/// Length and structure problems in a draft are warnings; only an empty draft fails.
pub fn validate_draft(
    text: &str,
    template: BookTemplate,
    chapter: u32,
) -> Result<Validated<String>, ParseError> {
    let body = text.trim();
    if body.is_empty() {
        return Err(ParseError::Content(format!("chapter {chapter} draft is empty")));
    }
    let mut warnings = Vec::new();
    let check = WordCountCheck::new(body, template.range(SectionKind::Chapter));
    if let Some(warning) = check.warning(&format!("chapter {chapter}")) {
        warnings.push(warning);
    }
    let missing = missing_subsections(body);
    if !missing.is_empty() {
        warnings.push(format!(
            "chapter {chapter} is missing subsections: {}",
            missing.join(", ")
        ));
    }
    Ok(Validated {
        value: body.to_string(),
        warnings,
    })
}

pub fn validate_optimized(text: &str, chapter: u32) -> Result<Validated<String>, ParseError> {
    let body = text.trim();
    if body.is_empty() {
        return Err(ParseError::Content(format!(
            "optimized chapter {chapter} is empty"
        )));
    }
    if !has_call_to_action(body) {
        return Err(ParseError::Content(format!(
            "optimized chapter {chapter} has no call to action"
        )));
    }
    Ok(Validated::clean(body.to_string()))
}

pub fn validate_cover(text: &str, book_title: &str) -> Result<Validated<String>, ParseError> {
    let prompt = clean_prompt_text(text);
    let warnings = check_cover_prompt(&prompt, book_title)?;
    Ok(Validated {
        value: prompt,
        warnings,
    })
}

pub fn validate_prompt(text: &str) -> Result<Validated<String>, ParseError> {
    let prompt = clean_prompt_text(text);
    if prompt.is_empty() {
        return Err(ParseError::Content("image prompt is empty".to_string()));
    }
    Ok(Validated::clean(prompt))
}

pub fn validate_record(text: &str, required: &[&str]) -> Result<Validated<Record>, ParseError> {
    parse_record(text, required).map(Validated::clean)
}

/// The chapter a per-chapter or fan-out invocation is working on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChapterRef<'s> {
    pub number: u32,
    pub title: &'s str,
    pub goal: &'s str,
}

impl<'s> From<&'s OutlineChapter> for ChapterRef<'s> {
    fn from(chapter: &'s OutlineChapter) -> Self {
        Self {
            number: chapter.number,
            title: &chapter.title,
            goal: &chapter.goal,
        }
    }
}

impl<'s> From<&'s Chapter> for ChapterRef<'s> {
    fn from(chapter: &'s Chapter) -> Self {
        Self {
            number: chapter.number,
            title: &chapter.title,
            goal: &chapter.goal,
        }
    }
}

/// Values that depend on where in the run a stage is invoked.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Scope<'s> {
    pub chapter: Option<ChapterRef<'s>>,
    /// Upstream chapter text, or every optimized chapter for whole-book stages.
    pub content: Option<&'s str>,
}

impl<'s> Scope<'s> {
    pub fn chapter(chapter: impl Into<ChapterRef<'s>>, content: Option<&'s str>) -> Self {
        Self {
            chapter: Some(chapter.into()),
            content,
        }
    }

    pub fn content(content: &'s str) -> Self {
        Self {
            chapter: None,
            content: Some(content),
        }
    }
}

/// Binds exactly the inputs `stage` declares. Template word budgets stand in for
/// the parameter set's own `chapter_length`.
pub(crate) fn stage_arguments(
    context: &RunContext,
    stage: StageId,
    scope: Scope<'_>,
) -> Result<PromptArguments, StageError> {
    let parameters = context.parameters().bindings();
    let missing = |dependency| StageError::MissingDependency { stage, dependency };
    let mut arguments = PromptArguments::new();

    for binding in stage.definition().inputs {
        match *binding {
            Binding::Parameter(name) => {
                if let Some(value) = parameters.get(name) {
                    arguments.insert(name.to_string(), value.clone());
                }
            }
            Binding::Template => arguments.extend(context.template().bindings()),
            Binding::Chapter => {
                if let Some(chapter) = scope.chapter {
                    let [number, title, goal] = CHAPTER_ARGUMENTS;
                    arguments.insert(number.to_string(), chapter.number.to_string());
                    arguments.insert(title.to_string(), chapter.title.to_string());
                    arguments.insert(goal.to_string(), chapter.goal.to_string());
                }
            }
            Binding::Stage(StageId::SeoQueries) => {
                let queries = match context.queries() {
                    Some(queries) => queries.join("; "),
                    None => parameters.get("seo_queries").cloned().unwrap_or_default(),
                };
                arguments.insert("seo_queries".into(), queries);
            }
            Binding::Stage(StageId::Outline) => {
                let raw = context
                    .stage(StageId::Outline)
                    .map(|result| result.raw.clone())
                    .ok_or_else(|| missing(StageId::Outline))?;
                let outline = context.outline().ok_or_else(|| missing(StageId::Outline))?;
                arguments.insert("outline".into(), raw);
                arguments.insert("book_title".into(), outline.full_title());
            }
            Binding::Stage(upstream @ (StageId::ChapterDraft | StageId::ChapterOptimize)) => {
                let content = scope.content.ok_or_else(|| missing(upstream))?;
                arguments.insert("content".into(), content.to_string());
            }
            Binding::Stage(_) => {}
        }
    }
    Ok(arguments)
}

/// Stages 7–9 each reduce one chapter's answer to a record.
pub(crate) fn validate_chapter_record(
    stage: StageId,
    text: &str,
) -> Result<Validated<Record>, ParseError> {
    match stage {
        StageId::InteractiveElements => validate_record(text, &INTERACTIVE_FIELDS),
        StageId::Backgrounds => validate_record(text, &BACKGROUND_FIELDS),
        _ => validate_prompt(text).map(|validated| {
            Validated::clean(Record::from([("prompt".to_string(), validated.value)]))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filler(words: usize) -> String {
        vec!["word"; words].join(" ")
    }

    #[test]
    fn short_draft_is_a_warning() {
        let text = format!(
            "## Introduction\n## Core Concepts\n## Practical Steps\n## Interactive Element\n## Common Pitfalls\n## Key Takeaways\n{}",
            filler(633)
        );
        let validated = validate_draft(&text, BookTemplate::Standard, 2).unwrap();
        assert_eq!(validated.warnings.len(), 1);
        assert!(validated.warnings[0].contains("chapter 2 has 650 words, expected 1080-1320"));
    }

    #[test]
    fn empty_draft_fails() {
        assert!(validate_draft("  \n", BookTemplate::Standard, 1).is_err());
    }

    #[test]
    fn optimized_chapter_needs_call_to_action() {
        assert!(validate_optimized("Body text.", 1).is_err());
        let validated = validate_optimized("Body.\n\nCall to Action: start today.", 1).unwrap();
        assert!(validated.warnings.is_empty());
    }

    #[test]
    fn cover_prompt_rejects_title() {
        let title = "Gentle Yoga: Your Guide to Real Change";
        assert!(validate_cover("A poster reading Gentle Yoga at dawn.", title).is_err());
        let ok = validate_cover("Prompt: Soft dawn light over a quiet mat.", title).unwrap();
        assert_eq!(ok.value, "Soft dawn light over a quiet mat.");
    }

    #[test]
    fn background_record_requires_all_fields() {
        let text = "Visual Motif: waves\nEmotional Tone: calm\n";
        let err = validate_record(text, &BACKGROUND_FIELDS).unwrap_err();
        assert_eq!(
            err,
            ParseError::Record {
                field: "image_prompt".into()
            }
        );
    }

    #[test]
    fn diagram_answers_become_prompt_records() {
        let record = validate_chapter_record(StageId::Diagrams, "Prompt: isometric steps.")
            .unwrap()
            .value;
        assert_eq!(record.get("prompt").map(String::as_str), Some("isometric steps."));
    }
}
