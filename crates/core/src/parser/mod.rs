//! Structural extraction and validation of model output.
//!
//! Parsers only look at layout (headings, labelled lines, word counts); they
//! never judge content quality.

mod content;
mod headings;
mod outline;
mod queries;
mod record;
mod toc;
mod words;

use thiserror::Error;

pub use content::{
    check_cover_prompt, clean_prompt_text, has_call_to_action, missing_subsections,
    CHAPTER_SUBSECTIONS,
};
pub use headings::{extract_chapter_headings, render_headings, ChapterHeading};
pub use outline::{parse_outline, Outline, OutlineChapter, MAX_TITLE_WORDS};
pub use queries::{parse_queries, QUERY_COUNT};
pub use record::{parse_record, Record};
pub use toc::{parse_table_of_contents, TableOfContents, TocEntry};
pub use words::{count_words, WordCountCheck};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("outline rejected: {0}")]
    Outline(String),
    #[error("table of contents rejected: {0}")]
    TableOfContents(String),
    #[error("search queries rejected: {0}")]
    Queries(String),
    #[error("record is missing required field `{field}`")]
    Record { field: String },
    #[error("content rejected: {0}")]
    Content(String),
}

/// Strips markdown emphasis and heading markers around a single line.
pub(crate) fn strip_markup(line: &str) -> &str {
    line.trim()
        .trim_start_matches(['#', '>'])
        .trim()
        .trim_matches(['*', '_'])
        .trim()
}
