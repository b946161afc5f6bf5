use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChapterHeading {
    pub number: u32,
    pub title: String,
}

/// Top-level `Chapter <n> – <title>` / `Chapter <n>: <title>` markers, in document
/// order. Sub-numbered headings (`1.1 ...`, `Chapter 2.3 ...`) never count, and a
/// repeated chapter number keeps its first title.
pub fn extract_chapter_headings(text: &str) -> Vec<ChapterHeading> {
    let mut seen = BTreeSet::new();
    let mut headings = Vec::new();
    for line in text.lines() {
        let Some((number, title)) = chapter_marker(line) else {
            continue;
        };
        if seen.insert(number) {
            headings.push(ChapterHeading { number, title });
        }
    }
    headings
}

/// Inverse of [`extract_chapter_headings`]: one `Chapter n: title` line per heading.
pub fn render_headings(headings: &[ChapterHeading]) -> String {
    headings
        .iter()
        .map(|heading| format!("Chapter {}: {}", heading.number, heading.title))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Number and title of a top-level chapter marker line. A title that starts with
/// subsection numbering (`Chapter 4: 4.1 Breathing`) is not a chapter.
pub(crate) fn chapter_marker(line: &str) -> Option<(u32, String)> {
    let captures = heading_regex().captures(line.trim())?;
    let number = captures[1].parse::<u32>().ok()?;
    let title = clean_title(&captures[2]);
    if title.is_empty() || subsection_regex().is_match(&title) {
        return None;
    }
    Some((number, title))
}

pub(crate) fn clean_title(raw: &str) -> String {
    raw.trim()
        .trim_matches(['*', '_', '"', '[', ']'])
        .trim()
        .to_string()
}

fn heading_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^(?:#{1,6}\s*|[-*]\s+)?(?:\*\*)?Chapter\s+(\d+)\s*(?:[:–—]|-)\s*(.+)$")
            .expect("invalid chapter heading regex")
    })
}

fn subsection_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^\d+\.\d+").expect("invalid subsection regex"))
}
