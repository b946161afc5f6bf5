use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::headings::{chapter_marker, clean_title};
use super::{strip_markup, ParseError};

/// Upper bound on the combined title and subtitle length.
pub const MAX_TITLE_WORDS: usize = 12;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OutlineChapter {
    pub number: u32,
    pub title: String,
    pub goal: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub summary: String,
    pub chapters: Vec<OutlineChapter>,
    /// Goal of the closing block; not a numbered chapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_thoughts: Option<String>,
}

impl Outline {
    pub fn full_title(&self) -> String {
        match &self.subtitle {
            Some(subtitle) => format!("{}: {}", self.title, subtitle),
            None => self.title.clone(),
        }
    }

    pub fn title_words(&self) -> usize {
        super::count_words(&self.title)
            + self
                .subtitle
                .as_deref()
                .map(super::count_words)
                .unwrap_or_default()
    }

    /// Checks the title budget and the chapter count demanded by the book template.
    pub fn validate(&self, expected_chapters: usize) -> Result<(), ParseError> {
        if self.title_words() > MAX_TITLE_WORDS {
            return Err(ParseError::Outline(format!(
                "title and subtitle use {} words, at most {MAX_TITLE_WORDS} allowed",
                self.title_words()
            )));
        }
        if self.chapters.len() != expected_chapters {
            return Err(ParseError::Outline(format!(
                "expected {expected_chapters} chapters, found {}",
                self.chapters.len()
            )));
        }
        Ok(())
    }
}

enum Marker {
    Chapter(u32, String),
    FinalThoughts,
}

fn marker(line: &str) -> Option<Marker> {
    let trimmed = line.trim();
    if let Some((number, title)) = chapter_marker(trimmed) {
        return Some(Marker::Chapter(number, title));
    }
    if final_thoughts_regex().is_match(strip_markup(trimmed)) {
        return Some(Marker::FinalThoughts);
    }
    None
}

fn goal(line: &str) -> Option<String> {
    goal_regex()
        .captures(line.trim())
        .map(|captures| clean_title(&captures[1]))
        .filter(|goal| !goal.is_empty())
}

/// Splits a stage-2 outline into title, summary, numbered chapters and the closing block.
pub fn parse_outline(text: &str) -> Result<Outline, ParseError> {
    let lines: Vec<&str> = text.lines().collect();

    let title_line = lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && marker(line).is_none())
        .find(|line| line.starts_with('#'))
        .or_else(|| {
            lines
                .iter()
                .map(|line| line.trim())
                .find(|line| !line.is_empty() && marker(line).is_none())
        })
        .ok_or_else(|| ParseError::Outline("outline is empty".to_string()))?;
    let title_text = strip_markup(title_line);
    let title_text = title_text
        .strip_prefix("Title:")
        .map(str::trim)
        .unwrap_or(title_text);
    let (title, subtitle) = match title_text.split_once(':') {
        Some((title, subtitle)) if !subtitle.trim().is_empty() => {
            (title.trim().to_string(), Some(subtitle.trim().to_string()))
        }
        _ => (title_text.trim_end_matches(':').trim().to_string(), None),
    };

    let mut chapters: Vec<OutlineChapter> = Vec::new();
    let mut final_thoughts = None;
    let mut summary = Vec::new();
    let mut in_summary = false;
    let mut index = 0;
    while index < lines.len() {
        let line = lines[index];
        match marker(line) {
            Some(Marker::Chapter(number, chapter_title)) => {
                in_summary = false;
                let found = following_goal(&lines[index + 1..]);
                let Some(goal) = found else {
                    return Err(ParseError::Outline(format!(
                        "chapter {number} (`{chapter_title}`) has no Goal line"
                    )));
                };
                let expected = chapters.len() as u32 + 1;
                if number != expected {
                    return Err(ParseError::Outline(format!(
                        "chapter {number} found where chapter {expected} was expected"
                    )));
                }
                chapters.push(OutlineChapter {
                    number,
                    title: chapter_title,
                    goal,
                });
            }
            Some(Marker::FinalThoughts) => {
                in_summary = false;
                final_thoughts = following_goal(&lines[index + 1..]).or(Some(String::new()));
            }
            None => {
                let stripped = strip_markup(line);
                if stripped.eq_ignore_ascii_case("core transformation summary") {
                    in_summary = true;
                } else if in_summary && chapters.is_empty() && !stripped.is_empty() {
                    summary.push(stripped.to_string());
                }
            }
        }
        index += 1;
    }

    if chapters.is_empty() {
        return Err(ParseError::Outline(
            "no `Chapter <n>: <title>` lines found".to_string(),
        ));
    }
    if title.is_empty() {
        return Err(ParseError::Outline("missing book title".to_string()));
    }

    Ok(Outline {
        title,
        subtitle,
        summary: summary.join(" "),
        chapters,
        final_thoughts: final_thoughts.filter(|goal: &String| !goal.is_empty()),
    })
}

/// The first Goal line before the next chapter or closing marker.
fn following_goal(rest: &[&str]) -> Option<String> {
    for line in rest {
        if marker(line).is_some() {
            return None;
        }
        if let Some(goal) = goal(line) {
            return Some(goal);
        }
    }
    None
}

fn goal_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^(?:[-*]\s+)?(?:\*\*|__)?goal(?:\*\*|__)?\s*:\s*(?:\*\*|__)?\s*(.+)$")
            .expect("invalid goal regex")
    })
}

fn final_thoughts_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^final\s+thoughts\b").expect("invalid final thoughts regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::extract_chapter_headings;

    const OUTLINE: &str = "\
# Beginner Yoga: Your Guide to Real Change

## Core Transformation Summary
From stiff and stressed to calm and flexible.

Chapter 1: Understanding the Fundamentals
Goal: Learn the basics.

**Chapter 2: Building Your Daily Routine**
1.1 A decorative sub-point
- **Goal:** Build a ten minute routine.

Final Thoughts
Goal: Keep practicing.
";

    #[test]
    fn parses_chapters_and_closing_block() {
        let outline = parse_outline(OUTLINE).unwrap();
        assert_eq!(outline.title, "Beginner Yoga");
        assert_eq!(outline.subtitle.as_deref(), Some("Your Guide to Real Change"));
        assert_eq!(outline.summary, "From stiff and stressed to calm and flexible.");
        assert_eq!(outline.chapters.len(), 2);
        assert_eq!(outline.chapters[1].title, "Building Your Daily Routine");
        assert_eq!(outline.chapters[1].goal, "Build a ten minute routine.");
        assert_eq!(outline.final_thoughts.as_deref(), Some("Keep practicing."));
        assert!(outline.validate(2).is_ok());
        assert!(matches!(outline.validate(5), Err(ParseError::Outline(_))));
    }

    #[test]
    fn chapter_without_goal_is_rejected() {
        let text = "# Book\nChapter 1: One\nChapter 2: Two\nGoal: something\n";
        let err = parse_outline(text).unwrap_err();
        assert!(err.to_string().contains("chapter 1"));
    }

    #[test]
    fn goal_does_not_leak_across_chapters() {
        let text = "# Book\nChapter 1: One\nGoal: first\nChapter 2: Two\nFinal Thoughts\nGoal: end\n";
        assert!(parse_outline(text).is_err());
    }

    #[test]
    fn numbered_subsection_titles_are_not_chapters() {
        let text = "# Book\nChapter 1: One\nGoal: a\nChapter 2: 2.1 Breathing\nGoal: b\n";
        let outline = parse_outline(text).unwrap();
        assert_eq!(outline.chapters.len(), 1);
        assert_eq!(outline.chapters[0].title, "One");
        assert!(extract_chapter_headings(text)
            .iter()
            .all(|heading| heading.number == 1));
    }

    #[test]
    fn chapters_must_be_consecutive() {
        let text = "# Book\nChapter 1: One\nGoal: a\nChapter 3: Three\nGoal: c\n";
        assert!(matches!(parse_outline(text), Err(ParseError::Outline(_))));
    }

    #[test]
    fn long_titles_fail_validation() {
        let text = "# One Two Three Four Five Six Seven: Eight Nine Ten Eleven Twelve Thirteen\nChapter 1: A\nGoal: b\n";
        let outline = parse_outline(text).unwrap();
        assert_eq!(outline.title_words(), 13);
        assert!(outline.validate(1).is_err());
    }
}
