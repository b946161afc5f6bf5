use serde::{Deserialize, Serialize};

use super::headings::{chapter_marker, clean_title};
use super::outline::Outline;
use super::{strip_markup, ParseError};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TocEntry {
    pub number: u32,
    pub title: String,
    pub subtitle: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableOfContents {
    pub entries: Vec<TocEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_thoughts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonus: Option<String>,
}

impl TableOfContents {
    /// One entry per outline chapter, numbered the same way and in the same order.
    pub fn validate_against(&self, outline: &Outline) -> Result<(), ParseError> {
        if self.entries.len() != outline.chapters.len() {
            return Err(ParseError::TableOfContents(format!(
                "{} entries for {} outline chapters",
                self.entries.len(),
                outline.chapters.len()
            )));
        }
        for (entry, chapter) in self.entries.iter().zip(&outline.chapters) {
            if entry.number != chapter.number {
                return Err(ParseError::TableOfContents(format!(
                    "entry {} appears where chapter {} belongs",
                    entry.number, chapter.number
                )));
            }
        }
        Ok(())
    }

    /// Numbered list used in the compiled book.
    pub fn render(&self) -> String {
        let mut out = String::from("## Table of Contents\n\n");
        for entry in &self.entries {
            out.push_str(&format!("{}. {}", entry.number, entry.title));
            if !entry.subtitle.is_empty() {
                out.push_str(&format!(" — {}", entry.subtitle));
            }
            out.push('\n');
        }
        let closing = self.entries.len() + 1;
        match &self.final_thoughts {
            Some(subtitle) if !subtitle.is_empty() => {
                out.push_str(&format!("{closing}. Final Thoughts — {subtitle}\n"))
            }
            _ => out.push_str(&format!("{closing}. Final Thoughts\n")),
        }
        if let Some(bonus) = &self.bonus {
            out.push_str(&format!("\n*{bonus}*\n"));
        }
        out
    }
}

enum Line<'a> {
    Chapter(u32, String),
    FinalThoughts,
    Bonus(&'a str),
    Text(&'a str),
    Blank,
}

fn classify(line: &str) -> Line<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Line::Blank;
    }
    if let Some((number, title)) = chapter_marker(trimmed) {
        return Line::Chapter(number, title);
    }
    let stripped = strip_markup(trimmed);
    let lowered = stripped.to_ascii_lowercase();
    if lowered.starts_with("final thoughts") {
        return Line::FinalThoughts;
    }
    if lowered.starts_with("bonus") {
        return Line::Bonus(stripped);
    }
    Line::Text(stripped)
}

fn split_inline_subtitle(title: &str) -> (String, Option<String>) {
    for separator in [" — ", " – ", " - "] {
        if let Some((title, subtitle)) = title.split_once(separator) {
            return (clean_title(title), Some(clean_title(subtitle)));
        }
    }
    (title.to_string(), None)
}

pub fn parse_table_of_contents(text: &str) -> Result<TableOfContents, ParseError> {
    let lines: Vec<Line<'_>> = text.lines().map(classify).collect();
    let mut entries = Vec::new();
    let mut final_thoughts = None;
    let mut bonus = None;

    let next_text = |from: usize| -> Option<String> {
        lines[from..]
            .iter()
            .find(|line| !matches!(line, Line::Blank))
            .and_then(|line| match line {
                Line::Text(text) => Some(text.to_string()),
                _ => None,
            })
    };

    for (index, line) in lines.iter().enumerate() {
        match line {
            Line::Chapter(number, title) => {
                let (title, inline) = split_inline_subtitle(title);
                let subtitle = inline.or_else(|| next_text(index + 1)).unwrap_or_default();
                entries.push(TocEntry {
                    number: *number,
                    title,
                    subtitle,
                });
            }
            Line::FinalThoughts => {
                final_thoughts = Some(next_text(index + 1).unwrap_or_default());
            }
            Line::Bonus(text) => bonus = Some(text.to_string()),
            Line::Text(_) | Line::Blank => {}
        }
    }

    if entries.is_empty() {
        return Err(ParseError::TableOfContents(
            "no `Chapter <n>: <title>` entries found".to_string(),
        ));
    }
    Ok(TableOfContents {
        entries,
        final_thoughts,
        bonus,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_outline;

    const TOC: &str = "\
Chapter 1: Fundamentals First
Learn what matters before you begin.

Chapter 2: Routine Blueprint — Design a schedule you can keep.

Final Thoughts
Carry the momentum forward.
Bonus: Printable checklist.
";

    #[test]
    fn parses_entries_closing_and_bonus() {
        let toc = parse_table_of_contents(TOC).unwrap();
        assert_eq!(toc.entries.len(), 2);
        assert_eq!(toc.entries[0].subtitle, "Learn what matters before you begin.");
        assert_eq!(toc.entries[1].title, "Routine Blueprint");
        assert_eq!(toc.entries[1].subtitle, "Design a schedule you can keep.");
        assert_eq!(toc.final_thoughts.as_deref(), Some("Carry the momentum forward."));
        assert_eq!(toc.bonus.as_deref(), Some("Bonus: Printable checklist."));
    }

    #[test]
    fn order_must_follow_outline() {
        let outline =
            parse_outline("# Book\nChapter 1: A\nGoal: a\nChapter 2: B\nGoal: b\n").unwrap();
        let toc = parse_table_of_contents(TOC).unwrap();
        assert!(toc.validate_against(&outline).is_ok());

        let swapped = parse_table_of_contents("Chapter 2: B\nx\nChapter 1: A\ny\n").unwrap();
        assert!(swapped.validate_against(&outline).is_err());
    }

    #[test]
    fn renders_numbered_list() {
        let rendered = parse_table_of_contents(TOC).unwrap().render();
        assert!(rendered.contains("1. Fundamentals First — Learn what matters before you begin.\n"));
        assert!(rendered.contains("3. Final Thoughts — Carry the momentum forward.\n"));
        assert!(rendered.contains("*Bonus: Printable checklist.*"));
    }
}
