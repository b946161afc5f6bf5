use super::{strip_markup, ParseError};

pub const CHAPTER_SUBSECTIONS: [&str; 6] = [
    "Introduction",
    "Core Concepts",
    "Practical Steps",
    "Interactive Element",
    "Common Pitfalls",
    "Key Takeaways",
];

const RENDERED_TEXT_PHRASES: [&str; 4] = ["title text", "typography", "lettering", "text that reads"];

/// Subsections of a chapter draft that have no heading line.
pub fn missing_subsections(text: &str) -> Vec<&'static str> {
    let headings: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('#') || line.starts_with("**"))
        .map(|line| strip_markup(line).to_ascii_lowercase())
        .collect();
    CHAPTER_SUBSECTIONS
        .iter()
        .copied()
        .filter(|name| {
            let name = name.to_ascii_lowercase();
            !headings.iter().any(|heading| heading.contains(&name))
        })
        .collect()
}

/// True when some line starts with "Call to Action", ignoring case and markdown markers.
pub fn has_call_to_action(text: &str) -> bool {
    text.lines().any(|line| {
        strip_markup(line)
            .to_ascii_lowercase()
            .starts_with("call to action")
    })
}

/// Trims a single-prompt answer: fences, quotes and a leading `Prompt:` label.
pub fn clean_prompt_text(text: &str) -> String {
    let body = text
        .trim()
        .trim_start_matches("```text")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let body = strip_markup(body);
    let body = match body.split_once(':') {
        Some((label, rest)) if label.trim().eq_ignore_ascii_case("prompt") => rest.trim(),
        _ => body,
    };
    body.trim_matches(['"', '\'']).trim().to_string()
}

/// Rejects cover prompts that are empty, name the book or ask for rendered text.
/// Returns advisory warnings otherwise.
pub fn check_cover_prompt(prompt: &str, book_title: &str) -> Result<Vec<String>, ParseError> {
    if prompt.trim().is_empty() {
        return Err(ParseError::Content("cover prompt is empty".to_string()));
    }
    let lowered = prompt.to_lowercase();
    let full_title = book_title.trim().to_lowercase();
    let main_title = full_title
        .split(':')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    for title in [&full_title, &main_title] {
        if title.split_whitespace().count() >= 2 && lowered.contains(title.as_str()) {
            return Err(ParseError::Content(format!(
                "cover prompt contains the book title `{title}`"
            )));
        }
    }
    if let Some(phrase) = RENDERED_TEXT_PHRASES
        .iter()
        .find(|phrase| lowered.contains(*phrase))
    {
        return Err(ParseError::Content(format!(
            "cover prompt requests rendered text (`{phrase}`)"
        )));
    }

    let mut warnings = Vec::new();
    let sentences = prompt
        .split(['.', '!', '?'])
        .filter(|sentence| !sentence.trim().is_empty())
        .count();
    if sentences > 2 {
        warnings.push(format!("cover prompt has {sentences} sentences, expected 1-2"));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_missing_subsections() {
        let text = "## Introduction\ntext\n## Core Concepts\n**Practical Steps**\n## Key Takeaways\n";
        assert_eq!(
            missing_subsections(text),
            vec!["Interactive Element", "Common Pitfalls"]
        );
    }

    #[test]
    fn call_to_action_tolerates_markup() {
        assert!(has_call_to_action("body\n\n**Call to Action:** try it"));
        assert!(has_call_to_action("## CALL TO ACTION\nDo it."));
        assert!(!has_call_to_action("Take action now."));
    }

    #[test]
    fn cleans_single_prompt_answers() {
        assert_eq!(clean_prompt_text("Prompt: \"soft light\""), "soft light");
        assert_eq!(clean_prompt_text("```\nmisty hills\n```"), "misty hills");
    }

    #[test]
    fn cover_prompt_rules() {
        let title = "Beginner Yoga: Your Guide to Real Change";
        assert!(check_cover_prompt("A calm sunrise. Soft light.", title)
            .unwrap()
            .is_empty());
        assert!(check_cover_prompt("Cover for Beginner Yoga with a sunrise.", title).is_err());
        assert!(check_cover_prompt("A sunrise with bold typography.", title).is_err());
        assert!(check_cover_prompt("  ", title).is_err());
        let warnings = check_cover_prompt("One. Two. Three.", title).unwrap();
        assert_eq!(warnings.len(), 1);
    }
}
