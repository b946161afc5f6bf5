use regex::Regex;
use std::sync::OnceLock;

use super::ParseError;

pub const QUERY_COUNT: usize = 5;
const MAX_QUERY_WORDS: usize = 4;

/// Exactly five one-to-four word queries, list markers and quotes removed.
pub fn parse_queries(text: &str) -> Result<Vec<String>, ParseError> {
    let queries: Vec<String> = text
        .lines()
        .map(|line| {
            let line = marker_regex().replace(line.trim(), "");
            line.trim().trim_matches(['"', '\'', '`']).trim().to_string()
        })
        .filter(|line| !line.is_empty())
        .collect();

    if queries.len() != QUERY_COUNT {
        return Err(ParseError::Queries(format!(
            "expected {QUERY_COUNT} lines, found {}",
            queries.len()
        )));
    }
    for query in &queries {
        let words = query.split_whitespace().count();
        if !(1..=MAX_QUERY_WORDS).contains(&words) {
            return Err(ParseError::Queries(format!(
                "`{query}` has {words} words, expected 1-{MAX_QUERY_WORDS}"
            )));
        }
        if let Some(bad) = query
            .chars()
            .find(|c| !(c.is_alphanumeric() || c.is_whitespace() || *c == '\'' || *c == '-'))
        {
            return Err(ParseError::Queries(format!(
                "`{query}` contains the special character `{bad}`"
            )));
        }
    }
    Ok(queries)
}

fn marker_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?:\d+[.)]\s*|[-*•]\s*)").expect("invalid list marker regex")
    })
}
