use std::collections::BTreeMap;

use super::{strip_markup, ParseError};

pub type Record = BTreeMap<String, String>;

/// Reads a fixed-key record from either a JSON object or `Key: value` lines.
/// Keys are normalised to snake_case; every key in `required` must be present
/// and non-empty.
pub fn parse_record(text: &str, required: &[&str]) -> Result<Record, ParseError> {
    let record = parse_json(text).unwrap_or_else(|| parse_lines(text));
    for field in required {
        match record.get(*field) {
            Some(value) if !value.trim().is_empty() => {}
            _ => {
                return Err(ParseError::Record {
                    field: (*field).to_string(),
                })
            }
        }
    }
    Ok(record)
}

fn normalize_key(key: &str) -> String {
    strip_markup(key)
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_json(text: &str) -> Option<Record> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&text[start..=end]).ok()?;
    let object = value.as_object()?;
    Some(
        object
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    serde_json::Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                (normalize_key(key), text.trim().to_string())
            })
            .collect(),
    )
}

fn parse_lines(text: &str) -> Record {
    let mut record = Record::new();
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*', '•']).trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = normalize_key(key);
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches(['*', '_']).trim();
        record.entry(key).or_insert_with(|| value.to_string());
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: [&str; 3] = ["visual_motif", "emotional_tone", "image_prompt"];

    #[test]
    fn reads_labelled_lines() {
        let text = "**Visual Motif:** flowing lines\n- Emotional Tone: calm\nImage Prompt: soft gradient: warm light\n";
        let record = parse_record(text, &KEYS).unwrap();
        assert_eq!(record["visual_motif"], "flowing lines");
        assert_eq!(record["emotional_tone"], "calm");
        assert_eq!(record["image_prompt"], "soft gradient: warm light");
    }

    #[test]
    fn reads_json_objects() {
        let text = "```json\n{\"Visual Motif\": \"waves\", \"emotional-tone\": \"hopeful\", \"image_prompt\": \"sea\"}\n```";
        let record = parse_record(text, &KEYS).unwrap();
        assert_eq!(record["emotional_tone"], "hopeful");
    }

    #[test]
    fn missing_key_names_the_field() {
        let err = parse_record("Visual Motif: x\nImage Prompt: y\n", &KEYS).unwrap_err();
        assert_eq!(
            err,
            ParseError::Record {
                field: "emotional_tone".to_string()
            }
        );
    }
}
