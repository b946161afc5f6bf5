use ebook_core::ProviderKind;
use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+[a-z]*$").unwrap());

/// Appends `/v1` unless the URL already names an API version.
/// A trailing `#` opts out and is stripped.
pub fn check_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if trimmed.ends_with('#') {
        return trimmed.trim_end_matches('#').to_string();
    }

    let without_slash = trimmed.trim_end_matches('/');
    if VERSION_SUFFIX_RE.is_match(without_slash) || without_slash.contains("/v1") {
        without_slash.to_string()
    } else {
        format!("{}/v1", without_slash)
    }
}

/// Where each hosted backend lives when the profile does not override it.
pub fn default_base_url(provider: ProviderKind) -> Option<&'static str> {
    match provider {
        ProviderKind::Anthropic => Some("https://api.anthropic.com/v1"),
        ProviderKind::Openai => Some("https://api.openai.com/v1"),
        ProviderKind::Openrouter => Some("https://openrouter.ai/api/v1"),
        ProviderKind::Groq => Some("https://api.groq.com/openai/v1"),
        ProviderKind::Gemini => Some("https://generativelanguage.googleapis.com/v1beta"),
        ProviderKind::Custom | ProviderKind::Mock => None,
    }
}

pub(crate) fn resolve_base_url(configured: Option<String>, provider: ProviderKind) -> Option<String> {
    configured
        .or_else(|| default_base_url(provider).map(str::to_string))
        .map(|url| check_base_url(&url))
        .filter(|url| !url.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_base_url_appends_v1_when_missing() {
        assert_eq!(
            check_base_url("https://example.com"),
            "https://example.com/v1"
        );
        assert_eq!(
            check_base_url("https://example.com/"),
            "https://example.com/v1"
        );
    }

    #[test]
    fn check_base_url_keeps_existing_version() {
        assert_eq!(
            check_base_url("https://example.com/v2"),
            "https://example.com/v2"
        );
        assert_eq!(
            check_base_url("https://generativelanguage.googleapis.com/v1beta/"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
    }

    #[test]
    fn check_base_url_respects_hash_suffix() {
        assert_eq!(
            check_base_url("https://example.com/#"),
            "https://example.com/"
        );
    }

    #[test]
    fn custom_provider_has_no_default() {
        assert_eq!(resolve_base_url(None, ProviderKind::Custom), None);
        assert_eq!(
            resolve_base_url(Some("http://localhost:11434".into()), ProviderKind::Custom),
            Some("http://localhost:11434/v1".to_string())
        );
        assert_eq!(
            resolve_base_url(None, ProviderKind::Groq),
            Some("https://api.groq.com/openai/v1".to_string())
        );
    }
}
