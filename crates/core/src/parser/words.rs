use serde::{Deserialize, Serialize};

use crate::template::WordRange;

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Outcome of comparing a section's length with its budget. Never an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WordCountCheck {
    pub words: usize,
    pub range: WordRange,
}

impl WordCountCheck {
    pub fn new(text: &str, range: WordRange) -> Self {
        Self {
            words: count_words(text),
            range,
        }
    }

    pub fn within_range(&self) -> bool {
        self.range.contains(self.words)
    }

    pub fn warning(&self, section: &str) -> Option<String> {
        if self.within_range() {
            return None;
        }
        Some(format!(
            "{section} has {} words, expected {}",
            self.words, self.range
        ))
    }
}
