use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::prompts::PromptArguments;

/// Relative deviation from a chapter target that still counts as on-budget.
pub const CHAPTER_TOLERANCE: f64 = 0.10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WordRange {
    pub min: usize,
    pub max: usize,
}

impl WordRange {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Range of `target` plus or minus `tolerance` (a fraction), rounded outward.
    pub fn around(target: usize, tolerance: f64) -> Self {
        let delta = (target as f64 * tolerance).round() as usize;
        Self {
            min: target.saturating_sub(delta),
            max: target + delta,
        }
    }

    pub fn contains(&self, words: usize) -> bool {
        (self.min..=self.max).contains(&words)
    }

    pub fn midpoint(&self) -> usize {
        (self.min + self.max) / 2
    }
}

impl fmt::Display for WordRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Introduction,
    Chapter,
    FinalThoughts,
    Review,
}

impl SectionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Introduction => "Introduction",
            Self::Chapter => "Chapter",
            Self::FinalThoughts => "Final Thoughts",
            Self::Review => "Review",
        }
    }
}

/// Word-count and structure budget of a book, chosen once per run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookTemplate {
    #[default]
    Standard,
    Quickstart,
    Deepdive,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TemplateBudget {
    pub introduction: WordRange,
    pub chapter_count: usize,
    pub chapter_words: usize,
    pub final_thoughts: WordRange,
    pub review: WordRange,
}

impl BookTemplate {
    pub const ALL: [BookTemplate; 3] = [Self::Standard, Self::Quickstart, Self::Deepdive];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Quickstart => "quickstart",
            Self::Deepdive => "deepdive",
        }
    }

    pub fn budget(&self) -> TemplateBudget {
        match self {
            Self::Standard => TemplateBudget {
                introduction: WordRange::new(600, 900),
                chapter_count: 5,
                chapter_words: 1200,
                final_thoughts: WordRange::new(600, 900),
                review: WordRange::new(300, 500),
            },
            Self::Quickstart => TemplateBudget {
                introduction: WordRange::new(300, 500),
                chapter_count: 3,
                chapter_words: 800,
                final_thoughts: WordRange::new(300, 500),
                review: WordRange::new(150, 250),
            },
            Self::Deepdive => TemplateBudget {
                introduction: WordRange::new(800, 1200),
                chapter_count: 8,
                chapter_words: 2000,
                final_thoughts: WordRange::new(800, 1200),
                review: WordRange::new(400, 700),
            },
        }
    }

    pub fn chapter_count(&self) -> usize {
        self.budget().chapter_count
    }

    pub fn range(&self, section: SectionKind) -> WordRange {
        let budget = self.budget();
        match section {
            SectionKind::Introduction => budget.introduction,
            SectionKind::Chapter => WordRange::around(budget.chapter_words, CHAPTER_TOLERANCE),
            SectionKind::FinalThoughts => budget.final_thoughts,
            SectionKind::Review => budget.review,
        }
    }

    /// Word-budget placeholders shared by every prompt that depends on the template.
    /// The template's chapter length replaces the parameter set's own value.
    pub fn bindings(&self) -> PromptArguments {
        let budget = self.budget();
        let chapter = self.range(SectionKind::Chapter);
        PromptArguments::from([
            ("chapter_count".to_string(), budget.chapter_count.to_string()),
            ("chapter_length".to_string(), budget.chapter_words.to_string()),
            ("chapter_min_words".to_string(), chapter.min.to_string()),
            ("chapter_max_words".to_string(), chapter.max.to_string()),
        ])
    }

    /// `min_words`/`max_words` bindings for one compiled section.
    pub fn section_bindings(&self, section: SectionKind) -> PromptArguments {
        let range = self.range(section);
        PromptArguments::from([
            ("min_words".to_string(), range.min.to_string()),
            ("max_words".to_string(), range.max.to_string()),
        ])
    }
}

impl fmt::Display for BookTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
#[error("unknown book template `{0}` (expected standard, quickstart or deepdive)")]
pub struct UnknownTemplate(pub String);

impl FromStr for BookTemplate {
    type Err = UnknownTemplate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        Self::ALL
            .into_iter()
            .find(|template| template.name() == normalized)
            .ok_or_else(|| UnknownTemplate(s.to_string()))
    }
}
