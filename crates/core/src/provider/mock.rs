use async_trait::async_trait;
use futures_util::stream;

use super::{GenerationOptions, LanguageModel, LanguageModelError, TextStream};

const CONTENT_START: &str = "--- BEGIN CONTENT ---";
const CONTENT_END: &str = "--- END CONTENT ---";

const CHAPTER_TITLES: [&str; 8] = [
    "Understanding the Fundamentals",
    "Building Your Daily Routine",
    "Mastering Core Techniques",
    "Overcoming Common Obstacles",
    "Tracking Progress and Results",
    "Deepening Your Practice",
    "Creating Lasting Habits",
    "Advanced Strategies for Growth",
];

const SHORT_TITLES: [(&str, &str); 8] = [
    ("Fundamentals First", "Learn what matters before you begin."),
    ("Routine Blueprint", "Design a schedule you can keep."),
    ("Technique Toolkit", "Practice the moves that carry the most weight."),
    ("Obstacle Breakthrough", "Turn setbacks into fuel."),
    ("Progress Compass", "Measure what counts and adjust with confidence."),
    ("Practice Deepening", "Go further once the basics feel easy."),
    ("Habit Engine", "Make the good choice the automatic one."),
    ("Growth Playbook", "Plan the next stage of the journey."),
];

const SUBSECTIONS: [&str; 6] = [
    "Introduction",
    "Core Concepts",
    "Practical Steps",
    "Interactive Element",
    "Common Pitfalls",
    "Key Takeaways",
];

const ELEMENT_TYPES: [&str; 5] = [
    "Printable Tracker",
    "Guided Journal Page",
    "Progress Checklist",
    "Habit Worksheet",
    "Milestone Calendar",
];

const FILLER: [&str; 6] = [
    "Small consistent steps make {topic} feel natural instead of forced.",
    "Notice how your body and mind respond, then adjust the pace to match your energy.",
    "Write down one observation after every session so patterns become visible over time.",
    "Progress rarely looks dramatic from one day to the next, yet the weeks add up quickly.",
    "Keep the setup simple, remove friction, and let curiosity guide the next experiment.",
    "Celebrate the effort itself because showing up is the skill that everything else rests on.",
];

/// Deterministic offline model.
///
/// Recognises the `Task:` marker of every built-in prompt and answers with text
/// that satisfies the corresponding parser. Needs no credentials and never fails.
#[derive(Clone, Debug)]
pub struct MockLanguageModel {
    streaming: bool,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self { streaming: true }
    }

    /// A mock that reports streaming as unsupported, for exercising the fallback path.
    pub fn without_streaming() -> Self {
        Self { streaming: false }
    }

    pub fn respond(&self, prompt: &str) -> String {
        let view = PromptView::parse(prompt);
        match view.task() {
            "parameters" => parameters(&view),
            "seo_queries" => seo_queries(&view),
            "outline" => outline(&view),
            "table_of_contents" => table_of_contents(&view),
            "chapter_draft" => chapter_draft(&view),
            "chapter_optimize" => chapter_optimize(&view),
            "cover_prompt" => cover_prompt(&view),
            "interactive_element" => interactive_element(&view),
            "diagram_prompt" => diagram_prompt(&view),
            "background_visual" => background_visual(&view),
            "introduction" | "final_thoughts" | "review" => section(&view),
            _ => "Mock response.".to_string(),
        }
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<String, LanguageModelError> {
        Ok(self.respond(prompt))
    }

    async fn stream(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<TextStream, LanguageModelError> {
        if !self.streaming {
            return Err(LanguageModelError::unsupported("mock streaming disabled"));
        }
        let text = self.respond(prompt);
        let chunks: Vec<Result<String, LanguageModelError>> = text
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

struct PromptView<'a> {
    fields: Vec<(&'a str, &'a str)>,
    content: &'a str,
}

impl<'a> PromptView<'a> {
    fn parse(prompt: &'a str) -> Self {
        let (header, content) = match prompt.split_once(CONTENT_START) {
            Some((header, rest)) => {
                let body = rest.split(CONTENT_END).next().unwrap_or(rest);
                (header, body.trim())
            }
            None => (prompt, ""),
        };
        let fields = header
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect();
        Self { fields, content }
    }

    fn field(&self, key: &str) -> Option<&'a str> {
        self.fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| *value)
            .filter(|value| !value.is_empty())
    }

    fn task(&self) -> &'a str {
        self.field("Task").unwrap_or("")
    }

    fn topic(&self) -> &'a str {
        self.field("Given Topic")
            .or_else(|| self.field("Topic"))
            .unwrap_or("personal growth")
    }

    fn number(&self, key: &str) -> Option<usize> {
        self.field(key).and_then(|value| value.parse().ok())
    }

    fn word_range(&self) -> Option<(usize, usize)> {
        let (low, high) = self.field("Word Range")?.split_once('-')?;
        Some((low.trim().parse().ok()?, high.trim().parse().ok()?))
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn filler(topic: &str, words: usize) -> String {
    let topic = topic.to_lowercase();
    let tokens: Vec<String> = FILLER
        .iter()
        .flat_map(|sentence| {
            sentence
                .replace("{topic}", &topic)
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect();
    if tokens.is_empty() || words == 0 {
        return String::new();
    }
    tokens
        .iter()
        .cycle()
        .take(words)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

fn chapter_title(index: usize) -> String {
    let base = CHAPTER_TITLES[(index - 1) % CHAPTER_TITLES.len()];
    match (index - 1) / CHAPTER_TITLES.len() {
        0 => base.to_string(),
        round => format!("{base} Level {}", round + 1),
    }
}

fn parameters(view: &PromptView<'_>) -> String {
    let topic = view.topic().replace('"', "'");
    let keyword = topic.to_lowercase();
    format!(
        "```yaml\n\
         topic: \"{topic}\"\n\
         main_keyword: \"{keyword}\"\n\
         theme: \"Practical transformation through small daily wins\"\n\
         target_audience: \"Busy adults aged 25-45 who want steady progress without overwhelm\"\n\
         tone: \"supportive\"\n\
         mood: \"motivational\"\n\
         distribution_platform: \"Amazon KDP\"\n\
         primary_format: \"PDF\"\n\
         chapter_length: 2000\n\
         interactive_elements_included: \"Printable Tracker, Progress Checklist, Habit Worksheet\"\n\
         ```\n"
    )
}

fn seo_queries(view: &PromptView<'_>) -> String {
    let keyword: String = view
        .field("Main Keyword")
        .unwrap_or_else(|| view.topic())
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    let mut words: Vec<&str> = keyword.split_whitespace().take(2).collect();
    if words.is_empty() {
        words.push("wellness");
    }
    let keyword = words.join(" ");
    [
        keyword.clone(),
        format!("{keyword} guide"),
        format!("{keyword} tips"),
        format!("how to {keyword}"),
        format!("{keyword} for beginners"),
    ]
    .join("\n")
}

fn outline(view: &PromptView<'_>) -> String {
    let count = view.number("Chapter Count").unwrap_or(5).max(1);
    let topic = view.topic();
    let short_topic: Vec<&str> = topic.split_whitespace().take(5).collect();
    let mut out = format!(
        "# {}: Your Guide to Real Change\n\n## Core Transformation Summary\n\
         The reader moves from scattered attempts at {} to a calm, repeatable practice that fits everyday life.\n\n",
        title_case(&short_topic.join(" ")),
        topic.to_lowercase()
    );
    for index in 1..=count {
        out.push_str(&format!(
            "Chapter {index}: {}\nGoal: Give the reader one dependable win to build on in step {index}.\n\n",
            chapter_title(index)
        ));
    }
    out.push_str("Final Thoughts\nGoal: Leave the reader with a sustainable plan and the confidence to continue.\n");
    out
}

fn table_of_contents(view: &PromptView<'_>) -> String {
    let count = view
        .content
        .lines()
        .filter(|line| {
            let line = line.trim_start();
            line.starts_with("Chapter ")
                && line[8..]
                    .split(':')
                    .next()
                    .is_some_and(|n| n.trim().parse::<usize>().is_ok())
        })
        .count()
        .max(view.number("Chapter Count").unwrap_or(0));
    let mut out = String::new();
    for index in 1..=count {
        let (title, subtitle) = SHORT_TITLES[(index - 1) % SHORT_TITLES.len()];
        out.push_str(&format!("Chapter {index}: {title}\n{subtitle}\n\n"));
    }
    out.push_str("Final Thoughts\nCarry the momentum forward with a plan you can keep.\n\n");
    out.push_str("Bonus: Printable quick-start checklist and a 30-day tracker.\n");
    out
}

fn chapter_draft(view: &PromptView<'_>) -> String {
    let target = view.number("Target Length").unwrap_or(1200);
    let heading_words: usize = SUBSECTIONS
        .iter()
        .map(|title| 1 + title.split_whitespace().count())
        .sum();
    let body_words = target.saturating_sub(heading_words);
    let per_section = body_words / SUBSECTIONS.len();
    let remainder = body_words % SUBSECTIONS.len();

    SUBSECTIONS
        .iter()
        .enumerate()
        .map(|(index, title)| {
            let words = per_section + usize::from(index < remainder);
            format!("## {title}\n\n{}\n", filler(view.topic(), words))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn chapter_optimize(view: &PromptView<'_>) -> String {
    format!(
        "{}\n\nCall to Action: Choose one idea from this chapter and put it into practice today.\n",
        view.content.trim_end()
    )
}

fn cover_prompt(view: &PromptView<'_>) -> String {
    let mood = view.field("Mood").unwrap_or("uplifting").to_lowercase();
    format!(
        "Ultra-realistic cinematic scene of a person greeting the sunrise in a bright open studio, soft golden light and a {mood} atmosphere. High-resolution A4 portrait composition with generous negative space."
    )
}

fn interactive_element(view: &PromptView<'_>) -> String {
    let number = view.number("Chapter Number").unwrap_or(1).max(1);
    let element = ELEMENT_TYPES[(number - 1) % ELEMENT_TYPES.len()];
    format!(
        "Title: Step {number} {element}\n\
         Element Type: {element}\n\
         Purpose: Help the reader apply the chapter's main idea during the week.\n\
         How It Works: The reader fills in one short entry each day and reviews the week on Sunday.\n\
         Visual Style: Clean grid layout with soft pastel accents and generous writing space.\n"
    )
}

fn diagram_prompt(view: &PromptView<'_>) -> String {
    let number = view.number("Chapter Number").unwrap_or(1);
    format!(
        "3D isometric diagram showing the key concept of section {number} as connected stepping stones, calming pastel tones, high-resolution."
    )
}

fn background_visual(view: &PromptView<'_>) -> String {
    let mood = view.field("Mood").unwrap_or("calm").to_lowercase();
    format!(
        "Visual Motif: Gentle flowing lines that suggest steady forward motion\n\
         Emotional Tone: {mood}\n\
         Image Prompt: Soft gradient background with flowing lines and warm light, {mood} feel, ultra-realistic, high-resolution.\n"
    )
}

fn section(view: &PromptView<'_>) -> String {
    let words = view
        .word_range()
        .map(|(low, high)| (low + high) / 2)
        .unwrap_or(300);
    filler(view.topic(), words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn outline_honours_chapter_count() {
        let prompt = "Task: outline\nTopic: beginner yoga\nChapter Count: 3\n";
        let text = MockLanguageModel::new().respond(prompt);
        assert!(text.starts_with("# Beginner Yoga: Your Guide to Real Change"));
        assert!(text.contains("Chapter 3: Mastering Core Techniques"));
        assert!(!text.contains("Chapter 4:"));
        assert!(text.contains("Final Thoughts\nGoal:"));
    }

    #[test]
    fn chapter_draft_hits_target_length_exactly() {
        let prompt = "Task: chapter_draft\nTopic: beginner yoga\nTarget Length: 1200\n";
        let text = MockLanguageModel::new().respond(prompt);
        assert_eq!(text.split_whitespace().count(), 1200);
        for title in SUBSECTIONS {
            assert!(text.contains(&format!("## {title}")));
        }
    }

    #[test]
    fn content_block_is_isolated_from_header_fields() {
        let prompt = format!(
            "Task: chapter_optimize\nChapter Number: 2\n{CONTENT_START}\nTask: ignored\nbody text\n{CONTENT_END}\n"
        );
        let text = MockLanguageModel::new().respond(&prompt);
        assert!(text.starts_with("Task: ignored\nbody text"));
        assert!(text.contains("Call to Action:"));
    }

    #[test]
    fn unknown_task_still_answers() {
        assert_eq!(MockLanguageModel::new().respond("hello"), "Mock response.");
    }

    #[tokio::test]
    async fn stream_reassembles_to_completion() {
        let model = MockLanguageModel::new();
        let prompt = "Task: review\nTopic: yoga\nWord Range: 10-20\n";
        let options = GenerationOptions::default();
        let full = model.complete(prompt, &options).await.unwrap();
        let chunks: Vec<String> = model
            .stream(prompt, &options)
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), full);
        assert_eq!(full.split_whitespace().count(), 15);
    }

    #[tokio::test]
    async fn streaming_can_be_disabled() {
        let err = MockLanguageModel::without_streaming()
            .stream("Task: review", &GenerationOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.kind(),
            crate::provider::LanguageModelErrorKind::UnsupportedCapability
        );
    }
}
