use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The ten generation steps. Stage 0 produces the parameter set; stages 1–9 write the book.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Parameters,
    SeoQueries,
    Outline,
    TableOfContents,
    ChapterDraft,
    ChapterOptimize,
    Cover,
    InteractiveElements,
    Diagrams,
    Backgrounds,
}

impl StageId {
    pub const ALL: [StageId; 10] = [
        Self::Parameters,
        Self::SeoQueries,
        Self::Outline,
        Self::TableOfContents,
        Self::ChapterDraft,
        Self::ChapterOptimize,
        Self::Cover,
        Self::InteractiveElements,
        Self::Diagrams,
        Self::Backgrounds,
    ];

    /// Stages that run concurrently once every chapter is optimized.
    pub const FAN_OUT: [StageId; 4] = [
        Self::Cover,
        Self::InteractiveElements,
        Self::Diagrams,
        Self::Backgrounds,
    ];

    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Parameters => 0,
            Self::SeoQueries => 1,
            Self::Outline => 2,
            Self::TableOfContents => 3,
            Self::ChapterDraft => 4,
            Self::ChapterOptimize => 5,
            Self::Cover => 6,
            Self::InteractiveElements => 7,
            Self::Diagrams => 8,
            Self::Backgrounds => 9,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Parameters => "Parameters",
            Self::SeoQueries => "SEO Queries",
            Self::Outline => "Outline",
            Self::TableOfContents => "Table of Contents",
            Self::ChapterDraft => "Chapter Draft",
            Self::ChapterOptimize => "Chapter Optimization",
            Self::Cover => "Cover Prompt",
            Self::InteractiveElements => "Interactive Elements",
            Self::Diagrams => "Diagram Prompts",
            Self::Backgrounds => "Background Visuals",
        }
    }

    pub fn definition(&self) -> &'static StageDefinition {
        &DEFINITIONS[self.ordinal() as usize]
    }

    pub fn dependencies(&self) -> &'static [StageId] {
        self.definition().dependencies
    }

    pub fn is_per_chapter(&self) -> bool {
        matches!(self.definition().mode, ExecutionMode::PerChapter)
    }

    /// File name of this stage's artifact. Per-chapter stages need `chapter`.
    pub fn artifact_name(&self, chapter: Option<u32>) -> String {
        let n = chapter.unwrap_or_default();
        match self {
            Self::Parameters => "stage_0_parameters.yaml".to_string(),
            Self::SeoQueries => "stage_1_queries.txt".to_string(),
            Self::Outline => "stage_2_outline.md".to_string(),
            Self::TableOfContents => "stage_3_toc.md".to_string(),
            Self::ChapterDraft => format!("stage_4_chapter_{n}.md"),
            Self::ChapterOptimize => format!("stage_5_optimized_chapter_{n}.md"),
            Self::Cover => "stage_6_cover_prompt.txt".to_string(),
            Self::InteractiveElements => "stage_7_interactive_elements.json".to_string(),
            Self::Diagrams => "stage_8_diagram_prompts.json".to_string(),
            Self::Backgrounds => "stage_9_background_prompts.json".to_string(),
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.ordinal(), self.label())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    ParameterSet,
    QueryList,
    Outline,
    TableOfContents,
    ChapterText,
    PromptText,
    /// One fixed-key record per chapter.
    ChapterRecords,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Runs once, strictly after its dependencies.
    Sequential,
    /// Runs once per outline chapter; chapters may overlap each other.
    PerChapter,
    /// Runs once alongside its fan-out siblings.
    Concurrent,
}

/// A value a stage reads before rendering its prompt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Binding {
    Parameter(&'static str),
    Stage(StageId),
    /// Word budgets and chapter count from the book template.
    Template,
    /// Number, title and goal of the chapter being processed.
    Chapter,
}

pub const TEMPLATE_ARGUMENTS: [&str; 4] = [
    "chapter_count",
    "chapter_length",
    "chapter_min_words",
    "chapter_max_words",
];

pub const CHAPTER_ARGUMENTS: [&str; 3] = ["chapter_number", "chapter_title", "chapter_goal"];

impl Binding {
    /// Prompt placeholders this binding fills.
    pub fn argument_names(&self) -> &[&'static str] {
        match self {
            Self::Parameter(name) => std::slice::from_ref(name),
            Self::Stage(StageId::SeoQueries) => &["seo_queries"],
            Self::Stage(StageId::Outline) => &["outline", "book_title"],
            Self::Stage(StageId::ChapterDraft | StageId::ChapterOptimize) => &["content"],
            Self::Stage(_) => &[],
            Self::Template => &TEMPLATE_ARGUMENTS,
            Self::Chapter => &CHAPTER_ARGUMENTS,
        }
    }
}

#[derive(Debug)]
pub struct StageDefinition {
    pub id: StageId,
    pub prompt_key: &'static str,
    pub inputs: &'static [Binding],
    pub dependencies: &'static [StageId],
    pub output: OutputShape,
    pub mode: ExecutionMode,
}

impl StageDefinition {
    /// Every placeholder the stage's prompt may use.
    pub fn argument_names(&self) -> BTreeSet<&'static str> {
        self.inputs
            .iter()
            .flat_map(|binding| binding.argument_names().iter().copied())
            .collect()
    }
}

/// Consecutive stages sharing an execution mode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Phase {
    pub mode: ExecutionMode,
    pub stages: Vec<StageId>,
}

/// Stages 1–9 grouped into the phases a run walks through in order.
pub fn phases() -> Vec<Phase> {
    let mut phases: Vec<Phase> = Vec::new();
    for definition in DEFINITIONS.iter().skip(1) {
        match phases.last_mut() {
            Some(phase)
                if phase.mode == definition.mode
                    && definition.mode != ExecutionMode::Sequential =>
            {
                phase.stages.push(definition.id)
            }
            _ => phases.push(Phase {
                mode: definition.mode,
                stages: vec![definition.id],
            }),
        }
    }
    phases
}

static DEFINITIONS: [StageDefinition; 10] = [
    StageDefinition {
        id: StageId::Parameters,
        prompt_key: "parameters",
        inputs: &[Binding::Parameter("topic")],
        dependencies: &[],
        output: OutputShape::ParameterSet,
        mode: ExecutionMode::Sequential,
    },
    StageDefinition {
        id: StageId::SeoQueries,
        prompt_key: "seo_queries",
        inputs: &[
            Binding::Parameter("topic"),
            Binding::Parameter("tone"),
            Binding::Parameter("mood"),
            Binding::Parameter("theme"),
            Binding::Parameter("main_keyword"),
            Binding::Parameter("target_audience"),
            Binding::Parameter("min_search_results"),
        ],
        dependencies: &[StageId::Parameters],
        output: OutputShape::QueryList,
        mode: ExecutionMode::Sequential,
    },
    StageDefinition {
        id: StageId::Outline,
        prompt_key: "outline",
        inputs: &[
            Binding::Parameter("target_audience"),
            Binding::Parameter("primary_format"),
            Binding::Parameter("distribution_platform"),
            Binding::Parameter("mood"),
            Binding::Parameter("topic"),
            Binding::Parameter("theme"),
            Binding::Stage(StageId::SeoQueries),
            Binding::Template,
        ],
        dependencies: &[StageId::SeoQueries],
        output: OutputShape::Outline,
        mode: ExecutionMode::Sequential,
    },
    StageDefinition {
        id: StageId::TableOfContents,
        prompt_key: "table_of_contents",
        inputs: &[Binding::Stage(StageId::Outline), Binding::Template],
        dependencies: &[StageId::Outline],
        output: OutputShape::TableOfContents,
        mode: ExecutionMode::Sequential,
    },
    StageDefinition {
        id: StageId::ChapterDraft,
        prompt_key: "chapter_draft",
        inputs: &[
            Binding::Chapter,
            Binding::Parameter("topic"),
            Binding::Parameter("main_keyword"),
            Binding::Parameter("theme"),
            Binding::Parameter("tone"),
            Binding::Parameter("mood"),
            Binding::Parameter("target_audience"),
            Binding::Parameter("interactive_elements"),
            Binding::Stage(StageId::SeoQueries),
            Binding::Template,
        ],
        dependencies: &[StageId::TableOfContents],
        output: OutputShape::ChapterText,
        mode: ExecutionMode::PerChapter,
    },
    StageDefinition {
        id: StageId::ChapterOptimize,
        prompt_key: "chapter_optimize",
        inputs: &[
            Binding::Chapter,
            Binding::Stage(StageId::ChapterDraft),
            Binding::Parameter("main_keyword"),
            Binding::Parameter("tone"),
            Binding::Template,
        ],
        dependencies: &[StageId::ChapterDraft],
        output: OutputShape::ChapterText,
        mode: ExecutionMode::PerChapter,
    },
    StageDefinition {
        id: StageId::Cover,
        prompt_key: "cover_prompt",
        inputs: &[
            Binding::Stage(StageId::Outline),
            Binding::Stage(StageId::ChapterOptimize),
            Binding::Parameter("topic"),
            Binding::Parameter("theme"),
            Binding::Parameter("mood"),
        ],
        dependencies: &[StageId::ChapterOptimize],
        output: OutputShape::PromptText,
        mode: ExecutionMode::Concurrent,
    },
    StageDefinition {
        id: StageId::InteractiveElements,
        prompt_key: "interactive_element",
        inputs: &[
            Binding::Chapter,
            Binding::Stage(StageId::ChapterOptimize),
            Binding::Parameter("interactive_elements"),
        ],
        dependencies: &[StageId::ChapterOptimize],
        output: OutputShape::ChapterRecords,
        mode: ExecutionMode::Concurrent,
    },
    StageDefinition {
        id: StageId::Diagrams,
        prompt_key: "diagram_prompt",
        inputs: &[Binding::Chapter, Binding::Stage(StageId::ChapterOptimize)],
        dependencies: &[StageId::ChapterOptimize],
        output: OutputShape::ChapterRecords,
        mode: ExecutionMode::Concurrent,
    },
    StageDefinition {
        id: StageId::Backgrounds,
        prompt_key: "background_visual",
        inputs: &[
            Binding::Chapter,
            Binding::Stage(StageId::ChapterOptimize),
            Binding::Parameter("mood"),
        ],
        dependencies: &[StageId::ChapterOptimize],
        output: OutputShape::ChapterRecords,
        mode: ExecutionMode::Concurrent,
    },
];

/// Prompt keys used outside the stage table, for the compiled book's own sections.
pub const SECTION_PROMPT_KEYS: [&str; 3] = ["introduction", "final_thoughts", "review"];

/// Every prompt key a full run renders.
pub fn required_prompt_keys() -> impl Iterator<Item = &'static str> {
    DEFINITIONS
        .iter()
        .map(|definition| definition.prompt_key)
        .chain(SECTION_PROMPT_KEYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_are_indexed_by_ordinal() {
        for stage in StageId::ALL {
            assert_eq!(stage.definition().id, stage);
        }
    }

    #[test]
    fn dependencies_point_backwards() {
        for stage in StageId::ALL {
            for dependency in stage.dependencies() {
                assert!(dependency.ordinal() < stage.ordinal(), "{stage} -> {dependency}");
            }
        }
    }

    #[test]
    fn fan_out_stages_share_one_dependency() {
        for stage in StageId::FAN_OUT {
            assert_eq!(stage.definition().mode, ExecutionMode::Concurrent);
            assert_eq!(stage.dependencies(), &[StageId::ChapterOptimize]);
        }
        assert!(StageId::ChapterDraft.is_per_chapter());
        assert!(!StageId::Outline.is_per_chapter());
    }

    #[test]
    fn stages_group_into_phases_by_mode() {
        let phases = phases();
        let shape: Vec<(ExecutionMode, Vec<StageId>)> = phases
            .into_iter()
            .map(|phase| (phase.mode, phase.stages))
            .collect();
        assert_eq!(
            shape,
            vec![
                (ExecutionMode::Sequential, vec![StageId::SeoQueries]),
                (ExecutionMode::Sequential, vec![StageId::Outline]),
                (ExecutionMode::Sequential, vec![StageId::TableOfContents]),
                (
                    ExecutionMode::PerChapter,
                    vec![StageId::ChapterDraft, StageId::ChapterOptimize]
                ),
                (ExecutionMode::Concurrent, StageId::FAN_OUT.to_vec()),
            ]
        );
    }

    #[test]
    fn argument_names_follow_declared_inputs() {
        let names = StageId::TableOfContents.definition().argument_names();
        assert!(names.contains("outline"));
        assert!(names.contains("chapter_count"));
        assert!(!names.contains("topic"));

        let optimize = StageId::ChapterOptimize.definition();
        assert!(optimize
            .inputs
            .contains(&Binding::Stage(StageId::ChapterDraft)));
        assert!(optimize.argument_names().contains("content"));
        assert!(!optimize.argument_names().contains("seo_queries"));
    }

    #[test]
    fn builtin_prompts_use_only_declared_inputs() {
        let registry = crate::prompts::PromptRegistry::new().unwrap();
        for stage in StageId::ALL {
            let definition = stage.definition();
            registry
                .ensure_bound(definition.prompt_key, &definition.argument_names())
                .unwrap();
        }
    }

    #[test]
    fn artifact_names_follow_stage_numbers() {
        assert_eq!(StageId::ChapterDraft.artifact_name(Some(3)), "stage_4_chapter_3.md");
        assert_eq!(
            StageId::ChapterOptimize.artifact_name(Some(2)),
            "stage_5_optimized_chapter_2.md"
        );
        assert_eq!(StageId::Cover.artifact_name(None), "stage_6_cover_prompt.txt");
    }

    #[test]
    fn every_prompt_key_exists_in_builtin_registry() {
        let registry = crate::prompts::PromptRegistry::new().unwrap();
        registry.ensure_keys(required_prompt_keys()).unwrap();
    }
}
