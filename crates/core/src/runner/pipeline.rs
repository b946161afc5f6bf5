use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::context::{Chapter, ChapterRecord, RunContext, StageKey, StageOutput, StageResult};
use crate::logging::LogLevel;
use crate::parser::{Outline, OutlineChapter};
use crate::progress::ProgressEvent;
use crate::stage::{phases, ExecutionMode, OutputShape, StageId};

use super::stages::{
    stage_arguments, validate_chapter_record, validate_cover, validate_draft, validate_optimized,
    validate_outline, validate_queries, validate_toc, Scope,
};
use super::{describe, Executed, RunState, StageError, StageReport, StageRunner, StageStatus, StateTracker};

/// Walks the stage table for one run: sequential stages one after another,
/// per-chapter stages as one sub-pipeline per chapter, then the concurrent
/// fan-out. Every result lands in the [`RunContext`].
pub struct Pipeline<'a> {
    runner: &'a StageRunner<'a>,
    context: &'a RunContext,
    tracker: &'a StateTracker<'a>,
    reports: Mutex<Vec<StageReport>>,
    warnings: Mutex<Vec<String>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        runner: &'a StageRunner<'a>,
        context: &'a RunContext,
        tracker: &'a StateTracker<'a>,
    ) -> Self {
        Self {
            runner,
            context,
            tracker,
            reports: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn reports(&self) -> Vec<StageReport> {
        self.reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        self.runner.log(LogLevel::Warn, message.clone());
        push_recovering(&self.warnings, message);
    }

    /// Records the caller's parameter set as the stage 0 result.
    pub fn commit_parameters(&self) -> Result<(), StageError> {
        let key = StageKey::stage(StageId::Parameters);
        let started = Instant::now();
        let outcome = self
            .context
            .commit(StageResult {
                key,
                raw: String::new(),
                output: StageOutput::Parameters(self.context.parameters().clone()),
                status: StageStatus::Succeeded,
                warnings: Vec::new(),
                retries: 0,
            })
            .map_err(StageError::from);
        self.report(key, started, &outcome);
        outcome.map(|_| ())
    }

    /// Stages 1 through 9, phase by phase as the stage table groups them.
    /// Returns the error that ended the run, if any.
    pub async fn run(&self) -> Result<(), StageError> {
        for phase in phases() {
            self.check_dependencies(&phase.stages)?;
            match phase.mode {
                ExecutionMode::Sequential => {
                    for stage in phase.stages {
                        self.enter(RunState::Stage(stage));
                        self.tracked(StageKey::stage(stage), self.sequential(stage))
                            .await?;
                    }
                }
                ExecutionMode::PerChapter => self.chapters(&phase.stages).await?,
                ExecutionMode::Concurrent => self.fan_out(&phase.stages).await?,
            }
        }
        Ok(())
    }

    /// Fails unless every stage the phase reads from outside itself has committed.
    /// A per-chapter dependency must be present for every chapter.
    fn check_dependencies(&self, stages: &[StageId]) -> Result<(), StageError> {
        for &stage in stages {
            for &dependency in stage.dependencies() {
                if stages.contains(&dependency) {
                    continue;
                }
                let ready = if dependency.is_per_chapter() {
                    let chapters = self.context.chapters();
                    !chapters.is_empty()
                        && chapters.iter().all(|chapter| {
                            self.context
                                .contains(StageKey::chapter(dependency, chapter.number))
                        })
                } else {
                    self.context.contains(StageKey::stage(dependency))
                };
                if !ready {
                    return Err(StageError::MissingDependency { stage, dependency });
                }
            }
        }
        Ok(())
    }

    fn enter(&self, state: RunState) {
        if !self.tracker.advance(state) {
            self.runner.log(
                LogLevel::Debug,
                format!("state {} -> {state} not taken", self.tracker.current()),
            );
        }
    }

    /// Publishes start/finish around `body` and commits its result.
    async fn tracked<F>(&self, key: StageKey, body: F) -> Result<Arc<StageResult>, StageError>
    where
        F: Future<Output = Result<StageResult, StageError>>,
    {
        if self.runner.cancel_token().is_cancelled() {
            return Err(StageError::Cancelled);
        }
        self.runner.progress().publish(ProgressEvent::StageStarted {
            stage: key.stage,
            chapter: key.chapter,
        });
        self.runner
            .log(LogLevel::Info, format!("Running {}", describe(key)));

        let started = Instant::now();
        let outcome = match body.await {
            Ok(result) => self.context.commit(result).map_err(StageError::from),
            Err(err) => Err(err),
        };
        self.report(key, started, &outcome);
        outcome
    }

    fn report(&self, key: StageKey, started: Instant, outcome: &Result<Arc<StageResult>, StageError>) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let report = match outcome {
            Ok(result) => {
                let level = if result.warnings.is_empty() {
                    LogLevel::Info
                } else {
                    LogLevel::Warn
                };
                self.runner.log(
                    level,
                    format!(
                        "{} finished ({} retries, {} warnings)",
                        describe(key),
                        result.retries,
                        result.warnings.len()
                    ),
                );
                StageReport {
                    stage: key.stage,
                    chapter: key.chapter,
                    status: result.status,
                    retries: result.retries,
                    warnings: result.warnings.clone(),
                    error: None,
                    duration_ms,
                }
            }
            Err(err) => {
                self.runner
                    .log(LogLevel::Error, format!("{} failed: {err}", describe(key)));
                StageReport {
                    stage: key.stage,
                    chapter: key.chapter,
                    status: StageStatus::Failed,
                    retries: err.retries(),
                    warnings: Vec::new(),
                    error: Some(err.to_string()),
                    duration_ms,
                }
            }
        };
        self.runner.progress().publish(ProgressEvent::StageFinished {
            stage: key.stage,
            chapter: key.chapter,
            status: report.status,
            retries: report.retries,
        });
        push_recovering(&self.reports, report);
    }

    /// A once-per-run stage, dispatched on the output it declares.
    async fn sequential(&self, stage: StageId) -> Result<StageResult, StageError> {
        let key = StageKey::stage(stage);
        let arguments = stage_arguments(self.context, stage, Scope::default())?;
        match stage.definition().output {
            OutputShape::QueryList => {
                let executed = self
                    .runner
                    .execute(key, &arguments, validate_queries)
                    .await?;
                Ok(finish(key, executed, StageOutput::Queries))
            }
            OutputShape::Outline => {
                let template = self.context.template();
                let executed = self
                    .runner
                    .execute(key, &arguments, |text| validate_outline(text, template))
                    .await?;
                Ok(finish(key, executed, StageOutput::Outline))
            }
            OutputShape::TableOfContents => {
                let outline = self.require_outline(stage)?;
                let executed = self
                    .runner
                    .execute(key, &arguments, |text| validate_toc(text, &outline))
                    .await?;
                Ok(finish(key, executed, StageOutput::TableOfContents))
            }
            _ => Err(StageError::Unsupported {
                stage,
                mode: ExecutionMode::Sequential,
            }),
        }
    }

    /// Runs each chapter through `stages` in order, several chapters at a time.
    async fn chapters(&self, stages: &[StageId]) -> Result<(), StageError> {
        let Some(&first) = stages.first() else {
            return Ok(());
        };
        let outline = self.require_outline(first)?;
        self.enter(RunState::Stage(first));

        let total = outline.chapters.len();
        let finished: Vec<AtomicUsize> = stages.iter().map(|_| AtomicUsize::new(0)).collect();
        let limit = self.runner.settings().max_parallel_chapters.max(1);
        stream::iter(
            outline
                .chapters
                .iter()
                .map(|chapter| self.chapter(stages, chapter, &finished, total)),
        )
        .buffer_unordered(limit)
        .try_collect::<Vec<()>>()
        .await?;

        if let Some(&last) = stages.last() {
            self.enter(RunState::Stage(last));
        }
        Ok(())
    }

    /// One chapter's sub-pipeline. Each stage reads the previous stage's text.
    async fn chapter(
        &self,
        stages: &[StageId],
        chapter: &OutlineChapter,
        finished: &[AtomicUsize],
        total: usize,
    ) -> Result<(), StageError> {
        let mut previous: Option<Arc<StageResult>> = None;
        for (index, &stage) in stages.iter().enumerate() {
            let content = previous.as_deref().and_then(StageResult::body);
            let result = self
                .tracked(
                    StageKey::chapter(stage, chapter.number),
                    self.chapter_text(stage, chapter, content),
                )
                .await?;
            // The run moves on once the last chapter clears this stage.
            if finished[index].fetch_add(1, Ordering::SeqCst) + 1 == total {
                if let Some(&next) = stages.get(index + 1) {
                    self.enter(RunState::Stage(next));
                }
            }
            previous = Some(result);
        }
        Ok(())
    }

    async fn chapter_text(
        &self,
        stage: StageId,
        chapter: &OutlineChapter,
        content: Option<&str>,
    ) -> Result<StageResult, StageError> {
        let key = StageKey::chapter(stage, chapter.number);
        let arguments = stage_arguments(self.context, stage, Scope::chapter(chapter, content))?;
        let executed = match stage {
            StageId::ChapterDraft => {
                let template = self.context.template();
                self.runner
                    .execute(key, &arguments, |text| {
                        validate_draft(text, template, chapter.number)
                    })
                    .await?
            }
            StageId::ChapterOptimize => {
                self.runner
                    .execute(key, &arguments, |text| validate_optimized(text, chapter.number))
                    .await?
            }
            _ => {
                return Err(StageError::Unsupported {
                    stage,
                    mode: ExecutionMode::PerChapter,
                })
            }
        };
        Ok(finish(key, executed, |body| StageOutput::ChapterText {
            number: chapter.number,
            title: chapter.title.clone(),
            body,
        }))
    }

    /// The concurrent stages side by side. One failure is isolated; all of them
    /// failing fails the run.
    async fn fan_out(&self, stages: &[StageId]) -> Result<(), StageError> {
        if stages.is_empty() {
            return Ok(());
        }
        let chapters = self.context.chapters();
        self.enter(RunState::FanOut);

        let chapters = chapters.as_slice();
        let outcomes = join_all(stages.iter().map(|&stage| async move {
            let outcome = self
                .tracked(StageKey::stage(stage), self.concurrent(stage, chapters))
                .await;
            (stage, outcome)
        }))
        .await;

        let mut failures: Vec<(StageId, StageError)> = outcomes
            .into_iter()
            .filter_map(|(stage, outcome)| outcome.err().map(|err| (stage, err)))
            .collect();

        if failures.iter().any(|(_, err)| err.is_cancelled()) {
            return Err(StageError::Cancelled);
        }
        if failures.len() == stages.len() {
            let (_, first) = failures.remove(0);
            return Err(first);
        }
        if !failures.is_empty() {
            let failed: Vec<String> = failures.iter().map(|(stage, _)| stage.to_string()).collect();
            self.warn(format!(
                "partial results: {} failed, continuing with the remaining stages",
                failed.join(", ")
            ));
        }
        Ok(())
    }

    async fn concurrent(&self, stage: StageId, chapters: &[Chapter]) -> Result<StageResult, StageError> {
        match stage.definition().output {
            OutputShape::PromptText => self.whole_book_prompt(stage, chapters).await,
            OutputShape::ChapterRecords => self.chapter_records(stage, chapters).await,
            _ => Err(StageError::Unsupported {
                stage,
                mode: ExecutionMode::Concurrent,
            }),
        }
    }

    /// A single image prompt drawn from every optimized chapter, e.g. the cover.
    async fn whole_book_prompt(
        &self,
        stage: StageId,
        chapters: &[Chapter],
    ) -> Result<StageResult, StageError> {
        let key = StageKey::stage(stage);
        let book_title = self.require_outline(stage)?.full_title();
        let content = chapters
            .iter()
            .filter_map(Chapter::optimized_body)
            .collect::<Vec<_>>()
            .join("\n\n");

        let arguments = stage_arguments(self.context, stage, Scope::content(&content))?;
        let executed = self
            .runner
            .execute(key, &arguments, |text| validate_cover(text, &book_title))
            .await?;
        Ok(finish(key, executed, StageOutput::Prompt))
    }

    /// Runs one fan-out stage for every chapter in order and commits the list.
    async fn chapter_records(
        &self,
        stage: StageId,
        chapters: &[Chapter],
    ) -> Result<StageResult, StageError> {
        let mut records = Vec::with_capacity(chapters.len());
        let mut raw = Vec::with_capacity(chapters.len());
        let mut warnings = Vec::new();
        let mut retries = 0;

        for chapter in chapters {
            let key = StageKey::chapter(stage, chapter.number);
            let scope = Scope::chapter(chapter, chapter.optimized_body());
            let arguments = stage_arguments(self.context, stage, scope)?;
            let executed = self
                .runner
                .execute(key, &arguments, |text| validate_chapter_record(stage, text))
                .await
                .map_err(|err| err.after_retries(retries))?;

            retries += executed.retries;
            warnings.extend(
                executed
                    .warnings
                    .into_iter()
                    .map(|warning| format!("chapter {}: {warning}", chapter.number)),
            );
            raw.push(executed.raw);
            records.push(ChapterRecord {
                chapter: chapter.number,
                title: chapter.title.clone(),
                fields: executed.value,
            });
        }

        Ok(StageResult {
            key: StageKey::stage(stage),
            raw: raw.join("\n\n"),
            output: StageOutput::ChapterRecords(records),
            status: StageStatus::from_warnings(&warnings),
            warnings,
            retries,
        })
    }

    fn require_outline(&self, stage: StageId) -> Result<Outline, StageError> {
        self.context
            .outline()
            .ok_or(StageError::MissingDependency {
                stage,
                dependency: StageId::Outline,
            })
    }
}

fn finish<T>(key: StageKey, executed: Executed<T>, wrap: impl FnOnce(T) -> StageOutput) -> StageResult {
    StageResult {
        key,
        raw: executed.raw,
        output: wrap(executed.value),
        status: StageStatus::from_warnings(&executed.warnings),
        warnings: executed.warnings,
        retries: executed.retries,
    }
}

/// A panicked holder never costs the list an entry.
fn push_recovering<T>(list: &Mutex<Vec<T>>, item: T) {
    list.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn poisoned_report_list_still_records() {
        let list = Mutex::new(vec![1]);
        let outcome = panic::catch_unwind(|| {
            let _guard = list.lock().unwrap();
            panic!("holder died");
        });
        assert!(outcome.is_err());
        assert!(list.is_poisoned());

        push_recovering(&list, 2);
        let recorded = list.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone();
        assert_eq!(recorded, vec![1, 2]);
    }
}
