//! Record pipeline: lint, liveness, content, derived operations, assembly.
//!
//! One [`RecordPipeline`] is shared by every record of a batch; it holds no
//! per-record state. Stage order within a record is fixed:
//!
//! 1. tag lint (annotates, never blocks)
//! 2. liveness resolution; a dead URL gets the offline tag and stops here
//! 3. text source selection: existing notes, else text extracted from the page
//! 4. summarize (only when the notes were empty) and suggest tags, concurrently
//! 5. assembly: tag union, notes, redirect rewrite

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use bookmarks_extract::Extracted;
use bookmarks_shared::{
    Bookmark, BookmarkError, LivenessMethod, LivenessVerdict, RecordOutcome, Result, TagsConfig,
    normalize_tag, urls_equivalent,
};

use crate::collaborators::{ContentExtractor, LanguageModel, PageFetcher, PageRenderer};
use crate::lint::BlessedTags;
use crate::liveness::LivenessResolver;
use crate::runner::{OperationRunner, Operations};

// ---------------------------------------------------------------------------
// Stage failures
// ---------------------------------------------------------------------------

/// Pipeline stage a record can fail in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Liveness,
    Extract,
    Summarize,
    SuggestTags,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Liveness => "liveness",
            Self::Extract => "extract",
            Self::Summarize => "summarize",
            Self::SuggestTags => "suggest_tags",
        })
    }
}

#[derive(Debug)]
struct StageFailure {
    stage: Stage,
    error: BookmarkError,
}

impl StageFailure {
    fn new(stage: Stage) -> impl FnOnce(BookmarkError) -> Self {
        move |error| Self { stage, error }
    }
}

/// Record after a successful pass.
struct Assembled {
    record: Bookmark,
    method: Option<LivenessMethod>,
}

#[derive(Default)]
struct Derived {
    summary: Option<String>,
    tags: Vec<String>,
}

/// Cache-key inputs of the LLM operations.
#[derive(Serialize)]
struct ModelInput<'a> {
    model: &'a str,
    text: &'a str,
}

// ---------------------------------------------------------------------------
// RecordPipeline
// ---------------------------------------------------------------------------

pub struct RecordPipeline {
    runner: OperationRunner,
    ops: Arc<Operations>,
    resolver: LivenessResolver,
    extractor: Arc<dyn ContentExtractor>,
    llm: Arc<dyn LanguageModel>,
    blessed: BlessedTags,
    tags: TagsConfig,
}

impl RecordPipeline {
    pub fn new(
        runner: OperationRunner,
        ops: Operations,
        fetcher: Arc<dyn PageFetcher>,
        renderer: Option<Arc<dyn PageRenderer>>,
        extractor: Arc<dyn ContentExtractor>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        let ops = Arc::new(ops);
        let resolver = LivenessResolver::new(runner.clone(), Arc::clone(&ops), fetcher, renderer);
        Self {
            runner,
            ops,
            resolver,
            extractor,
            llm,
            blessed: BlessedTags::default(),
            tags: TagsConfig::default(),
        }
    }

    pub fn with_blessed_tags(mut self, blessed: BlessedTags) -> Self {
        self.blessed = blessed;
        self
    }

    pub fn with_tags_config(mut self, tags: TagsConfig) -> Self {
        self.tags = tags;
        self
    }

    /// Token observed between stages; shared with the runner.
    pub fn cancellation(&self) -> &CancellationToken {
        self.runner.cancellation()
    }

    /// Process one record into its outcome.
    ///
    /// Stage failures become a `failed` outcome carrying the reason. Only
    /// fatal errors (the cache store is unusable) are returned as `Err`.
    #[instrument(skip_all, fields(record = %record.identity(index), url = %record.href))]
    pub async fn process(&self, index: usize, record: Bookmark) -> Result<RecordOutcome> {
        let id = record.identity(index);

        let lint = self.blessed.lint(&record.tags);
        if !lint.unblessed.is_empty() {
            warn!(unblessed = ?lint.unblessed, "tags not in blessed list");
        }

        let mut outcome = match self.advance(&record).await {
            Ok(assembled) => {
                let mut outcome = RecordOutcome::processed(id, index, assembled.record);
                outcome.method = assembled.method;
                outcome
            }
            Err(failure) if failure.error.is_fatal() => return Err(failure.error),
            Err(failure) => {
                let reason = if matches!(failure.error, BookmarkError::Cancelled)
                    || self.cancellation().is_cancelled()
                {
                    "cancelled".to_string()
                } else {
                    format!("{}: {}", failure.stage, failure.error)
                };
                warn!(stage = %failure.stage, %reason, "record failed");
                RecordOutcome::failed(id, index, record, reason)
            }
        };
        outcome.lint_warnings = lint.unblessed;
        Ok(outcome)
    }

    async fn advance(&self, input: &Bookmark) -> std::result::Result<Assembled, StageFailure> {
        self.checkpoint(Stage::Liveness)?;
        let verdict = self
            .resolver
            .resolve(&input.href)
            .await
            .map_err(StageFailure::new(Stage::Liveness))?;

        let mut record = input.clone();
        if !verdict.is_live() {
            if record.tags.insert(self.tags.offline_tag.clone()) {
                info!(tag = %self.tags.offline_tag, "url is dead, tagged offline");
            }
            return Ok(Assembled {
                record,
                method: None,
            });
        }

        self.checkpoint(Stage::Extract)?;
        let had_notes = !record.extended.is_blank();
        let text = self.select_text(&record, &verdict).await?;

        let derived = match text {
            Some(text) => {
                self.checkpoint(Stage::Summarize)?;
                self.derive(&text, !had_notes).await?
            }
            None => Derived::default(),
        };

        for tag in derived.tags.iter().filter_map(|tag| normalize_tag(tag)) {
            record.tags.insert(tag);
        }
        if let Some(summary) = derived.summary {
            record.extended = summary.into();
        }
        if !urls_equivalent(&record.href, &verdict.final_url) {
            info!(final_url = %verdict.final_url, "url redirected, rewriting");
            record.href = verdict.final_url.clone();
            record.tags.insert(self.tags.redirected_tag.clone());
        }

        Ok(Assembled {
            record,
            method: verdict.method,
        })
    }

    /// Existing notes win; otherwise the page body, fetched if the verdict
    /// carried none, reduced to its main text.
    async fn select_text(
        &self,
        record: &Bookmark,
        verdict: &LivenessVerdict,
    ) -> std::result::Result<Option<String>, StageFailure> {
        if !record.extended.is_blank() {
            return Ok(Some(record.extended.as_str().to_string()));
        }

        let html = match &verdict.content {
            Some(content) => content.clone(),
            None => match self.resolver.fetch(&record.href).await {
                Ok(page) => page.content,
                Err(e) if e.is_fatal() || matches!(e, BookmarkError::Cancelled) => {
                    return Err(StageFailure::new(Stage::Extract)(e));
                }
                Err(e) => {
                    warn!(error = %e, "content fetch failed, no text source");
                    return Ok(None);
                }
            },
        };

        let extracted = self
            .extract(html)
            .await
            .map_err(StageFailure::new(Stage::Extract))?;
        if extracted.is_empty() {
            debug!("page has no readable text");
            return Ok(None);
        }
        debug!(region = ?extracted.region, text_len = extracted.text.len(), "text extracted");
        Ok(Some(extracted.text))
    }

    async fn extract(&self, html: String) -> Result<Extracted> {
        self.runner
            .run(&self.ops.extract, &html, || {
                let extractor = Arc::clone(&self.extractor);
                let html = html.clone();
                async move {
                    tokio::task::spawn_blocking(move || extractor.extract(&html))
                        .await
                        .map_err(|e| BookmarkError::parse(format!("extraction task failed: {e}")))
                }
            })
            .await
    }

    /// Summarize and suggest tags concurrently; both must succeed.
    async fn derive(
        &self,
        text: &str,
        summarize: bool,
    ) -> std::result::Result<Derived, StageFailure> {
        let input = ModelInput {
            model: self.llm.model_id(),
            text,
        };

        let summary = async {
            if summarize {
                self.runner
                    .run(&self.ops.summarize, &input, || self.llm.summarize(text))
                    .await
                    .map(Some)
            } else {
                Ok(None)
            }
        };
        let tags = self
            .runner
            .run(&self.ops.suggest_tags, &input, || self.llm.suggest_tags(text));

        let (summary, tags) = tokio::join!(summary, tags);
        let summary: Option<String> = summary.map_err(StageFailure::new(Stage::Summarize))?;
        let tags: Vec<String> = tags.map_err(StageFailure::new(Stage::SuggestTags))?;

        Ok(Derived {
            summary: summary.filter(|s| !s.trim().is_empty()),
            tags,
        })
    }

    fn checkpoint(&self, stage: Stage) -> std::result::Result<(), StageFailure> {
        if self.cancellation().is_cancelled() {
            Err(StageFailure::new(stage)(BookmarkError::Cancelled))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::HtmlExtractor;
    use crate::testing::{FakeFetcher, FakeLlm, FakeRenderer, Reply, test_ops, test_runner};
    use bookmarks_shared::{OutcomeStatus, TagSet, TextField};

    const URL: &str = "https://site.test/post";
    const PAGE: &str = "<html><body><nav>menu</nav><article><p>Async Rust in depth.</p></article></body></html>";

    struct Harness {
        fetcher: Arc<FakeFetcher>,
        renderer: Arc<FakeRenderer>,
        llm: Arc<FakeLlm>,
        pipeline: RecordPipeline,
    }

    async fn harness(fetcher: FakeFetcher, renderer: FakeRenderer, llm: FakeLlm) -> Harness {
        let fetcher = Arc::new(fetcher);
        let renderer = Arc::new(renderer);
        let llm = Arc::new(llm);
        let pipeline = RecordPipeline::new(
            test_runner().await,
            test_ops(),
            Arc::clone(&fetcher) as Arc<dyn PageFetcher>,
            Some(Arc::clone(&renderer) as Arc<dyn PageRenderer>),
            Arc::new(HtmlExtractor),
            Arc::clone(&llm) as Arc<dyn LanguageModel>,
        );
        Harness {
            fetcher,
            renderer,
            llm,
            pipeline,
        }
    }

    fn bookmark(href: &str, extended: &str, tags: &str) -> Bookmark {
        serde_json::from_value(serde_json::json!({
            "href": href,
            "description": "A post",
            "extended": extended,
            "tags": tags,
            "time": "2024-01-01T00:00:00Z",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn live_page_without_notes_is_summarized_and_tagged() {
        let h = harness(
            FakeFetcher::new()
                .probe(URL, Reply::Status(405))
                .fetch(URL, Reply::ok(URL, PAGE)),
            FakeRenderer::new(),
            FakeLlm::default(),
        )
        .await;

        let outcome = h.pipeline.process(0, bookmark(URL, "", "rust")).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Processed);
        assert_eq!(outcome.method, Some(LivenessMethod::Fetch));
        assert_eq!(outcome.record.extended, "A short summary.");
        assert_eq!(outcome.record.tags.to_delimited(), "rust async");
        assert_eq!(outcome.record.href, URL);
        assert_eq!(h.llm.calls.count("summarize", "Async Rust in depth."), 1);
        assert_eq!(outcome.record.extra["time"], "2024-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn null_notes_are_summarized() {
        let h = harness(
            FakeFetcher::new()
                .probe(URL, Reply::Status(405))
                .fetch(URL, Reply::ok(URL, PAGE)),
            FakeRenderer::new(),
            FakeLlm::default(),
        )
        .await;

        let mut record = bookmark(URL, "", "rust");
        record.extended = TextField::Null;
        let outcome = h.pipeline.process(0, record).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Processed);
        assert_eq!(outcome.record.extended, "A short summary.");
        assert_eq!(h.llm.calls.count_kind("summarize"), 1);
    }

    #[tokio::test]
    async fn existing_notes_skip_summarization() {
        let h = harness(
            FakeFetcher::new().probe(URL, Reply::ok(URL, "")),
            FakeRenderer::new(),
            FakeLlm::default(),
        )
        .await;

        let outcome = h
            .pipeline
            .process(0, bookmark(URL, "My own notes.", "python"))
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Processed);
        assert_eq!(outcome.record.extended, "My own notes.");
        assert_eq!(outcome.record.tags.to_delimited(), "python rust async");
        assert_eq!(h.llm.calls.count_kind("summarize"), 0);
        assert_eq!(h.llm.calls.count("suggest_tags", "My own notes."), 1);
        // Notes are the text source, so no page body is needed.
        assert_eq!(h.fetcher.calls.count_kind("fetch"), 0);
    }

    #[tokio::test]
    async fn probe_only_verdict_fetches_the_body() {
        let h = harness(
            FakeFetcher::new()
                .probe(URL, Reply::ok(URL, ""))
                .fetch(URL, Reply::ok(URL, PAGE)),
            FakeRenderer::new(),
            FakeLlm::default(),
        )
        .await;

        let outcome = h.pipeline.process(0, bookmark(URL, "", "")).await.unwrap();
        assert_eq!(outcome.method, Some(LivenessMethod::Probe));
        assert_eq!(outcome.record.extended, "A short summary.");
        assert_eq!(h.fetcher.calls.count("fetch", URL), 1);
    }

    #[tokio::test]
    async fn body_fetch_failure_leaves_record_untouched() {
        let h = harness(
            FakeFetcher::new().probe(URL, Reply::ok(URL, "")),
            FakeRenderer::new(),
            FakeLlm::default(),
        )
        .await;

        let outcome = h.pipeline.process(0, bookmark(URL, "", "rust")).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Processed);
        assert_eq!(outcome.record.extended, "");
        assert_eq!(outcome.record.tags.to_delimited(), "rust");
        assert_eq!(h.llm.calls.count_kind("suggest_tags"), 0);
    }

    #[tokio::test]
    async fn dead_url_is_tagged_offline_once() {
        let h = harness(FakeFetcher::new(), FakeRenderer::new(), FakeLlm::default()).await;

        let outcome = h
            .pipeline
            .process(0, bookmark(URL, "", "rust data:offline"))
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Processed);
        assert_eq!(outcome.method, None);
        assert_eq!(outcome.record.tags.to_delimited(), "rust data:offline");
        assert_eq!(h.llm.calls.count_kind("suggest_tags"), 0);

        let fresh = h.pipeline.process(1, bookmark(URL, "", "rust")).await.unwrap();
        let offline = fresh
            .record
            .tags
            .iter()
            .filter(|t| *t == "data:offline")
            .count();
        assert_eq!(offline, 1);
    }

    #[tokio::test]
    async fn render_fallback_uses_rendered_text() {
        let h = harness(
            FakeFetcher::new()
                .probe(URL, Reply::Hang)
                .fetch(URL, Reply::Hang),
            FakeRenderer::new().render(
                URL,
                Reply::ok(URL, "<html><body><main><p>Rendered client-side.</p></main></body></html>"),
            ),
            FakeLlm::default(),
        )
        .await;

        let outcome = h.pipeline.process(0, bookmark(URL, "", "")).await.unwrap();
        assert_eq!(outcome.method, Some(LivenessMethod::Render));
        assert_eq!(h.llm.calls.count("summarize", "Rendered client-side."), 1);
        assert_eq!(h.renderer.calls.count("render", URL), 1);
    }

    #[tokio::test]
    async fn redirect_rewrites_url_and_marks_record() {
        let target = "https://new.site.test/post";
        let h = harness(
            FakeFetcher::new()
                .probe(URL, Reply::ok(target, ""))
                .fetch(URL, Reply::ok(target, PAGE)),
            FakeRenderer::new(),
            FakeLlm::default(),
        )
        .await;

        let outcome = h.pipeline.process(0, bookmark(URL, "", "")).await.unwrap();
        assert_eq!(outcome.record.href, target);
        assert!(outcome.record.tags.contains("data:redirected"));
    }

    #[tokio::test]
    async fn llm_failure_fails_only_this_record() {
        let h = harness(
            FakeFetcher::new().fetch(URL, Reply::ok(URL, PAGE)),
            FakeRenderer::new(),
            FakeLlm {
                fail_summarize: true,
                ..FakeLlm::default()
            },
        )
        .await;

        let input = bookmark(URL, "", "rust");
        let outcome = h.pipeline.process(3, input.clone()).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.id.0, "#3");
        assert_eq!(outcome.record, input);
        let reason = outcome.failure_reason.unwrap();
        assert!(reason.starts_with("summarize: "), "{reason}");
    }

    #[tokio::test]
    async fn lint_warnings_are_annotations() {
        let h = harness(FakeFetcher::new(), FakeRenderer::new(), FakeLlm::default()).await;
        let pipeline = h
            .pipeline
            .with_blessed_tags(BlessedTags::parse("rust\n"));

        let outcome = pipeline
            .process(0, bookmark(URL, "", "rust zig"))
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Processed);
        assert_eq!(outcome.lint_warnings, vec!["zig"]);
    }

    #[tokio::test]
    async fn missing_blessed_list_changes_nothing() {
        let h = harness(
            FakeFetcher::new().fetch(URL, Reply::ok(URL, PAGE)),
            FakeRenderer::new(),
            FakeLlm::default(),
        )
        .await;
        let blessed = BlessedTags::load(&std::env::temp_dir().join("bm_absent_blessed.txt")).unwrap();
        let pipeline = h.pipeline.with_blessed_tags(blessed);

        let outcome = pipeline
            .process(0, bookmark(URL, "", "Unusual-Tag"))
            .await
            .unwrap();
        assert!(outcome.lint_warnings.is_empty());
        assert_eq!(outcome.status, OutcomeStatus::Processed);
        assert!(outcome.record.tags.contains("rust"));
    }

    #[tokio::test]
    async fn cancelled_before_start_is_reported() {
        let h = harness(
            FakeFetcher::new().probe(URL, Reply::ok(URL, "")),
            FakeRenderer::new(),
            FakeLlm::default(),
        )
        .await;
        h.pipeline.cancellation().cancel();

        let outcome = h.pipeline.process(0, bookmark(URL, "", "")).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.failure_reason.as_deref(), Some("cancelled"));
        assert_eq!(h.fetcher.calls.count_kind("probe"), 0);
    }

    #[tokio::test]
    async fn custom_tag_names_are_used() {
        let h = harness(FakeFetcher::new(), FakeRenderer::new(), FakeLlm::default()).await;
        let pipeline = h.pipeline.with_tags_config(TagsConfig {
            offline_tag: "dead".into(),
            redirected_tag: "moved".into(),
        });

        let outcome = pipeline.process(0, bookmark(URL, "", "")).await.unwrap();
        assert_eq!(outcome.record.tags, TagSet::parse("dead"));
    }
}
