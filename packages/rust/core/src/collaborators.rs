//! Seams to the external services the pipeline depends on.
//!
//! Production implementations wrap [`HttpFetcher`], [`RenderBridge`],
//! [`extract_text`] and [`LlmClient`](crate::llm::LlmClient); tests substitute
//! in-process fakes.

use async_trait::async_trait;

use bookmarks_extract::{Extracted, extract_text};
use bookmarks_fetch::{HttpFetcher, PageResponse, ProbeResponse, RenderBridge};
use bookmarks_shared::Result;

/// HTTP reachability probe and full fetch.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeResponse>;
    async fn fetch(&self, url: &str) -> Result<PageResponse>;
}

/// Headless-browser rendering, used only as the last liveness stage.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str) -> Result<PageResponse>;
}

/// Main-text extraction from HTML. CPU-bound; callers run it off the async threads.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, html: &str) -> Extracted;
}

/// Text summarization and tag suggestion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Identifies the model in cache keys, so switching models recomputes.
    fn model_id(&self) -> &str;

    async fn summarize(&self, text: &str) -> Result<String>;

    /// Normalized (lower-cased) tags, most relevant first.
    async fn suggest_tags(&self, text: &str) -> Result<Vec<String>>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn probe(&self, url: &str) -> Result<ProbeResponse> {
        HttpFetcher::probe(self, url).await
    }

    async fn fetch(&self, url: &str) -> Result<PageResponse> {
        HttpFetcher::fetch(self, url).await
    }
}

#[async_trait]
impl PageRenderer for RenderBridge {
    async fn render(&self, url: &str) -> Result<PageResponse> {
        RenderBridge::render(self, url).await
    }
}

/// [`ContentExtractor`] backed by `bookmarks-extract`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlExtractor;

impl ContentExtractor for HtmlExtractor {
    fn extract(&self, html: &str) -> Extracted {
        extract_text(html)
    }
}
