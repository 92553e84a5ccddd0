//! In-process fakes for engine tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bookmarks_fetch::{PageResponse, ProbeResponse};
use bookmarks_shared::{Backoff, BookmarkError, Result, RetryPolicy};
use bookmarks_storage::Storage;

use crate::cache::CacheStore;
use crate::collaborators::{LanguageModel, PageFetcher, PageRenderer};
use crate::runner::{OperationClass, OperationRunner, Operations};

pub(crate) async fn test_runner() -> OperationRunner {
    let storage = Storage::open(Path::new(":memory:")).await.expect("open test db");
    OperationRunner::new(Arc::new(CacheStore::new(Arc::new(storage))))
}

/// Two attempts, 1 ms apart, 100 ms per attempt.
pub(crate) fn test_ops() -> Operations {
    let class = |name| OperationClass {
        name,
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            backoff: Backoff::Fixed,
            max_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(100),
        },
        ttl: chrono::Duration::days(7),
    };
    Operations {
        probe: class(Operations::PROBE),
        fetch: class(Operations::FETCH),
        render: class(Operations::RENDER),
        extract: class(Operations::EXTRACT),
        summarize: class(Operations::SUMMARIZE),
        suggest_tags: class(Operations::SUGGEST_TAGS),
    }
}

/// Scripted response of a fake collaborator.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Page {
        final_url: String,
        status: u16,
        content: String,
    },
    /// Terminal non-success status.
    Status(u16),
    /// Never answers within any test timeout.
    Hang,
}

impl Reply {
    pub(crate) fn ok(final_url: &str, content: &str) -> Self {
        Self::Page {
            final_url: final_url.to_string(),
            status: 200,
            content: content.to_string(),
        }
    }

    async fn into_page(self, url: &str, latency: Duration) -> Result<PageResponse> {
        tokio::time::sleep(latency).await;
        match self {
            Self::Page {
                final_url,
                status,
                content,
            } => Ok(PageResponse {
                final_url,
                status,
                content,
            }),
            Self::Status(status) => Err(BookmarkError::HttpStatus {
                url: url.to_string(),
                status,
            }),
            Self::Hang => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Err(BookmarkError::Network("hung".into()))
            }
        }
    }
}

/// Ordered log of collaborator invocations.
#[derive(Debug, Default)]
pub(crate) struct CallLog(Mutex<Vec<(&'static str, String)>>);

impl CallLog {
    fn record(&self, kind: &'static str, arg: &str) {
        self.0
            .lock()
            .expect("call log lock")
            .push((kind, arg.to_string()));
    }

    pub(crate) fn count(&self, kind: &str, arg: &str) -> usize {
        self.0
            .lock()
            .expect("call log lock")
            .iter()
            .filter(|(k, a)| *k == kind && a == arg)
            .count()
    }

    pub(crate) fn count_kind(&self, kind: &str) -> usize {
        self.0
            .lock()
            .expect("call log lock")
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

/// URLs without a scripted reply answer 404.
#[derive(Debug, Default)]
pub(crate) struct FakeFetcher {
    probes: HashMap<String, Reply>,
    fetches: HashMap<String, Reply>,
    latency: Duration,
    pub(crate) calls: CallLog,
}

impl FakeFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn probe(mut self, url: &str, reply: Reply) -> Self {
        self.probes.insert(url.to_string(), reply);
        self
    }

    pub(crate) fn fetch(mut self, url: &str, reply: Reply) -> Self {
        self.fetches.insert(url.to_string(), reply);
        self
    }

    pub(crate) fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn probe(&self, url: &str) -> Result<ProbeResponse> {
        self.calls.record("probe", url);
        let reply = self.probes.get(url).cloned().unwrap_or(Reply::Status(404));
        let page = reply.into_page(url, self.latency).await?;
        Ok(ProbeResponse {
            final_url: page.final_url,
            status: page.status,
        })
    }

    async fn fetch(&self, url: &str) -> Result<PageResponse> {
        self.calls.record("fetch", url);
        let reply = self.fetches.get(url).cloned().unwrap_or(Reply::Status(404));
        reply.into_page(url, self.latency).await
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeRenderer {
    renders: HashMap<String, Reply>,
    pub(crate) calls: CallLog,
}

impl FakeRenderer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn render(mut self, url: &str, reply: Reply) -> Self {
        self.renders.insert(url.to_string(), reply);
        self
    }
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn render(&self, url: &str) -> Result<PageResponse> {
        self.calls.record("render", url);
        let reply = self.renders.get(url).cloned().unwrap_or(Reply::Status(404));
        reply.into_page(url, Duration::ZERO).await
    }
}

/// Language model that answers with fixed text.
#[derive(Debug)]
pub(crate) struct FakeLlm {
    pub(crate) summary: String,
    pub(crate) tags: Vec<String>,
    pub(crate) fail_summarize: bool,
    pub(crate) calls: CallLog,
}

impl Default for FakeLlm {
    fn default() -> Self {
        Self {
            summary: "A short summary.".into(),
            tags: vec!["rust".into(), "async".into()],
            fail_summarize: false,
            calls: CallLog::default(),
        }
    }
}

#[async_trait]
impl LanguageModel for FakeLlm {
    fn model_id(&self) -> &str {
        "fake-model"
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        self.calls.record("summarize", text);
        if self.fail_summarize {
            return Err(BookmarkError::Llm {
                message: "model rejected the request".into(),
                transient: false,
            });
        }
        Ok(self.summary.clone())
    }

    async fn suggest_tags(&self, text: &str) -> Result<Vec<String>> {
        self.calls.record("suggest_tags", text);
        Ok(self.tags.clone())
    }
}
