//! Liveness resolution: probe, then fetch, then render.
//!
//! Each stage is one [`OperationRunner`] call, so stages are cached and
//! deduplicated per URL. The first stage that succeeds decides the verdict;
//! when all of them fail the URL is dead, which is a normal result.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use bookmarks_fetch::{PageResponse, ProbeResponse};
use bookmarks_shared::{BookmarkError, LivenessMethod, LivenessVerdict, Result};

use crate::collaborators::{PageFetcher, PageRenderer};
use crate::runner::{OperationRunner, Operations};

pub struct LivenessResolver {
    runner: OperationRunner,
    ops: Arc<Operations>,
    fetcher: Arc<dyn PageFetcher>,
    renderer: Option<Arc<dyn PageRenderer>>,
}

impl LivenessResolver {
    pub fn new(
        runner: OperationRunner,
        ops: Arc<Operations>,
        fetcher: Arc<dyn PageFetcher>,
        renderer: Option<Arc<dyn PageRenderer>>,
    ) -> Self {
        Self {
            runner,
            ops,
            fetcher,
            renderer,
        }
    }

    /// Walk the stages in [`LivenessMethod::ORDER`] and stop at the first success.
    ///
    /// Only fatal errors and cancellation are returned as `Err`; every other
    /// stage failure moves on to the next stage and ends up in the dead
    /// verdict's `failure_detail`.
    #[instrument(skip(self))]
    pub async fn resolve(&self, url: &str) -> Result<LivenessVerdict> {
        let mut failures: Vec<String> = Vec::new();

        for method in LivenessMethod::ORDER {
            if self.runner.cancellation().is_cancelled() {
                return Err(BookmarkError::Cancelled);
            }

            match self.stage(method, url).await {
                Ok(verdict) => {
                    debug!(%method, final_url = %verdict.final_url, "url is live");
                    return Ok(verdict);
                }
                Err(e) if e.is_fatal() || matches!(e, BookmarkError::Cancelled) => return Err(e),
                Err(e) => {
                    warn!(%method, error = %e, "liveness stage failed");
                    failures.push(format!("{method}: {e}"));
                }
            }
        }

        let detail = failures.join("; ");
        warn!(%detail, "all liveness stages failed, url is dead");
        Ok(LivenessVerdict::dead(url, detail))
    }

    /// Full page fetch under the `liveness.fetch` key.
    ///
    /// Shares its cache entry with the fetch stage of [`resolve`](Self::resolve).
    pub async fn fetch(&self, url: &str) -> Result<PageResponse> {
        self.runner
            .run(&self.ops.fetch, url, || self.fetcher.fetch(url))
            .await
    }

    async fn stage(&self, method: LivenessMethod, url: &str) -> Result<LivenessVerdict> {
        match method {
            LivenessMethod::Probe => {
                let probe: ProbeResponse = self
                    .runner
                    .run(&self.ops.probe, url, || self.fetcher.probe(url))
                    .await?;
                Ok(LivenessVerdict::live(
                    method,
                    probe.final_url,
                    Some(probe.status),
                    None,
                ))
            }
            LivenessMethod::Fetch => {
                let page = self.fetch(url).await?;
                Ok(LivenessVerdict::live(
                    method,
                    page.final_url,
                    Some(page.status),
                    Some(page.content),
                ))
            }
            LivenessMethod::Render => {
                let Some(renderer) = &self.renderer else {
                    return Err(BookmarkError::Render {
                        message: "no renderer configured".into(),
                        transient: false,
                    });
                };
                let page: PageResponse = self
                    .runner
                    .run(&self.ops.render, url, || renderer.render(url))
                    .await?;
                Ok(LivenessVerdict::live(
                    method,
                    page.final_url,
                    Some(page.status),
                    Some(page.content),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFetcher, FakeRenderer, Reply, test_ops, test_runner};
    use bookmarks_fetch::HttpFetcher;
    use bookmarks_shared::{HttpConfig, LivenessStatus};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const URL: &str = "https://site.test/page";

    async fn resolver(fetcher: Arc<FakeFetcher>, renderer: Option<Arc<FakeRenderer>>) -> LivenessResolver {
        LivenessResolver::new(
            test_runner().await,
            Arc::new(test_ops()),
            fetcher,
            renderer.map(|r| r as Arc<dyn PageRenderer>),
        )
    }

    #[tokio::test]
    async fn probe_success_stops_the_chain() {
        let fetcher = Arc::new(FakeFetcher::new().probe(URL, Reply::ok(URL, "")));
        let renderer = Arc::new(FakeRenderer::new());
        let resolver = resolver(Arc::clone(&fetcher), Some(Arc::clone(&renderer))).await;

        let verdict = resolver.resolve(URL).await.unwrap();
        assert_eq!(verdict.method, Some(LivenessMethod::Probe));
        assert_eq!(verdict.content, None);
        assert_eq!(fetcher.calls.count("fetch", URL), 0);
        assert_eq!(renderer.calls.count("render", URL), 0);
    }

    #[tokio::test]
    async fn fetch_wins_when_probe_fails() {
        let fetcher = Arc::new(
            FakeFetcher::new()
                .probe(URL, Reply::Status(405))
                .fetch(URL, Reply::ok(URL, "<p>hello</p>")),
        );
        let renderer = Arc::new(FakeRenderer::new().render(URL, Reply::ok(URL, "<p>rendered</p>")));
        let resolver = resolver(Arc::clone(&fetcher), Some(Arc::clone(&renderer))).await;

        let verdict = resolver.resolve(URL).await.unwrap();
        assert_eq!(verdict.method, Some(LivenessMethod::Fetch));
        assert_eq!(verdict.content.as_deref(), Some("<p>hello</p>"));
        assert_eq!(renderer.calls.count("render", URL), 0);
    }

    #[tokio::test]
    async fn render_is_the_last_resort() {
        let fetcher = Arc::new(
            FakeFetcher::new()
                .probe(URL, Reply::Hang)
                .fetch(URL, Reply::Hang),
        );
        let renderer = Arc::new(FakeRenderer::new().render(URL, Reply::ok(URL, "<p>js app</p>")));
        let resolver = resolver(Arc::clone(&fetcher), Some(Arc::clone(&renderer))).await;

        let verdict = resolver.resolve(URL).await.unwrap();
        assert_eq!(verdict.method, Some(LivenessMethod::Render));
        assert_eq!(verdict.content.as_deref(), Some("<p>js app</p>"));
    }

    #[tokio::test]
    async fn total_failure_is_a_dead_verdict_with_every_reason() {
        let fetcher = Arc::new(
            FakeFetcher::new()
                .probe(URL, Reply::Status(404))
                .fetch(URL, Reply::Status(404)),
        );
        let renderer = Arc::new(FakeRenderer::new().render(URL, Reply::Status(404)));
        let resolver = resolver(fetcher, Some(renderer)).await;

        let verdict = resolver.resolve(URL).await.unwrap();
        assert_eq!(verdict.status, LivenessStatus::Dead);
        assert_eq!(verdict.method, None);
        assert_eq!(verdict.final_url, URL);
        let detail = verdict.failure_detail.unwrap();
        assert!(detail.starts_with("probe: "), "{detail}");
        assert!(detail.contains("; fetch: "), "{detail}");
        assert!(detail.contains("; render: "), "{detail}");
    }

    #[tokio::test]
    async fn missing_renderer_fails_the_render_stage() {
        let fetcher = Arc::new(
            FakeFetcher::new()
                .probe(URL, Reply::Status(500))
                .fetch(URL, Reply::Status(500)),
        );
        let resolver = resolver(fetcher, None).await;

        let verdict = resolver.resolve(URL).await.unwrap();
        assert!(!verdict.is_live());
        assert!(
            verdict
                .failure_detail
                .unwrap()
                .contains("render: render error: no renderer configured")
        );
    }

    #[tokio::test]
    async fn second_resolution_is_served_from_cache() {
        let fetcher = Arc::new(
            FakeFetcher::new()
                .probe(URL, Reply::Status(403))
                .fetch(URL, Reply::ok(URL, "<p>x</p>")),
        );
        let resolver = resolver(Arc::clone(&fetcher), None).await;

        let first = resolver.resolve(URL).await.unwrap();
        let second = resolver.resolve(URL).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls.count("fetch", URL), 1);
        // Failed probes are not cached.
        assert_eq!(fetcher.calls.count("probe", URL), 2);
    }

    #[tokio::test]
    async fn cancelled_resolution_is_not_dead() {
        let fetcher = Arc::new(FakeFetcher::new().probe(URL, Reply::ok(URL, "")));
        let resolver = resolver(Arc::clone(&fetcher), None).await;
        resolver.runner.cancellation().cancel();

        let err = resolver.resolve(URL).await.unwrap_err();
        assert!(matches!(err, BookmarkError::Cancelled));
        assert_eq!(fetcher.calls.count("probe", URL), 0);
    }

    #[tokio::test]
    async fn resolves_against_a_real_http_server() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<article>Body</article>"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher: Arc<dyn PageFetcher> =
            Arc::new(HttpFetcher::new(&HttpConfig::default()).unwrap());
        let resolver =
            LivenessResolver::new(test_runner().await, Arc::new(test_ops()), fetcher, None);

        let url = format!("{}/article", server.uri());
        let verdict = resolver.resolve(&url).await.unwrap();
        assert_eq!(verdict.method, Some(LivenessMethod::Fetch));
        assert_eq!(verdict.status_code, Some(200));

        // The page body is reused from cache, the server sees one GET.
        let page = resolver.fetch(&url).await.unwrap();
        assert!(page.content.contains("Body"));
    }
}
