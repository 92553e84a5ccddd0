//! Retrying operation runner.
//!
//! Every side-effecting call (probe, fetch, render, extract, LLM) goes through
//! [`OperationRunner::run`], which memoizes the result in the [`CacheStore`]
//! under an [`OperationKey`] derived from the operation name and its inputs,
//! collapses concurrent duplicates, and retries transient failures per the
//! operation's [`RetryPolicy`].

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use bookmarks_shared::{AppConfig, BookmarkError, Result, RetryPolicy};

use crate::cache::{CacheStore, OperationKey, Slot};

// ---------------------------------------------------------------------------
// Operation classes
// ---------------------------------------------------------------------------

/// A named kind of operation with its retry and cache policy.
#[derive(Debug, Clone)]
pub struct OperationClass {
    /// Namespaces the cache key; also the `operation` column in storage.
    pub name: &'static str,
    pub retry: RetryPolicy,
    pub ttl: chrono::Duration,
}

/// The operation classes used by the pipeline.
#[derive(Debug, Clone)]
pub struct Operations {
    pub probe: OperationClass,
    pub fetch: OperationClass,
    pub render: OperationClass,
    pub extract: OperationClass,
    pub summarize: OperationClass,
    pub suggest_tags: OperationClass,
}

impl Operations {
    pub const PROBE: &'static str = "liveness.probe";
    pub const FETCH: &'static str = "liveness.fetch";
    pub const RENDER: &'static str = "liveness.render";
    pub const EXTRACT: &'static str = "content.extract";
    pub const SUMMARIZE: &'static str = "llm.summarize";
    pub const SUGGEST_TAGS: &'static str = "llm.suggest_tags";

    pub fn from_config(config: &AppConfig) -> Self {
        let ttl = chrono::Duration::days(i64::from(config.defaults.cache_ttl_days));
        let class = |name, retry: &bookmarks_shared::RetryPolicyConfig| OperationClass {
            name,
            retry: RetryPolicy::from(retry),
            ttl,
        };

        Self {
            probe: class(Self::PROBE, &config.retry.probe),
            fetch: class(Self::FETCH, &config.retry.fetch),
            render: class(Self::RENDER, &config.retry.render),
            extract: class(Self::EXTRACT, &config.retry.extract),
            summarize: class(Self::SUMMARIZE, &config.retry.llm),
            suggest_tags: class(Self::SUGGEST_TAGS, &config.retry.llm),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationRunner
// ---------------------------------------------------------------------------

/// Cached, deduplicated, retrying execution of operations.
///
/// Cloning is cheap; clones share the cache store and cancellation token.
#[derive(Clone)]
pub struct OperationRunner {
    cache: Arc<CacheStore>,
    cancel: CancellationToken,
}

impl OperationRunner {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            cache,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop waiting between retries once `cancel` fires.
    ///
    /// An attempt already running is never interrupted, so its result still
    /// reaches the cache.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `op` for `inputs` under `class`, or return its cached result.
    ///
    /// On a miss the caller that wins [`CacheStore::acquire_or_wait`] executes
    /// `op`; concurrent callers with the same key wait and share the result or
    /// the failure. Successful results are cached before they are returned.
    #[instrument(skip_all, fields(operation = class.name))]
    pub async fn run<I, T, F, Fut>(&self, class: &OperationClass, inputs: &I, mut op: F) -> Result<T>
    where
        I: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = OperationKey::new(class.name, inputs)?;

        loop {
            match self.cache.acquire_or_wait(&key).await? {
                Slot::Ready(entry) => match serde_json::from_str::<T>(&entry.value_json) {
                    Ok(value) => {
                        debug!(key = %key, "cache hit");
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "discarding undecodable cache entry");
                        self.cache.invalidate(&key).await?;
                    }
                },
                Slot::Failed(message) => {
                    return Err(BookmarkError::Coalesced {
                        operation: class.name.to_string(),
                        message,
                    });
                }
                Slot::Compute(guard) => {
                    return match self.execute(class, &mut op).await {
                        Ok(value) => {
                            let value_json = serde_json::to_string(&value).map_err(|e| {
                                BookmarkError::parse(format!(
                                    "cannot serialize result of {}: {e}",
                                    class.name
                                ))
                            })?;
                            guard.publish(value_json, class.ttl).await?;
                            Ok(value)
                        }
                        Err(e) => {
                            guard.fail(e.to_string());
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// The attempt loop: per-attempt timeout, retry only transient errors.
    async fn execute<T, F, Fut>(&self, class: &OperationClass, op: &mut F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &class.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(policy.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(BookmarkError::Timeout(policy.timeout)),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if err.is_fatal() || !err.is_transient() {
                debug!(attempt, error = %err, "structural failure, not retrying");
                return Err(err);
            }
            if attempt >= policy.max_attempts {
                return Err(BookmarkError::Exhausted {
                    operation: class.name.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = policy.delay_after(attempt);
            warn!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(BookmarkError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
