//! Processing engine for bookmark exports.
//!
//! The engine memoizes every expensive operation in a persistent cache, retries
//! transient failures per operation class, and runs record pipelines
//! concurrently:
//!
//! [`BatchCoordinator`] → (N concurrent) [`RecordPipeline`] → [`LivenessResolver`]
//! → [`OperationRunner`] → [`CacheStore`].

pub mod batch;
pub mod cache;
pub mod collaborators;
pub mod io;
pub mod lint;
pub mod liveness;
pub mod llm;
pub mod pipeline;
pub mod runner;

#[cfg(test)]
mod testing;

pub use batch::{BatchCoordinator, BatchProgress, BatchResult, BatchStats, SilentProgress};
pub use cache::{CacheStore, ComputeGuard, OperationKey, Slot};
pub use collaborators::{ContentExtractor, HtmlExtractor, LanguageModel, PageFetcher, PageRenderer};
pub use io::{load_records, save_outcomes};
pub use lint::{BlessedTags, LintReport};
pub use liveness::LivenessResolver;
pub use llm::LlmClient;
pub use pipeline::{RecordPipeline, Stage};
pub use runner::{OperationClass, OperationRunner, Operations};
