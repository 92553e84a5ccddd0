//! Shared types, error model, and configuration for the bookmark processor.
//!
//! This crate is the foundation depended on by all other bookmark crates.
//! It provides:
//! - [`BookmarkError`] — the unified error type
//! - Domain types ([`Bookmark`], [`TagSet`], [`LivenessVerdict`], [`RecordOutcome`])
//! - Configuration ([`AppConfig`], [`RetryPolicy`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, Backoff, DefaultsConfig, HttpConfig, LlmConfig, RenderConfig, RetryConfig,
    RetryPolicy, RetryPolicyConfig, TagsConfig, config_dir, config_file_path, expand_home,
    init_config, init_config_at, load_config, load_config_from, resolve_api_key, validate_config,
};
pub use error::{BookmarkError, Result};
pub use types::{
    BatchRun, Bookmark, LivenessMethod, LivenessStatus, LivenessVerdict, OutcomeStatus,
    RecordId, RecordOutcome, RunId, TagSet, TextField, normalize_tag, urls_equivalent,
};
