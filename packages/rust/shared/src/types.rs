//! Core domain types for bookmark processing.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RecordId
// ---------------------------------------------------------------------------

/// Identity of one input record: its `hash` when present, otherwise its input position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Identity for a record without a usable `hash`.
    pub fn from_index(index: usize) -> Self {
        Self(format!("#{index}"))
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for batch-run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// TagSet
// ---------------------------------------------------------------------------

/// Insertion-ordered set of tags.
///
/// Deserializes from either a whitespace-delimited string or a list of strings and
/// always serializes back to the space-delimited string form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct TagSet(Vec<String>);

impl TagSet {
    /// Split a delimited tag string.
    pub fn parse(raw: &str) -> Self {
        raw.split_whitespace().collect()
    }

    /// Add a tag. Returns `false` when it was already present.
    pub fn insert(&mut self, tag: impl Into<String>) -> bool {
        let tag = tag.into();
        if tag.is_empty() || self.contains(&tag) {
            return false;
        }
        self.0.push(tag);
        true
    }

    /// Set union in place; existing tags keep their position.
    pub fn extend<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            self.insert(tag);
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Space-delimited form used in output files.
    pub fn to_delimited(&self) -> String {
        self.0.join(" ")
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::default();
        set.extend(iter);
        set
    }
}

impl<'de> Deserialize<'de> for TagSet {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        /// Tags as they appear on the wire: a whitespace-delimited string or a list.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawTags {
            Text(String),
            List(Vec<String>),
            Null(()),
        }

        Ok(match RawTags::deserialize(deserializer)? {
            RawTags::Text(text) => Self::parse(&text),
            RawTags::List(list) => list
                .iter()
                .flat_map(|item| item.split_whitespace())
                .collect(),
            RawTags::Null(()) => Self::default(),
        })
    }
}

impl From<TagSet> for String {
    fn from(tags: TagSet) -> Self {
        tags.to_delimited()
    }
}

// ---------------------------------------------------------------------------
// TextField
// ---------------------------------------------------------------------------

/// An optional string field as it appeared in the input.
///
/// Exports mix missing keys, explicit `null`s and strings for the same field;
/// each form is written back the way it was read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TextField {
    #[default]
    Missing,
    Null,
    Text(String),
}

impl TextField {
    /// The string value; missing and null read as empty.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Missing | Self::Null => "",
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn is_blank(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl From<String> for TextField {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for TextField {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl PartialEq<&str> for TextField {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl std::fmt::Display for TextField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TextField {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Text(text) => serializer.serialize_str(text),
            Self::Missing | Self::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for TextField {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<String>::deserialize(deserializer)? {
            Some(text) => Self::Text(text),
            None => Self::Null,
        })
    }
}

// ---------------------------------------------------------------------------
// Bookmark
// ---------------------------------------------------------------------------

/// One bookmark record in Pinboard export shape.
///
/// Fields the processor does not touch (`meta`, `time`, `shared`, `toread`, ...)
/// are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    /// Bookmarked URL.
    pub href: String,
    /// Title.
    #[serde(default, skip_serializing_if = "TextField::is_missing")]
    pub description: TextField,
    /// Free-text notes; an existing value is treated as authoritative.
    #[serde(default, skip_serializing_if = "TextField::is_missing")]
    pub extended: TextField,
    #[serde(default)]
    pub tags: TagSet,
    /// Stable record identity when present.
    #[serde(default, skip_serializing_if = "TextField::is_missing")]
    pub hash: TextField,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Bookmark {
    /// Record identity given its position in the input.
    pub fn identity(&self, index: usize) -> RecordId {
        match self.hash.as_str().trim() {
            "" => RecordId::from_index(index),
            hash => RecordId(hash.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Ordered liveness-check methods, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessMethod {
    /// HEAD request.
    Probe,
    /// Full GET.
    Fetch,
    /// Headless browser render.
    Render,
}

impl LivenessMethod {
    /// All methods in the order the resolver tries them.
    pub const ORDER: [LivenessMethod; 3] = [Self::Probe, Self::Fetch, Self::Render];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Fetch => "fetch",
            Self::Render => "render",
        }
    }
}

impl std::fmt::Display for LivenessMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    Live,
    Dead,
}

/// Terminal result of resolving one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub status: LivenessStatus,
    /// Method that succeeded; `None` on a dead verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<LivenessMethod>,
    /// URL after redirects (the input URL on a dead verdict).
    pub final_url: String,
    /// Terminal HTTP status of the successful stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Page body; absent for probe-only verdicts and dead verdicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasons from every failed stage, in order. Present only when dead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
}

impl LivenessVerdict {
    pub fn live(
        method: LivenessMethod,
        final_url: impl Into<String>,
        status_code: Option<u16>,
        content: Option<String>,
    ) -> Self {
        Self {
            status: LivenessStatus::Live,
            method: Some(method),
            final_url: final_url.into(),
            status_code,
            content,
            failure_detail: None,
        }
    }

    pub fn dead(url: impl Into<String>, failure_detail: impl Into<String>) -> Self {
        Self {
            status: LivenessStatus::Dead,
            method: None,
            final_url: url.into(),
            status_code: None,
            content: None,
            failure_detail: Some(failure_detail.into()),
        }
    }

    pub fn is_live(&self) -> bool {
        self.status == LivenessStatus::Live
    }
}

// ---------------------------------------------------------------------------
// RecordOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Processed,
    Failed,
}

/// Final result of one record's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub id: RecordId,
    /// Position of the record in the input.
    pub index: usize,
    /// The record, mutated by the pipeline when processed; as read when failed early.
    pub record: Bookmark,
    pub status: OutcomeStatus,
    /// Human-readable reason. Present only when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Liveness method that succeeded, if the record got that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<LivenessMethod>,
    /// Tags not in the blessed list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lint_warnings: Vec<String>,
}

impl RecordOutcome {
    pub fn processed(id: RecordId, index: usize, record: Bookmark) -> Self {
        Self {
            id,
            index,
            record,
            status: OutcomeStatus::Processed,
            failure_reason: None,
            method: None,
            lint_warnings: Vec::new(),
        }
    }

    pub fn failed(
        id: RecordId,
        index: usize,
        record: Bookmark,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id,
            index,
            record,
            status: OutcomeStatus::Failed,
            failure_reason: Some(reason.into()),
            method: None,
            lint_warnings: Vec::new(),
        }
    }

    pub fn is_processed(&self) -> bool {
        self.status == OutcomeStatus::Processed
    }
}

// ---------------------------------------------------------------------------
// BatchRun
// ---------------------------------------------------------------------------

/// One `run` invocation, stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: RunId,
    /// Input file the batch was read from.
    pub input_path: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Counts and duration, written when the run finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static TAG_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9:_\-]").expect("valid regex"));

/// Lower-case a raw tag and drop characters outside `[a-z0-9:_-]`.
/// Returns `None` when nothing usable remains.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let cleaned = TAG_DISALLOWED.replace_all(&lowered, "");
    let cleaned = cleaned.trim_matches(|c| c == '-' || c == ':');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Whether two URLs point at the same resource after parsing normalization
/// (scheme/host case, default port, empty path).
pub fn urls_equivalent(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}
