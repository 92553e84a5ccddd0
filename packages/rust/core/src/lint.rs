//! Tag lint against the blessed-tag list.
//!
//! Lint only annotates: unblessed tags are reported as warnings on the
//! outcome and never removed or blocking.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use bookmarks_shared::{BookmarkError, Result, TagSet};

/// Approved tags, one per line in the source file.
#[derive(Debug, Clone, Default)]
pub struct BlessedTags {
    tags: HashSet<String>,
}

/// Tags of one record that are not blessed, in record order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LintReport {
    pub unblessed: Vec<String>,
}

impl BlessedTags {
    /// Read the list. A missing file yields an empty list, which disables lint.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "blessed tag list not found, tag lint disabled");
                return Ok(Self::default());
            }
            Err(e) => return Err(BookmarkError::io(path, e)),
        };

        let blessed = Self::parse(&content);
        info!(path = %path.display(), count = blessed.len(), "loaded blessed tags");
        Ok(blessed)
    }

    /// Blank lines and `#` comments are ignored.
    pub fn parse(content: &str) -> Self {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Case-insensitive; the list is stored lower-cased.
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.contains(&tag.to_lowercase())
    }

    pub fn lint(&self, tags: &TagSet) -> LintReport {
        if self.is_empty() {
            return LintReport::default();
        }
        LintReport {
            unblessed: tags
                .iter()
                .filter(|tag| !self.contains(tag))
                .map(str::to_string)
                .collect(),
        }
    }
}

impl<S: AsRef<str>> FromIterator<S> for BlessedTags {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            tags: iter
                .into_iter()
                .map(|tag| tag.as_ref().to_lowercase())
                .collect(),
        }
    }
}
