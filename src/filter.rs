//! Tag filtering.
//!
//! A [`TagFilter`] decides which tags of a repository take part in a
//! replication. The algebra, in order:
//!
//! 1. Drop tags matching any exclude regex (exclude wins).
//! 2. If include regexes exist, keep only tags matching at least one.
//! 3. Sort by updated time, newest first (tag name descending breaks ties,
//!    keeping the output deterministic).
//! 4. With `latest > 0`, truncate to the newest N.
//!
//! # Timestamp caveat
//!
//! The v2 tag listing carries no timestamps, so callers on pure-v2
//! registries stamp every tag with "now". Under that substitution the sort
//! is decided purely by the name tie-breaker and `latest-N` degrades to
//! "the N lexicographically last tags" rather than the N most recently
//! pushed. Registries with a metadata API (Harbor) can feed real
//! timestamps and get true latest-N semantics.

use crate::config::TagRules;
use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;

/// A tag name paired with its last-updated time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub name: String,
    pub updated: DateTime<Utc>,
}

impl TagInfo {
    /// Pair a tag with an update time.
    pub fn new(name: impl Into<String>, updated: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            updated,
        }
    }

    /// A tag stamped with the current time.
    ///
    /// Used when the registry exposes no per-tag timestamps; see the
    /// module docs for what that does to `latest-N`.
    pub fn now(name: impl Into<String>) -> Self {
        Self::new(name, Utc::now())
    }
}

/// Compiled tag selection rules.
#[derive(Debug)]
pub struct TagFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    latest: usize,
}

impl TagFilter {
    /// Compile a filter from pattern strings.
    ///
    /// Compilation failures are terminal configuration errors.
    pub fn new(include: &[String], exclude: &[String], latest: usize) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        ReplicationError::Config(format!("invalid tag pattern {:?}: {}", p, e))
                    })
                })
                .collect()
        };

        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            latest,
        })
    }

    /// Compile a filter from rule configuration.
    pub fn from_rules(rules: &TagRules) -> Result<Self> {
        Self::new(&rules.include, &rules.exclude, rules.latest)
    }

    /// Check a single tag against include/exclude patterns.
    pub fn matches(&self, tag: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(tag)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.iter().any(|re| re.is_match(tag))
    }

    /// Apply the full pipeline and return the surviving tag names,
    /// newest first.
    pub fn apply(&self, tags: Vec<TagInfo>) -> Vec<String> {
        let mut matched: Vec<TagInfo> = tags.into_iter().filter(|t| self.matches(&t.name)).collect();

        matched.sort_by(|a, b| {
            b.updated
                .cmp(&a.updated)
                .then_with(|| b.name.cmp(&a.name))
        });

        if self.latest > 0 && matched.len() > self.latest {
            matched.truncate(self.latest);
        }

        matched.into_iter().map(|t| t.name).collect()
    }
}
