//! Configuration for the replication engine.
//!
//! This module defines all configuration types needed to run replications.
//! Configuration is passed to the [`Scheduler`](crate::scheduler::Scheduler)
//! and [`ReplicationEngine`](crate::engine::ReplicationEngine) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use registry_replicator::config::{ReplicationRule, RegistryEndpoint};
//!
//! let source = RegistryEndpoint::for_testing("dockerhub", "https://registry-1.docker.io");
//! let target = RegistryEndpoint::for_testing("harbor", "https://harbor.internal");
//!
//! let rule = ReplicationRule::for_testing("nginx-mirror", "dockerhub", "harbor");
//! assert!(rule.validate().is_ok());
//! # let _ = (source, target);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! GlobalSettings
//! ├── concurrency: usize           # blob copy workers per execution
//! └── retry: RetrySettings         # backoff policy for transfers
//!
//! RegistryEndpoint                 # one per registry, referenced by name
//! ├── url / username / password
//! ├── insecure: bool               # skip TLS verification
//! └── qps: u32                     # token-bucket cap, 0 = unlimited
//!
//! ReplicationRule                  # one per mirroring relationship
//! ├── source / target: RuleTarget  # registry ref + project [+ repository]
//! ├── tags: TagRules               # include/exclude regexes, latest-N
//! ├── architectures: Vec<String>   # allow-list for manifest lists
//! ├── cron: String                 # empty = on-demand only
//! └── notify: NotifySettings       # consumed by the notification plane
//! ```

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// GlobalSettings: engine-wide tunables
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine-wide settings shared by every execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Number of concurrent blob copies per execution.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry policy applied to blob transfers.
    #[serde(default)]
    pub retry: RetrySettings,
}

fn default_concurrency() -> usize {
    3
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry: RetrySettings::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetrySettings: serializable retry policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry policy as it appears in configuration.
///
/// Intervals are duration strings (`"1s"`, `"500ms"`, `"2min"`); use
/// [`retry_config()`](Self::retry_config) for the parsed form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum attempts per operation (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Delay before the first retry.
    #[serde(default = "default_initial_interval")]
    pub initial_interval: String,

    /// Ceiling for the exponential backoff.
    #[serde(default = "default_max_interval")]
    pub max_interval: String,
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_interval() -> String {
    "1s".to_string()
}

fn default_max_interval() -> String {
    "30s".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: "1s".to_string(),
            max_interval: "30s".to_string(),
        }
    }
}

impl RetrySettings {
    /// Parse into the runtime retry policy.
    ///
    /// Unparseable interval strings fall back to the defaults.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: humantime::parse_duration(&self.initial_interval)
                .unwrap_or(Duration::from_secs(1)),
            max_delay: humantime::parse_duration(&self.max_interval)
                .unwrap_or(Duration::from_secs(30)),
            backoff_factor: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RegistryEndpoint: one entry per registry
// ═══════════════════════════════════════════════════════════════════════════════

/// A configured registry endpoint.
///
/// Endpoints are referenced by name from [`RuleTarget`] and treated as
/// immutable within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEndpoint {
    /// Unique endpoint name (for rule references and logging).
    pub name: String,

    /// Base URL. A missing scheme defaults to `https://`.
    pub url: String,

    /// Basic-auth username. `None` means anonymous.
    #[serde(default)]
    pub username: Option<String>,

    /// Basic-auth password or robot-account secret.
    #[serde(default)]
    pub password: Option<String>,

    /// Skip TLS certificate verification (self-signed lab registries).
    #[serde(default)]
    pub insecure: bool,

    /// Outbound request cap in queries per second. `0` disables the gate.
    #[serde(default)]
    pub qps: u32,
}

impl RegistryEndpoint {
    /// The endpoint URL with scheme defaulting and trailing slash trimmed.
    pub fn normalized_url(&self) -> String {
        normalize_registry_url(&self.url)
    }

    /// Whether basic credentials are configured.
    pub fn has_credentials(&self) -> bool {
        matches!(&self.username, Some(u) if !u.is_empty())
    }

    /// Create an anonymous endpoint for testing.
    pub fn for_testing(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            username: None,
            password: None,
            insecure: false,
            qps: 0,
        }
    }
}

/// Normalize a registry URL: trim trailing slashes, default to `https://`.
pub fn normalize_registry_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationRule: one entry per mirroring relationship
// ═══════════════════════════════════════════════════════════════════════════════

/// One side of a replication rule: a registry reference plus a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTarget {
    /// Name of the [`RegistryEndpoint`] to use.
    pub registry: String,

    /// Project (Harbor) or first path segment (vanilla v2).
    pub project: String,

    /// Repository within the project. `None` on the source side means
    /// "the whole project"; `None` on the target side means "mirror the
    /// source repository name".
    #[serde(default)]
    pub repository: Option<String>,
}

/// Tag selection rules. See [`crate::filter::TagFilter`] for the algebra.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagRules {
    /// Keep only tags matching at least one of these regexes (empty = all).
    #[serde(default)]
    pub include: Vec<String>,

    /// Drop tags matching any of these regexes. Wins over include.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// After filtering and sorting, keep only the newest N tags (0 = all).
    #[serde(default)]
    pub latest: usize,
}

/// When to notify about finished executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyCondition {
    /// Notify about every terminal execution.
    #[default]
    All,
    /// Notify only when the execution failed.
    Failed,
}

/// Notification wiring for a rule.
///
/// The engine only carries this data; delivery belongs to the
/// notification plane consuming the event stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifySettings {
    /// Whether to notify at all.
    #[serde(default)]
    pub enabled: bool,

    /// Condition gating the notification.
    #[serde(default)]
    pub condition: NotifyCondition,

    /// Channel identifiers understood by the notification plane.
    #[serde(default)]
    pub channels: Vec<String>,
}

/// A declarative replication rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationRule {
    /// Unique rule name.
    pub name: String,

    /// Where to copy from.
    pub source: RuleTarget,

    /// Where to copy to.
    pub target: RuleTarget,

    /// Tag selection.
    #[serde(default)]
    pub tags: TagRules,

    /// Architecture allow-list for manifest lists (empty = all).
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Standard 5-field cron expression. Empty = trigger only on demand.
    #[serde(default)]
    pub cron: String,

    /// Disabled rules are skipped by the scheduler.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Notification wiring.
    #[serde(default)]
    pub notify: NotifySettings,

    /// Last modification time; bumped by the management plane on edits.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl ReplicationRule {
    /// Full source repository path for a repository name.
    pub fn source_repo_path(&self, repo: &str) -> String {
        format!("{}/{}", self.source.project, repo)
    }

    /// Full target repository path, honoring the target repository
    /// override (falls back to mirroring the source repository name).
    pub fn target_repo_path(&self, source_repo: &str) -> String {
        let repo = self.target.repository.as_deref().unwrap_or(source_repo);
        format!("{}/{}", self.target.project, repo)
    }

    /// Validate the rule: names, regexes, and the cron expression.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ReplicationError::Config("rule name is required".into()));
        }
        if self.source.registry.is_empty() || self.target.registry.is_empty() {
            return Err(ReplicationError::Config(format!(
                "rule {}: source and target registry references are required",
                self.name
            )));
        }
        if self.source.project.is_empty() || self.target.project.is_empty() {
            return Err(ReplicationError::Config(format!(
                "rule {}: source and target projects are required",
                self.name
            )));
        }
        for pattern in self.tags.include.iter().chain(self.tags.exclude.iter()) {
            regex::Regex::new(pattern).map_err(|e| {
                ReplicationError::Config(format!(
                    "rule {}: invalid tag pattern {:?}: {}",
                    self.name, pattern, e
                ))
            })?;
        }
        if !self.cron.is_empty() {
            crate::scheduler::parse_cron_expression(&self.cron).map_err(|e| {
                ReplicationError::Config(format!(
                    "rule {}: invalid cron expression {:?}: {}",
                    self.name, self.cron, e
                ))
            })?;
        }
        Ok(())
    }

    /// Create a minimal single-repository rule for testing.
    pub fn for_testing(name: &str, source_registry: &str, target_registry: &str) -> Self {
        Self {
            name: name.to_string(),
            source: RuleTarget {
                registry: source_registry.to_string(),
                project: "library".to_string(),
                repository: Some("nginx".to_string()),
            },
            target: RuleTarget {
                registry: target_registry.to_string(),
                project: "mirror".to_string(),
                repository: None,
            },
            tags: TagRules::default(),
            architectures: Vec::new(),
            cron: String::new(),
            enabled: true,
            notify: NotifySettings::default(),
            updated_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
