// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine: orchestrates a single rule execution.
//!
//! One [`ReplicationEngine`] drives one [`Execution`](crate::execution::Execution)
//! through its phases:
//!
//! 1. **Preflight**: ping both endpoints; ensure the target project
//!    exists (created public-by-default when absent, 409 counts as
//!    success). Failures here are terminal for the rule.
//! 2. **Enumerate**: the rule's repository, or every repository of the
//!    source project.
//! 3. **Plan**: walk manifests per tag, dedupe blobs per
//!    `(target repository, digest)` so every target namespace receives
//!    the blobs its own manifests reference.
//! 4. **Copy**: one [`BlobCopyTask`] per planned blob through a bounded
//!    [`WorkerPool`]; a blob failure is recorded and the rule continues.
//! 5. **Push**: per tag, children first (under digest references), then
//!    the tag manifest, raw bytes verbatim. A tag with any failed blob is
//!    not pushed: every blob a pushed manifest references must already be
//!    on the target.
//! 6. **Summarize**: `success` iff nothing failed.
//!
//! Cancellation flows through a `watch` channel: every phase boundary,
//! pool worker, and retry sleep observes it.
//!
//! For a given tag all blobs strictly precede its manifest, and all child
//! manifests strictly precede the index. Across tags, order is
//! unspecified.

mod plan;

use crate::config::{GlobalSettings, RegistryEndpoint, ReplicationRule};
use crate::error::{ReplicationError, Result};
use crate::events::{EngineEvent, EventBus, ProgressPhase};
use crate::execution::ExecutionCounters;
use crate::filter::TagFilter;
use crate::metrics;
use crate::pool::{Task, WorkerPool};
use crate::registry::{copy_blob, RegistryClient};
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::store::{BoxFuture, ExecutionLogger};
use plan::{build_plan, TagPlan};
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::watch;
use tracing::{info_span, Instrument};

/// Engine for one rule execution.
pub struct ReplicationEngine {
    rule: ReplicationRule,
    global: GlobalSettings,
    source: Arc<RegistryClient>,
    target: Arc<RegistryClient>,
    bus: EventBus,
    logger: ExecutionLogger,
    counters: Arc<ExecutionCounters>,
    execution_id: String,
}

impl ReplicationEngine {
    /// Build an engine for a rule and its two endpoints.
    ///
    /// Validates the rule and constructs both registry clients; any
    /// failure here is terminal before the execution even starts.
    pub fn new(
        rule: ReplicationRule,
        global: GlobalSettings,
        source_endpoint: &RegistryEndpoint,
        target_endpoint: &RegistryEndpoint,
        bus: EventBus,
        logger: ExecutionLogger,
    ) -> Result<Self> {
        rule.validate()?;
        let source = Arc::new(RegistryClient::new(source_endpoint)?);
        let target = Arc::new(RegistryClient::new(target_endpoint)?);
        let execution_id = logger.execution_id().to_string();

        Ok(Self {
            rule,
            global,
            source,
            target,
            bus,
            logger,
            counters: Arc::new(ExecutionCounters::new()),
            execution_id,
        })
    }

    /// Shared progress counters for this execution.
    pub fn counters(&self) -> Arc<ExecutionCounters> {
        Arc::clone(&self.counters)
    }

    /// Run the execution to completion or cancellation.
    pub async fn run(&self, cancel_rx: watch::Receiver<bool>) -> Result<()> {
        let span = info_span!(
            "execution",
            rule = %self.rule.name,
            execution_id = %self.execution_id
        );
        self.run_inner(cancel_rx).instrument(span).await
    }

    async fn run_inner(&self, cancel_rx: watch::Receiver<bool>) -> Result<()> {
        metrics::record_execution_started(&self.rule.name);
        self.logger
            .info(format!(
                "Starting replication {} -> {}",
                self.source.base_url(),
                self.target.base_url()
            ))
            .await;

        // Phase 1: preflight.
        if let Err(e) = self.source.ping().await {
            self.logger
                .error(format!("source registry unreachable: {}", e))
                .await;
            return Err(e);
        }
        if let Err(e) = self.target.ping().await {
            self.logger
                .error(format!("target registry unreachable: {}", e))
                .await;
            return Err(e);
        }
        self.ensure_target_project().await?;
        self.check_canceled(&cancel_rx)?;

        // Phase 2: enumerate repositories.
        let repositories = match &self.rule.source.repository {
            Some(repo) => vec![repo.clone()],
            None => match self.source.list_repositories(&self.rule.source.project).await {
                Ok(repos) => {
                    self.logger
                        .info(format!(
                            "project {} has {} repositories",
                            self.rule.source.project,
                            repos.len()
                        ))
                        .await;
                    repos
                }
                Err(e) => {
                    self.logger
                        .error(format!(
                            "failed to list repositories of {}: {}",
                            self.rule.source.project, e
                        ))
                        .await;
                    return Err(e);
                }
            },
        };

        // Phases 3-4: plan.
        let filter = TagFilter::from_rules(&self.rule.tags)?;
        let plan = build_plan(
            &self.source,
            &self.rule,
            &repositories,
            &filter,
            &self.logger,
            &cancel_rx,
        )
        .await?;

        self.counters.set_total(plan.blobs.len() as u64);
        metrics::record_plan(&self.rule.name, plan.tags.len(), plan.blobs.len());
        self.logger
            .info(format!(
                "Plan ready: {} repositories, {} tags, {} blobs",
                repositories.len(),
                plan.tags.len(),
                plan.blobs.len()
            ))
            .await;
        self.publish_progress(ProgressPhase::Manifest, None);
        self.check_canceled(&cancel_rx)?;

        // Phase 5: copy blobs.
        // Failures are keyed by (target repo, digest): a digest that
        // failed in one namespace may well have landed in another.
        let failed_digests: Arc<StdMutex<HashSet<(String, String)>>> = Arc::default();
        let retry = self.global.retry.retry_config();
        let mut pool = WorkerPool::new(self.global.concurrency, cancel_rx.clone());

        for blob in &plan.blobs {
            let task = BlobCopyTask {
                source: Arc::clone(&self.source),
                target: Arc::clone(&self.target),
                rule: self.rule.name.clone(),
                execution_id: self.execution_id.clone(),
                source_repo: blob.source_repo.clone(),
                target_repo: blob.target_repo.clone(),
                digest: blob.digest.clone(),
                size: blob.size,
                retry: retry.clone(),
                counters: Arc::clone(&self.counters),
                failed: Arc::clone(&failed_digests),
                bus: self.bus.clone(),
            };
            pool.submit(Arc::new(task)).await?;
        }

        match pool.wait().await {
            // Per-blob failures were recorded by the tasks; the push phase
            // decides which tags they veto.
            Ok(()) | Err(ReplicationError::Pool { .. }) => {}
            Err(e) => return Err(e),
        }
        self.check_canceled(&cancel_rx)?;

        // Phase 6: push manifests, children before their index.
        let failed: HashSet<(String, String)> = failed_digests
            .lock()
            .expect("failed digest lock poisoned")
            .clone();
        let mut failed_tags = 0u64;

        for tag_plan in &plan.tags {
            self.check_canceled(&cancel_rx)?;

            if let Some(bad) = tag_plan
                .blob_digests
                .iter()
                .find(|d| failed.contains(&(tag_plan.target_repo.clone(), (*d).clone())))
            {
                self.logger
                    .error(format!(
                        "not pushing manifest {}:{}: blob {} failed",
                        tag_plan.target_repo, tag_plan.tag, bad
                    ))
                    .await;
                failed_tags += 1;
                continue;
            }

            if let Err(e) = self.push_tag(tag_plan).await {
                self.logger
                    .error(format!(
                        "failed to push manifest {}:{}: {}",
                        tag_plan.target_repo, tag_plan.tag, e
                    ))
                    .await;
                metrics::record_manifest_push_failed(&self.rule.name);
                failed_tags += 1;
                continue;
            }

            self.logger
                .info(format!("tag {}:{} replicated", tag_plan.target_repo, tag_plan.tag))
                .await;
        }

        // Phase 7: summarize.
        self.publish_progress(ProgressPhase::Complete, None);
        let failed_blobs = self.counters.failed();
        if failed_blobs > 0 || failed_tags > 0 {
            self.logger
                .error(format!(
                    "replication finished with {} failed blob(s), {} failed tag(s)",
                    failed_blobs, failed_tags
                ))
                .await;
            return Err(ReplicationError::Incomplete {
                failed_blobs,
                failed_tags,
            });
        }

        let snapshot = self.counters.snapshot();
        self.logger
            .info(format!(
                "replication complete: {} synced ({} skipped), {} bytes",
                snapshot.synced_blobs, snapshot.skipped_blobs, snapshot.bytes_synced
            ))
            .await;
        Ok(())
    }

    /// Ensure the target project exists, creating it (public) when absent.
    ///
    /// An existence check failure is tolerated with a note: the target may
    /// not be a Harbor and vanilla registries create namespaces on push.
    /// A failed creation, however, is terminal.
    async fn ensure_target_project(&self) -> Result<()> {
        let project = &self.rule.target.project;
        match self.target.project_exists(project).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.logger
                    .info(format!("target project {} missing, creating", project))
                    .await;
                if let Err(e) = self.target.create_project(project, true).await {
                    self.logger
                        .error(format!("failed to create target project {}: {}", project, e))
                        .await;
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => {
                self.logger
                    .info(format!(
                        "cannot check target project {} (not a Harbor?): {}",
                        project, e
                    ))
                    .await;
                Ok(())
            }
        }
    }

    /// Push one tag: children under their digests, then the tag manifest.
    async fn push_tag(&self, tag_plan: &TagPlan) -> Result<()> {
        for child in &tag_plan.children {
            self.target
                .put_manifest(&tag_plan.target_repo, &child.digest, &child.manifest)
                .await?;
        }
        self.target
            .put_manifest(&tag_plan.target_repo, &tag_plan.tag, &tag_plan.manifest)
            .await?;
        Ok(())
    }

    fn publish_progress(&self, phase: ProgressPhase, current: Option<String>) {
        self.bus.publish(EngineEvent::Progress {
            execution_id: self.execution_id.clone(),
            rule: self.rule.name.clone(),
            phase,
            counters: self.counters.snapshot(),
            current,
        });
    }

    fn check_canceled(&self, cancel_rx: &watch::Receiver<bool>) -> Result<()> {
        if *cancel_rx.borrow() {
            Err(ReplicationError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// First 12 hex characters of a digest, for log lines.
fn short_digest(digest: &str) -> &str {
    digest.get(..19).unwrap_or(digest)
}

/// One blob transfer through the pool.
///
/// Fast paths in order: already present on the target (skipped), same-repo
/// mount (some registries treat it as "already have it"), then the
/// retry-wrapped streaming copy.
struct BlobCopyTask {
    source: Arc<RegistryClient>,
    target: Arc<RegistryClient>,
    rule: String,
    execution_id: String,
    source_repo: String,
    target_repo: String,
    digest: String,
    size: u64,
    retry: RetryConfig,
    counters: Arc<ExecutionCounters>,
    failed: Arc<StdMutex<HashSet<(String, String)>>>,
    bus: EventBus,
}

impl BlobCopyTask {
    fn publish(&self) {
        self.bus.publish(EngineEvent::Progress {
            execution_id: self.execution_id.clone(),
            rule: self.rule.clone(),
            phase: ProgressPhase::Blob,
            counters: self.counters.snapshot(),
            current: Some(self.digest.clone()),
        });
    }

    fn mark_failed(&self) {
        self.counters.record_failed();
        metrics::record_blob_failed(&self.rule);
        self.failed
            .lock()
            .expect("failed digest lock poisoned")
            .insert((self.target_repo.clone(), self.digest.clone()));
        self.publish();
    }
}

impl Task for BlobCopyTask {
    fn execute(&self, cancel: watch::Receiver<bool>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if *cancel.borrow() {
                return Err(ReplicationError::Canceled);
            }

            match self.target.blob_exists(&self.target_repo, &self.digest).await {
                Ok((true, _)) => {
                    self.counters.record_skipped();
                    metrics::record_blob_skipped(&self.rule);
                    self.publish();
                    return Ok(());
                }
                Ok((false, _)) => {}
                Err(e) => {
                    self.mark_failed();
                    return Err(e);
                }
            }

            if let Ok(true) = self
                .target
                .mount_blob(&self.target_repo, &self.target_repo, &self.digest)
                .await
            {
                self.counters.record_mounted();
                metrics::record_blob_mounted(&self.rule);
                self.publish();
                return Ok(());
            }

            let operation = format!("copy blob {}", short_digest(&self.digest));
            let result = retry_with_backoff(&self.retry, cancel, &operation, || {
                copy_blob(
                    &self.source,
                    &self.target,
                    &self.source_repo,
                    &self.target_repo,
                    &self.digest,
                    self.size,
                )
            })
            .await;

            match result {
                Ok(()) => {
                    self.counters.record_copied(self.size);
                    metrics::record_blob_copied(&self.rule, self.size);
                    self.publish();
                    Ok(())
                }
                Err(ReplicationError::Canceled) => Err(ReplicationError::Canceled),
                Err(e) => {
                    self.mark_failed();
                    Err(e)
                }
            }
        })
    }

    fn description(&self) -> String {
        format!("copy blob {}", short_digest(&self.digest))
    }
}
