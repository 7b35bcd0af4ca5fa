// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication planning: walk the manifest graph, decide what to copy.
//!
//! For every `(repository, tag)` pair the planner fetches and retains the
//! manifest (raw bytes included). Manifest lists recurse one level into
//! their children, filtered by the rule's architecture allow-list. The
//! resulting blob set is deduplicated by `(target repository, digest)`:
//! a base layer shared by fifty tags of one repository is copied once,
//! but a digest referenced from two different repositories is planned
//! once per target repository. Blobs live in per-repository namespaces
//! on the target, and every manifest pushed there must find its blobs in
//! its own namespace.
//!
//! Enumeration errors are tolerated: a repository whose tag listing fails
//! or a tag whose manifest cannot be fetched is logged and skipped; the
//! rule carries on. The manifest graph is a DAG rooted at a tag, so the
//! walk terminates without cycle bookkeeping.

use crate::config::ReplicationRule;
use crate::error::{ReplicationError, Result};
use crate::filter::{TagFilter, TagInfo};
use crate::registry::{filter_entries_by_arch, Manifest, RegistryClient};
use crate::store::ExecutionLogger;
use std::collections::HashSet;
use tokio::sync::watch;
use tracing::debug;

/// A child manifest of an index tag, pushed under its digest reference.
pub(crate) struct ChildManifest {
    pub digest: String,
    pub manifest: Manifest,
}

/// Everything needed to finish one tag after its blobs are on the target.
pub(crate) struct TagPlan {
    pub source_repo: String,
    pub target_repo: String,
    pub tag: String,
    /// The manifest to push under the tag (index or single image),
    /// byte-for-byte as fetched.
    pub manifest: Manifest,
    /// Children of an index tag, pushed before the index itself.
    pub children: Vec<ChildManifest>,
    /// Digests this tag depends on; a failure in any of them vetoes the
    /// manifest push.
    pub blob_digests: Vec<String>,
}

/// One planned blob transfer into one target repository.
///
/// The same digest appears once per target repository that references
/// it; within a repository, the first tag that mentioned it wins.
pub(crate) struct BlobPlan {
    pub digest: String,
    pub size: u64,
    pub source_repo: String,
    pub target_repo: String,
}

/// The full plan for one execution.
pub(crate) struct ReplicationPlan {
    pub tags: Vec<TagPlan>,
    pub blobs: Vec<BlobPlan>,
}

/// Walk the manifest graph for all repositories and build the plan.
pub(crate) async fn build_plan(
    source: &RegistryClient,
    rule: &ReplicationRule,
    repositories: &[String],
    filter: &TagFilter,
    logger: &ExecutionLogger,
    cancel_rx: &watch::Receiver<bool>,
) -> Result<ReplicationPlan> {
    let mut plan = ReplicationPlan {
        tags: Vec::new(),
        blobs: Vec::new(),
    };
    let mut seen = HashSet::new();

    for repo in repositories {
        if *cancel_rx.borrow() {
            return Err(ReplicationError::Canceled);
        }

        let source_repo = rule.source_repo_path(repo);
        let target_repo = rule.target_repo_path(repo);

        let tags = match source.list_tags(&source_repo).await {
            Ok(tags) => tags,
            Err(e) => {
                logger
                    .error(format!("failed to list tags for {}: {}", source_repo, e))
                    .await;
                continue;
            }
        };

        // The v2 tag listing has no timestamps; every tag gets "now",
        // which reduces latest-N to the name tie-breaker (see filter docs).
        let tag_infos: Vec<TagInfo> = tags.into_iter().map(TagInfo::now).collect();
        let selected = filter.apply(tag_infos);
        debug!(repo = %source_repo, selected = selected.len(), "Tags selected");

        for tag in selected {
            if *cancel_rx.borrow() {
                return Err(ReplicationError::Canceled);
            }

            match plan_tag(source, rule, &source_repo, &target_repo, &tag).await {
                Ok(Some(tag_plan)) => {
                    for (digest, size) in referenced_blobs(&tag_plan) {
                        if seen.insert((target_repo.clone(), digest.clone())) {
                            plan.blobs.push(BlobPlan {
                                digest,
                                size,
                                source_repo: source_repo.clone(),
                                target_repo: target_repo.clone(),
                            });
                        }
                    }
                    plan.tags.push(tag_plan);
                }
                Ok(None) => {
                    logger
                        .warn(format!(
                            "tag {}:{} has no manifests matching the architecture allow-list, skipping",
                            source_repo, tag
                        ))
                        .await;
                }
                Err(e) => {
                    logger
                        .error(format!("failed to plan tag {}:{}: {}", source_repo, tag, e))
                        .await;
                }
            }
        }
    }

    Ok(plan)
}

/// Fetch and retain the manifests for one tag.
///
/// `Ok(None)` means the architecture allow-list filtered every child of
/// an index away; fetch and protocol errors are terminal for the tag.
async fn plan_tag(
    source: &RegistryClient,
    rule: &ReplicationRule,
    source_repo: &str,
    target_repo: &str,
    tag: &str,
) -> Result<Option<TagPlan>> {
    let manifest = source.get_manifest(source_repo, tag).await?;

    let mut children = Vec::new();
    let mut blob_digests = Vec::new();

    if manifest.is_manifest_list() {
        let entries = filter_entries_by_arch(&manifest.manifests, &rule.architectures);
        if entries.is_empty() {
            return Ok(None);
        }
        for entry in entries {
            let child = source.get_manifest(source_repo, &entry.digest).await?;
            blob_digests.extend(child.all_blobs().into_iter().map(|d| d.digest));
            children.push(ChildManifest {
                digest: entry.digest,
                manifest: child,
            });
        }
    } else {
        blob_digests.extend(manifest.all_blobs().into_iter().map(|d| d.digest));
    }

    blob_digests.sort();
    blob_digests.dedup();

    Ok(Some(TagPlan {
        source_repo: source_repo.to_string(),
        target_repo: target_repo.to_string(),
        tag: tag.to_string(),
        manifest,
        children,
        blob_digests,
    }))
}

/// All `(digest, size)` pairs a tag plan references.
fn referenced_blobs(tag_plan: &TagPlan) -> Vec<(String, u64)> {
    let mut blobs = Vec::new();
    if tag_plan.children.is_empty() {
        for d in tag_plan.manifest.all_blobs() {
            blobs.push((d.digest, d.size));
        }
    } else {
        for child in &tag_plan.children {
            for d in child.manifest.all_blobs() {
                blobs.push((d.digest, d.size));
            }
        }
    }
    blobs
}
