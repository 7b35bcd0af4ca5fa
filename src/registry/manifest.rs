//! Manifest types and manifest/tag operations.
//!
//! A [`Manifest`] keeps its exact raw bytes from fetch to push:
//! re-serializing parsed JSON changes the content digest, and the digest
//! is the artifact's identity. The parsed view is advisory only.

use super::{error_body, RegistryClient, MANIFEST_ACCEPT_HEADER};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use bytes::Bytes;
use reqwest::Method;
use serde::Deserialize;

/// Default media type when a manifest carries none (older Docker pushes).
const DEFAULT_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Tag listing page size.
const TAG_PAGE_SIZE: usize = 100;

/// Platform triple attached to index entries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, rename = "os.version")]
    pub os_version: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
}

/// A content descriptor: how a manifest references a blob or a child
/// manifest. Identity is the digest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub size: u64,
    pub digest: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// A parsed manifest (single image or manifest list / index), paired with
/// the exact bytes the source registry returned.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    /// Config blob; absent on manifest lists.
    #[serde(default)]
    pub config: Option<Descriptor>,
    /// Ordered layer blobs; empty on manifest lists.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Child manifest entries; empty on single-image manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    /// The exact bytes from the wire. Pushed verbatim.
    #[serde(skip)]
    pub raw: Bytes,
    /// Canonical digest, from the `Docker-Content-Digest` response header.
    #[serde(skip)]
    pub content_digest: String,
}

impl Manifest {
    /// Whether this is a manifest list / image index.
    pub fn is_manifest_list(&self) -> bool {
        self.media_type.contains("manifest.list") || self.media_type.contains("image.index")
    }

    /// All blobs referenced directly: config plus layers, in order.
    pub fn all_blobs(&self) -> Vec<Descriptor> {
        let mut blobs = Vec::with_capacity(self.layers.len() + 1);
        if let Some(config) = &self.config {
            if !config.digest.is_empty() {
                blobs.push(config.clone());
            }
        }
        blobs.extend(self.layers.iter().cloned());
        blobs
    }

    /// Media type to announce when pushing this manifest.
    pub fn media_type_or_default(&self) -> &str {
        if self.media_type.is_empty() {
            DEFAULT_MANIFEST_MEDIA_TYPE
        } else {
            &self.media_type
        }
    }
}

/// Keep only index entries whose platform architecture is allow-listed.
/// An empty allow-list keeps everything.
pub fn filter_entries_by_arch(entries: &[Descriptor], architectures: &[String]) -> Vec<Descriptor> {
    if architectures.is_empty() {
        return entries.to_vec();
    }
    entries
        .iter()
        .filter(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| architectures.iter().any(|a| *a == p.architecture))
        })
        .cloned()
        .collect()
}

impl RegistryClient {
    /// Fetch a manifest by tag or digest, retaining the raw bytes and the
    /// server's canonical digest.
    pub async fn get_manifest(&self, repository: &str, reference: &str) -> Result<Manifest> {
        let path = format!("/v2/{}/manifests/{}", repository, reference);
        let resp = self
            .execute(
                "GetManifest",
                Method::GET,
                &path,
                None,
                &[("accept", MANIFEST_ACCEPT_HEADER)],
            )
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            return Err(ReplicationError::http("GetManifest", status, error_body(resp).await));
        }

        let content_digest = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                ReplicationError::Protocol(format!(
                    "manifest {}/{} response is missing Docker-Content-Digest",
                    repository, reference
                ))
            })?;

        let raw = resp
            .bytes()
            .await
            .map_err(|e| ReplicationError::network("GetManifest", e))?;

        let mut manifest: Manifest = serde_json::from_slice(&raw).map_err(|e| {
            ReplicationError::Protocol(format!(
                "malformed manifest JSON for {}:{}: {}",
                repository, reference, e
            ))
        })?;
        manifest.raw = raw;
        manifest.content_digest = content_digest;

        Ok(manifest)
    }

    /// Push a manifest under a tag or digest reference.
    ///
    /// The body is the retained raw bytes; returns the server-assigned
    /// digest (falling back to the `Location` header).
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        manifest: &Manifest,
    ) -> Result<String> {
        let path = format!("/v2/{}/manifests/{}", repository, reference);
        let media_type = manifest.media_type_or_default().to_owned();
        let resp = self
            .execute(
                "PutManifest",
                Method::PUT,
                &path,
                Some(manifest.raw.clone()),
                &[("content-type", media_type.as_str())],
            )
            .await?;

        let status = resp.status().as_u16();
        if status != 201 && status != 200 {
            return Err(ReplicationError::http("PutManifest", status, error_body(resp).await));
        }

        metrics::record_manifest_pushed(self.name());
        let digest = resp
            .headers()
            .get("docker-content-digest")
            .or_else(|| resp.headers().get("location"))
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(digest)
    }

    /// Check whether a manifest exists without fetching it.
    pub async fn head_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<(bool, Option<String>)> {
        let path = format!("/v2/{}/manifests/{}", repository, reference);
        let resp = self
            .execute(
                "HeadManifest",
                Method::HEAD,
                &path,
                None,
                &[("accept", MANIFEST_ACCEPT_HEADER)],
            )
            .await?;

        match resp.status().as_u16() {
            200 => {
                let digest = resp
                    .headers()
                    .get("docker-content-digest")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                Ok((true, digest))
            }
            404 => Ok((false, None)),
            status => Err(ReplicationError::http("HeadManifest", status, error_body(resp).await)),
        }
    }

    /// List all tags of a repository, paging through `?n=…&last=…`.
    ///
    /// An empty repository yields an empty list.
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let mut all = Vec::new();
        let mut last: Option<String> = None;
        loop {
            let path = match &last {
                None => format!("/v2/{}/tags/list?n={}", repository, TAG_PAGE_SIZE),
                Some(last) => format!("/v2/{}/tags/list?n={}&last={}", repository, TAG_PAGE_SIZE, last),
            };
            let resp = self.execute("ListTags", Method::GET, &path, None, &[]).await?;
            let status = resp.status().as_u16();
            if status != 200 {
                return Err(ReplicationError::http("ListTags", status, error_body(resp).await));
            }

            let page: TagList = resp
                .json()
                .await
                .map_err(|e| ReplicationError::Protocol(format!("malformed tag list: {}", e)))?;
            let page = page.tags.unwrap_or_default();
            let count = page.len();
            let page_last = page.last().cloned();

            // No progress means the server ignores `last`; stop rather
            // than appending the same page forever.
            if page_last == last {
                break;
            }
            all.extend(page);

            if count < TAG_PAGE_SIZE {
                break;
            }
            last = page_last;
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 7023,
            "digest": "sha256:aaa0000000000000000000000000000000000000000000000000000000000000"
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 12345678,
                "digest": "sha256:bbb0000000000000000000000000000000000000000000000000000000000000"
            }
        ]
    }"#;

    const INDEX_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 1024,
                "digest": "sha256:ccc0000000000000000000000000000000000000000000000000000000000000",
                "platform": {"architecture": "amd64", "os": "linux"}
            },
            {
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "size": 1025,
                "digest": "sha256:ddd0000000000000000000000000000000000000000000000000000000000000",
                "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
            }
        ]
    }"#;

    fn parse(raw: &str) -> Manifest {
        let mut m: Manifest = serde_json::from_str(raw).unwrap();
        m.raw = Bytes::copy_from_slice(raw.as_bytes());
        m
    }

    #[test]
    fn test_parse_image_manifest() {
        let m = parse(IMAGE_MANIFEST);
        assert_eq!(m.schema_version, 2);
        assert!(!m.is_manifest_list());
        assert_eq!(m.layers.len(), 1);
        assert_eq!(m.layers[0].size, 12_345_678);
        assert!(m.config.is_some());
    }

    #[test]
    fn test_all_blobs_config_first() {
        let m = parse(IMAGE_MANIFEST);
        let blobs = m.all_blobs();
        assert_eq!(blobs.len(), 2);
        assert!(blobs[0].digest.starts_with("sha256:aaa"));
        assert!(blobs[1].digest.starts_with("sha256:bbb"));
    }

    #[test]
    fn test_parse_index() {
        let m = parse(INDEX_MANIFEST);
        assert!(m.is_manifest_list());
        assert!(m.all_blobs().is_empty());
        assert_eq!(m.manifests.len(), 2);
        assert_eq!(
            m.manifests[1].platform.as_ref().unwrap().variant.as_deref(),
            Some("v8")
        );
    }

    #[test]
    fn test_filter_entries_by_arch() {
        let m = parse(INDEX_MANIFEST);

        let amd64 = filter_entries_by_arch(&m.manifests, &["amd64".to_string()]);
        assert_eq!(amd64.len(), 1);
        assert!(amd64[0].digest.starts_with("sha256:ccc"));

        let all = filter_entries_by_arch(&m.manifests, &[]);
        assert_eq!(all.len(), 2);

        let none = filter_entries_by_arch(&m.manifests, &["s390x".to_string()]);
        assert!(none.is_empty());
    }

    #[test]
    fn test_raw_bytes_survive_parsing() {
        let m = parse(IMAGE_MANIFEST);
        // The retained bytes are exactly what came off the wire, whitespace
        // and field order included.
        assert_eq!(m.raw.as_ref(), IMAGE_MANIFEST.as_bytes());
    }

    #[test]
    fn test_media_type_default() {
        let mut m = parse(IMAGE_MANIFEST);
        m.media_type = String::new();
        assert_eq!(
            m.media_type_or_default(),
            "application/vnd.docker.distribution.manifest.v2+json"
        );
    }

    #[test]
    fn test_manifest_list_media_type_docker() {
        let mut m = parse(INDEX_MANIFEST);
        m.media_type = "application/vnd.docker.distribution.manifest.list.v2+json".into();
        assert!(m.is_manifest_list());
    }
}
