//! Shared test utilities: a wiremock-backed fake registry.
//!
//! The fake speaks just enough of the v2 protocol for the engine to run
//! end-to-end: ping, tag listing, manifest GET/PUT, blob HEAD/GET, the
//! three-step upload, and the Harbor project listing used by preflight.

#![allow(dead_code)]

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CONFIG_DIGEST: &str =
    "sha256:aaa0000000000000000000000000000000000000000000000000000000000000";
pub const LAYER_DIGEST: &str =
    "sha256:bbb0000000000000000000000000000000000000000000000000000000000000";
pub const MANIFEST_DIGEST: &str =
    "sha256:fff0000000000000000000000000000000000000000000000000000000000000";

pub const CONFIG_BLOB: &[u8] = br#"{"architecture":"amd64","os":"linux"}"#;
pub const LAYER_BLOB: &[u8] = b"layer-bytes-layer-bytes-layer-bytes";

/// A second image sharing [`LAYER_DIGEST`] with the first.
pub const CONFIG2_DIGEST: &str =
    "sha256:ddd0000000000000000000000000000000000000000000000000000000000000";
pub const MANIFEST2_DIGEST: &str =
    "sha256:eee0000000000000000000000000000000000000000000000000000000000000";
pub const CONFIG2_BLOB: &[u8] = br#"{"architecture":"amd64","os":"linux","variant":""}"#;

pub const IMAGE_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A schema-2 image manifest whose declared sizes match the fake blobs.
pub fn image_manifest_json() -> String {
    format!(
        r#"{{
  "schemaVersion": 2,
  "mediaType": "{IMAGE_MEDIA_TYPE}",
  "config": {{
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "size": {config_size},
    "digest": "{CONFIG_DIGEST}"
  }},
  "layers": [
    {{
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "size": {layer_size},
      "digest": "{LAYER_DIGEST}"
    }}
  ]
}}"#,
        config_size = CONFIG_BLOB.len(),
        layer_size = LAYER_BLOB.len(),
    )
}

/// Total payload bytes of the fake image.
pub fn image_total_bytes() -> u64 {
    (CONFIG_BLOB.len() + LAYER_BLOB.len()) as u64
}

/// A second schema-2 manifest: its own config, the shared layer.
pub fn second_image_manifest_json() -> String {
    format!(
        r#"{{
  "schemaVersion": 2,
  "mediaType": "{IMAGE_MEDIA_TYPE}",
  "config": {{
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "size": {config_size},
    "digest": "{CONFIG2_DIGEST}"
  }},
  "layers": [
    {{
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "size": {layer_size},
      "digest": "{LAYER_DIGEST}"
    }}
  ]
}}"#,
        config_size = CONFIG2_BLOB.len(),
        layer_size = LAYER_BLOB.len(),
    )
}

/// One fake registry endpoint.
pub struct FakeRegistry {
    pub server: MockServer,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// `/v2/` answers 200.
    pub async fn mount_ping(&self) {
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
    }

    /// Harbor project listing contains the given projects.
    pub async fn mount_harbor_projects(&self, projects: &[&str]) {
        let body: Vec<_> = projects
            .iter()
            .map(|name| serde_json::json!({ "name": name }))
            .collect();
        Mock::given(method("GET"))
            .and(path("/api/v2.0/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Catalog listing for registries without the Harbor API; the
    /// unmatched `/api/v2.0/...` probes fall through to wiremock's 404.
    pub async fn mount_catalog(&self, repositories: &[&str]) {
        Mock::given(method("GET"))
            .and(path("/v2/_catalog"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "repositories": repositories })),
            )
            .mount(&self.server)
            .await;
    }

    /// Tag listing for a repository (single page).
    pub async fn mount_tags(&self, repo: &str, tags: &[&str]) {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/tags/list", repo)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "name": repo, "tags": tags })),
            )
            .mount(&self.server)
            .await;
    }

    /// Manifest GET (and HEAD) for a reference.
    pub async fn mount_manifest(&self, repo: &str, reference: &str, body: &str, digest: &str) {
        let template = ResponseTemplate::new(200)
            .set_body_raw(body.as_bytes().to_vec(), IMAGE_MEDIA_TYPE)
            .insert_header("Docker-Content-Digest", digest);
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/manifests/{}", repo, reference)))
            .respond_with(template)
            .mount(&self.server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(format!("/v2/{}/manifests/{}", repo, reference)))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Docker-Content-Digest", digest),
            )
            .mount(&self.server)
            .await;
    }

    /// Blob present: HEAD 200 with size, GET 200 with the bytes.
    pub async fn mount_blob(&self, repo: &str, digest: &str, content: &'static [u8]) {
        Mock::given(method("HEAD"))
            .and(path(format!("/v2/{}/blobs/{}", repo, digest)))
            .respond_with(
                ResponseTemplate::new(200).insert_header("Content-Length", content.len().to_string()),
            )
            .mount(&self.server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", repo, digest)))
            .respond_with(ResponseTemplate::new(200).set_body_raw(content, "application/octet-stream"))
            .mount(&self.server)
            .await;
    }

    /// Blob absent: HEAD 404.
    pub async fn mount_blob_missing(&self, repo: &str, digest: &str) {
        Mock::given(method("HEAD"))
            .and(path(format!("/v2/{}/blobs/{}", repo, digest)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&self.server)
            .await;
    }

    /// Full upload flow for a repository:
    /// mount attempt answers 202 (unavailable), POST initiates, PATCH
    /// accepts the bytes, PUT commits. Mount order matters: the
    /// mount-query mock must win over the plain POST.
    pub async fn mount_upload_flow(&self, repo: &str) {
        let upload_path = format!("/v2/{}/blobs/uploads/", repo);
        let session_path = format!("/v2/{}/blobs/uploads/session-1", repo);

        // Cross-repo mount attempt: not available, hands back an upload URL.
        Mock::given(method("POST"))
            .and(path(upload_path.clone()))
            .and(query_param("from", repo))
            .respond_with(
                ResponseTemplate::new(202).insert_header("Location", session_path.as_str()),
            )
            .mount(&self.server)
            .await;

        // Plain initiation.
        Mock::given(method("POST"))
            .and(path(upload_path))
            .respond_with(
                ResponseTemplate::new(202).insert_header("Location", session_path.as_str()),
            )
            .mount(&self.server)
            .await;

        Mock::given(method("PATCH"))
            .and(path(session_path.clone()))
            .respond_with(
                ResponseTemplate::new(202).insert_header("Location", session_path.as_str()),
            )
            .mount(&self.server)
            .await;

        Mock::given(method("PUT"))
            .and(path(session_path))
            .respond_with(ResponseTemplate::new(201))
            .mount(&self.server)
            .await;
    }

    /// Manifest PUT answers 201 with a digest header.
    pub async fn mount_manifest_put(&self, repo: &str, reference: &str, digest: &str) {
        Mock::given(method("PUT"))
            .and(path(format!("/v2/{}/manifests/{}", repo, reference)))
            .respond_with(
                ResponseTemplate::new(201).insert_header("Docker-Content-Digest", digest),
            )
            .mount(&self.server)
            .await;
    }

    /// Count received requests matching a method and path substring.
    pub async fn request_count(&self, http_method: &str, path_contains: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.as_str() == http_method && r.url.path().contains(path_contains))
            .count()
    }
}
