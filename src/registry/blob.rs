//! Blob transfer: existence checks, streaming download, the three-step
//! monolithic upload, and cross-repo mounts.
//!
//! Blob bodies are plumbed end-to-end as streams and never buffered:
//! the download's byte stream becomes the upload's request body. This is
//! load-bearing for multi-GB layers.

use super::{error_body, RegistryClient};
use crate::error::{ReplicationError, Result};
use bytes::Bytes;
use futures_util::Stream;
use reqwest::{Method, Response};

/// A blob download in flight.
///
/// Dropping the stream closes the connection; consuming it via
/// [`into_body`](Self::into_body) hands the bytes straight to an upload.
pub struct BlobStream {
    response: Response,
    size: u64,
}

impl BlobStream {
    /// Declared size from `Content-Length` (0 when the server omits it).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The raw byte stream.
    pub fn into_stream(self) -> impl Stream<Item = reqwest::Result<Bytes>> {
        self.response.bytes_stream()
    }

    /// Wrap the stream as an upload body without buffering.
    pub fn into_body(self) -> reqwest::Body {
        reqwest::Body::wrap_stream(self.into_stream())
    }
}

impl RegistryClient {
    /// Check whether a blob exists; returns its size when it does.
    pub async fn blob_exists(&self, repository: &str, digest: &str) -> Result<(bool, u64)> {
        let path = format!("/v2/{}/blobs/{}", repository, digest);
        let resp = self
            .execute("BlobExists", Method::HEAD, &path, None, &[])
            .await?;

        match resp.status().as_u16() {
            200 => Ok((true, content_length(&resp))),
            404 => Ok((false, 0)),
            status => Err(ReplicationError::http("BlobExists", status, error_body(resp).await)),
        }
    }

    /// Start a streaming download of a blob.
    pub async fn get_blob(&self, repository: &str, digest: &str) -> Result<BlobStream> {
        let path = format!("/v2/{}/blobs/{}", repository, digest);
        let resp = self.execute("GetBlob", Method::GET, &path, None, &[]).await?;

        let status = resp.status().as_u16();
        if status != 200 {
            return Err(ReplicationError::http("GetBlob", status, error_body(resp).await));
        }

        let size = content_length(&resp);
        Ok(BlobStream { response: resp, size })
    }

    /// Upload a blob via the monolithic three-step protocol:
    /// POST to initiate, PATCH the bytes, PUT with `?digest=…` to commit.
    pub async fn put_blob(
        &self,
        repository: &str,
        digest: &str,
        body: reqwest::Body,
        size: u64,
    ) -> Result<()> {
        let upload_url = self.initiate_upload(repository).await?;
        let commit_url = self.upload_content(&upload_url, body, size).await?;
        self.commit_upload(&commit_url, digest).await
    }

    /// POST `/v2/{repo}/blobs/uploads/`, expect 202 and a `Location`.
    async fn initiate_upload(&self, repository: &str) -> Result<String> {
        let path = format!("/v2/{}/blobs/uploads/", repository);
        let resp = self
            .execute("InitiateUpload", Method::POST, &path, None, &[])
            .await?;

        let status = resp.status().as_u16();
        if status != 202 {
            return Err(ReplicationError::http("InitiateUpload", status, error_body(resp).await));
        }

        let location = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ReplicationError::Protocol("no Location header in upload initiation response".into())
            })?;
        Ok(self.resolve_location(location))
    }

    /// PATCH the blob bytes to the upload URL; returns the new `Location`.
    ///
    /// Goes straight to the transport (Basic auth only): the upload URL
    /// came out of an already-authenticated initiation and can be absolute,
    /// pointing off the endpoint base.
    async fn upload_content(
        &self,
        upload_url: &str,
        body: reqwest::Body,
        size: u64,
    ) -> Result<String> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let mut req = self
            .http
            .patch(upload_url)
            .header("content-type", "application/octet-stream")
            .body(body);
        if size > 0 {
            req = req.header("content-length", size.to_string());
        }
        if let (Some(user), pass) = (&self.username, &self.password) {
            req = req.basic_auth(user, pass.as_deref());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ReplicationError::network("UploadContent", e))?;
        crate::metrics::record_http_request(self.name(), "PATCH", resp.status().as_u16());

        let status = resp.status().as_u16();
        if status != 202 {
            return Err(ReplicationError::http("UploadContent", status, error_body(resp).await));
        }

        let location = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ReplicationError::Protocol("no Location header in upload PATCH response".into())
            })?;
        Ok(self.resolve_location(location))
    }

    /// PUT with `?digest=…` and an empty body to commit the upload.
    async fn commit_upload(&self, upload_url: &str, digest: &str) -> Result<()> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let mut url = reqwest::Url::parse(upload_url).map_err(|e| {
            ReplicationError::Protocol(format!("invalid upload URL {:?}: {}", upload_url, e))
        })?;
        url.query_pairs_mut().append_pair("digest", digest);

        let mut req = self.http.put(url).header("content-length", "0");
        if let (Some(user), pass) = (&self.username, &self.password) {
            req = req.basic_auth(user, pass.as_deref());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ReplicationError::network("CommitUpload", e))?;
        crate::metrics::record_http_request(self.name(), "PUT", resp.status().as_u16());

        let status = resp.status().as_u16();
        if status != 201 {
            return Err(ReplicationError::http("CommitUpload", status, error_body(resp).await));
        }
        Ok(())
    }

    /// Attempt a cross-repo mount.
    ///
    /// 201 means the server linked the existing blob (no bytes moved);
    /// 202 means mount is unavailable and the server handed back a normal
    /// upload URL, which we abandon in favor of the caller's fallback.
    pub async fn mount_blob(&self, from_repo: &str, to_repo: &str, digest: &str) -> Result<bool> {
        let path = format!(
            "/v2/{}/blobs/uploads/?mount={}&from={}",
            to_repo, digest, from_repo
        );
        let resp = self
            .execute("MountBlob", Method::POST, &path, None, &[])
            .await?;

        match resp.status().as_u16() {
            201 => Ok(true),
            202 => Ok(false),
            status => Err(ReplicationError::http("MountBlob", status, error_body(resp).await)),
        }
    }
}

/// Stream one blob from source to target.
///
/// The download body is wrapped directly into the upload request; no
/// intermediate buffering. `declared_size` (from the manifest descriptor)
/// wins over the download's `Content-Length` when both are present.
pub async fn copy_blob(
    source: &RegistryClient,
    target: &RegistryClient,
    source_repo: &str,
    target_repo: &str,
    digest: &str,
    declared_size: u64,
) -> Result<()> {
    let download = source.get_blob(source_repo, digest).await?;
    let size = if declared_size > 0 {
        declared_size
    } else {
        download.size()
    };
    target
        .put_blob(target_repo, digest, download.into_body(), size)
        .await
}

fn content_length(resp: &Response) -> u64 {
    resp.headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
