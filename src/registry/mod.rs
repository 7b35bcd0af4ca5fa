// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry v2 protocol client.
//!
//! One [`RegistryClient`] per configured endpoint. The client speaks the
//! OCI/Docker Registry v2 HTTP protocol and transparently handles:
//!
//! - **Authentication**: requests go out with Basic credentials (when
//!   configured); a 401 with a `WWW-Authenticate` challenge triggers the
//!   bearer-token dance against the advertised realm, then a single
//!   retry of the original request. Tokens are scoped per request path,
//!   so no token cache is required for correctness.
//! - **Rate limiting**: endpoints with a QPS cap gate every outbound call
//!   through a token bucket. [`ping`](RegistryClient::ping) and the token
//!   sub-request are exempt so a saturated bucket cannot deadlock startup.
//! - **Project helpers**: Harbor's `/api/v2.0` project/repository API with
//!   a `/v2/_catalog` fallback for vanilla registries.
//!
//! The client never retries: transport failures and 429/5xx answers
//! surface as retryable [`ReplicationError`]s and the caller decides
//! (see [`crate::resilience`]).

mod blob;
mod manifest;

pub use blob::{copy_blob, BlobStream};
pub use manifest::{filter_entries_by_arch, Descriptor, Manifest, Platform};

use crate::config::RegistryEndpoint;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::RateLimiter;
use bytes::Bytes;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Accept header advertising every manifest media type we can replicate:
/// Docker schema 2, Docker manifest list, OCI manifest, OCI index.
pub const MANIFEST_ACCEPT_HEADER: &str = "application/vnd.docker.distribution.manifest.v2+json,\
application/vnd.docker.distribution.manifest.list.v2+json,\
application/vnd.oci.image.manifest.v1+json,\
application/vnd.oci.image.index.v1+json";

/// Harbor page size for project/repository listings.
const HARBOR_PAGE_SIZE: usize = 100;

/// Registry v2 API client for a single endpoint.
///
/// Concurrency-safe: the underlying HTTP client is multiplexed and the
/// rate limiter is internally synchronized, so one instance is shared by
/// all workers of an execution.
pub struct RegistryClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
    limiter: Option<RateLimiter>,
}

impl RegistryClient {
    /// Build a client for an endpoint.
    pub fn new(endpoint: &RegistryEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(endpoint.insecure)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            // Generous request timeout: multi-GB blobs on slow registries.
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                ReplicationError::Config(format!(
                    "failed to build HTTP client for endpoint {}: {}",
                    endpoint.name, e
                ))
            })?;

        Ok(Self {
            name: endpoint.name.clone(),
            base_url: endpoint.normalized_url(),
            http,
            username: endpoint.username.clone().filter(|u| !u.is_empty()),
            password: endpoint.password.clone(),
            limiter: RateLimiter::for_qps(endpoint.qps),
        })
    }

    /// Endpoint name (for logs and metrics).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe `/v2/`.
    ///
    /// 200 and 401 both count as reachable: a 401 means the server speaks
    /// v2 and merely demands auth. Exempt from the rate gate.
    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/v2/", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ReplicationError::network("Ping", e))?;
        metrics::record_http_request(&self.name, "GET", resp.status().as_u16());

        match resp.status().as_u16() {
            200 | 401 => Ok(()),
            status => Err(ReplicationError::http("Ping", status, error_body(resp).await)),
        }
    }

    /// Perform a request with rate limiting and the auth challenge dance.
    ///
    /// The body must be replayable (cheaply cloned) because a 401 answer
    /// means the request is sent twice.
    pub(crate) async fn execute(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        headers: &[(&'static str, &str)],
    ) -> Result<Response> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .send(operation, method.clone(), &url, body.clone(), headers, None)
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            if let Some(challenge) = challenge {
                debug!(endpoint = %self.name, operation, "401 with challenge, negotiating bearer token");
                let token = self.fetch_bearer_token(&challenge).await?;
                // The bearer retry is a second outbound request and pays
                // the gate like the first; only the token fetch is exempt.
                if let Some(limiter) = &self.limiter {
                    limiter.acquire().await;
                }
                return self
                    .send(operation, method, &url, body, headers, Some(token.as_str()))
                    .await;
            }
            // No challenge to negotiate with: hand the 401 to the caller.
        }

        Ok(resp)
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        url: &str,
        body: Option<Bytes>,
        headers: &[(&'static str, &str)],
        bearer: Option<&str>,
    ) -> Result<Response> {
        let method_name = method.as_str().to_owned();
        let mut req = self.http.request(method, url);
        for (key, value) in headers {
            req = req.header(*key, *value);
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        req = match bearer {
            Some(token) => req.bearer_auth(token),
            None => match (&self.username, &self.password) {
                (Some(user), pass) => req.basic_auth(user, pass.as_deref()),
                _ => req,
            },
        };

        let resp = req
            .send()
            .await
            .map_err(|e| ReplicationError::network(operation, e))?;
        metrics::record_http_request(&self.name, &method_name, resp.status().as_u16());
        Ok(resp)
    }

    /// Obtain a bearer token for a `WWW-Authenticate` challenge.
    ///
    /// Issues `GET realm?service=…&scope=…` with Basic credentials and
    /// accepts either `token` or `access_token` in the response (registries
    /// disagree on the field name). Exempt from the rate gate.
    async fn fetch_bearer_token(&self, challenge: &str) -> Result<String> {
        let params = parse_auth_header(challenge);
        let realm = params
            .get("realm")
            .ok_or_else(|| ReplicationError::Protocol("no realm in WWW-Authenticate header".into()))?;

        let mut token_url = reqwest::Url::parse(realm)
            .map_err(|e| ReplicationError::Protocol(format!("invalid auth realm {:?}: {}", realm, e)))?;
        {
            let mut query = token_url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                query.append_pair("service", service);
            }
            if let Some(scope) = params.get("scope") {
                query.append_pair("scope", scope);
            }
        }

        let mut req = self.http.get(token_url);
        if let (Some(user), pass) = (&self.username, &self.password) {
            req = req.basic_auth(user, pass.as_deref());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ReplicationError::network("FetchToken", e))?;
        let status = resp.status().as_u16();
        metrics::record_http_request(&self.name, "GET", status);
        if status != 200 {
            return Err(ReplicationError::http("FetchToken", status, error_body(resp).await));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ReplicationError::Protocol(format!("malformed token response: {}", e)))?;

        token
            .token
            .filter(|t| !t.is_empty())
            .or(token.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ReplicationError::Protocol("token endpoint returned no token".into()))
    }

    /// Resolve an upload `Location` against the endpoint base URL.
    ///
    /// Absolute values are honored as-is; relative ones are joined.
    pub(crate) fn resolve_location(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}{}", self.base_url, location)
        }
    }

    // =========================================================================
    // Project helpers (Harbor API with catalog fallback)
    // =========================================================================

    /// List projects.
    ///
    /// Harbor answers `/api/v2.0/projects`; anything else degrades to the
    /// catalog, where a "project" is the first path segment of a
    /// repository name.
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        match self.list_harbor_projects().await {
            Ok(projects) => Ok(projects),
            Err(e) => {
                debug!(endpoint = %self.name, error = %e, "Harbor project API unavailable, using catalog");
                self.list_projects_from_catalog().await
            }
        }
    }

    async fn list_harbor_projects(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct HarborProject {
            name: String,
        }

        let mut all = Vec::new();
        let mut page = 1usize;
        loop {
            let path = format!("/api/v2.0/projects?page={}&page_size={}", page, HARBOR_PAGE_SIZE);
            let resp = self
                .execute("ListProjects", Method::GET, &path, None, &[])
                .await?;
            let status = resp.status().as_u16();
            if status != 200 {
                return Err(ReplicationError::http("ListProjects", status, error_body(resp).await));
            }
            let projects: Vec<HarborProject> = resp
                .json()
                .await
                .map_err(|e| ReplicationError::Protocol(format!("malformed project listing: {}", e)))?;

            let count = projects.len();
            all.extend(projects.into_iter().map(|p| p.name));
            if count < HARBOR_PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn list_projects_from_catalog(&self) -> Result<Vec<String>> {
        let repositories = self.catalog().await?;

        let mut projects: Vec<String> = repositories
            .iter()
            .map(|repo| repo.split('/').next().unwrap_or(repo).to_string())
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    /// List repositories within a project, names relative to the project.
    pub async fn list_repositories(&self, project: &str) -> Result<Vec<String>> {
        match self.list_harbor_repositories(project).await {
            Ok(repos) => Ok(repos),
            Err(e) => {
                debug!(endpoint = %self.name, error = %e, "Harbor repository API unavailable, using catalog");
                self.list_repositories_from_catalog(project).await
            }
        }
    }

    async fn list_harbor_repositories(&self, project: &str) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct HarborRepository {
            name: String,
        }

        let mut all = Vec::new();
        let mut page = 1usize;
        loop {
            let path = format!(
                "/api/v2.0/projects/{}/repositories?page={}&page_size={}",
                project, page, HARBOR_PAGE_SIZE
            );
            let resp = self
                .execute("ListRepositories", Method::GET, &path, None, &[])
                .await?;
            let status = resp.status().as_u16();
            if status != 200 {
                return Err(ReplicationError::http("ListRepositories", status, error_body(resp).await));
            }
            let repos: Vec<HarborRepository> = resp.json().await.map_err(|e| {
                ReplicationError::Protocol(format!("malformed repository listing: {}", e))
            })?;

            let count = repos.len();
            // Harbor returns "project/repo"; keep only the repo part.
            all.extend(repos.into_iter().map(|r| {
                match r.name.split_once('/') {
                    Some((_, repo)) => repo.to_string(),
                    None => r.name,
                }
            }));
            if count < HARBOR_PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn list_repositories_from_catalog(&self, project: &str) -> Result<Vec<String>> {
        let repositories = self.catalog().await?;
        let prefix = format!("{}/", project);
        Ok(repositories
            .into_iter()
            .filter_map(|repo| repo.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn catalog(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Catalog {
            #[serde(default)]
            repositories: Vec<String>,
        }

        let resp = self
            .execute("Catalog", Method::GET, "/v2/_catalog", None, &[])
            .await?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(ReplicationError::http("Catalog", status, error_body(resp).await));
        }
        let catalog: Catalog = resp
            .json()
            .await
            .map_err(|e| ReplicationError::Protocol(format!("malformed catalog: {}", e)))?;
        Ok(catalog.repositories)
    }

    /// Whether a project exists (best effort; see [`list_projects`](Self::list_projects)).
    pub async fn project_exists(&self, project: &str) -> Result<bool> {
        let projects = self.list_projects().await?;
        Ok(projects.iter().any(|p| p == project))
    }

    /// Create a Harbor project. HTTP 409 counts as success (idempotent).
    pub async fn create_project(&self, project: &str, public: bool) -> Result<()> {
        let body = serde_json::json!({
            "project_name": project,
            "metadata": { "public": public.to_string() },
        });
        let body = serde_json::to_vec(&body)
            .map_err(|e| ReplicationError::Internal(format!("failed to encode project payload: {}", e)))?;
        let body = Bytes::from(body);

        let resp = self
            .execute(
                "CreateProject",
                Method::POST,
                "/api/v2.0/projects",
                Some(body),
                &[("content-type", "application/json")],
            )
            .await?;

        match resp.status().as_u16() {
            200 | 201 | 409 => Ok(()),
            status => Err(ReplicationError::http("CreateProject", status, error_body(resp).await)),
        }
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("authenticated", &self.username.is_some())
            .finish()
    }
}

/// Read an error response body for diagnostics.
pub(crate) async fn error_body(resp: Response) -> String {
    resp.text().await.unwrap_or_default()
}

/// Parse a `WWW-Authenticate` header into its key/value parameters.
///
/// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull"`
pub(crate) fn parse_auth_header(header: &str) -> HashMap<String, String> {
    let header = header.strip_prefix("Bearer ").unwrap_or(header);

    let mut params = HashMap::new();
    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}
