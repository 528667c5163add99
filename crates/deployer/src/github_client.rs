//! GitHub contents API client used to fetch changed definitions.

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Public GitHub API endpoint.
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Errors raised while fetching a file.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub API error fetching {path}: {status} - {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("cannot decode {path}: {reason}")]
    Decode { path: String, reason: String },
}

/// Source of file contents at a given revision.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Fetch `path` from `owner/repo`, at `git_ref` or the default branch.
    async fn fetch(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: Option<&str>,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Contents API response for a single file.
#[derive(Debug, Deserialize)]
struct ContentResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    /// Raw URL, used when the file is too large to be inlined.
    #[serde(default)]
    download_url: Option<String>,
}

/// GitHub API client for reading repository files.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubClient {
    /// Create a new GitHub client. Without a token only public repositories
    /// are readable.
    pub fn new(api_url: &str, token: Option<&str>) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("deployer/1.0"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()).map(str::to_string),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn download(&self, url: &str, path: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.authorized(self.client.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl FileSource for GitHubClient {
    async fn fetch(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        let encoded_path = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let url = format!("{}/repos/{owner}/{repo}/contents/{encoded_path}", self.api_url);

        debug!(owner = %owner, repo = %repo, path = %path, git_ref = ?git_ref, "Fetching file from GitHub");

        let mut request = self.authorized(self.client.get(&url));
        if let Some(git_ref) = git_ref {
            request = request.query(&[("ref", git_ref)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let content: ContentResponse = response.json().await?;

        match (content.encoding.as_deref(), content.content) {
            (Some("base64"), Some(encoded)) => {
                // GitHub wraps base64 content at 60 columns.
                let clean: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
                base64::engine::general_purpose::STANDARD
                    .decode(clean)
                    .map_err(|e| FetchError::Decode {
                        path: path.to_string(),
                        reason: e.to_string(),
                    })
            }
            _ => match content.download_url {
                Some(download_url) => self.download(&download_url, path).await,
                None => Err(FetchError::Decode {
                    path: path.to_string(),
                    reason: "response carries neither content nor download_url".to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_decodes_wrapped_base64() {
        let server = MockServer::start().await;
        let body = "apiVersion: apps/v1\nkind: Deployment\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(body);
        let wrapped = format!("{}\n{}\n", &encoded[..20], &encoded[20..]);

        Mock::given(method("GET"))
            .and(path("/repos/acme/manifests/contents/deploy/web.yaml"))
            .and(query_param("ref", "abc123"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "file",
                "encoding": "base64",
                "content": wrapped,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GitHubClient::new(&server.uri(), Some("t0ken")).unwrap();
        let bytes = client
            .fetch("acme", "manifests", "deploy/web.yaml", Some("abc123"))
            .await
            .unwrap();

        assert_eq!(bytes, body.as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_follows_download_url_for_large_files() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/acme/manifests/contents/big.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "file",
                "encoding": "none",
                "content": "",
                "download_url": format!("{}/raw/big.yaml", server.uri()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/raw/big.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("kind: Deployment\n"))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&server.uri(), None).unwrap();
        let bytes = client
            .fetch("acme", "manifests", "big.yaml", None)
            .await
            .unwrap();

        assert_eq!(bytes, b"kind: Deployment\n");
    }

    #[tokio::test]
    async fn test_fetch_surfaces_error_status() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&server.uri(), None).unwrap();
        let err = client
            .fetch("acme", "manifests", "missing.yaml", None)
            .await
            .unwrap_err();

        match err {
            FetchError::Status { status, path, .. } => {
                assert_eq!(status, 404);
                assert_eq!(path, "missing.yaml");
            }
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_rejects_invalid_base64() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "encoding": "base64",
                "content": "!!!not base64!!!",
            })))
            .mount(&server)
            .await;

        let client = GitHubClient::new(&server.uri(), None).unwrap();
        let err = client
            .fetch("acme", "manifests", "web.yaml", None)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Decode { .. }));
    }
}
