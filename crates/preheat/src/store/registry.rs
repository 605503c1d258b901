//! HTTP-backed registry and token collaborators.
//!
//! [`HttpRegistryClient`] resolves manifest digests with a Docker Registry
//! v2 `HEAD` request. [`TokenEndpointService`] mints bearer tokens from a
//! Docker token endpoint (`realm`), the same flow `docker pull` uses.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{RegistryConfig, TransportConfig};
use crate::error::{PreheatError, PreheatResult};
use crate::provider::client::join_url;

use super::{RegistryClient, TokenService};

/// Manifest media types accepted when resolving digests.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

fn build_client(transport: &TransportConfig, insecure: bool) -> PreheatResult<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(transport.connect_timeout())
        .timeout(transport.request_timeout())
        .danger_accept_invalid_certs(insecure)
        .build()?)
}

/// Registry v2 client used for manifest lookups.
pub struct HttpRegistryClient {
    client: reqwest::Client,
    endpoint: String,
    tokens: Option<Arc<dyn TokenService>>,
}

impl HttpRegistryClient {
    pub fn new(
        registry: &RegistryConfig,
        transport: &TransportConfig,
        tokens: Option<Arc<dyn TokenService>>,
    ) -> PreheatResult<Self> {
        Ok(Self {
            client: build_client(transport, registry.insecure)?,
            endpoint: registry.external_endpoint.clone(),
            tokens,
        })
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn manifest_exists(&self, repository: &str, tag: &str) -> PreheatResult<(bool, String)> {
        let url = join_url(&self.endpoint, &format!("v2/{repository}/manifests/{tag}"))?;

        let mut request = self.client.head(url.clone()).header(ACCEPT, MANIFEST_ACCEPT);
        if let Some(tokens) = &self.tokens {
            let token = tokens.mint(repository, &["pull".to_string()]).await?;
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => {
                let digest = response
                    .headers()
                    .get(DIGEST_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                debug!(repository, tag, digest = %digest, "Resolved manifest");
                Ok((true, digest))
            }
            StatusCode::NOT_FOUND => Ok((false, String::new())),
            status => Err(PreheatError::Http {
                method: "HEAD",
                url: url.to_string(),
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Mints registry tokens from a Docker token endpoint.
pub struct TokenEndpointService {
    client: reqwest::Client,
    realm: String,
    service: String,
    username: Option<String>,
    password: Option<String>,
}

impl TokenEndpointService {
    /// `None` when no token realm is configured.
    pub fn from_config(
        registry: &RegistryConfig,
        transport: &TransportConfig,
    ) -> PreheatResult<Option<Self>> {
        let Some(realm) = registry.token_realm.clone() else {
            return Ok(None);
        };
        Ok(Some(Self {
            client: build_client(transport, registry.insecure)?,
            realm,
            service: registry.token_service.clone(),
            username: registry.username.clone(),
            password: registry.password.clone(),
        }))
    }
}

#[async_trait]
impl TokenService for TokenEndpointService {
    async fn mint(&self, repository: &str, actions: &[String]) -> PreheatResult<String> {
        let scope = format!("repository:{repository}:{}", actions.join(","));
        let mut request = self
            .client
            .get(&self.realm)
            .query(&[("service", self.service.as_str()), ("scope", scope.as_str())]);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, scope = %scope, "Token endpoint rejected request");
            return Err(PreheatError::Http {
                method: "GET",
                url: self.realm.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response.json().await?;
        parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PreheatError::NotFound(format!("token for scope {scope}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockTokenService;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry_config(endpoint: &str) -> RegistryConfig {
        RegistryConfig {
            external_endpoint: endpoint.to_string(),
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_manifest_exists_reads_digest() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/v2/library/alpine/manifests/latest"))
            .and(header("authorization", "Bearer pull-token"))
            .respond_with(
                ResponseTemplate::new(200).insert_header(DIGEST_HEADER, "sha256:abc"),
            )
            .mount(&server)
            .await;

        let mut tokens = MockTokenService::new();
        tokens
            .expect_mint()
            .withf(|repo, actions| repo == "library/alpine" && actions.len() == 1 && actions[0] == "pull")
            .returning(|_, _| Ok("pull-token".to_string()));

        let client = HttpRegistryClient::new(
            &registry_config(&server.uri()),
            &TransportConfig::default(),
            Some(Arc::new(tokens)),
        )
        .unwrap();

        let (exists, digest) = client.manifest_exists("library/alpine", "latest").await.unwrap();
        assert!(exists);
        assert_eq!(digest, "sha256:abc");
    }

    #[tokio::test]
    async fn test_manifest_missing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client =
            HttpRegistryClient::new(&registry_config(&server.uri()), &TransportConfig::default(), None)
                .unwrap();
        let (exists, digest) = client.manifest_exists("library/nope", "1.0").await.unwrap();
        assert!(!exists);
        assert!(digest.is_empty());
    }

    #[tokio::test]
    async fn test_token_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/service/token"))
            .and(query_param("service", "harbor-registry"))
            .and(query_param("scope", "repository:library/alpine:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "t0k"})))
            .mount(&server)
            .await;

        let config = RegistryConfig {
            token_realm: Some(format!("{}/service/token", server.uri())),
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..RegistryConfig::default()
        };
        let service = TokenEndpointService::from_config(&config, &TransportConfig::default())
            .unwrap()
            .unwrap();
        let token = service
            .mint("library/alpine", &["pull".to_string()])
            .await
            .unwrap();
        assert_eq!(token, "t0k");
    }

    #[test]
    fn test_token_service_requires_realm() {
        let service =
            TokenEndpointService::from_config(&RegistryConfig::default(), &TransportConfig::default())
                .unwrap();
        assert!(service.is_none());
    }
}
