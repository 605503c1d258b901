//! Shared HTTP transport for provider drivers.
//!
//! Two `reqwest` clients are built up front: one verifying TLS and one
//! skipping verification. Drivers pick one per request from their instance's
//! `insecure` flag. `reqwest::Client` is internally reference counted, so
//! cloning an [`HttpClient`] shares both connection pools.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::error::{PreheatError, PreheatResult};
use crate::provider::auth::{self, Credential};

const JSON: &str = "application/json";

/// User agent sent with every provider request.
const USER_AGENT: &str = concat!("preheat/", env!("CARGO_PKG_VERSION"));

/// Join `path` onto a provider base URL and check the result is HTTP(S).
///
/// A trailing slash on `endpoint` is tolerated.
pub fn join_url(endpoint: &str, path: &str) -> PreheatResult<Url> {
    let base = endpoint.trim().trim_end_matches('/');
    let path = path.trim_start_matches('/');
    let raw = format!("{base}/{path}");

    let url = Url::parse(&raw)
        .map_err(|e| PreheatError::Validation(format!("malformed url '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(PreheatError::Validation(format!(
            "'{raw}' is not an http(s) url"
        ))),
    }
}

/// Process-wide HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpClient {
    secure: reqwest::Client,
    insecure: reqwest::Client,
}

impl HttpClient {
    /// Build both clients eagerly.
    pub fn new(config: &TransportConfig) -> PreheatResult<Self> {
        let build = |skip_verify: bool| {
            reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(config.connect_timeout())
                .timeout(config.request_timeout())
                .pool_max_idle_per_host(config.pool_max_idle_per_host)
                .danger_accept_invalid_certs(skip_verify)
                .build()
        };

        Ok(Self {
            secure: build(false)?,
            insecure: build(true)?,
        })
    }

    fn client(&self, insecure: bool) -> &reqwest::Client {
        if insecure {
            &self.insecure
        } else {
            &self.secure
        }
    }

    /// `GET` a JSON resource and return the raw body on 2xx.
    pub async fn get(
        &self,
        url: &Url,
        credential: Option<&Credential>,
        insecure: bool,
    ) -> PreheatResult<Vec<u8>> {
        self.send(Method::GET, url, credential, None, insecure).await
    }

    /// `POST` `body` as JSON and return the raw body on 2xx.
    ///
    /// `208 Already Reported` is returned as [`PreheatError::Http`] with
    /// status 208 so callers can tell it apart from other 2xx codes.
    pub async fn post<B>(
        &self,
        url: &Url,
        credential: Option<&Credential>,
        body: &B,
        insecure: bool,
    ) -> PreheatResult<Vec<u8>>
    where
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)?;
        self.send(Method::POST, url, credential, Some(payload), insecure)
            .await
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        credential: Option<&Credential>,
        payload: Option<Vec<u8>>,
        insecure: bool,
    ) -> PreheatResult<Vec<u8>> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(JSON));
        if payload.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
        }
        auth::authorize(&mut headers, credential)?;

        trace!(method = %method, url = %url, "Provider request starting");

        let mut request = self
            .client(insecure)
            .request(method.clone(), url.clone())
            .headers(headers);
        if let Some(payload) = payload {
            request = request.body(payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        debug!(
            method = %method,
            url = %url,
            status = status.as_u16(),
            "Provider request finished"
        );

        let already_reported = method == Method::POST && status == StatusCode::ALREADY_REPORTED;
        if status.is_success() && !already_reported {
            return Ok(body.to_vec());
        }

        Err(PreheatError::Http {
            method: if method == Method::POST { "POST" } else { "GET" },
            url: url.to_string(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
