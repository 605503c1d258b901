//! Credential handlers for outgoing provider requests.
//!
//! Each [`AuthMode`] has one stateless handler that writes the credential
//! into the request headers. Basic and custom modes take their material from
//! a single `auth_data` entry; more than one entry is ambiguous and rejected.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};

use crate::error::{PreheatError, PreheatResult};
use crate::models::{AuthData, AuthMode, Instance};

pub use crate::models::BEARER_TOKEN_KEY;

/// Credential material bound to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub mode: AuthMode,
    pub data: AuthData,
}

impl Credential {
    /// `None` when the instance does not authenticate.
    pub fn from_instance(instance: &Instance) -> Option<Self> {
        (instance.auth_mode != AuthMode::None).then(|| Self {
            mode: instance.auth_mode,
            data: instance.auth_data.clone(),
        })
    }
}

/// Attaches a credential to request headers.
pub trait AuthHandler: Send + Sync {
    fn mode(&self) -> AuthMode;

    /// Write the credential into `headers`.
    fn authorize(&self, headers: &mut HeaderMap, credential: Option<&Credential>)
        -> PreheatResult<()>;
}

struct NoneAuthHandler;
struct BasicAuthHandler;
struct BearerAuthHandler;
struct CustomAuthHandler;

static NONE_HANDLER: NoneAuthHandler = NoneAuthHandler;
static BASIC_HANDLER: BasicAuthHandler = BasicAuthHandler;
static BEARER_HANDLER: BearerAuthHandler = BearerAuthHandler;
static CUSTOM_HANDLER: CustomAuthHandler = CustomAuthHandler;

/// Handler registered for `mode`.
pub fn handler(mode: AuthMode) -> &'static dyn AuthHandler {
    match mode {
        AuthMode::None => &NONE_HANDLER,
        AuthMode::Basic => &BASIC_HANDLER,
        AuthMode::Bearer => &BEARER_HANDLER,
        AuthMode::Custom => &CUSTOM_HANDLER,
    }
}

/// Apply whichever handler matches the credential (none when absent).
pub fn authorize(headers: &mut HeaderMap, credential: Option<&Credential>) -> PreheatResult<()> {
    let mode = credential.map_or(AuthMode::None, |c| c.mode);
    handler(mode).authorize(headers, credential)
}

fn require<'a>(mode: AuthMode, credential: Option<&'a Credential>) -> PreheatResult<&'a Credential> {
    let credential = credential.ok_or_else(|| {
        PreheatError::Validation(format!("{mode} auth requires a credential"))
    })?;
    if credential.mode != mode {
        return Err(PreheatError::Validation(format!(
            "{mode} auth handler given a {} credential",
            credential.mode
        )));
    }
    Ok(credential)
}

fn single_entry(mode: AuthMode, data: &AuthData) -> PreheatResult<(&str, &str)> {
    let mut entries = data.iter();
    match (entries.next(), entries.next()) {
        (Some((k, v)), None) => Ok((k.as_str(), v.as_str())),
        (None, _) => Err(PreheatError::Validation(format!(
            "{mode} auth requires one credential entry"
        ))),
        (Some(_), Some(_)) => Err(PreheatError::Validation(format!(
            "{mode} auth expects exactly one credential entry, got {}",
            data.len()
        ))),
    }
}

fn header_value(raw: &str) -> PreheatResult<HeaderValue> {
    HeaderValue::from_str(raw)
        .map_err(|e| PreheatError::Validation(format!("invalid header value: {e}")))
}

impl AuthHandler for NoneAuthHandler {
    fn mode(&self) -> AuthMode {
        AuthMode::None
    }

    fn authorize(&self, _headers: &mut HeaderMap, _credential: Option<&Credential>) -> PreheatResult<()> {
        Ok(())
    }
}

impl AuthHandler for BasicAuthHandler {
    fn mode(&self) -> AuthMode {
        AuthMode::Basic
    }

    fn authorize(&self, headers: &mut HeaderMap, credential: Option<&Credential>) -> PreheatResult<()> {
        let credential = require(self.mode(), credential)?;
        let (username, password) = single_entry(self.mode(), &credential.data)?;
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        headers.insert(AUTHORIZATION, header_value(&format!("Basic {encoded}"))?);
        Ok(())
    }
}

impl AuthHandler for BearerAuthHandler {
    fn mode(&self) -> AuthMode {
        AuthMode::Bearer
    }

    fn authorize(&self, headers: &mut HeaderMap, credential: Option<&Credential>) -> PreheatResult<()> {
        let credential = require(self.mode(), credential)?;
        let token = credential
            .data
            .get(BEARER_TOKEN_KEY)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                PreheatError::Validation("bearer auth requires a 'token' entry".to_string())
            })?;
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        Ok(())
    }
}

impl AuthHandler for CustomAuthHandler {
    fn mode(&self) -> AuthMode {
        AuthMode::Custom
    }

    fn authorize(&self, headers: &mut HeaderMap, credential: Option<&Credential>) -> PreheatResult<()> {
        let credential = require(self.mode(), credential)?;
        let (name, value) = single_entry(self.mode(), &credential.data)?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PreheatError::Validation(format!("invalid header name '{name}': {e}")))?;
        headers.insert(name, header_value(value)?);
        Ok(())
    }
}
