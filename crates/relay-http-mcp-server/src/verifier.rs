//! Credential verification
//!
//! Every verifier rejects credentials without the configured prefix before
//! doing anything else. The HTTP verifier then asks the upstream account
//! service, and fails closed on any error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use relay_mcp_session_storage::mask_credential;

/// Default prefix every credential must carry
pub const DEFAULT_KEY_PREFIX: &str = "sa_tools_";
/// Default account service base URL
pub const DEFAULT_API_URL: &str = "http://deepuml.xhus.cn";
/// Path of the verification endpoint below the account service base URL
pub const VERIFY_PATH: &str = "api/tools/verify";
/// Header carrying the credential on verification requests
pub const API_KEY_HEADER: &str = "x-api-key";

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `true` only for a credential known to be valid
    async fn verify(&self, credential: &str) -> bool;
}

/// Configuration for [`HttpCredentialVerifier`]
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Account service base URL
    pub api_url: String,
    /// Required credential prefix
    pub key_prefix: String,
    /// Timeout for the verification request
    pub timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Error building a verifier
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("Invalid API URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Resolve the verification endpoint below `api_url`
///
/// The base is treated as a directory, so `http://host/base` and
/// `http://host/base/` both resolve to `http://host/base/api/tools/verify`.
pub fn verify_url(api_url: &str) -> Result<Url, VerifierError> {
    let invalid = |reason: String| VerifierError::InvalidUrl {
        url: api_url.to_string(),
        reason,
    };

    let mut base = Url::parse(api_url).map_err(|e| invalid(e.to_string()))?;
    if base.cannot_be_a_base() {
        return Err(invalid("URL cannot be a base".to_string()));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(VERIFY_PATH).map_err(|e| invalid(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    data: Option<VerifyData>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    #[serde(default)]
    valid: bool,
}

/// Verifies credentials against the account service
#[derive(Debug, Clone)]
pub struct HttpCredentialVerifier {
    client: reqwest::Client,
    endpoint: Url,
    key_prefix: String,
}

impl HttpCredentialVerifier {
    pub fn new(config: VerifierConfig) -> Result<Self, VerifierError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Self::with_client(client, config)
    }

    /// Use a preconfigured client
    pub fn with_client(client: reqwest::Client, config: VerifierConfig) -> Result<Self, VerifierError> {
        Ok(Self {
            client,
            endpoint: verify_url(&config.api_url)?,
            key_prefix: config.key_prefix,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn check_remote(&self, credential: &str) -> Result<bool, reqwest::Error> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .header(API_KEY_HEADER, credential)
            .send()
            .await?;

        let status = response.status();
        let body: VerifyResponse = response.json().await?;
        Ok(status == reqwest::StatusCode::OK && body.data.is_some_and(|data| data.valid))
    }
}

#[async_trait]
impl CredentialVerifier for HttpCredentialVerifier {
    async fn verify(&self, credential: &str) -> bool {
        if !credential.starts_with(&self.key_prefix) {
            warn!("Credential {} rejected: invalid prefix", mask_credential(credential));
            return false;
        }

        match self.check_remote(credential).await {
            Ok(valid) => {
                debug!(
                    "Credential {} verified by account service: valid={}",
                    mask_credential(credential),
                    valid
                );
                valid
            }
            Err(e) => {
                warn!("Credential verification failed: {}", e);
                false
            }
        }
    }
}

/// Accepts any credential carrying the prefix, without a network call
#[derive(Debug, Clone)]
pub struct PrefixCredentialVerifier {
    key_prefix: String,
}

impl PrefixCredentialVerifier {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
        }
    }
}

impl Default for PrefixCredentialVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

#[async_trait]
impl CredentialVerifier for PrefixCredentialVerifier {
    async fn verify(&self, credential: &str) -> bool {
        credential.starts_with(&self.key_prefix) && credential.len() > self.key_prefix.len()
    }
}
