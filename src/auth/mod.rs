//! Capability tokens.
//!
//! A capability token binds a bearer to one tenant capability. The HTTP layer
//! parses the token and checks that its claims match the tenant the request
//! resolves to before anything is built or executed.
//!
//! [`HmacTokenVerifier`] implements the format
//! `base64url(claims_json) "." hex(hmac_sha256(secret, base64url(claims_json)))`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{HubError, HubResult};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Claims carried by a capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityClaims {
    pub install_id: String,
    pub space_id: String,
    /// Capability name the token grants access to.
    pub capability: String,
    /// Expiry as a unix timestamp in seconds. `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl CapabilityClaims {
    pub fn new(
        install_id: impl Into<String>,
        space_id: impl Into<String>,
        capability: impl Into<String>,
    ) -> Self {
        Self {
            install_id: install_id.into(),
            space_id: space_id.into(),
            capability: capability.into(),
            exp: None,
        }
    }

    pub fn expires_at(mut self, unix_seconds: i64) -> Self {
        self.exp = Some(unix_seconds);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.exp.is_some_and(|exp| exp <= Utc::now().timestamp())
    }

    /// Check the claims grant access to this exact tenant capability.
    pub fn authorize(&self, capability: &str, install_id: &str, space_id: &str) -> HubResult<()> {
        if self.is_expired() {
            return Err(HubError::Unauthorized("token expired".into()));
        }
        if self.capability != capability || self.install_id != install_id || self.space_id != space_id
        {
            return Err(HubError::Unauthorized(
                "token claims do not match the requested capability".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Parses and verifies capability tokens.
pub trait TokenVerifier: Send + Sync {
    fn parse_capability_token(&self, token: &str) -> HubResult<CapabilityClaims>;
}

/// HMAC-SHA256 signed tokens sharing one secret with the issuer.
#[derive(Clone)]
pub struct HmacTokenVerifier {
    keyed: HmacSha256,
}

impl HmacTokenVerifier {
    /// Key a verifier. The secret must not be empty.
    pub fn new(secret: impl AsRef<[u8]>) -> HubResult<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(HubError::validation("auth secret must not be empty"));
        }
        let keyed = HmacSha256::new_from_slice(secret)
            .map_err(|e| HubError::validation(format!("invalid auth secret: {}", e)))?;
        Ok(Self { keyed })
    }

    fn mac(&self) -> HmacSha256 {
        self.keyed.clone()
    }

    /// Sign a set of claims into a token.
    pub fn issue(&self, claims: &CapabilityClaims) -> HubResult<String> {
        let json = serde_json::to_vec(claims)
            .map_err(|e| HubError::validation(format!("unencodable claims: {}", e)))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }
}

impl TokenVerifier for HmacTokenVerifier {
    fn parse_capability_token(&self, token: &str) -> HubResult<CapabilityClaims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| HubError::Unauthorized("malformed token".into()))?;
        let signature = hex::decode(signature)
            .map_err(|_| HubError::Unauthorized("malformed token signature".into()))?;

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| HubError::Unauthorized("bad token signature".into()))?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| HubError::Unauthorized("malformed token payload".into()))?;
        serde_json::from_slice(&json)
            .map_err(|e| HubError::Unauthorized(format!("malformed token claims: {}", e)))
    }
}
