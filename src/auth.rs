/// Request authentication
///
/// Three credential kinds cross the boundary: bearer session JWTs (HS256)
/// for user endpoints, Basic `admin:<password>` for admin endpoints, and
/// service JWTs signed with an actor's secp256k1 key for inter-server
/// calls. Extractors surface them to handlers; verification lives here.
use axum::{extract::FromRequestParts, http::request::Parts};
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use k256::ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::account::manager::SessionClaims;
use crate::context::AppContext;
use crate::crypto::{public_key_from_multibase, Signer};
use crate::error::{PdsError, PdsResult};
use crate::identity::IdentityResolver;

/// Authenticated user context
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub did: String,
    pub claims: SessionClaims,
}

impl AuthContext {
    pub fn is_app_password(&self) -> bool {
        self.claims.app_password_name.is_some()
    }
}

#[axum::async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = PdsError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(parts)
            .ok_or_else(|| PdsError::AuthRequired("Missing authorization header".to_string()))?;
        let claims = state.account_manager.validate_access_token(&token)?;
        Ok(AuthContext {
            did: claims.sub.clone(),
            claims,
        })
    }
}

/// Optional authentication; invalid credentials read as anonymous
#[derive(Debug, Clone)]
pub struct OptionalAuthContext {
    pub auth: Option<AuthContext>,
}

#[axum::async_trait]
impl FromRequestParts<AppContext> for OptionalAuthContext {
    type Rejection = PdsError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let auth = extract_bearer_token(parts)
            .and_then(|token| state.account_manager.validate_access_token(&token).ok())
            .map(|claims| AuthContext {
                did: claims.sub.clone(),
                claims,
            });
        Ok(OptionalAuthContext { auth })
    }
}

/// Admin gate: Basic `admin:<password>` only
#[derive(Debug, Clone)]
pub struct AdminAuthContext;

#[axum::async_trait]
impl FromRequestParts<AppContext> for AdminAuthContext {
    type Rejection = PdsError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PdsError::AuthRequired("Missing authorization header".to_string()))?;
        verify_admin_basic(header, &state.config.auth.admin_password)?;
        Ok(AdminAuthContext)
    }
}

/// Pull the bearer token out of the Authorization header
pub fn extract_bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

/// Check a Basic header against the admin password
pub fn verify_admin_basic(header: &str, admin_password: &str) -> PdsResult<()> {
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| PdsError::AuthRequired("Admin endpoints use Basic auth".to_string()))?;
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| PdsError::AuthRequired("Malformed Basic credentials".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| PdsError::AuthRequired("Malformed Basic credentials".to_string()))?;
    match decoded.split_once(':') {
        Some(("admin", password)) if password == admin_password => Ok(()),
        _ => Err(PdsError::AuthRequired("Bad admin credentials".to_string())),
    }
}

/// Service JWT claims for inter-server calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceJwtClaims {
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lxm: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ServiceJwtHeader {
    alg: String,
    typ: String,
}

/// Sign a short-lived service JWT with an actor's signing key (ES256K)
pub fn create_service_jwt(
    signer: &dyn Signer,
    iss: &str,
    aud: &str,
    lxm: Option<&str>,
) -> PdsResult<String> {
    let header = ServiceJwtHeader {
        alg: "ES256K".to_string(),
        typ: "JWT".to_string(),
    };
    let claims = ServiceJwtClaims {
        iss: iss.to_string(),
        aud: aud.to_string(),
        exp: (Utc::now() + chrono::Duration::seconds(60)).timestamp(),
        lxm: lxm.map(String::from),
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&header).map_err(|e| PdsError::internal(e.to_string()))?,
    );
    let claims_b64 = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&claims).map_err(|e| PdsError::internal(e.to_string()))?,
    );
    let signing_input = format!("{}.{}", header_b64, claims_b64);
    let sig = signer.sign(signing_input.as_bytes())?;
    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig)))
}

/// Verify a service JWT by resolving the issuer's DID document and
/// checking the signature against its `atproto` verification method.
pub async fn verify_service_jwt(
    resolver: &IdentityResolver,
    token: &str,
    expected_aud: &str,
) -> PdsResult<ServiceJwtClaims> {
    let mut parts = token.splitn(3, '.');
    let (header_b64, claims_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s)) => (h, c, s),
        _ => return Err(PdsError::AuthRequired("Malformed service token".to_string())),
    };
    let claims: ServiceJwtClaims = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| PdsError::AuthRequired("Malformed service token".to_string()))?,
    )
    .map_err(|_| PdsError::AuthRequired("Malformed service token".to_string()))?;

    if claims.exp < Utc::now().timestamp() {
        return Err(PdsError::AuthRequired("Service token expired".to_string()));
    }
    if claims.aud != expected_aud {
        return Err(PdsError::AuthRequired(
            "Service token issued for another audience".to_string(),
        ));
    }

    let doc = resolver.resolve_did(&claims.iss).await?;
    let multibase = doc
        .signing_key_multibase()
        .ok_or_else(|| PdsError::AuthRequired("Issuer has no signing key".to_string()))?;
    let key_bytes = public_key_from_multibase(multibase)
        .map_err(|_| PdsError::AuthRequired("Issuer signing key unusable".to_string()))?;
    let key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|_| PdsError::AuthRequired("Issuer signing key unusable".to_string()))?;
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| PdsError::AuthRequired("Malformed service token".to_string()))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|_| PdsError::AuthRequired("Malformed service token".to_string()))?;
    let signing_input = format!("{}.{}", header_b64, claims_b64);
    key.verify(signing_input.as_bytes(), &sig)
        .map_err(|_| PdsError::AuthRequired("Bad service token signature".to_string()))?;
    Ok(claims)
}
