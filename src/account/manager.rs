/// Account manager
///
/// Credentials use scrypt with Node-compatible parameters
/// (N=2^14, r=8, p=1, dkLen=64); stored hashes are `salt:hexhash`. Login
/// pads its own latency so a missing identifier is indistinguishable from
/// a wrong password. Session tokens are HS256 JWTs; refresh tokens rotate
/// through the `next_id` chain.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{Rng, RngCore};
use scrypt::Params;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::account::invites::ensure_invite_available_tx;
use crate::config::ServerConfig;
use crate::error::{PdsError, PdsResult};
use crate::metrics;

/// Access token scope
pub const ACCESS_SCOPE: &str = "com.atproto.access";
/// Refresh token scope
pub const REFRESH_SCOPE: &str = "com.atproto.refresh";
/// App-password sessions get a restricted scope
pub const APP_PASS_SCOPE: &str = "com.atproto.appPass";

/// Default token lifetime
const TOKEN_LIFETIME_DAYS: i64 = 90;
/// Upper bound of the login latency pad
const LOGIN_JITTER_MS: u64 = 350;

/// Joined actor + account view
#[derive(Debug, Clone)]
pub struct ActorAccount {
    pub did: String,
    pub handle: Option<String>,
    pub email: Option<String>,
    pub created_at: String,
    pub takedown_ref: Option<String>,
    pub deactivated_at: Option<String>,
    pub email_confirmed_at: Option<String>,
    pub invites_disabled: bool,
}

impl ActorAccount {
    /// Taken-down accounts are soft deleted
    pub fn soft_deleted(&self) -> bool {
        self.takedown_ref.is_some()
    }
}

/// Account lifecycle status as seen by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Takendown,
    Deactivated,
    Deleted,
}

/// Successful login result
#[derive(Debug, Clone)]
pub struct Login {
    pub user: ActorAccount,
    /// Set when an app password matched instead of the main password
    pub app_password_name: Option<String>,
    pub app_password_privileged: bool,
}

/// Issued session token pair
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access_jwt: String,
    pub refresh_jwt: String,
}

/// JWT claims for both token scopes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub scope: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_password_name: Option<String>,
}

/// Options for `create_account`
#[derive(Debug, Clone)]
pub struct CreateAccountOpts {
    pub did: String,
    pub handle: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub repo_cid: String,
    pub repo_rev: String,
    pub invite_code: Option<String>,
    pub deactivated: bool,
}

pub struct AccountManager {
    pub(crate) db: SqlitePool,
    pub(crate) config: Arc<ServerConfig>,
}

impl AccountManager {
    pub async fn new(db: SqlitePool, config: Arc<ServerConfig>) -> PdsResult<Self> {
        super::create_schema(&db).await?;
        Ok(Self { db, config })
    }

    /// Register actor + account + invite use + repo pointer in one
    /// transaction, returning the first session token pair.
    pub async fn create_account(&self, opts: CreateAccountOpts) -> PdsResult<SessionTokens> {
        let now = Utc::now();
        let password_hash = match &opts.password {
            Some(password) => Some(hash_password(password)?),
            None => None,
        };
        let tokens = self.issue_tokens(&opts.did, None)?;
        let refresh = decode_refresh_claims(&tokens.refresh_jwt)?;

        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO actor (did, handle, created_at, deactivated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(did) DO NOTHING",
        )
        .bind(&opts.did)
        .bind(&opts.handle)
        .bind(now.to_rfc3339())
        .bind(if opts.deactivated {
            Some(now.to_rfc3339())
        } else {
            None
        })
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(result) if result.rows_affected() == 0 => {
                return Err(PdsError::invalid_request("DID already registered"))
            }
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(PdsError::invalid_request("Handle already taken"))
            }
            Err(e) => return Err(e.into()),
        }

        if let (Some(email), Some(hash)) = (&opts.email, &password_hash) {
            let result = sqlx::query(
                "INSERT INTO account (did, email, password_scrypt) VALUES (?1, ?2, ?3)",
            )
            .bind(&opts.did)
            .bind(email.to_lowercase())
            .bind(hash)
            .execute(&mut *tx)
            .await;
            if let Err(e) = result {
                if is_unique_violation(&e) {
                    return Err(PdsError::invalid_request("Email already registered"));
                }
                return Err(e.into());
            }
        }

        if let Some(code) = &opts.invite_code {
            ensure_invite_available_tx(&mut tx, code).await?;
            sqlx::query(
                "INSERT INTO invite_code_use (code, used_by, used_at) VALUES (?1, ?2, ?3)",
            )
            .bind(code)
            .bind(&opts.did)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO refresh_token (id, did, expires_at, app_password_name)
             VALUES (?1, ?2, ?3, NULL)",
        )
        .bind(&refresh.jti)
        .bind(&opts.did)
        .bind(expiry_string(refresh.exp))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO repo_root (did, cid, rev, indexed_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(did) DO UPDATE SET
                cid = excluded.cid, rev = excluded.rev, indexed_at = excluded.indexed_at",
        )
        .bind(&opts.did)
        .bind(&opts.repo_cid)
        .bind(&opts.repo_rev)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(tokens)
    }

    /// Authenticate by email, handle, or DID
    ///
    /// The main password is checked first, then app passwords. Total
    /// elapsed time is padded to a random duration in [0, 350ms) so
    /// timing does not reveal whether the identifier exists.
    pub async fn login(&self, identifier: &str, password: &str) -> PdsResult<Login> {
        let started = std::time::Instant::now();
        let timer = metrics::LOGIN_DURATION.start_timer();
        let result = self.login_inner(identifier, password).await;
        let pad = std::time::Duration::from_millis(rand::thread_rng().gen_range(0..LOGIN_JITTER_MS));
        if let Some(remaining) = pad.checked_sub(started.elapsed()) {
            tokio::time::sleep(remaining).await;
        }
        timer.observe_duration();
        result
    }

    async fn login_inner(&self, identifier: &str, password: &str) -> PdsResult<Login> {
        let identifier = identifier.to_lowercase();
        let user = if identifier.contains('@') {
            self.get_account_by_email(&identifier).await?
        } else {
            self.get_account(&identifier).await?
        };
        let user = user.ok_or_else(PdsError::auth_required)?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT password_scrypt FROM account WHERE did = ?1")
                .bind(&user.did)
                .fetch_optional(&self.db)
                .await?;

        let mut app_password_name = None;
        let mut app_password_privileged = false;
        let main_ok = stored
            .map(|hash| verify_password(password, &hash))
            .unwrap_or(false);
        if !main_ok {
            match self.verify_app_password(&user.did, password).await? {
                Some(descriptor) => {
                    app_password_name = Some(descriptor.0);
                    app_password_privileged = descriptor.1;
                }
                None => return Err(PdsError::auth_required()),
            }
        }

        if user.soft_deleted() {
            return Err(PdsError::AccountTakedown);
        }
        Ok(Login {
            user,
            app_password_name,
            app_password_privileged,
        })
    }

    /// Issue a fresh access/refresh pair and store the refresh row
    pub async fn create_session(
        &self,
        did: &str,
        app_password_name: Option<String>,
    ) -> PdsResult<SessionTokens> {
        let tokens = self.issue_tokens(did, app_password_name.clone())?;
        let refresh = decode_refresh_claims(&tokens.refresh_jwt)?;
        sqlx::query(
            "INSERT INTO refresh_token (id, did, expires_at, app_password_name)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&refresh.jti)
        .bind(did)
        .bind(expiry_string(refresh.exp))
        .bind(&app_password_name)
        .execute(&self.db)
        .await?;
        Ok(tokens)
    }

    /// Sign the token pair without touching the database
    pub(crate) fn issue_tokens(
        &self,
        did: &str,
        app_password_name: Option<String>,
    ) -> PdsResult<SessionTokens> {
        let now = Utc::now();
        let exp = now + Duration::days(TOKEN_LIFETIME_DAYS);
        let access_scope = if app_password_name.is_some() {
            APP_PASS_SCOPE
        } else {
            ACCESS_SCOPE
        };
        let access = self.sign_claims(&SessionClaims {
            scope: access_scope.to_string(),
            sub: did.to_string(),
            aud: self.config.service.service_did.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: random_jti(),
            app_password_name: app_password_name.clone(),
        })?;
        let refresh = self.sign_claims(&SessionClaims {
            scope: REFRESH_SCOPE.to_string(),
            sub: did.to_string(),
            aud: self.config.service.service_did.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: random_jti(),
            app_password_name,
        })?;
        Ok(SessionTokens {
            access_jwt: access,
            refresh_jwt: refresh,
        })
    }

    fn sign_claims(&self, claims: &SessionClaims) -> PdsResult<String> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.config.auth.jwt_secret.as_bytes()),
        )
        .map_err(|e| PdsError::internal(format!("failed to sign token: {}", e)))
    }

    /// Verify an access token and return its claims
    pub fn validate_access_token(&self, token: &str) -> PdsResult<SessionClaims> {
        let claims = self.verify_token(token)?;
        if claims.scope != ACCESS_SCOPE && claims.scope != APP_PASS_SCOPE {
            return Err(PdsError::AuthRequired("Bad token scope".to_string()));
        }
        Ok(claims)
    }

    pub(crate) fn verify_token(&self, token: &str) -> PdsResult<SessionClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60;
        validation.validate_aud = false;
        decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(self.config.auth.jwt_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                PdsError::AuthRequired("Token has expired".to_string())
            }
            _ => PdsError::AuthRequired("Invalid token".to_string()),
        })
    }

    /// Rotate a refresh token: the old row points at its successor and a
    /// replayed token is rejected.
    pub async fn refresh_session(&self, refresh_jwt: &str) -> PdsResult<SessionTokens> {
        let claims = self.verify_token(refresh_jwt)?;
        if claims.scope != REFRESH_SCOPE {
            return Err(PdsError::AuthRequired("Bad token scope".to_string()));
        }
        let row = sqlx::query(
            "SELECT id, did, expires_at, next_id, app_password_name
             FROM refresh_token WHERE id = ?1",
        )
        .bind(&claims.jti)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| PdsError::AuthRequired("Refresh token revoked".to_string()))?;

        let next_id: Option<String> = row.get("next_id");
        if next_id.is_some() {
            return Err(PdsError::AuthRequired("Refresh token superseded".to_string()));
        }
        let expires_at: String = row.get("expires_at");
        if parse_time(&expires_at)? < Utc::now() {
            return Err(PdsError::AuthRequired("Refresh token expired".to_string()));
        }
        let app_password_name: Option<String> = row.get("app_password_name");

        let tokens = self.issue_tokens(&claims.sub, app_password_name.clone())?;
        let new_claims = decode_refresh_claims(&tokens.refresh_jwt)?;

        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO refresh_token (id, did, expires_at, app_password_name)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&new_claims.jti)
        .bind(&claims.sub)
        .bind(expiry_string(new_claims.exp))
        .bind(&app_password_name)
        .execute(&mut *tx)
        .await?;
        // Short grace window, then the old token dies
        sqlx::query("UPDATE refresh_token SET next_id = ?1, expires_at = ?2 WHERE id = ?3")
            .bind(&new_claims.jti)
            .bind((Utc::now() + Duration::hours(2)).to_rfc3339())
            .bind(&claims.jti)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(tokens)
    }

    /// Revoke every refresh token for a DID
    pub async fn revoke_refresh_tokens(&self, did: &str) -> PdsResult<()> {
        sqlx::query("DELETE FROM refresh_token WHERE did = ?1")
            .bind(did)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Drop refresh tokens past their expiry
    pub async fn delete_expired_refresh_tokens(&self) -> PdsResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_token WHERE expires_at < ?1")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Fetch by handle or DID, including takedown and deactivated rows
    pub async fn get_account(&self, handle_or_did: &str) -> PdsResult<Option<ActorAccount>> {
        let row = sqlx::query(
            "SELECT actor.did, actor.handle, actor.created_at, actor.takedown_ref,
                    actor.deactivated_at, account.email, account.email_confirmed_at,
                    account.invites_disabled
             FROM actor LEFT JOIN account ON account.did = actor.did
             WHERE actor.did = ?1 OR actor.handle = ?1",
        )
        .bind(handle_or_did)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| row_to_actor_account(&r)))
    }

    pub async fn get_account_by_email(&self, email: &str) -> PdsResult<Option<ActorAccount>> {
        let row = sqlx::query(
            "SELECT actor.did, actor.handle, actor.created_at, actor.takedown_ref,
                    actor.deactivated_at, account.email, account.email_confirmed_at,
                    account.invites_disabled
             FROM account INNER JOIN actor ON actor.did = account.did
             WHERE account.email = ?1",
        )
        .bind(email.to_lowercase())
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| row_to_actor_account(&r)))
    }

    pub async fn handle_taken(&self, handle: &str) -> PdsResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM actor WHERE handle = ?1")
            .bind(handle)
            .fetch_one(&self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn email_taken(&self, email: &str) -> PdsResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM account WHERE email = ?1")
            .bind(email.to_lowercase())
            .fetch_one(&self.db)
            .await?;
        Ok(count > 0)
    }

    /// Current lifecycle status for a DID
    pub async fn account_status(&self, did: &str) -> PdsResult<AccountStatus> {
        match self.get_account(did).await? {
            None => Ok(AccountStatus::Deleted),
            Some(account) if account.takedown_ref.is_some() => Ok(AccountStatus::Takendown),
            Some(account) if account.deactivated_at.is_some() => Ok(AccountStatus::Deactivated),
            Some(_) => Ok(AccountStatus::Active),
        }
    }

    pub async fn update_handle(&self, did: &str, handle: &str) -> PdsResult<()> {
        let result = sqlx::query("UPDATE actor SET handle = ?1 WHERE did = ?2")
            .bind(handle)
            .bind(did)
            .execute(&self.db)
            .await;
        match result {
            Ok(r) if r.rows_affected() == 0 => Err(PdsError::RepoNotFound(did.to_string())),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(PdsError::invalid_request("Handle already taken"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_email(&self, did: &str, email: &str) -> PdsResult<()> {
        let result = sqlx::query(
            "UPDATE account SET email = ?1, email_confirmed_at = NULL WHERE did = ?2",
        )
        .bind(email.to_lowercase())
        .bind(did)
        .execute(&self.db)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(PdsError::invalid_request("Email already registered"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_password(&self, did: &str, password: &str) -> PdsResult<()> {
        let hash = hash_password(password)?;
        sqlx::query("UPDATE account SET password_scrypt = ?1 WHERE did = ?2")
            .bind(hash)
            .bind(did)
            .execute(&self.db)
            .await?;
        self.revoke_refresh_tokens(did).await
    }

    pub async fn takedown_account(&self, did: &str, takedown_ref: &str) -> PdsResult<()> {
        sqlx::query("UPDATE actor SET takedown_ref = ?1 WHERE did = ?2")
            .bind(takedown_ref)
            .bind(did)
            .execute(&self.db)
            .await?;
        self.revoke_refresh_tokens(did).await
    }

    pub async fn activate_account(&self, did: &str) -> PdsResult<()> {
        sqlx::query(
            "UPDATE actor SET deactivated_at = NULL, delete_after = NULL WHERE did = ?1",
        )
        .bind(did)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn deactivate_account(&self, did: &str, delete_after: Option<&str>) -> PdsResult<()> {
        sqlx::query("UPDATE actor SET deactivated_at = ?1, delete_after = ?2 WHERE did = ?3")
            .bind(Utc::now().to_rfc3339())
            .bind(delete_after)
            .bind(did)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Remove every account-store row for a DID
    pub async fn delete_account(&self, did: &str) -> PdsResult<()> {
        let mut tx = self.db.begin().await?;
        for table in ["refresh_token", "app_password"] {
            sqlx::query(&format!("DELETE FROM {} WHERE did = ?1", table))
                .bind(did)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM account WHERE did = ?1")
            .bind(did)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM repo_root WHERE did = ?1")
            .bind(did)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM actor WHERE did = ?1")
            .bind(did)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Service-side repo root pointer
    pub async fn update_repo_root(&self, did: &str, cid: &str, rev: &str) -> PdsResult<()> {
        sqlx::query(
            "INSERT INTO repo_root (did, cid, rev, indexed_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(did) DO UPDATE SET
                cid = excluded.cid, rev = excluded.rev, indexed_at = excluded.indexed_at",
        )
        .bind(did)
        .bind(cid)
        .bind(rev)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

fn row_to_actor_account(row: &sqlx::sqlite::SqliteRow) -> ActorAccount {
    ActorAccount {
        did: row.get("did"),
        handle: row.get("handle"),
        email: row.get("email"),
        created_at: row.get("created_at"),
        takedown_ref: row.get("takedown_ref"),
        deactivated_at: row.get("deactivated_at"),
        email_confirmed_at: row.get("email_confirmed_at"),
        invites_disabled: row
            .get::<Option<i64>, _>("invites_disabled")
            .map(|v| v != 0)
            .unwrap_or(false),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE"))
}

pub(crate) fn expiry_string(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}

pub(crate) fn parse_time(s: &str) -> PdsResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PdsError::internal(format!("invalid timestamp: {}", e)))
}

/// Decode refresh claims without verification (we just signed them)
pub(crate) fn decode_refresh_claims(jwt: &str) -> PdsResult<SessionClaims> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| PdsError::internal("malformed JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| PdsError::internal(format!("malformed JWT payload: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| PdsError::internal(format!("malformed JWT claims: {}", e)))
}

/// 32 random bytes, base64 with the padding trimmed
fn random_jti() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes).trim_end_matches('=').to_string()
}

fn scrypt_key(password: &str, salt: &[u8]) -> PdsResult<Vec<u8>> {
    // Node-compatible parameters: N=2^14, r=8, p=1, dkLen=64
    let params = Params::new(14, 8, 1, 64)
        .map_err(|e| PdsError::internal(format!("bad scrypt params: {}", e)))?;
    let mut out = vec![0u8; 64];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut out)
        .map_err(|e| PdsError::internal(format!("scrypt failed: {}", e)))?;
    Ok(out)
}

/// Hash with a random 16-byte salt; stored as `salt:hexhash`
pub(crate) fn hash_password(password: &str) -> PdsResult<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    hash_with_salt(password, &hex::encode(salt))
}

/// App passwords use a deterministic salt derived from the DID
pub(crate) fn hash_app_password(did: &str, password: &str) -> PdsResult<String> {
    let digest = Sha256::digest(did.as_bytes());
    hash_with_salt(password, &hex::encode(&digest[..16]))
}

fn hash_with_salt(password: &str, salt: &str) -> PdsResult<String> {
    let key = scrypt_key(password, salt.as_bytes())?;
    Ok(format!("{}:{}", salt, hex::encode(key)))
}

pub(crate) fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, hash)) = stored.split_once(':') else {
        return false;
    };
    match scrypt_key(password, salt.as_bytes()) {
        Ok(key) => constant_time_eq(&hex::encode(key), hash),
        Err(_) => false,
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
pub(crate) async fn test_manager() -> (tempfile::TempDir, AccountManager) {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(ServerConfig::test_config(dir.path()));
    let db = crate::db::memory_pool().await.unwrap();
    let manager = AccountManager::new(db, config).await.unwrap();
    (dir, manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(did: &str, handle: &str, email: &str) -> CreateAccountOpts {
        CreateAccountOpts {
            did: did.to_string(),
            handle: handle.to_string(),
            email: Some(email.to_string()),
            password: Some("hunter2hunter2".to_string()),
            repo_cid: "bafyreiabc".to_string(),
            repo_rev: "3jzfcijpj2z2a".to_string(),
            invite_code: None,
            deactivated: false,
        }
    }

    #[test]
    fn test_password_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.contains(':'));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
    }

    #[test]
    fn test_app_password_salt_is_deterministic() {
        let a = hash_app_password("did:plc:abc", "pass").unwrap();
        let b = hash_app_password("did:plc:abc", "pass").unwrap();
        assert_eq!(a, b);
        let c = hash_app_password("did:plc:other", "pass").unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_create_account_and_login() {
        let (_dir, manager) = test_manager().await;
        let tokens = manager
            .create_account(opts("did:plc:alice", "alice.test", "alice@test.com"))
            .await
            .unwrap();
        assert!(!tokens.access_jwt.is_empty());
        assert!(!tokens.refresh_jwt.is_empty());

        // By handle
        let login = manager.login("alice.test", "hunter2hunter2").await.unwrap();
        assert_eq!(login.user.did, "did:plc:alice");
        assert!(login.app_password_name.is_none());
        // By email
        let login = manager
            .login("alice@test.com", "hunter2hunter2")
            .await
            .unwrap();
        assert_eq!(login.user.did, "did:plc:alice");
    }

    #[tokio::test]
    async fn test_login_failures_are_opaque() {
        let (_dir, manager) = test_manager().await;
        manager
            .create_account(opts("did:plc:bob", "bob.test", "bob@test.com"))
            .await
            .unwrap();

        let missing = manager.login("ghost.test", "x").await.unwrap_err();
        let wrong = manager.login("bob.test", "wrong").await.unwrap_err();
        assert_eq!(missing.to_string(), wrong.to_string());
        assert!(matches!(missing, PdsError::AuthRequired(_)));
        assert!(matches!(wrong, PdsError::AuthRequired(_)));
    }

    #[tokio::test]
    async fn test_duplicate_handle_and_email() {
        let (_dir, manager) = test_manager().await;
        manager
            .create_account(opts("did:plc:one", "taken.test", "one@test.com"))
            .await
            .unwrap();
        let err = manager
            .create_account(opts("did:plc:two", "taken.test", "two@test.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));
        let err = manager
            .create_account(opts("did:plc:three", "other.test", "one@test.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_access_token_round_trip() {
        let (_dir, manager) = test_manager().await;
        let tokens = manager
            .create_account(opts("did:plc:claims", "claims.test", "c@test.com"))
            .await
            .unwrap();
        let claims = manager.validate_access_token(&tokens.access_jwt).unwrap();
        assert_eq!(claims.sub, "did:plc:claims");
        assert_eq!(claims.scope, ACCESS_SCOPE);
        assert!(!claims.jti.contains('='));

        // The refresh token is not a valid access token
        let err = manager.validate_access_token(&tokens.refresh_jwt).unwrap_err();
        assert!(matches!(err, PdsError::AuthRequired(_)));
    }

    #[tokio::test]
    async fn test_refresh_rotation_rejects_replay() {
        let (_dir, manager) = test_manager().await;
        let tokens = manager
            .create_account(opts("did:plc:rotate", "rotate.test", "r@test.com"))
            .await
            .unwrap();
        let rotated = manager.refresh_session(&tokens.refresh_jwt).await.unwrap();
        assert_ne!(rotated.refresh_jwt, tokens.refresh_jwt);

        // Replaying the superseded token fails
        let err = manager.refresh_session(&tokens.refresh_jwt).await.unwrap_err();
        assert!(matches!(err, PdsError::AuthRequired(_)));
        // The fresh token still works
        manager.refresh_session(&rotated.refresh_jwt).await.unwrap();
    }

    #[tokio::test]
    async fn test_takedown_blocks_login() {
        let (_dir, manager) = test_manager().await;
        manager
            .create_account(opts("did:plc:down", "down.test", "d@test.com"))
            .await
            .unwrap();
        manager
            .takedown_account("did:plc:down", "mod-action-1")
            .await
            .unwrap();
        let err = manager.login("down.test", "hunter2hunter2").await.unwrap_err();
        assert!(matches!(err, PdsError::AccountTakedown));
        assert_eq!(
            manager.account_status("did:plc:down").await.unwrap(),
            AccountStatus::Takendown
        );
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (_dir, manager) = test_manager().await;
        manager
            .create_account(opts("did:plc:cycle", "cycle.test", "cy@test.com"))
            .await
            .unwrap();
        assert_eq!(
            manager.account_status("did:plc:cycle").await.unwrap(),
            AccountStatus::Active
        );
        manager.deactivate_account("did:plc:cycle", None).await.unwrap();
        assert_eq!(
            manager.account_status("did:plc:cycle").await.unwrap(),
            AccountStatus::Deactivated
        );
        manager.activate_account("did:plc:cycle").await.unwrap();
        assert_eq!(
            manager.account_status("did:plc:cycle").await.unwrap(),
            AccountStatus::Active
        );
        manager.delete_account("did:plc:cycle").await.unwrap();
        assert_eq!(
            manager.account_status("did:plc:cycle").await.unwrap(),
            AccountStatus::Deleted
        );
    }
}
