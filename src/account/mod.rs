/// Account store - actors, accounts, sessions, invites, app passwords
///
/// The service-level account database couples actor rows (DID + handle)
/// with credentials, refresh tokens, invite accounting, and the
/// service-side repo root pointer. Account creation is one transaction:
/// an actor either fully exists or not at all.

pub mod app_passwords;
pub mod creation;
pub mod invites;
pub mod manager;

pub use creation::{AccountCreator, CreateAccountInput, CreateAccountResult};
pub use manager::{AccountManager, AccountStatus, ActorAccount, Login, SessionTokens};

use sqlx::SqlitePool;

use crate::error::PdsResult;

/// Service-level account schema, created inline on startup
pub(crate) async fn create_schema(pool: &SqlitePool) -> PdsResult<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS actor (
            did TEXT PRIMARY KEY NOT NULL,
            handle TEXT,
            created_at TEXT NOT NULL,
            takedown_ref TEXT,
            deactivated_at TEXT,
            delete_after TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_actor_handle
            ON actor(handle) WHERE handle IS NOT NULL;

        CREATE TABLE IF NOT EXISTS account (
            did TEXT PRIMARY KEY NOT NULL,
            email TEXT NOT NULL,
            password_scrypt TEXT NOT NULL,
            email_confirmed_at TEXT,
            invites_disabled INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_account_email ON account(email);

        CREATE TABLE IF NOT EXISTS app_password (
            did TEXT NOT NULL,
            name TEXT NOT NULL,
            password_scrypt TEXT NOT NULL,
            created_at TEXT NOT NULL,
            privileged INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (did, name)
        );

        CREATE TABLE IF NOT EXISTS invite_code (
            code TEXT PRIMARY KEY NOT NULL,
            available_uses INTEGER NOT NULL,
            disabled INTEGER NOT NULL DEFAULT 0,
            for_account TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS invite_code_use (
            code TEXT NOT NULL,
            used_by TEXT NOT NULL,
            used_at TEXT NOT NULL,
            PRIMARY KEY (code, used_by)
        );

        CREATE TABLE IF NOT EXISTS refresh_token (
            id TEXT PRIMARY KEY NOT NULL,
            did TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            next_id TEXT,
            app_password_name TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_refresh_token_did ON refresh_token(did);

        CREATE TABLE IF NOT EXISTS repo_root (
            did TEXT PRIMARY KEY NOT NULL,
            cid TEXT NOT NULL,
            rev TEXT NOT NULL,
            indexed_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
