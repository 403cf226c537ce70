/// App passwords
///
/// Generated as sixteen base32 characters shown `xxxx-xxxx-xxxx-xxxx`;
/// only the scrypt hash is stored. Verification walks every app password
/// for the account since the cleartext carries no name.
use chrono::Utc;
use rand::RngCore;
use sqlx::Row;

use crate::account::manager::{hash_app_password, verify_password, AccountManager};
use crate::error::{PdsError, PdsResult};

/// Created app password; the cleartext is only ever returned here
#[derive(Debug, Clone)]
pub struct AppPassword {
    pub name: String,
    pub password: String,
    pub created_at: String,
    pub privileged: bool,
}

/// Listed app password metadata
#[derive(Debug, Clone)]
pub struct AppPasswordDescript {
    pub name: String,
    pub created_at: String,
    pub privileged: bool,
}

impl AccountManager {
    pub async fn create_app_password(
        &self,
        did: &str,
        name: &str,
        privileged: bool,
    ) -> PdsResult<AppPassword> {
        if name.trim().is_empty() || name.len() > 64 {
            return Err(PdsError::invalid_request("Invalid app password name"));
        }
        let password = generate_app_password();
        let hash = hash_app_password(did, &password)?;
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO app_password (did, name, password_scrypt, created_at, privileged)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(did)
        .bind(name)
        .bind(&hash)
        .bind(&now)
        .bind(privileged as i64)
        .execute(&self.db)
        .await;
        if let Err(e) = result {
            if matches!(&e, sqlx::Error::Database(db) if db.message().contains("UNIQUE")) {
                return Err(PdsError::invalid_request(
                    "App password with that name already exists",
                ));
            }
            return Err(e.into());
        }
        Ok(AppPassword {
            name: name.to_string(),
            password,
            created_at: now,
            privileged,
        })
    }

    pub async fn list_app_passwords(&self, did: &str) -> PdsResult<Vec<AppPasswordDescript>> {
        let rows = sqlx::query(
            "SELECT name, created_at, privileged FROM app_password
             WHERE did = ?1 ORDER BY created_at",
        )
        .bind(did)
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .iter()
            .map(|row| AppPasswordDescript {
                name: row.get("name"),
                created_at: row.get("created_at"),
                privileged: row.get::<i64, _>("privileged") != 0,
            })
            .collect())
    }

    pub async fn revoke_app_password(&self, did: &str, name: &str) -> PdsResult<()> {
        sqlx::query("DELETE FROM app_password WHERE did = ?1 AND name = ?2")
            .bind(did)
            .bind(name)
            .execute(&self.db)
            .await?;
        sqlx::query("DELETE FROM refresh_token WHERE did = ?1 AND app_password_name = ?2")
            .bind(did)
            .bind(name)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Match a cleartext against the account's app passwords
    pub(crate) async fn verify_app_password(
        &self,
        did: &str,
        password: &str,
    ) -> PdsResult<Option<(String, bool)>> {
        let rows = sqlx::query(
            "SELECT name, password_scrypt, privileged FROM app_password WHERE did = ?1",
        )
        .bind(did)
        .fetch_all(&self.db)
        .await?;
        for row in rows {
            let hash: String = row.get("password_scrypt");
            if verify_password(password, &hash) {
                return Ok(Some((
                    row.get::<String, _>("name"),
                    row.get::<i64, _>("privileged") != 0,
                )));
            }
        }
        Ok(None)
    }
}

/// Sixteen random base32 chars in four hyphenated groups
fn generate_app_password() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let chars: Vec<char> = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::manager::{test_manager, CreateAccountOpts};

    async fn with_account() -> (tempfile::TempDir, AccountManager) {
        let (dir, manager) = test_manager().await;
        manager
            .create_account(CreateAccountOpts {
                did: "did:plc:app".to_string(),
                handle: "app.test".to_string(),
                email: Some("app@test.com".to_string()),
                password: Some("main-password".to_string()),
                repo_cid: "bafyreiabc".to_string(),
                repo_rev: "3jzfcijpj2z2a".to_string(),
                invite_code: None,
                deactivated: false,
            })
            .await
            .unwrap();
        (dir, manager)
    }

    #[test]
    fn test_generated_format() {
        let password = generate_app_password();
        assert_eq!(password.len(), 19);
        let groups: Vec<&str> = password.split('-').collect();
        assert_eq!(groups.len(), 4);
        assert!(groups.iter().all(|g| g.len() == 4));
    }

    #[tokio::test]
    async fn test_app_password_login_path() {
        let (_dir, manager) = with_account().await;
        let created = manager
            .create_app_password("did:plc:app", "my phone", false)
            .await
            .unwrap();

        // The cleartext authenticates through the normal login path
        let login = manager.login("app.test", &created.password).await.unwrap();
        assert_eq!(login.app_password_name.as_deref(), Some("my phone"));
        assert!(!login.app_password_privileged);

        // And the main password still works
        let login = manager.login("app.test", "main-password").await.unwrap();
        assert!(login.app_password_name.is_none());
    }

    #[tokio::test]
    async fn test_revoked_app_password_stops_working() {
        let (_dir, manager) = with_account().await;
        let created = manager
            .create_app_password("did:plc:app", "old client", false)
            .await
            .unwrap();
        manager
            .revoke_app_password("did:plc:app", "old client")
            .await
            .unwrap();
        let err = manager.login("app.test", &created.password).await.unwrap_err();
        assert!(matches!(err, PdsError::AuthRequired(_)));
        assert!(manager
            .list_app_passwords("did:plc:app")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (_dir, manager) = with_account().await;
        manager
            .create_app_password("did:plc:app", "dup", false)
            .await
            .unwrap();
        let err = manager
            .create_app_password("did:plc:app", "dup", false)
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));
    }
}
