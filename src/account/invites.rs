/// Invite code accounting
///
/// Codes carry a fixed number of uses and belong to the account that they
/// were minted for. Availability is checked inside the create-account
/// transaction so two racing registrations cannot both consume the last
/// use.
use chrono::Utc;
use rand::Rng;
use sqlx::{Row, Sqlite, Transaction};

use crate::account::manager::AccountManager;
use crate::error::{PdsError, PdsResult};

/// One invite code with its recorded uses
#[derive(Debug, Clone)]
pub struct InviteCode {
    pub code: String,
    pub available_uses: i64,
    pub disabled: bool,
    pub for_account: String,
    pub created_by: String,
    pub created_at: String,
    pub uses: Vec<InviteCodeUse>,
}

#[derive(Debug, Clone)]
pub struct InviteCodeUse {
    pub used_by: String,
    pub used_at: String,
}

impl AccountManager {
    /// Mint invite codes; `created_by` is `admin` or a DID
    pub async fn create_invite_codes(
        &self,
        count: usize,
        use_count: i64,
        for_account: &str,
        created_by: &str,
    ) -> PdsResult<Vec<String>> {
        if count == 0 || use_count < 1 {
            return Err(PdsError::invalid_request("Invalid invite code parameters"));
        }
        let now = Utc::now().to_rfc3339();
        let mut codes = Vec::with_capacity(count);
        for _ in 0..count {
            let code = generate_invite_code(&self.config.service.hostname);
            sqlx::query(
                "INSERT INTO invite_code
                    (code, available_uses, disabled, for_account, created_by, created_at)
                 VALUES (?1, ?2, 0, ?3, ?4, ?5)",
            )
            .bind(&code)
            .bind(use_count)
            .bind(for_account)
            .bind(created_by)
            .bind(&now)
            .execute(&self.db)
            .await?;
            codes.push(code);
        }
        Ok(codes)
    }

    /// Availability check outside a transaction (pre-validation)
    pub async fn ensure_invite_is_available(&self, code: &str) -> PdsResult<()> {
        let mut tx = self.db.begin().await?;
        ensure_invite_available_tx(&mut tx, code).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Codes minted for an account, with their uses
    pub async fn invites_for_account(&self, did: &str) -> PdsResult<Vec<InviteCode>> {
        let rows = sqlx::query(
            "SELECT code, available_uses, disabled, for_account, created_by, created_at
             FROM invite_code WHERE for_account = ?1 ORDER BY created_at",
        )
        .bind(did)
        .fetch_all(&self.db)
        .await?;
        let mut codes = Vec::with_capacity(rows.len());
        for row in rows {
            let code: String = row.get("code");
            let use_rows = sqlx::query(
                "SELECT used_by, used_at FROM invite_code_use WHERE code = ?1 ORDER BY used_at",
            )
            .bind(&code)
            .fetch_all(&self.db)
            .await?;
            codes.push(InviteCode {
                code,
                available_uses: row.get("available_uses"),
                disabled: row.get::<i64, _>("disabled") != 0,
                for_account: row.get("for_account"),
                created_by: row.get("created_by"),
                created_at: row.get("created_at"),
                uses: use_rows
                    .iter()
                    .map(|u| InviteCodeUse {
                        used_by: u.get("used_by"),
                        used_at: u.get("used_at"),
                    })
                    .collect(),
            });
        }
        Ok(codes)
    }

    /// Disable every code minted for an account
    pub async fn disable_invites_for_account(&self, did: &str) -> PdsResult<()> {
        sqlx::query("UPDATE invite_code SET disabled = 1 WHERE for_account = ?1")
            .bind(did)
            .execute(&self.db)
            .await?;
        sqlx::query("UPDATE account SET invites_disabled = 1 WHERE did = ?1")
            .bind(did)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

/// Transactional availability check: not disabled, uses remaining, and
/// the minting account not taken down.
pub(crate) async fn ensure_invite_available_tx(
    tx: &mut Transaction<'_, Sqlite>,
    code: &str,
) -> PdsResult<()> {
    let row = sqlx::query(
        "SELECT invite_code.available_uses, invite_code.disabled, actor.takedown_ref
         FROM invite_code
         LEFT JOIN actor ON actor.did = invite_code.for_account
         WHERE invite_code.code = ?1",
    )
    .bind(code)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(row) = row else {
        return Err(PdsError::InvalidInviteCode);
    };
    if row.get::<i64, _>("disabled") != 0 {
        return Err(PdsError::InvalidInviteCode);
    }
    if row.get::<Option<String>, _>("takedown_ref").is_some() {
        return Err(PdsError::InvalidInviteCode);
    }
    let available: i64 = row.get("available_uses");
    let used: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invite_code_use WHERE code = ?1")
        .bind(code)
        .fetch_one(&mut **tx)
        .await?;
    if used >= available {
        return Err(PdsError::InvalidInviteCode);
    }
    Ok(())
}

/// `<hostname>-xxxxx-xxxxx` with a base32-ish alphabet
fn generate_invite_code(hostname: &str) -> String {
    const ALPHABET: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let mut segment = || {
        (0..5)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect::<String>()
    };
    let host = hostname.replace('.', "-");
    format!("{}-{}-{}", host, segment(), segment())
}
