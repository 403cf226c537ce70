/// Actor preferences
///
/// Named JSON preference rows, scoped by namespace prefix so an app
/// password session cannot clobber preferences belonging to other apps.
use sqlx::Row;

use crate::actor_store::ActorDb;
use crate::error::{PdsError, PdsResult};

#[derive(Debug, Clone)]
pub struct Preference {
    pub name: String,
    pub value: serde_json::Value,
}

#[derive(Clone)]
pub struct PreferenceStore {
    db: ActorDb,
}

impl PreferenceStore {
    pub(crate) fn new(db: ActorDb) -> Self {
        Self { db }
    }

    /// All preferences under a namespace (e.g. `app.bsky`)
    pub async fn get_preferences(&self, namespace: &str) -> PdsResult<Vec<Preference>> {
        let rows = sqlx::query("SELECT name, value_json FROM account_pref ORDER BY id")
            .fetch_all(&self.db.pool)
            .await?;
        let mut prefs = Vec::new();
        for row in rows {
            let name: String = row.get("name");
            if !pref_in_namespace(&name, namespace) {
                continue;
            }
            let raw: String = row.get("value_json");
            let value = serde_json::from_str(&raw)
                .map_err(|e| PdsError::internal(format!("corrupt preference row: {}", e)))?;
            prefs.push(Preference { name, value });
        }
        Ok(prefs)
    }

    /// Replace every preference under a namespace
    pub async fn put_preferences(
        &self,
        namespace: &str,
        prefs: Vec<Preference>,
    ) -> PdsResult<()> {
        for pref in &prefs {
            if !pref_in_namespace(&pref.name, namespace) {
                return Err(PdsError::invalid_request(format!(
                    "Preference {:?} is outside namespace {:?}",
                    pref.name, namespace
                )));
            }
        }
        let mut tx = self.db.pool.begin().await?;
        let rows = sqlx::query("SELECT id, name FROM account_pref")
            .fetch_all(&mut *tx)
            .await?;
        for row in rows {
            let name: String = row.get("name");
            if pref_in_namespace(&name, namespace) {
                let id: i64 = row.get("id");
                sqlx::query("DELETE FROM account_pref WHERE id = ?1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        for pref in prefs {
            let value = serde_json::to_string(&pref.value)
                .map_err(|e| PdsError::internal(format!("failed to encode preference: {}", e)))?;
            sqlx::query("INSERT INTO account_pref (name, value_json) VALUES (?1, ?2)")
                .bind(&pref.name)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn pref_in_namespace(name: &str, namespace: &str) -> bool {
    name == namespace || name.starts_with(&format!("{}.", namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor_store::test_store;
    use crate::crypto::Keypair;

    #[tokio::test]
    async fn test_put_and_get_scoped() {
        let (_dir, store) = test_store().await;
        store
            .create("did:plc:prefs", &Keypair::generate())
            .await
            .unwrap();
        let prefs = store.preferences("did:plc:prefs").await.unwrap();

        prefs
            .put_preferences(
                "app.bsky",
                vec![
                    Preference {
                        name: "app.bsky.actor.defs#savedFeedsPref".to_string(),
                        value: serde_json::json!({ "pinned": ["feed1"] }),
                    },
                    Preference {
                        name: "app.bsky.actor.defs#adultContentPref".to_string(),
                        value: serde_json::json!({ "enabled": false }),
                    },
                ],
            )
            .await
            .unwrap();

        let got = prefs.get_preferences("app.bsky").await.unwrap();
        assert_eq!(got.len(), 2);

        // Replacing the namespace drops the old rows
        prefs
            .put_preferences(
                "app.bsky",
                vec![Preference {
                    name: "app.bsky.actor.defs#savedFeedsPref".to_string(),
                    value: serde_json::json!({ "pinned": [] }),
                }],
            )
            .await
            .unwrap();
        let got = prefs.get_preferences("app.bsky").await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_namespace_violation_rejected() {
        let (_dir, store) = test_store().await;
        store
            .create("did:plc:prefs2", &Keypair::generate())
            .await
            .unwrap();
        let prefs = store.preferences("did:plc:prefs2").await.unwrap();
        let err = prefs
            .put_preferences(
                "app.bsky",
                vec![Preference {
                    name: "com.other.pref".to_string(),
                    value: serde_json::json!(1),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));
    }
}
