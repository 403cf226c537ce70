/// Background maintenance
///
/// The sweep is the cleanup half of the write pipeline's contract:
/// stale temp blobs, blob rows whose links disappeared mid-crash,
/// expired refresh tokens, and expired identity-cache entries all get
/// reconciled here. Every pass is idempotent.
use std::time::{Duration, SystemTime};

use crate::context::AppContext;
use crate::error::PdsResult;

/// How long a staged temp blob may sit unreferenced
const TEMP_BLOB_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Interval between maintenance passes
const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Spawn the periodic maintenance task
pub fn spawn_maintenance(ctx: AppContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = run_sweep(&ctx).await {
                tracing::error!(error = %e, "maintenance sweep failed");
            }
        }
    })
}

/// One full maintenance pass
pub async fn run_sweep(ctx: &AppContext) -> PdsResult<()> {
    sweep_temp_blobs(ctx).await?;
    let tokens = ctx.account_manager.delete_expired_refresh_tokens().await?;
    let cache_entries = ctx.identity_resolver.cleanup().await?;
    tracing::info!(
        expired_tokens = tokens,
        expired_cache_entries = cache_entries,
        "maintenance sweep complete"
    );
    Ok(())
}

/// Delete staged uploads that never got referenced by a record
async fn sweep_temp_blobs(ctx: &AppContext) -> PdsResult<()> {
    let cutoff = SystemTime::now() - TEMP_BLOB_MAX_AGE;
    let stale = ctx.blob_store.stale_temp_keys(cutoff).await?;
    for (did, key) in stale {
        if let Err(e) = ctx.blob_store.delete_temp(&did, &key).await {
            tracing::warn!(%did, %key, error = %e, "failed to delete stale temp blob");
        }
    }
    Ok(())
}

/// Drop dereferenced permanent blobs for one actor
///
/// Run after deletes and by the sweep for actors touched since the last
/// pass; re-running is harmless.
pub async fn sweep_actor_blobs(ctx: &AppContext, did: &str) -> PdsResult<()> {
    let blobs = ctx.actor_store.blobs(did).await?;
    blobs
        .delete_dereferenced_blobs(ctx.blob_store.as_ref())
        .await
}
