/// Sequencer implementation
///
/// `publish` holds one async lock across seq assignment, the log append,
/// and the broadcast, so delivery order always equals seq order. The
/// subscriber registry lives behind a read-write lock; a subscriber whose
/// channel fills up is dropped rather than allowed to stall the stream.
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{PdsError, PdsResult};
use crate::metrics;
use crate::sequencer::{
    AccountEvent, CommitEvent, EventType, HandleEvent, IdentityEvent, SeqEvent, SeqRow,
    TombstoneEvent,
};

/// Sequencer configuration
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Maximum rows returned by one range query
    pub max_query_limit: i64,
    /// Per-subscriber channel capacity before the subscriber is dropped
    pub subscriber_buffer: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_query_limit: 1000,
            subscriber_buffer: 512,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SeqEvent>,
}

/// Durable ordered event log plus in-process pub/sub
#[derive(Clone)]
pub struct Sequencer {
    db: SqlitePool,
    config: SequencerConfig,
    /// Held across seq assignment + append + broadcast
    publish_lock: Arc<Mutex<()>>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl Sequencer {
    /// Open the sequencer over its database, creating the schema
    pub async fn new(db: SqlitePool, config: SequencerConfig) -> PdsResult<Self> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS repo_seq (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                did TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event BLOB NOT NULL,
                invalidated INTEGER NOT NULL DEFAULT 0,
                sequenced_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_repo_seq_did ON repo_seq(did);
            CREATE INDEX IF NOT EXISTS idx_repo_seq_time ON repo_seq(sequenced_at);
            "#,
        )
        .execute(&db)
        .await?;
        let sequencer = Self {
            db,
            config,
            publish_lock: Arc::new(Mutex::new(())),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(1)),
        };
        // Checkpoint restore: AUTOINCREMENT continues past MAX(seq) on its
        // own; reading it here surfaces corruption at startup.
        let checkpoint = sequencer.current_seq().await?;
        tracing::info!(checkpoint = ?checkpoint, "sequencer opened");
        Ok(sequencer)
    }

    pub async fn sequence_commit(&self, evt: CommitEvent) -> PdsResult<i64> {
        let did = evt.repo.clone();
        self.publish(&did, EventType::Commit, encode(&evt)?).await
    }

    pub async fn sequence_identity(&self, evt: IdentityEvent) -> PdsResult<i64> {
        let did = evt.did.clone();
        self.publish(&did, EventType::Identity, encode(&evt)?).await
    }

    pub async fn sequence_account(&self, evt: AccountEvent) -> PdsResult<i64> {
        let did = evt.did.clone();
        self.publish(&did, EventType::Account, encode(&evt)?).await
    }

    pub async fn sequence_handle(&self, evt: HandleEvent) -> PdsResult<i64> {
        let did = evt.did.clone();
        self.publish(&did, EventType::Handle, encode(&evt)?).await
    }

    pub async fn sequence_tombstone(&self, evt: TombstoneEvent) -> PdsResult<i64> {
        let did = evt.did.clone();
        self.publish(&did, EventType::Tombstone, encode(&evt)?).await
    }

    /// Assign the next seq, append to the log, and broadcast
    async fn publish(&self, did: &str, event_type: EventType, event: Vec<u8>) -> PdsResult<i64> {
        let _guard = self.publish_lock.lock().await;
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO repo_seq (did, event_type, event, invalidated, sequenced_at)
            VALUES (?1, ?2, ?3, 0, ?4)
            RETURNING seq
            "#,
        )
        .bind(did)
        .bind(event_type.as_str())
        .bind(&event)
        .bind(now.to_rfc3339())
        .fetch_one(&self.db)
        .await?;
        let seq: i64 = row.try_get("seq")?;
        metrics::EVENTS_SEQUENCED
            .with_label_values(&[event_type.as_str()])
            .inc();

        let decoded = decode_event(&SeqRow {
            seq,
            did: did.to_string(),
            event_type: event_type.as_str().to_string(),
            event,
            invalidated: false,
            sequenced_at: now,
        })?;
        self.broadcast(decoded).await;
        Ok(seq)
    }

    /// Deliver one event to every live subscriber, dropping the slow ones
    async fn broadcast(&self, event: SeqEvent) {
        let mut dropped: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for sub in subscribers.iter() {
                if sub.tx.try_send(event.clone()).is_err() {
                    dropped.push(sub.id);
                }
            }
        }
        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            subscribers.retain(|s| !dropped.contains(&s.id));
            metrics::SUBSCRIBERS_DROPPED.inc_by(dropped.len() as u64);
            tracing::warn!(count = dropped.len(), "dropped slow subscribers");
        }
    }

    /// Subscribe to the stream, optionally backfilling from `seq > cursor`
    ///
    /// Backfilled rows arrive strictly before live events; overlap between
    /// the two phases is deduplicated by seq.
    pub async fn subscribe(&self, cursor: Option<i64>) -> PdsResult<mpsc::Receiver<SeqEvent>> {
        let (out_tx, out_rx) = mpsc::channel(self.config.subscriber_buffer);
        let (live_tx, mut live_rx) = mpsc::channel(self.config.subscriber_buffer);

        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.push(Subscriber { id, tx: live_tx });
        }

        let sequencer = self.clone();
        tokio::spawn(async move {
            let mut last_sent: i64 = 0;
            if let Some(mut position) = cursor {
                loop {
                    let page = match sequencer.request_seq_range(Some(position), None, None).await
                    {
                        Ok(page) => page,
                        Err(e) => {
                            tracing::error!(error = %e, "backfill query failed");
                            break;
                        }
                    };
                    if page.is_empty() {
                        break;
                    }
                    for event in page {
                        position = event.seq();
                        if out_tx.send(event).await.is_err() {
                            sequencer.unsubscribe(id).await;
                            return;
                        }
                    }
                }
                last_sent = position;
            }

            while let Some(event) = live_rx.recv().await {
                if event.seq() <= last_sent {
                    continue;
                }
                last_sent = event.seq();
                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
            sequencer.unsubscribe(id).await;
        });

        Ok(out_rx)
    }

    async fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| s.id != id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Highest assigned seq, if any
    pub async fn current_seq(&self) -> PdsResult<Option<i64>> {
        let row = sqlx::query("SELECT MAX(seq) AS max_seq FROM repo_seq")
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("max_seq")?)
    }

    /// Next valid event after the cursor
    pub async fn next(&self, cursor: i64) -> PdsResult<Option<SeqRow>> {
        let row = sqlx::query(
            "SELECT seq, did, event_type, event, invalidated, sequenced_at
             FROM repo_seq WHERE seq > ?1 AND invalidated = 0
             ORDER BY seq ASC LIMIT 1",
        )
        .bind(cursor)
        .fetch_optional(&self.db)
        .await?;
        row.map(|r| row_to_seq_row(&r)).transpose()
    }

    /// First event at or after a wall-clock time; bridges time-based
    /// backfill cursors onto the seq domain.
    pub async fn earliest_after_time(&self, time: DateTime<Utc>) -> PdsResult<Option<SeqRow>> {
        let row = sqlx::query(
            "SELECT seq, did, event_type, event, invalidated, sequenced_at
             FROM repo_seq WHERE sequenced_at >= ?1 AND invalidated = 0
             ORDER BY sequenced_at ASC, seq ASC LIMIT 1",
        )
        .bind(time.to_rfc3339())
        .fetch_optional(&self.db)
        .await?;
        row.map(|r| row_to_seq_row(&r)).transpose()
    }

    /// Decoded events in `(earliest, latest]`, ascending
    pub async fn request_seq_range(
        &self,
        earliest: Option<i64>,
        latest: Option<i64>,
        limit: Option<i64>,
    ) -> PdsResult<Vec<SeqEvent>> {
        let limit = limit
            .unwrap_or(self.config.max_query_limit)
            .min(self.config.max_query_limit);
        let rows = sqlx::query(
            "SELECT seq, did, event_type, event, invalidated, sequenced_at
             FROM repo_seq
             WHERE invalidated = 0
               AND seq > ?1
               AND (?2 IS NULL OR seq <= ?2)
             ORDER BY seq ASC LIMIT ?3",
        )
        .bind(earliest.unwrap_or(0))
        .bind(latest)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(decode_event(&row_to_seq_row(&row)?)?);
        }
        Ok(events)
    }

    /// Mark every event for a DID invalidated (used on account deletion)
    pub async fn invalidate_for_did(&self, did: &str) -> PdsResult<()> {
        sqlx::query("UPDATE repo_seq SET invalidated = 1 WHERE did = ?1")
            .bind(did)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

fn encode<T: serde::Serialize>(evt: &T) -> PdsResult<Vec<u8>> {
    serde_cbor::to_vec(evt).map_err(|e| PdsError::internal(format!("failed to encode event: {}", e)))
}

fn row_to_seq_row(row: &sqlx::sqlite::SqliteRow) -> PdsResult<SeqRow> {
    let time: String = row.try_get("sequenced_at")?;
    Ok(SeqRow {
        seq: row.try_get("seq")?,
        did: row.try_get("did")?,
        event_type: row.try_get("event_type")?,
        event: row.try_get("event")?,
        invalidated: row.try_get::<i64, _>("invalidated")? != 0,
        sequenced_at: DateTime::parse_from_rfc3339(&time)
            .map_err(|e| PdsError::internal(format!("invalid event timestamp: {}", e)))?
            .with_timezone(&Utc),
    })
}

/// Decode a log row back into a typed event
pub fn decode_event(row: &SeqRow) -> PdsResult<SeqEvent> {
    let event_type = EventType::parse(&row.event_type)
        .ok_or_else(|| PdsError::internal(format!("unknown event type {:?}", row.event_type)))?;
    let time = row.sequenced_at.to_rfc3339();
    let seq = row.seq;
    let decode_err = |e: serde_cbor::Error| {
        PdsError::internal(format!("failed to decode {} event: {}", row.event_type, e))
    };
    Ok(match event_type {
        EventType::Commit => SeqEvent::Commit {
            seq,
            time,
            evt: serde_cbor::from_slice(&row.event).map_err(decode_err)?,
        },
        EventType::Identity => SeqEvent::Identity {
            seq,
            time,
            evt: serde_cbor::from_slice(&row.event).map_err(decode_err)?,
        },
        EventType::Account => SeqEvent::Account {
            seq,
            time,
            evt: serde_cbor::from_slice(&row.event).map_err(decode_err)?,
        },
        EventType::Handle => SeqEvent::Handle {
            seq,
            time,
            evt: serde_cbor::from_slice(&row.event).map_err(decode_err)?,
        },
        EventType::Migrate => SeqEvent::Migrate {
            seq,
            time,
            evt: serde_cbor::from_slice(&row.event).map_err(decode_err)?,
        },
        EventType::Tombstone => SeqEvent::Tombstone {
            seq,
            time,
            evt: serde_cbor::from_slice(&row.event).map_err(decode_err)?,
        },
        EventType::Info => SeqEvent::Info {
            seq,
            time,
            evt: serde_cbor::from_slice(&row.event).map_err(decode_err)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_sequencer() -> Sequencer {
        let db = crate::db::memory_pool().await.unwrap();
        Sequencer::new(db, SequencerConfig::default()).await.unwrap()
    }

    fn identity(did: &str) -> IdentityEvent {
        IdentityEvent {
            did: did.to_string(),
            handle: Some("alice.test".to_string()),
        }
    }

    #[tokio::test]
    async fn test_seq_starts_at_one_and_is_dense() {
        let sequencer = test_sequencer().await;
        for expected in 1..=5i64 {
            let seq = sequencer
                .sequence_identity(identity("did:plc:a"))
                .await
                .unwrap();
            assert_eq!(seq, expected);
        }
        assert_eq!(sequencer.current_seq().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_live_subscriber_sees_events_in_order() {
        let sequencer = test_sequencer().await;
        let mut rx = sequencer.subscribe(None).await.unwrap();
        for _ in 0..3 {
            sequencer
                .sequence_identity(identity("did:plc:a"))
                .await
                .unwrap();
        }
        for expected in 1..=3i64 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.seq(), expected);
        }
    }

    #[tokio::test]
    async fn test_backfill_then_live() {
        let sequencer = test_sequencer().await;
        for _ in 0..4 {
            sequencer
                .sequence_identity(identity("did:plc:a"))
                .await
                .unwrap();
        }
        // Subscribe from cursor 2: backfill 3, 4, then live 5
        let mut rx = sequencer.subscribe(Some(2)).await.unwrap();
        sequencer
            .sequence_identity(identity("did:plc:a"))
            .await
            .unwrap();
        let seqs: Vec<i64> = vec![
            rx.recv().await.unwrap().seq(),
            rx.recv().await.unwrap().seq(),
            rx.recv().await.unwrap().seq(),
        ];
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_invalidated_events_are_skipped() {
        let sequencer = test_sequencer().await;
        sequencer
            .sequence_identity(identity("did:plc:gone"))
            .await
            .unwrap();
        sequencer
            .sequence_identity(identity("did:plc:kept"))
            .await
            .unwrap();
        sequencer.invalidate_for_did("did:plc:gone").await.unwrap();

        let events = sequencer.request_seq_range(None, None, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].did(), "did:plc:kept");

        let next = sequencer.next(0).await.unwrap().unwrap();
        assert_eq!(next.did, "did:plc:kept");
    }

    #[tokio::test]
    async fn test_commit_event_round_trip() {
        let sequencer = test_sequencer().await;
        let evt = CommitEvent::new(
            "did:plc:repo".to_string(),
            "bafyreiabc".to_string(),
            "3jzfcijpj2z2a".to_string(),
            None,
            None,
            vec![1, 2, 3],
            vec![crate::sequencer::CommitOp {
                action: "create".to_string(),
                path: "app.bsky.feed.post/1".to_string(),
                cid: Some("bafyreidef".to_string()),
            }],
            vec![],
        );
        sequencer.sequence_commit(evt).await.unwrap();
        let events = sequencer.request_seq_range(None, None, None).await.unwrap();
        match &events[0] {
            SeqEvent::Commit { evt, seq, .. } => {
                assert_eq!(*seq, 1);
                assert_eq!(evt.repo, "did:plc:repo");
                assert_eq!(evt.blocks, vec![1, 2, 3]);
                assert_eq!(evt.ops.len(), 1);
            }
            other => panic!("expected commit event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_earliest_after_time() {
        let sequencer = test_sequencer().await;
        let before = Utc::now() - chrono::Duration::seconds(5);
        sequencer
            .sequence_identity(identity("did:plc:a"))
            .await
            .unwrap();
        let row = sequencer.earliest_after_time(before).await.unwrap();
        assert_eq!(row.unwrap().seq, 1);
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert!(sequencer.earliest_after_time(future).await.unwrap().is_none());
    }
}
