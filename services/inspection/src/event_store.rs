use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Errors raised by an [`EventStore`]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One ingested PLC tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RawEvent {
    /// Monotonic id assigned at ingestion
    pub id: i64,
    /// When the ingestion collaborator delivered the tick
    pub delivered_at: DateTime<Utc>,
    /// Opaque JSON payload, stored verbatim
    pub payload: String,
    pub processed: bool,
}

/// Outcome of appending a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Appended {
    Inserted(RawEvent),
    /// Same payload was already delivered; nothing stored
    Duplicate(i64),
}

impl Appended {
    pub fn id(&self) -> i64 {
        match self {
            Appended::Inserted(event) => event.id,
            Appended::Duplicate(id) => *id,
        }
    }
}

/// Keyset position in the `(delivered_at, id)` order of the backlog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventCursor {
    pub delivered_at: DateTime<Utc>,
    pub id: i64,
}

impl EventCursor {
    pub fn after(event: &RawEvent) -> Self {
        Self {
            delivered_at: event.delivered_at,
            id: event.id,
        }
    }
}

/// SHA-256 hex digest used to detect redelivered payloads
pub fn payload_digest(payload: &str) -> String {
    format!("{:x}", Sha256::digest(payload.as_bytes()))
}

/// Append-only raw event log.
///
/// Nothing is ever deleted. Consumption happens through claims: a pass claims
/// every event of a cycle at once, then either completes (marks processed) or
/// releases them. Claims are leases so a crashed worker's events become
/// claimable again.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, delivered_at: DateTime<Utc>, payload: &str) -> Result<Appended, StoreError>;

    /// Unprocessed events without a live claim, ordered by `(delivered_at, id)`
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<RawEvent>, StoreError> {
        self.fetch_unprocessed_after(None, limit).await
    }

    /// Next page of the backlog, strictly after `cursor`
    async fn fetch_unprocessed_after(
        &self,
        cursor: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<RawEvent>, StoreError>;

    /// All-or-nothing claim. Returns false, claiming nothing, if any id is
    /// processed or held by another owner's live lease.
    async fn claim(&self, ids: &[i64], owner: &str, lease: Duration) -> Result<bool, StoreError>;

    /// Mark events claimed by `owner` as processed; returns rows updated
    async fn complete(&self, ids: &[i64], owner: &str) -> Result<u64, StoreError>;

    /// Drop `owner`'s claim without processing
    async fn release(&self, ids: &[i64], owner: &str) -> Result<u64, StoreError>;

    /// Mark unclaimed events processed without a cycle (malformed, keyless, idle)
    async fn discard(&self, ids: &[i64]) -> Result<u64, StoreError>;

    async fn count_unprocessed(&self) -> Result<i64, StoreError>;
}

/// PostgreSQL-backed event log
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self, payload))]
    async fn append(&self, delivered_at: DateTime<Utc>, payload: &str) -> Result<Appended, StoreError> {
        let digest = payload_digest(payload);

        let inserted = sqlx::query_as::<_, RawEvent>(
            r#"
            INSERT INTO raw_events (delivered_at, payload, payload_digest)
            VALUES ($1, $2, $3)
            ON CONFLICT (payload_digest) DO NOTHING
            RETURNING id, delivered_at, payload, processed
            "#,
        )
        .bind(delivered_at)
        .bind(payload)
        .bind(&digest)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(event) = inserted {
            return Ok(Appended::Inserted(event));
        }

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM raw_events WHERE payload_digest = $1")
            .bind(&digest)
            .fetch_one(&self.pool)
            .await?;

        debug!(event_id = id, "Duplicate delivery ignored");
        Ok(Appended::Duplicate(id))
    }

    async fn fetch_unprocessed_after(
        &self,
        cursor: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<RawEvent>, StoreError> {
        let events = sqlx::query_as::<_, RawEvent>(
            r#"
            SELECT id, delivered_at, payload, processed
            FROM raw_events
            WHERE NOT processed
              AND (claimed_by IS NULL OR claim_expires_at < NOW())
              AND ($2::timestamptz IS NULL OR (delivered_at, id) > ($2::timestamptz, $3::bigint))
            ORDER BY delivered_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .bind(cursor.map(|c| c.delivered_at))
        .bind(cursor.map(|c| c.id))
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    #[instrument(skip(self, ids), fields(events = ids.len()))]
    async fn claim(&self, ids: &[i64], owner: &str, lease: Duration) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row locks serialize competing claims; the loser re-evaluates the
        // WHERE clause after the winner commits and matches fewer rows.
        let claimed = sqlx::query(
            r#"
            UPDATE raw_events
            SET claimed_by = $2,
                claim_expires_at = NOW() + ($3::double precision * INTERVAL '1 second')
            WHERE id = ANY($1)
              AND NOT processed
              AND (claimed_by IS NULL OR claimed_by = $2 OR claim_expires_at < NOW())
            "#,
        )
        .bind(ids)
        .bind(owner)
        .bind(lease.num_milliseconds() as f64 / 1000.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed as usize != ids.len() {
            tx.rollback().await?;
            debug!(claimed, wanted = ids.len(), "Claim lost");
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn complete(&self, ids: &[i64], owner: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE raw_events
            SET processed = TRUE, processed_at = NOW(),
                claimed_by = NULL, claim_expires_at = NULL
            WHERE id = ANY($1) AND claimed_by = $2 AND NOT processed
            "#,
        )
        .bind(ids)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release(&self, ids: &[i64], owner: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE raw_events
            SET claimed_by = NULL, claim_expires_at = NULL
            WHERE id = ANY($1) AND claimed_by = $2
            "#,
        )
        .bind(ids)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn discard(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE raw_events
            SET processed = TRUE, processed_at = NOW()
            WHERE id = ANY($1)
              AND NOT processed
              AND (claimed_by IS NULL OR claim_expires_at < NOW())
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_unprocessed(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM raw_events WHERE NOT processed")
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

#[derive(Debug, Clone)]
struct Claim {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredEvent {
    event: RawEvent,
    claim: Option<Claim>,
}

impl StoredEvent {
    fn claimable_by(&self, owner: Option<&str>, now: DateTime<Utc>) -> bool {
        if self.event.processed {
            return false;
        }
        match &self.claim {
            None => true,
            Some(claim) => claim.expires_at < now || Some(claim.owner.as_str()) == owner,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    events: Vec<StoredEvent>,
    by_digest: HashMap<String, i64>,
    next_id: i64,
}

impl MemoryInner {
    fn index_of(&self, id: i64) -> Option<usize> {
        self.events.binary_search_by_key(&id, |e| e.event.id).ok()
    }
}

/// In-process event log with the same claim semantics as [`PgEventStore`]
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored event, processed or not
    pub async fn all(&self) -> Vec<RawEvent> {
        let inner = self.inner.lock().await;
        inner.events.iter().map(|e| e.event.clone()).collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, delivered_at: DateTime<Utc>, payload: &str) -> Result<Appended, StoreError> {
        let digest = payload_digest(payload);
        let mut inner = self.inner.lock().await;

        if let Some(id) = inner.by_digest.get(&digest) {
            return Ok(Appended::Duplicate(*id));
        }

        inner.next_id += 1;
        let event = RawEvent {
            id: inner.next_id,
            delivered_at,
            payload: payload.to_string(),
            processed: false,
        };
        inner.by_digest.insert(digest, event.id);
        inner.events.push(StoredEvent {
            event: event.clone(),
            claim: None,
        });

        Ok(Appended::Inserted(event))
    }

    async fn fetch_unprocessed_after(
        &self,
        cursor: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<RawEvent>, StoreError> {
        let now = Utc::now();
        let inner = self.inner.lock().await;

        let mut events: Vec<RawEvent> = inner
            .events
            .iter()
            .filter(|e| e.claimable_by(None, now))
            .filter(|e| cursor.map_or(true, |c| EventCursor::after(&e.event) > c))
            .map(|e| e.event.clone())
            .collect();
        events.sort_by_key(|e| (e.delivered_at, e.id));
        events.truncate(limit);

        Ok(events)
    }

    async fn claim(&self, ids: &[i64], owner: &str, lease: Duration) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let mut positions = Vec::with_capacity(ids.len());
        for id in ids {
            match inner.index_of(*id) {
                Some(pos) if inner.events[pos].claimable_by(Some(owner), now) => positions.push(pos),
                _ => return Ok(false),
            }
        }

        for pos in positions {
            inner.events[pos].claim = Some(Claim {
                owner: owner.to_string(),
                expires_at: now + lease,
            });
        }

        Ok(true)
    }

    async fn complete(&self, ids: &[i64], owner: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;

        for id in ids {
            let Some(pos) = inner.index_of(*id) else {
                continue;
            };
            let stored = &mut inner.events[pos];
            let owned = stored.claim.as_ref().is_some_and(|c| c.owner == owner);
            if owned && !stored.event.processed {
                stored.event.processed = true;
                stored.claim = None;
                updated += 1;
            }
        }

        if updated as usize != ids.len() {
            warn!(updated, wanted = ids.len(), "Completed fewer events than claimed");
        }

        Ok(updated)
    }

    async fn release(&self, ids: &[i64], owner: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut updated = 0;

        for id in ids {
            let Some(pos) = inner.index_of(*id) else {
                continue;
            };
            let stored = &mut inner.events[pos];
            if stored.claim.as_ref().is_some_and(|c| c.owner == owner) {
                stored.claim = None;
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn discard(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut updated = 0;

        for id in ids {
            let Some(pos) = inner.index_of(*id) else {
                continue;
            };
            let stored = &mut inner.events[pos];
            if stored.claimable_by(None, now) {
                stored.event.processed = true;
                stored.claim = None;
                updated += 1;
            }
        }

        Ok(updated)
    }

    async fn count_unprocessed(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.iter().filter(|e| !e.event.processed).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_766_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_ids_and_dedupes() {
        let store = MemoryEventStore::new();
        let a = store.append(at(0), r#"{"n":1}"#).await.unwrap();
        let b = store.append(at(1), r#"{"n":2}"#).await.unwrap();
        let again = store.append(at(5), r#"{"n":1}"#).await.unwrap();

        assert!(a.id() < b.id());
        assert_eq!(again, Appended::Duplicate(a.id()));
        assert_eq!(store.count_unprocessed().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fetch_orders_by_delivery_and_limits() {
        let store = MemoryEventStore::new();
        store.append(at(10), r#"{"n":1}"#).await.unwrap();
        store.append(at(5), r#"{"n":2}"#).await.unwrap();
        store.append(at(7), r#"{"n":3}"#).await.unwrap();

        let events = store.fetch_unprocessed(2).await.unwrap();
        let payloads: Vec<_> = events.iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(payloads, vec![r#"{"n":2}"#, r#"{"n":3}"#]);
    }

    #[tokio::test]
    async fn test_fetch_pages_with_cursor() {
        let store = MemoryEventStore::new();
        for n in 0..5 {
            store.append(at(n), &format!(r#"{{"n":{n}}}"#)).await.unwrap();
        }

        let first = store.fetch_unprocessed(2).await.unwrap();
        let cursor = first.last().map(EventCursor::after);
        let second = store.fetch_unprocessed_after(cursor, 2).await.unwrap();
        let cursor = second.last().map(EventCursor::after);
        let third = store.fetch_unprocessed_after(cursor, 2).await.unwrap();

        let ids: Vec<i64> = first.iter().chain(&second).chain(&third).map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_all_or_nothing() {
        let store = MemoryEventStore::new();
        let a = store.append(at(0), r#"{"n":1}"#).await.unwrap().id();
        let b = store.append(at(1), r#"{"n":2}"#).await.unwrap().id();
        let c = store.append(at(2), r#"{"n":3}"#).await.unwrap().id();

        assert!(store.claim(&[a, b], "w1", Duration::seconds(60)).await.unwrap());
        // b is held by w1, so w2 gets neither b nor c
        assert!(!store.claim(&[b, c], "w2", Duration::seconds(60)).await.unwrap());
        assert!(store.claim(&[c], "w2", Duration::seconds(60)).await.unwrap());

        // claimed events disappear from the backlog
        assert!(store.fetch_unprocessed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken_over() {
        let store = MemoryEventStore::new();
        let a = store.append(at(0), r#"{"n":1}"#).await.unwrap().id();

        assert!(store.claim(&[a], "w1", Duration::seconds(-1)).await.unwrap());
        assert!(store.claim(&[a], "w2", Duration::seconds(60)).await.unwrap());
        assert_eq!(store.complete(&[a], "w1").await.unwrap(), 0);
        assert_eq!(store.complete(&[a], "w2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_complete_release_and_discard() {
        let store = MemoryEventStore::new();
        let a = store.append(at(0), r#"{"n":1}"#).await.unwrap().id();
        let b = store.append(at(1), r#"{"n":2}"#).await.unwrap().id();

        assert!(store.claim(&[a], "w1", Duration::seconds(60)).await.unwrap());
        assert_eq!(store.discard(&[a, b]).await.unwrap(), 1);
        assert_eq!(store.release(&[a], "w1").await.unwrap(), 1);

        let backlog = store.fetch_unprocessed(10).await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, a);

        assert!(store.claim(&[a], "w1", Duration::seconds(60)).await.unwrap());
        assert_eq!(store.complete(&[a], "w1").await.unwrap(), 1);
        assert_eq!(store.count_unprocessed().await.unwrap(), 0);
        assert!(store.all().await.iter().all(|e| e.processed));
    }

    #[test]
    fn test_payload_digest_is_stable() {
        assert_eq!(payload_digest("abc"), payload_digest("abc"));
        assert_ne!(payload_digest("abc"), payload_digest("abd"));
        assert_eq!(payload_digest("").len(), 64);
    }
}
