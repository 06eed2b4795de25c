use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::{
    now_iso, phone_variants, LogEntry, MediaMeta, OrderRecord, SessionRecord,
};

pub const SESSION_TTL: Duration = Duration::hours(24);
pub const ORDER_TTL: Duration = Duration::days(7);
pub const INQUIRY_TTL: Duration = Duration::days(7);
pub const AGENT_REQUEST_TTL: Duration = Duration::hours(1);
pub const MEDIA_TTL: Duration = Duration::days(30);
pub const LOG_CAP: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The storage engine capability: a string/blob keyspace with per-key TTLs,
/// prefix scans and capped append-only lists. The conversation engine is
/// written against this trait, not against a concrete backend.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set_blob(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;
    /// Push to the head of a list, trimming it to `cap` newest entries.
    async fn list_push(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError>;
}

/// Postgres-backed store. Expiry is written as an `expires_at` column and
/// enforced on read, so lapsed keys simply stop resolving.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    fn expires_at(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| Utc::now() + ttl)
    }
}

#[async_trait]
impl KeyValueStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT value FROM kv_entries \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(Self::expires_at(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT key FROM kv_entries \
             WHERE key LIKE $1 || '%' AND (expires_at IS NULL OR expires_at > now()) \
             ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("key")).collect())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(
            "SELECT value FROM kv_blobs \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn set_blob(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv_blobs (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(Self::expires_at(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO kv_lists (key, entry) VALUES ($1, $2)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "DELETE FROM kv_lists WHERE key = $1 AND id NOT IN \
             (SELECT id FROM kv_lists WHERE key = $1 ORDER BY id DESC LIMIT $2)",
        )
        .bind(key)
        .bind(cap as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory store used by the test suite. Carries a controllable clock skew
/// so retention windows can be exercised without waiting them out.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<DateTime<Utc>>)>>,
    blobs: Mutex<HashMap<String, (Vec<u8>, Option<DateTime<Utc>>)>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    skew: Mutex<Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            lists: Mutex::new(HashMap::new()),
            skew: Mutex::new(Duration::zero()),
        }
    }

    /// Shift this store's notion of "now" forward.
    pub async fn advance(&self, by: Duration) {
        let mut skew = self.skew.lock().await;
        *skew = *skew + by;
    }

    async fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.skew.lock().await
    }

    pub async fn list_entries(&self, key: &str) -> Vec<String> {
        self.lists
            .lock()
            .await
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.now().await;
        let entries = self.entries.lock().await;
        Ok(entries.get(key).and_then(|(value, expires_at)| {
            match expires_at {
                Some(at) if *at <= now => None,
                _ => Some(value.clone()),
            }
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = match ttl {
            Some(ttl) => Some(self.now().await + ttl),
            None => None,
        };
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = self.now().await;
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, (_, expires_at))| {
                key.starts_with(prefix)
                    && match expires_at {
                        Some(at) => *at > now,
                        None => true,
                    }
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.now().await;
        let blobs = self.blobs.lock().await;
        Ok(blobs.get(key).and_then(|(value, expires_at)| {
            match expires_at {
                Some(at) if *at <= now => None,
                _ => Some(value.clone()),
            }
        }))
    }

    async fn set_blob(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = match ttl {
            Some(ttl) => Some(self.now().await + ttl),
            None => None,
        };
        self.blobs
            .lock()
            .await
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError> {
        let mut lists = self.lists.lock().await;
        let list = lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        list.truncate(cap);
        Ok(())
    }
}

/// Domain access layer over the raw keyspace. Owns the lifetimes of session,
/// order, inquiry and media records; everything above it only holds
/// request-scoped copies.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Fetch the session for an identity. Never fails: storage errors and
    /// undecodable records both come back as a fresh default session.
    pub async fn get_session(&self, identity: &str) -> SessionRecord {
        let key = format!("session:{identity}");
        match self.kv.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(identity, error = %err, "undecodable session record, resetting");
                SessionRecord::default()
            }),
            Ok(None) => SessionRecord::default(),
            Err(err) => {
                tracing::error!(identity, error = %err, "session read failed, using default");
                SessionRecord::default()
            }
        }
    }

    /// Persist a session, refreshing the retention window. Last write wins;
    /// two messages racing on one identity is an accepted hazard, not
    /// something this layer serializes.
    pub async fn put_session(
        &self,
        identity: &str,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let key = format!("session:{identity}");
        let raw = serde_json::to_string(record)?;
        self.kv.set(&key, &raw, Some(SESSION_TTL)).await?;
        self.append_log(identity, "state", "state", json!(record)).await;
        Ok(())
    }

    /// Append to the per-identity interaction log. Best effort: failures are
    /// recorded and swallowed, never surfaced to the turn.
    pub async fn append_log(&self, identity: &str, direction: &str, kind: &str, payload: Value) {
        let entry = LogEntry {
            timestamp: now_iso(),
            direction: direction.to_string(),
            kind: kind.to_string(),
            payload,
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        if let Err(err) = self
            .kv
            .list_push(&format!("conversation:{identity}"), &raw, LOG_CAP)
            .await
        {
            tracing::warn!(identity, error = %err, "interaction log append failed");
        }
    }

    pub async fn save_order(&self, order: &OrderRecord) -> Result<(), StoreError> {
        let key = format!("order:{}", order.order_number);
        let raw = serde_json::to_string(order)?;
        self.kv.set(&key, &raw, Some(ORDER_TTL)).await
    }

    pub async fn get_order(&self, reference: &str) -> Result<Option<OrderRecord>, StoreError> {
        let key = format!("order:{}", reference.to_uppercase());
        match self.kv.get(&key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Linear scan of all order keys, matching the customer phone across its
    /// formatted variants by substring. O(n) in stored orders and loose
    /// enough to false-positive on short suffixes; kept for compatibility
    /// with the historical lookup behavior.
    pub async fn find_order_by_phone(
        &self,
        raw_phone: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        let wanted = phone_variants(raw_phone);
        if wanted.is_empty() {
            return Ok(None);
        }
        let keys = self.kv.scan("order:").await?;
        if keys.len() > 100 {
            tracing::warn!(orders = keys.len(), "order-by-phone scan is getting expensive");
        }
        for key in keys {
            let Some(order_raw) = self.kv.get(&key).await? else {
                continue;
            };
            let Ok(order) = serde_json::from_str::<OrderRecord>(&order_raw) else {
                continue;
            };
            let Some(stored_phone) = order.fields.phone.clone() else {
                continue;
            };
            let stored = phone_variants(&stored_phone);
            let hit = wanted
                .iter()
                .any(|w| stored.iter().any(|s| s.contains(w.as_str())));
            if hit {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    /// Persist an inquiry/callback/agent-request record under
    /// `{prefix}:{id}`.
    pub async fn save_inquiry(
        &self,
        prefix: &str,
        id: &str,
        payload: &Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(payload)?;
        self.kv.set(&format!("{prefix}:{id}"), &raw, Some(ttl)).await
    }

    pub async fn save_media(
        &self,
        kind: &str,
        key: &str,
        bytes: &[u8],
        meta: &MediaMeta,
    ) -> Result<(), StoreError> {
        self.kv
            .set_blob(&format!("media:{kind}:{key}"), bytes, Some(MEDIA_TTL))
            .await?;
        let raw = serde_json::to_string(meta)?;
        self.kv
            .set(&format!("media_meta:{kind}:{key}"), &raw, Some(MEDIA_TTL))
            .await
    }

    pub async fn get_media(
        &self,
        kind: &str,
        key: &str,
    ) -> Result<Option<(Vec<u8>, MediaMeta)>, StoreError> {
        let Some(bytes) = self.kv.get_blob(&format!("media:{kind}:{key}")).await? else {
            return Ok(None);
        };
        let meta = match self.kv.get(&format!("media_meta:{kind}:{key}")).await? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };
        let meta = meta.unwrap_or_else(|| MediaMeta {
            order_ref: None,
            content_type: "application/octet-stream".to_string(),
            media_id: String::new(),
            received_at: now_iso(),
        });
        Ok(Some((bytes, meta)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderFields, Step};

    fn store() -> (Arc<MemoryStore>, SessionStore) {
        let kv = Arc::new(MemoryStore::new());
        (kv.clone(), SessionStore::new(kv))
    }

    fn order(reference: &str, phone: &str) -> OrderRecord {
        OrderRecord {
            order_number: reference.to_string(),
            fields: OrderFields {
                phone: Some(phone.to_string()),
                ..OrderFields::default()
            },
            selected_item: Some("Cake Fairy Cake - $20".to_string()),
            quoted_price: Some(20),
            status: "pending".to_string(),
            timestamp: now_iso(),
            design_image_key: None,
            payment_proof_key: None,
        }
    }

    #[tokio::test]
    async fn missing_session_comes_back_as_default() {
        let (_, store) = store();
        let record = store.get_session("+263771234567").await;
        assert_eq!(record.step, Step::Welcome);
        assert_eq!(record.fields, OrderFields::default());
    }

    #[tokio::test]
    async fn undecodable_session_resets_to_default() {
        let (kv, store) = store();
        kv.set("session:+263771234567", "{not json", Some(SESSION_TTL))
            .await
            .unwrap();
        let record = store.get_session("+263771234567").await;
        assert_eq!(record.step, Step::Welcome);
    }

    #[tokio::test]
    async fn session_survives_a_round_trip() {
        let (_, store) = store();
        let mut record = SessionRecord::default();
        record.step = Step::CollectingOrder;
        record.fields.name = Some("Rudo".to_string());
        store.put_session("+263771234567", &record).await.unwrap();
        let loaded = store.get_session("+263771234567").await;
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn orders_expire_after_seven_days() {
        let (kv, store) = store();
        store.save_order(&order("AB12CD34", "+263771234567")).await.unwrap();

        kv.advance(Duration::days(6)).await;
        assert!(store.get_order("AB12CD34").await.unwrap().is_some());

        kv.advance(Duration::days(2)).await;
        assert!(store.get_order("AB12CD34").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn order_lookup_is_case_insensitive_on_reference() {
        let (_, store) = store();
        store.save_order(&order("AB12CD34", "+263771234567")).await.unwrap();
        assert!(store.get_order("ab12cd34").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn order_scan_matches_phone_variants() {
        let (_, store) = store();
        store.save_order(&order("AB12CD34", "+263771234567")).await.unwrap();

        let by_local = store.find_order_by_phone("0771234567").await.unwrap();
        assert!(by_local.is_some());
        let by_bare = store.find_order_by_phone("263771234567").await.unwrap();
        assert_eq!(by_bare.unwrap().order_number, "AB12CD34");
        let miss = store.find_order_by_phone("0779999999").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn interaction_log_is_capped() {
        let (kv, store) = store();
        for i in 0..(LOG_CAP + 20) {
            store
                .append_log("+263771234567", "in", "text", json!({ "text": i }))
                .await;
        }
        let entries = kv.list_entries("conversation:+263771234567").await;
        assert_eq!(entries.len(), LOG_CAP);
        // newest first
        let newest: LogEntry = serde_json::from_str(&entries[0]).unwrap();
        assert_eq!(newest.payload, json!({ "text": LOG_CAP + 19 }));
    }

    #[tokio::test]
    async fn media_round_trips_with_metadata() {
        let (_, store) = store();
        let meta = MediaMeta {
            order_ref: Some("AB12CD34".to_string()),
            content_type: "image/jpeg".to_string(),
            media_id: "media-1".to_string(),
            received_at: now_iso(),
        };
        store
            .save_media("payment", "AB12CD34", b"bytes", &meta)
            .await
            .unwrap();
        let (bytes, loaded) = store.get_media("payment", "AB12CD34").await.unwrap().unwrap();
        assert_eq!(bytes, b"bytes");
        assert_eq!(loaded.content_type, "image/jpeg");
    }
}
