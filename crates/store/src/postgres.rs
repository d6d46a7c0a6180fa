//! PostgreSQL-backed store. Schema lives in `migrations/`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::types::{
    DeliveryStatus, DownloadEntry, EpisodeInfo, Item, Notification, PayloadRef, Source,
    SourceState,
};

use crate::{Discovery, DownloadLog, ItemStore, NotificationLog, SourceStateStore};

const ITEM_COLUMNS: &str = "id, source, external_id, title, season, episode_from, episode_to, \
                            page_url, poster_url, published_at, discovered_at, announced";

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    source: Source,
    external_id: String,
    title: String,
    season: Option<i32>,
    episode_from: Option<i32>,
    episode_to: Option<i32>,
    page_url: Option<String>,
    poster_url: Option<String>,
    published_at: DateTime<Utc>,
    discovered_at: DateTime<Utc>,
    announced: bool,
}

impl ItemRow {
    fn into_item(self, payload_refs: Vec<PayloadRef>) -> Item {
        let to_u32 = |v: Option<i32>| v.and_then(|n| u32::try_from(n).ok());
        let episode = to_u32(self.season).map(|season| EpisodeInfo {
            season,
            episode_from: to_u32(self.episode_from),
            episode_to: to_u32(self.episode_to),
        });
        Item {
            id: self.id,
            source: self.source,
            external_id: self.external_id,
            title: self.title,
            episode,
            page_url: self.page_url,
            poster_url: self.poster_url,
            published_at: self.published_at,
            discovered_at: self.discovered_at,
            announced: self.announced,
            payload_refs,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PayloadRow {
    item_id: Uuid,
    content_hash: String,
    origin_url: String,
    quality: Option<String>,
    size_bytes: i64,
    stored_at: DateTime<Utc>,
}

impl From<PayloadRow> for PayloadRef {
    fn from(row: PayloadRow) -> Self {
        PayloadRef {
            content_hash: row.content_hash,
            origin_url: row.origin_url,
            quality: row.quality,
            size_bytes: u64::try_from(row.size_bytes).unwrap_or_default(),
            stored_at: row.stored_at,
        }
    }
}

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Payload refs of several items, grouped by item and in attachment order.
    async fn payloads_for(&self, item_ids: &[Uuid]) -> anyhow::Result<HashMap<Uuid, Vec<PayloadRef>>> {
        let rows: Vec<PayloadRow> = sqlx::query_as(
            r#"
            SELECT ip.item_id, ip.content_hash, ip.origin_url, ip.quality, pr.size_bytes, pr.stored_at
            FROM item_payloads ip
            JOIN payload_refs pr ON pr.content_hash = ip.content_hash
            WHERE ip.item_id = ANY($1)
            ORDER BY ip.position
            "#,
        )
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<PayloadRef>> = HashMap::new();
        for row in rows {
            grouped.entry(row.item_id).or_default().push(row.into());
        }
        Ok(grouped)
    }

    async fn hydrate(&self, rows: Vec<ItemRow>) -> anyhow::Result<Vec<Item>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut payloads = self.payloads_for(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let refs = payloads.remove(&row.id).unwrap_or_default();
                row.into_item(refs)
            })
            .collect())
    }

    async fn find_by_key(&self, source: Source, external_id: &str) -> anyhow::Result<Option<Item>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE source = $1 AND external_id = $2"
        ))
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ItemStore for PgStore {
    async fn check_and_record(&self, item: &Item) -> anyhow::Result<Discovery> {
        let to_i32 = |v: Option<u32>| v.and_then(|n| i32::try_from(n).ok());
        let episode = item.episode.as_ref();

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO items (id, source, external_id, title, season, episode_from, episode_to,
                               page_url, poster_url, published_at, discovered_at, announced)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, false)
            ON CONFLICT (source, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(item.id)
        .bind(item.source)
        .bind(&item.external_id)
        .bind(&item.title)
        .bind(to_i32(episode.map(|e| e.season)))
        .bind(to_i32(episode.and_then(|e| e.episode_from)))
        .bind(to_i32(episode.and_then(|e| e.episode_to)))
        .bind(&item.page_url)
        .bind(&item.poster_url)
        .bind(item.published_at)
        .bind(item.discovered_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            let mut recorded = item.clone();
            recorded.announced = false;
            recorded.payload_refs.clear();
            return Ok(Discovery::New(recorded));
        }

        let existing = self
            .find_by_key(item.source, &item.external_id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "item {}/{} conflicted on insert but could not be read back",
                    item.source,
                    item.external_id
                )
            })?;
        Ok(Discovery::Existing(existing))
    }

    async fn append_payload_ref(
        &self,
        item_id: Uuid,
        payload: &PayloadRef,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO payload_refs (content_hash, origin_url, quality, size_bytes, stored_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (content_hash) DO NOTHING
            "#,
        )
        .bind(&payload.content_hash)
        .bind(&payload.origin_url)
        .bind(&payload.quality)
        .bind(i64::try_from(payload.size_bytes)?)
        .bind(payload.stored_at)
        .execute(&mut *tx)
        .await?;

        let attached = sqlx::query(
            r#"
            INSERT INTO item_payloads (item_id, content_hash, origin_url, quality)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (item_id, content_hash) DO NOTHING
            "#,
        )
        .bind(item_id)
        .bind(&payload.content_hash)
        .bind(&payload.origin_url)
        .bind(&payload.quality)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        tx.commit().await?;
        Ok(attached)
    }

    async fn claim_announcement(&self, item_id: Uuid) -> anyhow::Result<bool> {
        let claimed = sqlx::query("UPDATE items SET announced = true WHERE id = $1 AND announced = false")
            .bind(item_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
            == 1;
        Ok(claimed)
    }

    async fn get_item(&self, item_id: Uuid) -> anyhow::Result<Option<Item>> {
        let row: Option<ItemRow> =
            sqlx::query_as(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1"))
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn revise(&self, item_id: Uuid, revised: &Item) -> anyhow::Result<()> {
        let to_i32 = |v: Option<u32>| v.and_then(|n| i32::try_from(n).ok());
        let episode = revised.episode.as_ref();

        let result = sqlx::query(
            r#"
            UPDATE items
            SET title = $2, season = $3, episode_from = $4, episode_to = $5, published_at = $6
            WHERE id = $1
            "#,
        )
        .bind(item_id)
        .bind(&revised.title)
        .bind(to_i32(episode.map(|e| e.season)))
        .bind(to_i32(episode.and_then(|e| e.episode_from)))
        .bind(to_i32(episode.and_then(|e| e.episode_to)))
        .bind(revised.published_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("unknown item {}", item_id);
        }
        Ok(())
    }

    async fn recent_items(&self, source: Source, limit: i64) -> anyhow::Result<Vec<Item>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE source = $1 AND announced \
             ORDER BY discovered_at DESC, published_at DESC LIMIT $2"
        ))
        .bind(source)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }
}

#[async_trait]
impl SourceStateStore for PgStore {
    async fn load(&self, source: Source) -> anyhow::Result<SourceState> {
        let row: Option<(Option<DateTime<Utc>>, Option<String>, i32)> = sqlx::query_as(
            "SELECT last_polled_at, last_cursor, consecutive_failures FROM source_state WHERE source = $1",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((last_polled_at, last_cursor, failures)) => SourceState {
                source,
                last_polled_at,
                last_cursor,
                consecutive_failures: u32::try_from(failures).unwrap_or_default(),
            },
            None => SourceState::new(source),
        })
    }

    async fn save(&self, state: &SourceState) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_state (source, last_polled_at, last_cursor, consecutive_failures)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source) DO UPDATE
            SET last_polled_at = $2, last_cursor = $3, consecutive_failures = $4, updated_at = NOW()
            "#,
        )
        .bind(state.source)
        .bind(state.last_polled_at)
        .bind(&state.last_cursor)
        .bind(i32::try_from(state.consecutive_failures).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl NotificationLog for PgStore {
    async fn begin(&self, item_id: Uuid, channel: &str) -> anyhow::Result<Notification> {
        sqlx::query(
            r#"
            INSERT INTO notifications (item_id, channel, status, attempts)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (item_id, channel) DO NOTHING
            "#,
        )
        .bind(item_id)
        .bind(channel)
        .bind(DeliveryStatus::Pending)
        .execute(&self.pool)
        .await?;

        self.get(item_id, channel).await?.ok_or_else(|| {
            anyhow::anyhow!("notification {}/{} missing after insert", item_id, channel)
        })
    }

    async fn record_attempt(
        &self,
        item_id: Uuid,
        channel: &str,
        status: DeliveryStatus,
        attempts: i32,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE notifications
            SET status = $3, attempts = $4, last_error = $5, updated_at = NOW()
            WHERE item_id = $1 AND channel = $2 AND status <> 'delivered'
            "#,
        )
        .bind(item_id)
        .bind(channel)
        .bind(status)
        .bind(attempts)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, item_id: Uuid, channel: &str) -> anyhow::Result<Option<Notification>> {
        let row: Option<Notification> = sqlx::query_as(
            r#"
            SELECT item_id, channel, status, attempts, last_error, updated_at
            FROM notifications
            WHERE item_id = $1 AND channel = $2
            "#,
        )
        .bind(item_id)
        .bind(channel)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl DownloadLog for PgStore {
    async fn record(&self, entry: &DownloadEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_downloads (content_hash, remote_addr, user_agent, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&entry.content_hash)
        .bind(&entry.remote_addr)
        .bind(&entry.user_agent)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
