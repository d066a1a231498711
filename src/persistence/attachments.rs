use async_trait::async_trait;
use duckdb::params;
use tracing::debug;

use super::{micros_to_datetime, Persistence};
use crate::error::Result;
use crate::sync::store::AttachmentCache;
use crate::types::Attachment;

#[async_trait]
impl AttachmentCache for Persistence {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<Attachment> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        self.run(move |inner| {
            let cached_at_us = inner.next_timestamp_us();
            let size_bytes = bytes.len() as i64;
            inner.conn.execute(
                "INSERT INTO attachments (key, bytes, content_type, cached_at_us, size_bytes)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (key) DO UPDATE SET
                    bytes = excluded.bytes,
                    content_type = excluded.content_type,
                    cached_at_us = excluded.cached_at_us,
                    size_bytes = excluded.size_bytes",
                params![key, bytes, content_type, cached_at_us, size_bytes],
            )?;
            Ok(Attachment {
                key,
                bytes,
                content_type,
                cached_at: micros_to_datetime(cached_at_us)?,
            })
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Attachment>> {
        let key = key.to_string();
        self.run(move |inner| {
            let mut stmt = inner.conn.prepare(
                "SELECT key, bytes, content_type, cached_at_us FROM attachments WHERE key = ?",
            )?;
            let rows = stmt
                .query_map(params![key], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<duckdb::Result<Vec<_>>>()?;

            match rows.into_iter().next() {
                Some((key, bytes, content_type, cached_at_us)) => Ok(Some(Attachment {
                    key,
                    bytes,
                    content_type,
                    cached_at: micros_to_datetime(cached_at_us)?,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.run(move |inner| {
            inner
                .conn
                .execute("DELETE FROM attachments WHERE key = ?", params![key])?;
            Ok(())
        })
        .await
    }

    async fn entry_count(&self) -> Result<u64> {
        self.run(|inner| {
            let count: i64 =
                inner
                    .conn
                    .query_row("SELECT COUNT(*) FROM attachments", params![], |row| {
                        row.get(0)
                    })?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn total_bytes(&self) -> Result<u64> {
        self.run(|inner| {
            let total: i64 = inner.conn.query_row(
                "SELECT CAST(COALESCE(SUM(size_bytes), 0) AS BIGINT) FROM attachments",
                params![],
                |row| row.get(0),
            )?;
            Ok(total.max(0) as u64)
        })
        .await
    }

    async fn evict_excess(
        &self,
        limit: usize,
        is_referenced: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync),
    ) -> Result<Vec<String>> {
        let keys = self
            .run(|inner| {
                let mut stmt = inner
                    .conn
                    .prepare("SELECT key FROM attachments ORDER BY cached_at_us ASC, key ASC")?;
                let keys = stmt
                    .query_map(params![], |row| row.get::<_, String>(0))?
                    .collect::<duckdb::Result<Vec<_>>>()?;
                Ok(keys)
            })
            .await?;

        let mut excess = keys.len().saturating_sub(limit);
        if excess == 0 {
            return Ok(Vec::new());
        }

        let mut victims = Vec::with_capacity(excess);
        for key in keys {
            if excess == 0 {
                break;
            }
            if is_referenced(&key) {
                debug!("Keeping attachment {} referenced by queued work", key);
                continue;
            }
            victims.push(key);
            excess -= 1;
        }

        if excess > 0 {
            debug!(
                "Attachment cache stays {} entr(ies) over its limit of {}: remaining entries are referenced",
                excess, limit
            );
        }

        let to_delete = victims.clone();
        self.run(move |inner| {
            for key in &to_delete {
                inner
                    .conn
                    .execute("DELETE FROM attachments WHERE key = ?", params![key])?;
            }
            Ok(())
        })
        .await?;

        Ok(victims)
    }
}
