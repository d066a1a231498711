use async_trait::async_trait;
use chrono::Utc;
use duckdb::{params, Connection};
use std::collections::HashSet;
use uuid::{NoContext, Timestamp, Uuid};

use super::{micros_to_datetime, Persistence};
use crate::error::{Result, SyncError};
use crate::sync::store::ActionStore;
use crate::types::{ActionPayload, ActionStatus, ActionType, FailureKind, PendingAction};

const ACTION_COLUMNS: &str = "id, action_type, payload, attachment_key, created_at_us, status, \
     retry_count, last_error, failure_kind, last_attempt_us";

/// Raw column values, converted to [`PendingAction`] outside the row callback
/// so JSON and enum errors surface as [`SyncError`].
struct ActionRow {
    id: String,
    action_type: String,
    payload: String,
    attachment_key: Option<String>,
    created_at_us: i64,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    failure_kind: Option<String>,
    last_attempt_us: Option<i64>,
}

impl ActionRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action_type: row.get(1)?,
            payload: row.get(2)?,
            attachment_key: row.get(3)?,
            created_at_us: row.get(4)?,
            status: row.get(5)?,
            retry_count: row.get(6)?,
            last_error: row.get(7)?,
            failure_kind: row.get(8)?,
            last_attempt_us: row.get(9)?,
        })
    }

    fn into_action(self) -> Result<PendingAction> {
        let status = ActionStatus::parse(&self.status).ok_or_else(|| {
            SyncError::Internal(format!(
                "unknown status '{}' on action {}",
                self.status, self.id
            ))
        })?;
        let last_attempt_at = self.last_attempt_us.map(micros_to_datetime).transpose()?;

        Ok(PendingAction {
            action_type: ActionType::parse(&self.action_type),
            payload: ActionPayload {
                data: serde_json::from_str(&self.payload)?,
                attachment: self.attachment_key,
            },
            created_at: micros_to_datetime(self.created_at_us)?,
            status,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
            last_error: self.last_error,
            failure_kind: self.failure_kind.as_deref().and_then(FailureKind::parse),
            last_attempt_at,
            id: self.id,
        })
    }
}

fn query_actions(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<PendingAction>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, ActionRow::from_row)?
        .collect::<duckdb::Result<Vec<_>>>()?;
    rows.into_iter().map(ActionRow::into_action).collect()
}

#[async_trait]
impl ActionStore for Persistence {
    async fn enqueue(
        &self,
        action_type: ActionType,
        payload: ActionPayload,
    ) -> Result<PendingAction> {
        let data = serde_json::to_string(&payload.data)
            .map_err(|e| SyncError::Enqueue(format!("payload is not serializable: {}", e)))?;

        self.run(move |inner| {
            let id = Uuid::new_v7(Timestamp::now(NoContext)).to_string();
            let created_at_us = inner.next_timestamp_us();

            inner
                .conn
                .execute(
                    "INSERT INTO pending_actions
                        (id, action_type, payload, attachment_key, created_at_us, status, retry_count)
                     VALUES (?, ?, ?, ?, ?, 'pending', 0)",
                    params![
                        id,
                        action_type.as_str(),
                        data,
                        payload.attachment.as_deref(),
                        created_at_us
                    ],
                )
                .map_err(|e| SyncError::Enqueue(e.to_string()))?;

            Ok(PendingAction {
                id,
                action_type,
                payload,
                created_at: micros_to_datetime(created_at_us)?,
                status: ActionStatus::Pending,
                retry_count: 0,
                last_error: None,
                failure_kind: None,
                last_attempt_at: None,
            })
        })
        .await
    }

    async fn list_ordered(&self) -> Result<Vec<PendingAction>> {
        self.run(|inner| {
            let sql = format!(
                "SELECT {} FROM pending_actions ORDER BY created_at_us ASC, id ASC",
                ACTION_COLUMNS
            );
            query_actions(&inner.conn, &sql, params![])
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<PendingAction>> {
        let id = id.to_string();
        self.run(move |inner| {
            let sql = format!("SELECT {} FROM pending_actions WHERE id = ?", ACTION_COLUMNS);
            Ok(query_actions(&inner.conn, &sql, params![id])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn mark_syncing(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |inner| {
            inner.conn.execute(
                "UPDATE pending_actions SET status = 'syncing' WHERE id = ?",
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, id: &str, kind: FailureKind, error: &str) -> Result<()> {
        let id = id.to_string();
        let error = error.to_string();
        self.run(move |inner| {
            inner.conn.execute(
                "UPDATE pending_actions
                 SET status = 'failed',
                     retry_count = retry_count + 1,
                     last_error = ?,
                     failure_kind = ?,
                     last_attempt_us = ?
                 WHERE id = ?",
                params![error, kind.as_str(), Utc::now().timestamp_micros(), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.run(move |inner| {
            inner
                .conn
                .execute("DELETE FROM pending_actions WHERE id = ?", params![id])?;
            Ok(())
        })
        .await
    }

    async fn count(&self) -> Result<u64> {
        self.run(|inner| {
            let count: i64 =
                inner
                    .conn
                    .query_row("SELECT COUNT(*) FROM pending_actions", params![], |row| {
                        row.get(0)
                    })?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn oldest_failure(&self) -> Result<Option<PendingAction>> {
        self.run(|inner| {
            let sql = format!(
                "SELECT {} FROM pending_actions WHERE status = 'failed'
                 ORDER BY created_at_us ASC, id ASC LIMIT 1",
                ACTION_COLUMNS
            );
            Ok(query_actions(&inner.conn, &sql, params![])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn referenced_attachment_keys(&self) -> Result<HashSet<String>> {
        self.run(|inner| {
            let mut stmt = inner.conn.prepare(
                "SELECT DISTINCT attachment_key FROM pending_actions
                 WHERE attachment_key IS NOT NULL",
            )?;
            let keys = stmt
                .query_map(params![], |row| row.get::<_, String>(0))?
                .collect::<duckdb::Result<HashSet<_>>>()?;
            Ok(keys)
        })
        .await
    }
}
