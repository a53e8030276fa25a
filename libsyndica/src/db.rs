//! Database operations for Syndica

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

use crate::error::Result;
use crate::platforms::PlatformId;
use crate::types::{ErrorSnapshot, IntentStatus, PostIntent, PublishContent, PublishOutcome};

/// Encrypted credential record as stored. Sealed fields are opaque
/// base64(nonce || ciphertext) blobs produced by the vault.
#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub user_id: String,
    pub platform: PlatformId,
    pub access_sealed: String,
    pub refresh_sealed: Option<String>,
    pub page_sealed: Option<String>,
    pub external_account_id: Option<String>,
    pub scope: String,
    pub expires_at: Option<i64>,
    pub connected_at: i64,
    pub updated_at: i64,
}

/// Pending authorization handshake record.
#[derive(Debug, Clone)]
pub struct HandshakeRow {
    pub id: String,
    pub user_id: String,
    pub platform: PlatformId,
    pub pkce_verifier: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::error::DbError::IoError)?;
        }

        // Use forward slashes for SQLite URL (works on both Windows and Unix)
        // Use mode=rwc to allow creating the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(crate::error::DbError::MigrationError)?;

        Ok(Self { pool })
    }

    // ---- credentials ----

    /// Insert or replace the credential record for (user, platform)
    pub async fn upsert_credential(&self, row: &CredentialRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials
                (user_id, platform, access_sealed, refresh_sealed, page_sealed,
                 external_account_id, scope, expires_at, connected_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, platform) DO UPDATE SET
                access_sealed = excluded.access_sealed,
                refresh_sealed = excluded.refresh_sealed,
                page_sealed = excluded.page_sealed,
                external_account_id = excluded.external_account_id,
                scope = excluded.scope,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.user_id)
        .bind(row.platform)
        .bind(&row.access_sealed)
        .bind(&row.refresh_sealed)
        .bind(&row.page_sealed)
        .bind(&row.external_account_id)
        .bind(&row.scope)
        .bind(row.expires_at)
        .bind(row.connected_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Get the credential record for (user, platform)
    pub async fn get_credential(
        &self,
        user_id: &str,
        platform: PlatformId,
    ) -> Result<Option<CredentialRow>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, platform, access_sealed, refresh_sealed, page_sealed,
                   external_account_id, scope, expires_at, connected_at, updated_at
            FROM credentials WHERE user_id = ? AND platform = ?
            "#,
        )
        .bind(user_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.map(|r| CredentialRow {
            user_id: r.get("user_id"),
            platform: r.get("platform"),
            access_sealed: r.get("access_sealed"),
            refresh_sealed: r.get("refresh_sealed"),
            page_sealed: r.get("page_sealed"),
            external_account_id: r.get("external_account_id"),
            scope: r.get("scope"),
            expires_at: r.get("expires_at"),
            connected_at: r.get("connected_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// Delete the credential record, returning whether a row existed
    pub async fn delete_credential(&self, user_id: &str, platform: PlatformId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM credentials WHERE user_id = ? AND platform = ?
            "#,
        )
        .bind(user_id)
        .bind(platform)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    // ---- handshakes ----

    /// Store a pending authorization handshake
    pub async fn insert_handshake(&self, row: &HandshakeRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO handshakes (id, user_id, platform, pkce_verifier, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(row.platform)
        .bind(&row.pkce_verifier)
        .bind(row.created_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Atomically consume a handshake: delete it and return the deleted row.
    /// A second caller with the same id gets None, so a handshake can never
    /// complete twice.
    pub async fn take_handshake(&self, id: &str) -> Result<Option<HandshakeRow>> {
        let row = sqlx::query(
            r#"
            DELETE FROM handshakes WHERE id = ?
            RETURNING id, user_id, platform, pkce_verifier, created_at, expires_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.map(|r| HandshakeRow {
            id: r.get("id"),
            user_id: r.get("user_id"),
            platform: r.get("platform"),
            pkce_verifier: r.get("pkce_verifier"),
            created_at: r.get("created_at"),
            expires_at: r.get("expires_at"),
        }))
    }

    /// Delete handshakes whose expiry has passed, returning the count
    pub async fn purge_expired_handshakes(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM handshakes WHERE expires_at <= ?
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    // ---- intents ----

    /// Create a new post intent
    pub async fn create_intent(&self, intent: &PostIntent) -> Result<()> {
        let content = serde_json::to_string(&intent.content)
            .map_err(|e| crate::error::SyndicaError::InvalidInput(e.to_string()))?;
        let options = intent.options.to_string();

        sqlx::query(
            r#"
            INSERT INTO intents (id, user_id, platform, content, options, scheduled_at, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.user_id)
        .bind(intent.platform)
        .bind(content)
        .bind(options)
        .bind(intent.scheduled_at)
        .bind(intent.status)
        .bind(intent.created_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Get an intent by ID
    pub async fn get_intent(&self, intent_id: &str) -> Result<Option<PostIntent>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, platform, content, options, scheduled_at, status,
                   remote_id, canonical_url, error_message, error_status, error_body,
                   correlation_id, created_at
            FROM intents WHERE id = ?
            "#,
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        row.map(row_to_intent).transpose()
    }

    /// List intents, newest schedule first, optionally filtered
    pub async fn list_intents(
        &self,
        user_id: Option<&str>,
        status: Option<IntentStatus>,
        limit: i64,
    ) -> Result<Vec<PostIntent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, platform, content, options, scheduled_at, status,
                   remote_id, canonical_url, error_message, error_status, error_body,
                   correlation_id, created_at
            FROM intents
            WHERE (? IS NULL OR user_id = ?)
              AND (? IS NULL OR status = ?)
            ORDER BY scheduled_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        rows.into_iter().map(row_to_intent).collect()
    }

    /// Scheduled intents whose time has come, oldest first
    pub async fn due_intents(&self, now: i64) -> Result<Vec<PostIntent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, platform, content, options, scheduled_at, status,
                   remote_id, canonical_url, error_message, error_status, error_body,
                   correlation_id, created_at
            FROM intents
            WHERE status = 'scheduled' AND scheduled_at <= ?
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        rows.into_iter().map(row_to_intent).collect()
    }

    /// Try to claim an intent for dispatch. The conditional update is the
    /// whole concurrency story: exactly one caller flips the row from
    /// scheduled to dispatching, everyone else sees zero rows affected.
    pub async fn claim_intent(&self, intent_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE intents SET status = 'dispatching', claimed_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(intent_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a successful publish on a claimed intent
    pub async fn finish_published(&self, intent_id: &str, outcome: &PublishOutcome) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE intents
            SET status = 'published', remote_id = ?, canonical_url = ?, claimed_at = NULL
            WHERE id = ? AND status = 'dispatching'
            "#,
        )
        .bind(&outcome.remote_id)
        .bind(&outcome.canonical_url)
        .bind(intent_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Record a terminal failure on a claimed intent
    pub async fn finish_failed(&self, intent_id: &str, error: &ErrorSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE intents
            SET status = 'failed', error_message = ?, error_status = ?, error_body = ?,
                correlation_id = ?, claimed_at = NULL
            WHERE id = ? AND status = 'dispatching'
            "#,
        )
        .bind(&error.message)
        .bind(error.upstream_status.map(|s| s as i64))
        .bind(&error.upstream_body)
        .bind(&error.correlation_id)
        .bind(intent_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Return intents stuck in dispatching since before the cutoff to the
    /// scheduled pool. Covers a worker that died mid-dispatch.
    pub async fn reclaim_stale(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE intents SET status = 'scheduled', claimed_at = NULL
            WHERE status = 'dispatching' AND claimed_at <= ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Move a still-scheduled intent to a new time, returning whether it was
    /// still claimable
    pub async fn reschedule_intent(&self, intent_id: &str, scheduled_at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE intents SET scheduled_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(scheduled_at)
        .bind(intent_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel a still-scheduled intent. Once dispatch has begun the intent
    /// is past the point of no return and this reports false.
    pub async fn cancel_intent(&self, intent_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM intents WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(intent_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Count intents a user created at or after the given time. Feeds
    /// quota checks, so cancelled rows no longer count but failed ones do.
    pub async fn count_user_intents_since(&self, user_id: &str, since: i64) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM intents WHERE user_id = ? AND created_at >= ?
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.get("count"))
    }

    /// Count intents per status
    pub async fn intent_counts(&self) -> Result<Vec<(IntentStatus, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) as count FROM intents GROUP BY status ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("status"), r.get("count")))
            .collect())
    }

    // ---- webhook idempotency ledger ----

    /// Whether a webhook delivery has already been processed
    pub async fn webhook_seen(&self, platform: PlatformId, event_id: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM webhook_events WHERE platform = ? AND event_id = ?
            "#,
        )
        .bind(platform)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(row.is_some())
    }

    /// Mark a webhook delivery processed. Returns false when another caller
    /// got there first, so duplicate deliveries collapse to one processing.
    pub async fn webhook_mark_processed(
        &self,
        platform: PlatformId,
        event_id: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO webhook_events (platform, event_id, processed_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(platform)
        .bind(event_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}

fn row_to_intent(r: sqlx::sqlite::SqliteRow) -> Result<PostIntent> {
    let content: PublishContent = serde_json::from_str(&r.get::<String, _>("content"))
        .map_err(|e| crate::error::SyndicaError::InvalidInput(e.to_string()))?;
    let options: serde_json::Value = serde_json::from_str(&r.get::<String, _>("options"))
        .unwrap_or(serde_json::Value::Null);

    let result = match (
        r.get::<Option<String>, _>("remote_id"),
        r.get::<Option<String>, _>("canonical_url"),
    ) {
        (Some(remote_id), Some(canonical_url)) => Some(PublishOutcome {
            remote_id,
            canonical_url,
        }),
        _ => None,
    };

    let last_error = r
        .get::<Option<String>, _>("error_message")
        .map(|message| ErrorSnapshot {
            message,
            upstream_status: r
                .get::<Option<i64>, _>("error_status")
                .map(|s| s as u16),
            upstream_body: r.get("error_body"),
            correlation_id: r
                .get::<Option<String>, _>("correlation_id")
                .unwrap_or_default(),
        });

    Ok(PostIntent {
        id: r.get("id"),
        user_id: r.get("user_id"),
        platform: r.get("platform"),
        content,
        options,
        scheduled_at: r.get("scheduled_at"),
        status: r.get("status"),
        result,
        last_error,
        created_at: r.get("created_at"),
    })
}
