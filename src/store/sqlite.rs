use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    Annotation, AnnotationPatch, AnnotationStatus, BoundingBox, EventEnvelope, EventType,
    Intent, NewAnnotation, Resolver, Role, Session, SessionDetail, SessionStatus, Severity,
    Store, ThreadMessage,
};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Durable single-file SQLite backing
pub struct SqliteStore {
    pool: SqlitePool,
    // Serializes read-modify-write mutations so patch application and the
    // row update appear atomic to concurrent requests.
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (or create) the store file and run migrations.
    pub async fn new(config: &StoreConfig) -> StoreResult<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Connection {
                message: format!("Failed to create store directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StoreError::Connection {
                message: format!("Invalid store URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection {
                message: format!("Failed to open store: {}", e),
            })?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Create an in-memory SQLite store for testing.
    pub async fn new_in_memory() -> StoreResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| StoreError::Connection {
                message: format!("Invalid in-memory URL: {}", e),
            })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection {
                message: format!("Failed to create in-memory store: {}", e),
            })?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await.map_err(|e| StoreError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        Ok(())
    }

    async fn load_thread(&self, annotation_id: &str) -> StoreResult<Vec<ThreadMessage>> {
        let rows: Vec<ThreadMessageRow> = sqlx::query_as(
            r#"
            SELECT id, annotation_id, role, content, created_at
            FROM thread_messages
            WHERE annotation_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(annotation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn fetch_annotation(&self, id: &str) -> StoreResult<Option<Annotation>> {
        let row: Option<AnnotationRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, comment, element, element_path, url, bounding_box,
                   intent, severity, status, resolved_by, resolved_at, context,
                   created_at, updated_at
            FROM annotations
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut annotation: Annotation = row.into();
        annotation.thread = self.load_thread(&annotation.id).await?;
        Ok(Some(annotation))
    }

    async fn fetch_session_annotations(&self, session_id: &str) -> StoreResult<Vec<Annotation>> {
        let rows: Vec<AnnotationRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, comment, element, element_path, url, bounding_box,
                   intent, severity, status, resolved_by, resolved_at, context,
                   created_at, updated_at
            FROM annotations
            WHERE session_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut annotations = Vec::with_capacity(rows.len());
        for row in rows {
            let mut annotation: Annotation = row.into();
            annotation.thread = self.load_thread(&annotation.id).await?;
            annotations.push(annotation);
        }
        Ok(annotations)
    }

    async fn write_annotation(&self, annotation: &Annotation) -> StoreResult<()> {
        let bounding_box = annotation
            .bounding_box
            .as_ref()
            .map(|b| serde_json::to_string(b).unwrap_or_default());
        let context = if annotation.context.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&annotation.context).unwrap_or_default())
        };

        sqlx::query(
            r#"
            UPDATE annotations
            SET comment = ?, element = ?, element_path = ?, url = ?, bounding_box = ?,
                intent = ?, severity = ?, status = ?, resolved_by = ?, resolved_at = ?,
                context = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&annotation.comment)
        .bind(&annotation.element)
        .bind(&annotation.element_path)
        .bind(&annotation.url)
        .bind(&bounding_box)
        .bind(annotation.intent.map(|i| i.to_string()))
        .bind(annotation.severity.map(|s| s.to_string()))
        .bind(annotation.status.to_string())
        .bind(annotation.resolved_by.map(|r| r.to_string()))
        .bind(annotation.resolved_at.map(|t| t.to_rfc3339()))
        .bind(&context)
        .bind(annotation.updated_at.to_rfc3339())
        .bind(&annotation.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_session(
        &self,
        url: &str,
        project_id: Option<String>,
    ) -> StoreResult<Session> {
        let session = Session::new(url, project_id);

        sqlx::query(
            r#"
            INSERT INTO sessions (id, url, project_id, status, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.url)
        .bind(&session.project_id)
        .bind(session.status.to_string())
        .bind(session.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    async fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, url, project_id, status, created_at
            FROM sessions
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, url, project_id, status, created_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn get_session_detail(&self, id: &str) -> StoreResult<Option<SessionDetail>> {
        let Some(session) = self.get_session(id).await? else {
            return Ok(None);
        };

        let annotations = self.fetch_session_annotations(id).await?;
        Ok(Some(SessionDetail {
            session,
            annotations,
        }))
    }

    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> StoreResult<Option<Session>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut session) = self.get_session(id).await? else {
            return Ok(None);
        };

        session.status = status;
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(Some(session))
    }

    async fn add_annotation(
        &self,
        session_id: &str,
        new: NewAnnotation,
    ) -> StoreResult<Option<Annotation>> {
        let _guard = self.write_lock.lock().await;

        if self.get_session(session_id).await?.is_none() {
            return Ok(None);
        }

        let annotation = Annotation::new(session_id, new);
        let bounding_box = annotation
            .bounding_box
            .as_ref()
            .map(|b| serde_json::to_string(b).unwrap_or_default());
        let context = if annotation.context.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&annotation.context).unwrap_or_default())
        };

        sqlx::query(
            r#"
            INSERT INTO annotations
                (id, session_id, comment, element, element_path, url, bounding_box,
                 intent, severity, status, resolved_by, resolved_at, context,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&annotation.id)
        .bind(&annotation.session_id)
        .bind(&annotation.comment)
        .bind(&annotation.element)
        .bind(&annotation.element_path)
        .bind(&annotation.url)
        .bind(&bounding_box)
        .bind(annotation.intent.map(|i| i.to_string()))
        .bind(annotation.severity.map(|s| s.to_string()))
        .bind(annotation.status.to_string())
        .bind(annotation.resolved_by.map(|r| r.to_string()))
        .bind(annotation.resolved_at.map(|t| t.to_rfc3339()))
        .bind(&context)
        .bind(annotation.created_at.to_rfc3339())
        .bind(annotation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Some(annotation))
    }

    async fn get_annotation(&self, id: &str) -> StoreResult<Option<Annotation>> {
        self.fetch_annotation(id).await
    }

    async fn update_annotation(
        &self,
        id: &str,
        patch: AnnotationPatch,
    ) -> StoreResult<Option<Annotation>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut annotation) = self.fetch_annotation(id).await? else {
            return Ok(None);
        };

        annotation.apply_patch(patch)?;
        self.write_annotation(&annotation).await?;

        Ok(Some(annotation))
    }

    async fn delete_annotation(&self, id: &str) -> StoreResult<Option<Annotation>> {
        let _guard = self.write_lock.lock().await;

        let Some(annotation) = self.fetch_annotation(id).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM thread_messages WHERE annotation_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM annotations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(Some(annotation))
    }

    async fn pending_annotations(
        &self,
        session_id: Option<&str>,
    ) -> StoreResult<Vec<Annotation>> {
        let rows: Vec<AnnotationRow> = match session_id {
            Some(session_id) => {
                sqlx::query_as(
                    r#"
                    SELECT id, session_id, comment, element, element_path, url, bounding_box,
                           intent, severity, status, resolved_by, resolved_at, context,
                           created_at, updated_at
                    FROM annotations
                    WHERE session_id = ? AND status = 'pending'
                    ORDER BY created_at ASC, id ASC
                    "#,
                )
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, session_id, comment, element, element_path, url, bounding_box,
                           intent, severity, status, resolved_by, resolved_at, context,
                           created_at, updated_at
                    FROM annotations
                    WHERE status = 'pending'
                    ORDER BY created_at ASC, id ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut annotations = Vec::with_capacity(rows.len());
        for row in rows {
            let mut annotation: Annotation = row.into();
            annotation.thread = self.load_thread(&annotation.id).await?;
            annotations.push(annotation);
        }
        Ok(annotations)
    }

    async fn add_thread_message(
        &self,
        annotation_id: &str,
        role: Role,
        content: &str,
    ) -> StoreResult<Option<Annotation>> {
        let _guard = self.write_lock.lock().await;

        let Some(mut annotation) = self.fetch_annotation(annotation_id).await? else {
            return Ok(None);
        };

        let message = ThreadMessage::new(annotation_id, role, content);
        sqlx::query(
            r#"
            INSERT INTO thread_messages (id, annotation_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.annotation_id)
        .bind(message.role.to_string())
        .bind(&message.content)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        annotation.updated_at = Utc::now();
        sqlx::query("UPDATE annotations SET updated_at = ? WHERE id = ?")
            .bind(annotation.updated_at.to_rfc3339())
            .bind(annotation_id)
            .execute(&self.pool)
            .await?;

        annotation.thread.push(message);
        Ok(Some(annotation))
    }

    async fn append_event(&self, event: &EventEnvelope) -> StoreResult<()> {
        let payload = serde_json::to_string(&event.payload).unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO events (sequence, event_type, timestamp, session_id, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.sequence as i64)
        .bind(event.event_type.to_string())
        .bind(event.timestamp.to_rfc3339())
        .bind(&event.session_id)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn events_since(
        &self,
        session_id: Option<&str>,
        after: u64,
        limit: u32,
    ) -> StoreResult<Vec<EventEnvelope>> {
        let rows: Vec<EventRow> = match session_id {
            Some(session_id) => {
                sqlx::query_as(
                    r#"
                    SELECT sequence, event_type, timestamp, session_id, payload
                    FROM events
                    WHERE session_id = ? AND sequence > ?
                    ORDER BY sequence ASC
                    LIMIT ?
                    "#,
                )
                .bind(session_id)
                .bind(after as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT sequence, event_type, timestamp, session_id, payload
                    FROM events
                    WHERE sequence > ?
                    ORDER BY sequence ASC
                    LIMIT ?
                    "#,
                )
                .bind(after as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn prune_events(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn max_sequence(&self) -> StoreResult<u64> {
        let max: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) FROM events")
            .fetch_one(&self.pool)
            .await?;

        Ok(max.0 as u64)
    }

    async fn close(&self) {
        info!("Closing store");
        self.pool.close().await;
    }
}

// ============================================================================
// Helper functions for parsing with logging
// ============================================================================

/// Parse timestamp with warning on failure
fn parse_timestamp_with_logging(ts_str: &str, context: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(ts_str) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            warn!(
                error = %e,
                timestamp = ts_str,
                context = context,
                "Failed to parse timestamp, using current time as fallback"
            );
            Utc::now()
        }
    }
}

/// Parse enum with warning on failure
fn parse_enum_with_logging<T: std::str::FromStr + Default>(value: &str, context: &str) -> T {
    match value.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                value = value,
                context = context,
                "Failed to parse enum value, using default"
            );
            T::default()
        }
    }
}

/// Parse an optional enum column, dropping unrecognized values with a warning
fn parse_optional_enum<T: std::str::FromStr>(value: Option<String>, context: &str) -> Option<T> {
    let value = value?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(value = %value, context = context, "Dropping unrecognized enum value");
            None
        }
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    url: String,
    project_id: Option<String>,
    status: String,
    created_at: String,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id.clone(),
            url: row.url,
            project_id: row.project_id,
            status: parse_enum_with_logging(&row.status, &format!("session {} status", row.id)),
            created_at: parse_timestamp_with_logging(
                &row.created_at,
                &format!("session {} created_at", row.id),
            ),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AnnotationRow {
    id: String,
    session_id: String,
    comment: String,
    element: String,
    element_path: String,
    url: Option<String>,
    bounding_box: Option<String>,
    intent: Option<String>,
    severity: Option<String>,
    status: String,
    resolved_by: Option<String>,
    resolved_at: Option<String>,
    context: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<AnnotationRow> for Annotation {
    fn from(row: AnnotationRow) -> Self {
        let bounding_box: Option<BoundingBox> = row.bounding_box.and_then(|s| {
            serde_json::from_str(&s)
                .map_err(|e| {
                    warn!(error = %e, annotation_id = %row.id, "Failed to parse bounding box");
                    e
                })
                .ok()
        });
        let context = row
            .context
            .and_then(|s| {
                serde_json::from_str(&s)
                    .map_err(|e| {
                        warn!(error = %e, annotation_id = %row.id, "Failed to parse context bag");
                        e
                    })
                    .ok()
            })
            .unwrap_or_default();

        Self {
            id: row.id.clone(),
            session_id: row.session_id,
            comment: row.comment,
            element: row.element,
            element_path: row.element_path,
            url: row.url,
            bounding_box,
            intent: parse_optional_enum::<Intent>(
                row.intent,
                &format!("annotation {} intent", row.id),
            ),
            severity: parse_optional_enum::<Severity>(
                row.severity,
                &format!("annotation {} severity", row.id),
            ),
            status: parse_enum_with_logging::<AnnotationStatus>(
                &row.status,
                &format!("annotation {} status", row.id),
            ),
            resolved_by: parse_optional_enum::<Resolver>(
                row.resolved_by,
                &format!("annotation {} resolved_by", row.id),
            ),
            resolved_at: row
                .resolved_at
                .map(|t| parse_timestamp_with_logging(&t, &format!("annotation {} resolved_at", row.id))),
            created_at: parse_timestamp_with_logging(
                &row.created_at,
                &format!("annotation {} created_at", row.id),
            ),
            updated_at: parse_timestamp_with_logging(
                &row.updated_at,
                &format!("annotation {} updated_at", row.id),
            ),
            thread: Vec::new(),
            context,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ThreadMessageRow {
    id: String,
    annotation_id: String,
    role: String,
    content: String,
    created_at: String,
}

impl From<ThreadMessageRow> for ThreadMessage {
    fn from(row: ThreadMessageRow) -> Self {
        let role = row.role.parse().unwrap_or_else(|_| {
            warn!(role = %row.role, message_id = %row.id, "Unrecognized thread role, assuming human");
            Role::Human
        });
        Self {
            id: row.id.clone(),
            annotation_id: row.annotation_id,
            role,
            content: row.content,
            created_at: parse_timestamp_with_logging(
                &row.created_at,
                &format!("thread message {} created_at", row.id),
            ),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    event_type: String,
    timestamp: String,
    session_id: String,
    payload: String,
}

impl From<EventRow> for EventEnvelope {
    fn from(row: EventRow) -> Self {
        let payload = serde_json::from_str(&row.payload).unwrap_or_else(|e| {
            warn!(error = %e, sequence = row.sequence, "Failed to parse event payload, using null");
            serde_json::Value::Null
        });
        let event_type = row.event_type.parse().unwrap_or_else(|_| {
            warn!(event_type = %row.event_type, sequence = row.sequence, "Unrecognized event type");
            EventType::AnnotationUpdated
        });

        Self {
            event_type,
            timestamp: parse_timestamp_with_logging(
                &row.timestamp,
                &format!("event {} timestamp", row.sequence),
            ),
            session_id: row.session_id,
            sequence: row.sequence as u64,
            payload,
        }
    }
}
