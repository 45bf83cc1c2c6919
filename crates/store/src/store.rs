//! SQLite-backed store

use crate::error::StoreError;
use easel_protocol::{CanvasState, OperationEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Statements run by `migrate`, one per entry (SQLite prepares a single
/// statement at a time).
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        owner_id INTEGER NOT NULL REFERENCES users(id),
        description TEXT,
        canvas_data TEXT,
        canvas_seq INTEGER NOT NULL DEFAULT 0,
        last_modified INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS project_collaborators (
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL REFERENCES users(id),
        PRIMARY KEY (project_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS operations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL,
        tab_id TEXT NOT NULL DEFAULT '',
        type TEXT NOT NULL,
        operation_data TEXT NOT NULL,
        sequence_number INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (project_id, sequence_number)
    )",
    "CREATE INDEX IF NOT EXISTS idx_operations_project_seq
        ON operations (project_id, sequence_number)",
    "CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT NOT NULL,
        original_name TEXT,
        mime TEXT,
        size INTEGER NOT NULL,
        hash TEXT NOT NULL UNIQUE,
        project_id INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS active_sessions (
        connection_id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        project_id INTEGER NOT NULL,
        tab_id TEXT NOT NULL,
        last_activity INTEGER NOT NULL
    )",
];

/// Dotted paths `patch_snapshot` may touch. Everything else is refused.
const PATCH_ALLOWLIST: &[&str] = &[
    "navigation.scale",
    "navigation.offset",
    "navigation.timestamp",
];

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub description: Option<String>,
    pub canvas_seq: u64,
    pub last_modified: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: i64,
    pub filename: String,
    pub original_name: Option<String>,
    pub mime: Option<String>,
    pub size: i64,
    pub hash: String,
    pub project_id: Option<i64>,
}

/// Metadata for a newly ingested blob.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub filename: String,
    pub original_name: Option<String>,
    pub mime: Option<String>,
    pub size: i64,
    pub hash: String,
    pub project_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub record: FileRecord,
    pub created: bool,
}

/// The stored half of an operation row; the rest of [`OperationEntry`] comes
/// from dedicated columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEnvelope {
    pub operation_id: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub files_removed: u64,
    pub removed_filenames: Vec<String>,
    pub vacuumed: bool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Durable state of the whole server. Cheap to clone (pooled).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    /// Appends take this shared; maintenance (checkpoint, vacuum) takes it
    /// exclusive so it only stalls writers for the checkpoint itself.
    maintenance: Arc<tokio::sync::RwLock<()>>,
}

impl Store {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            maintenance: Arc::new(tokio::sync::RwLock::new(())),
        };
        store.migrate().await?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        // Sessions never survive a restart.
        sqlx::query("DELETE FROM active_sessions")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- users ----

    pub async fn upsert_user(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<UserRecord, StoreError> {
        let row = sqlx::query(
            "INSERT INTO users (username, display_name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET display_name = excluded.display_name
             RETURNING id, username, display_name, created_at",
        )
        .bind(username)
        .bind(display_name)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(UserRecord {
            id: row.get("id"),
            username: row.get("username"),
            display_name: row.get("display_name"),
            created_at: row.get("created_at"),
        })
    }

    // ---- projects ----

    pub async fn create_project(
        &self,
        name: &str,
        owner_id: i64,
        description: Option<&str>,
    ) -> Result<ProjectRecord, StoreError> {
        let row = sqlx::query(
            "INSERT INTO projects (name, owner_id, description, last_modified)
             VALUES (?, ?, ?, ?)
             RETURNING id, name, owner_id, description, canvas_seq, last_modified",
        )
        .bind(name)
        .bind(owner_id)
        .bind(description)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(project_from_row(&row))
    }

    /// Fetch a project, creating it with the requested id on first join.
    pub async fn ensure_project(
        &self,
        id: i64,
        name: &str,
        owner_id: i64,
    ) -> Result<ProjectRecord, StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO projects (id, name, owner_id, last_modified)
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(owner_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        self.get_project(id)
            .await?
            .ok_or(StoreError::NotFound("project"))
    }

    pub async fn get_project(&self, id: i64) -> Result<Option<ProjectRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, owner_id, description, canvas_seq, last_modified
             FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(project_from_row))
    }

    pub async fn list_projects(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, owner_id, description, canvas_seq, last_modified
             FROM projects ORDER BY last_modified DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(project_from_row).collect())
    }

    pub async fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<ProjectRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE projects SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                last_modified = ?
             WHERE id = ?
             RETURNING id, name, owner_id, description, canvas_seq, last_modified",
        )
        .bind(name)
        .bind(description)
        .bind(now_ms())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("project"))?;
        Ok(project_from_row(&row))
    }

    pub async fn delete_project(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("project"));
        }
        Ok(())
    }

    pub async fn add_collaborator(&self, project_id: i64, user_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO project_collaborators (project_id, user_id) VALUES (?, ?)",
        )
        .bind(project_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- operation log ----

    /// Atomically assign max(seq)+1 for the project and insert the row.
    ///
    /// In-process callers already serialize through the room lane; the
    /// `Conflict` path exists for the losing side of an external race and
    /// must be retried by the caller.
    pub async fn append_operation(
        &self,
        project_id: i64,
        user_id: i64,
        tab_id: &str,
        operation_type: &str,
        envelope: &OperationEnvelope,
    ) -> Result<u64, StoreError> {
        let _gate = self.maintenance.read().await;
        let data = serde_json::to_string(envelope)?;
        let now = now_ms();

        let mut tx = self.pool.begin().await?;
        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM operations WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            "INSERT INTO operations
                (project_id, user_id, tab_id, type, operation_data, sequence_number, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(user_id)
        .bind(tab_id)
        .bind(operation_type)
        .bind(&data)
        .bind(seq)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if StoreError::is_unique_violation(&e) {
                debug!(project_id, seq, "sequence race lost, caller retries");
                return Err(StoreError::Conflict);
            }
            return Err(e.into());
        }

        sqlx::query("UPDATE projects SET last_modified = ? WHERE id = ?")
            .bind(now)
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(seq as u64)
    }

    /// Append a transaction's children as one atomic block of contiguous
    /// sequence numbers. Either every child persists or none does.
    pub async fn append_operations(
        &self,
        project_id: i64,
        user_id: i64,
        tab_id: &str,
        operations: &[(String, OperationEnvelope)],
    ) -> Result<Vec<u64>, StoreError> {
        let _gate = self.maintenance.read().await;
        let now = now_ms();

        let mut tx = self.pool.begin().await?;
        let first: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM operations WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut seqs = Vec::with_capacity(operations.len());
        for (offset, (operation_type, envelope)) in operations.iter().enumerate() {
            let seq = first + offset as i64;
            let inserted = sqlx::query(
                "INSERT INTO operations
                    (project_id, user_id, tab_id, type, operation_data, sequence_number, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(project_id)
            .bind(user_id)
            .bind(tab_id)
            .bind(operation_type)
            .bind(serde_json::to_string(envelope)?)
            .bind(seq)
            .bind(now)
            .execute(&mut *tx)
            .await;
            if let Err(e) = inserted {
                if StoreError::is_unique_violation(&e) {
                    return Err(StoreError::Conflict);
                }
                return Err(e.into());
            }
            seqs.push(seq as u64);
        }

        sqlx::query("UPDATE projects SET last_modified = ? WHERE id = ?")
            .bind(now)
            .bind(project_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(seqs)
    }

    /// Ops with seq in (last_seq, last_seq + limit], ascending.
    pub async fn operations_since(
        &self,
        project_id: i64,
        last_seq: u64,
        limit: u32,
    ) -> Result<Vec<OperationEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT project_id, user_id, tab_id, type, operation_data, sequence_number, created_at
             FROM operations
             WHERE project_id = ? AND sequence_number > ?
             ORDER BY sequence_number ASC
             LIMIT ?",
        )
        .bind(project_id)
        .bind(last_seq as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(operation_from_row).collect()
    }

    pub async fn latest_seq(&self, project_id: i64) -> Result<u64, StoreError> {
        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM operations WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(seq as u64)
    }

    // ---- snapshots ----

    pub async fn save_snapshot(
        &self,
        project_id: i64,
        blob: &Value,
        seq_marker: u64,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(blob)?;
        sqlx::query(
            "UPDATE projects SET canvas_data = ?, canvas_seq = ?, last_modified = ? WHERE id = ?",
        )
        .bind(&data)
        .bind(seq_marker as i64)
        .bind(now_ms())
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns the snapshot blob and the seq it was taken at.
    pub async fn load_snapshot(
        &self,
        project_id: i64,
    ) -> Result<Option<(Value, u64)>, StoreError> {
        let row = sqlx::query("SELECT canvas_data, canvas_seq FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("project"))?;
        let data: Option<String> = row.get("canvas_data");
        let seq: i64 = row.get("canvas_seq");
        match data {
            None => Ok(None),
            Some(text) => Ok(Some((serde_json::from_str(&text)?, seq as u64))),
        }
    }

    /// Targeted field update for the navigation-state endpoint. The path is
    /// validated against an allowlist; everything else mutates through the
    /// operation log.
    pub async fn patch_snapshot(
        &self,
        project_id: i64,
        path: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        if !PATCH_ALLOWLIST.contains(&path) {
            return Err(StoreError::PatchPathNotAllowed(path.to_string()));
        }

        let row = sqlx::query("SELECT canvas_data FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("project"))?;
        let data: Option<String> = row.get("canvas_data");
        let mut blob: Value = match data {
            Some(text) => serde_json::from_str(&text)?,
            None => Value::Object(Default::default()),
        };

        set_dotted_path(&mut blob, path, value);

        sqlx::query("UPDATE projects SET canvas_data = ?, last_modified = ? WHERE id = ?")
            .bind(serde_json::to_string(&blob)?)
            .bind(now_ms())
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- files ----

    /// Idempotent on hash: a re-upload of a known blob returns the existing
    /// record with `created: false`.
    pub async fn register_file(&self, file: &NewFile) -> Result<RegisterOutcome, StoreError> {
        if let Some(existing) = self.file_by_hash(&file.hash).await? {
            return Ok(RegisterOutcome {
                record: existing,
                created: false,
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO files (filename, original_name, mime, size, hash, project_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id, filename, original_name, mime, size, hash, project_id",
        )
        .bind(&file.filename)
        .bind(&file.original_name)
        .bind(&file.mime)
        .bind(file.size)
        .bind(&file.hash)
        .bind(file.project_id)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(RegisterOutcome {
                record: file_from_row(&row),
                created: true,
            }),
            // Lost a concurrent upload race on the same hash.
            Err(e) if StoreError::is_unique_violation(&e) => {
                let record = self
                    .file_by_hash(&file.hash)
                    .await?
                    .ok_or(StoreError::NotFound("file"))?;
                Ok(RegisterOutcome {
                    record,
                    created: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn file_by_hash(&self, hash: &str) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, filename, original_name, mime, size, hash, project_id
             FROM files WHERE hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(file_from_row))
    }

    // ---- sessions ----

    pub async fn upsert_session(
        &self,
        connection_id: u64,
        user_id: i64,
        project_id: i64,
        tab_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO active_sessions (connection_id, user_id, project_id, tab_id, last_activity)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(connection_id) DO UPDATE SET
                user_id = excluded.user_id,
                project_id = excluded.project_id,
                tab_id = excluded.tab_id,
                last_activity = excluded.last_activity",
        )
        .bind(connection_id as i64)
        .bind(user_id)
        .bind(project_id)
        .bind(tab_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_session(&self, connection_id: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE active_sessions SET last_activity = ? WHERE connection_id = ?")
            .bind(now_ms())
            .bind(connection_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_session(&self, connection_id: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM active_sessions WHERE connection_id = ?")
            .bind(connection_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- maintenance ----

    pub async fn database_size(&self) -> Result<u64, StoreError> {
        let size: i64 = sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(size as u64)
    }

    /// Truncate the WAL. Takes the maintenance lock exclusively, so appends
    /// queue for the duration of the checkpoint only.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        let _gate = self.maintenance.write().await;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Orphan sweep: drop file records whose hash no project snapshot
    /// references, then checkpoint (and optionally VACUUM). Returns the
    /// stored filenames so the caller can unlink the blobs.
    pub async fn cleanup(&self, vacuum: bool) -> Result<CleanupReport, StoreError> {
        let mut referenced: std::collections::HashSet<String> = std::collections::HashSet::new();
        let rows = sqlx::query("SELECT canvas_data FROM projects")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let data: Option<String> = row.get("canvas_data");
            let Some(text) = data else { continue };
            let canvas = CanvasState::from_value(Some(serde_json::from_str(&text)?))?;
            referenced.extend(canvas.referenced_hashes());
        }

        let files = sqlx::query("SELECT id, filename, hash FROM files")
            .fetch_all(&self.pool)
            .await?;
        let mut report = CleanupReport::default();
        for row in &files {
            let hash: String = row.get("hash");
            if referenced.contains(&hash) {
                continue;
            }
            let id: i64 = row.get("id");
            sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            report.files_removed += 1;
            report.removed_filenames.push(row.get("filename"));
        }

        self.checkpoint().await?;
        if vacuum {
            // VACUUM rewrites the whole file; callers avoid it while rooms
            // are active.
            if let Err(e) = sqlx::query("VACUUM").execute(&self.pool).await {
                warn!(error = %e, "vacuum failed");
            } else {
                report.vacuumed = true;
            }
        }

        info!(files_removed = report.files_removed, "cleanup finished");
        Ok(report)
    }

    /// Final checkpoint and pool shutdown.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "final checkpoint failed");
        }
        self.pool.close().await;
    }
}

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> ProjectRecord {
    ProjectRecord {
        id: row.get("id"),
        name: row.get("name"),
        owner_id: row.get("owner_id"),
        description: row.get("description"),
        canvas_seq: row.get::<i64, _>("canvas_seq") as u64,
        last_modified: row.get("last_modified"),
    }
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        filename: row.get("filename"),
        original_name: row.get("original_name"),
        mime: row.get("mime"),
        size: row.get("size"),
        hash: row.get("hash"),
        project_id: row.get("project_id"),
    }
}

fn operation_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OperationEntry, StoreError> {
    let data: String = row.get("operation_data");
    let envelope: OperationEnvelope = serde_json::from_str(&data)?;
    Ok(OperationEntry {
        seq: row.get::<i64, _>("sequence_number") as u64,
        project_id: row.get("project_id"),
        user_id: row.get("user_id"),
        tab_id: row.get("tab_id"),
        operation_type: row.get("type"),
        operation_id: envelope.operation_id,
        params: envelope.params,
        undo_data: envelope.undo_data,
        transaction_id: envelope.transaction_id,
        created_at: row.get("created_at"),
    })
}

fn set_dotted_path(blob: &mut Value, path: &str, value: Value) {
    let mut current = blob;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        let map = current.as_object_mut().expect("object ensured above");
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
}
