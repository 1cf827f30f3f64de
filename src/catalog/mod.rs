//! Persistent catalog (spec.md §4.2): Fingerprints, Triggers, Destinations,
//! Tasks, with transactional writes and the filtered queries the Coordinator
//! needs.
//!
//! Storage backend: SQLite via `sqlx`, a single file under
//! `<base_dir>/db/database.db` (spec.md §6). The pool is capped at one
//! connection: SQLite does not support concurrent writers, and the
//! single-coordinator invariant (spec.md §5) means one connection is
//! sufficient — this plays the same role as the teacher wrapping a single
//! database client behind one owned handle (`CubePostgresClient`).

pub mod models;
mod schema;

use crate::error::CatalogError;
use crate::ids::{AeTitle, HumanReadableId, InferenceServerUid};
use camino::{Utf8Path, Utf8PathBuf};
use models::{Destination, Fingerprint, Task, TaskStatus, TaskUpdate, Trigger};
use rand::RngCore;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;

/// Specification for one Trigger row to be attached to a Fingerprint.
#[derive(Debug, Clone, Default)]
pub struct NewTrigger {
    pub study_description_pattern: Option<String>,
    pub series_description_pattern: Option<String>,
    pub sop_class_uid_exact: Option<String>,
    pub exclude_pattern: Option<String>,
}

pub struct Catalog {
    pool: SqlitePool,
    base_dir: Utf8PathBuf,
}

impl Catalog {
    /// Connect to (creating if necessary) the catalog database under
    /// `base_dir` (spec.md §6: `<base_dir>/db/database.db`).
    pub async fn connect(base_dir: impl Into<Utf8PathBuf>) -> Result<Self, CatalogError> {
        let base_dir = base_dir.into();
        let db_dir = base_dir.join("db");
        fs_err::create_dir_all(&db_dir)?;
        let db_path = db_dir.join("database.db");
        let url = format!("sqlite://{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new().max_connections(1).connect(&url).await?;
        sqlx::query(schema::CREATE_TABLES).execute(&pool).await?;
        Ok(Self { pool, base_dir })
    }

    /// Root under which Task storage folders (spec.md §6) are allocated.
    pub fn data_dir(&self) -> Utf8PathBuf {
        self.base_dir.join("data")
    }

    // ---------------------------------------------------------------- add

    pub async fn add_fingerprint(
        &self,
        human_readable_id: HumanReadableId,
        inference_server_url: impl Into<String>,
        version: Option<String>,
        description: Option<String>,
        delete_locally: bool,
        delete_remotely: bool,
    ) -> Result<Fingerprint, CatalogError> {
        let now = OffsetDateTime::now_utc();
        let inference_server_url = inference_server_url.into();
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query(
            "INSERT INTO fingerprints (human_readable_id, inference_server_url, version, description, delete_locally, delete_remotely, created_timestamp) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(human_readable_id.as_str())
        .bind(&inference_server_url)
        .bind(&version)
        .bind(&description)
        .bind(delete_locally)
        .bind(delete_remotely)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;
        Ok(Fingerprint {
            id,
            human_readable_id,
            inference_server_url,
            version,
            description,
            delete_locally,
            delete_remotely,
            created_timestamp: now,
            triggers: Vec::new(),
            destinations: Vec::new(),
        })
    }

    pub async fn add_trigger(
        &self,
        fingerprint_id: i64,
        trigger: NewTrigger,
    ) -> Result<Trigger, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query(
            "INSERT INTO triggers (fingerprint_id, study_description_pattern, series_description_pattern, sop_class_uid_exact, exclude_pattern) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(fingerprint_id)
        .bind(&trigger.study_description_pattern)
        .bind(&trigger.series_description_pattern)
        .bind(&trigger.sop_class_uid_exact)
        .bind(&trigger.exclude_pattern)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;
        Ok(Trigger {
            id,
            fingerprint_id,
            study_description_pattern: trigger.study_description_pattern,
            series_description_pattern: trigger.series_description_pattern,
            sop_class_uid_exact: trigger.sop_class_uid_exact,
            exclude_pattern: trigger.exclude_pattern,
        })
    }

    pub async fn add_destination(
        &self,
        host: impl Into<String>,
        port: u16,
        ae_title: AeTitle,
        fingerprint_id: Option<i64>,
    ) -> Result<Destination, CatalogError> {
        let host = host.into();
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query("INSERT INTO destinations (host, port, ae_title) VALUES (?, ?, ?)")
            .bind(&host)
            .bind(port)
            .bind(ae_title.as_str())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        if let Some(fingerprint_id) = fingerprint_id {
            sqlx::query(
                "INSERT INTO fingerprint_destinations (fingerprint_id, destination_id) VALUES (?, ?)",
            )
            .bind(fingerprint_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(Destination { id, host, port, ae_title })
    }

    /// Create a Task for the given Fingerprint (spec.md §4.2): allocates a
    /// fresh storage folder named with a cryptographically random 8-byte
    /// token, sets the input/output archive paths, status = PENDING.
    pub async fn add_task(&self, fingerprint_id: i64) -> Result<Task, CatalogError> {
        let token = random_token();
        let folder = self.data_dir().join(&token);
        fs_err::create_dir_all(&folder)?;
        let input_archive_path = folder.join("input.tar");
        let output_archive_path = folder.join("output.tar");
        let now = OffsetDateTime::now_utc();
        let status = TaskStatus::Pending;
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query(
            "INSERT INTO tasks (fingerprint_id, input_archive_path, output_archive_path, status, created_timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(fingerprint_id)
        .bind(input_archive_path.as_str())
        .bind(output_archive_path.as_str())
        .bind(status.code())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;
        Ok(Task {
            id,
            fingerprint_id,
            input_archive_path,
            output_archive_path,
            status,
            inference_server_uid: None,
            deleted_local: false,
            deleted_remote: false,
            created_timestamp: now,
        })
    }

    // --------------------------------------------------------------- read

    pub async fn list_fingerprints(&self) -> Result<Vec<Fingerprint>, CatalogError> {
        let rows = sqlx::query(
            "SELECT id, human_readable_id, inference_server_url, version, description, delete_locally, delete_remotely, created_timestamp FROM fingerprints ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut fingerprints = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let triggers = self.triggers_for(id).await?;
            let destinations = self.destinations_for(id).await?;
            fingerprints.push(Fingerprint {
                id,
                human_readable_id: HumanReadableId::new(row.try_get::<String, _>("human_readable_id")?),
                inference_server_url: row.try_get("inference_server_url")?,
                version: row.try_get("version")?,
                description: row.try_get("description")?,
                delete_locally: row.try_get("delete_locally")?,
                delete_remotely: row.try_get("delete_remotely")?,
                created_timestamp: row.try_get("created_timestamp")?,
                triggers,
                destinations,
            });
        }
        Ok(fingerprints)
    }

    /// One Fingerprint by id, with its Triggers and Destinations loaded
    /// (used by the Coordinator's Post/Forward/Cleanup phases, which need a
    /// Task's owning Fingerprint, not the whole list).
    pub async fn get_fingerprint(&self, id: i64) -> Result<Fingerprint, CatalogError> {
        let row = sqlx::query(
            "SELECT id, human_readable_id, inference_server_url, version, description, delete_locally, delete_remotely, created_timestamp FROM fingerprints WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CatalogError::NotFound(id))?;
        let triggers = self.triggers_for(id).await?;
        let destinations = self.destinations_for(id).await?;
        Ok(Fingerprint {
            id,
            human_readable_id: HumanReadableId::new(row.try_get::<String, _>("human_readable_id")?),
            inference_server_url: row.try_get("inference_server_url")?,
            version: row.try_get("version")?,
            description: row.try_get("description")?,
            delete_locally: row.try_get("delete_locally")?,
            delete_remotely: row.try_get("delete_remotely")?,
            created_timestamp: row.try_get("created_timestamp")?,
            triggers,
            destinations,
        })
    }

    async fn triggers_for(&self, fingerprint_id: i64) -> Result<Vec<Trigger>, CatalogError> {
        let rows = sqlx::query(
            "SELECT id, fingerprint_id, study_description_pattern, series_description_pattern, sop_class_uid_exact, exclude_pattern FROM triggers WHERE fingerprint_id = ?",
        )
        .bind(fingerprint_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Trigger {
                    id: row.try_get("id")?,
                    fingerprint_id: row.try_get("fingerprint_id")?,
                    study_description_pattern: row.try_get("study_description_pattern")?,
                    series_description_pattern: row.try_get("series_description_pattern")?,
                    sop_class_uid_exact: row.try_get("sop_class_uid_exact")?,
                    exclude_pattern: row.try_get("exclude_pattern")?,
                })
            })
            .collect()
    }

    async fn destinations_for(&self, fingerprint_id: i64) -> Result<Vec<Destination>, CatalogError> {
        let rows = sqlx::query(
            "SELECT d.id, d.host, d.port, d.ae_title FROM destinations d INNER JOIN fingerprint_destinations fd ON fd.destination_id = d.id WHERE fd.fingerprint_id = ?",
        )
        .bind(fingerprint_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Destination {
                    id: row.try_get("id")?,
                    host: row.try_get("host")?,
                    port: row.try_get::<i64, _>("port")? as u16,
                    ae_title: AeTitle::new(row.try_get::<String, _>("ae_title")?),
                })
            })
            .collect()
    }

    pub async fn get_task(&self, id: i64) -> Result<Task, CatalogError> {
        let row = sqlx::query(
            "SELECT id, fingerprint_id, input_archive_path, output_archive_path, status, inference_server_uid, deleted_local, deleted_remote, created_timestamp FROM tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(CatalogError::NotFound(id))?;
        row_to_task(row)
    }

    /// `tasks where status = S` (spec.md §4.2), used by each Coordinator
    /// phase.
    pub async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, CatalogError> {
        let rows = sqlx::query(
            "SELECT id, fingerprint_id, input_archive_path, output_archive_path, status, inference_server_uid, deleted_local, deleted_remote, created_timestamp FROM tasks WHERE status = ?",
        )
        .bind(status.code())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    /// Every task not yet in a terminal state (SUCCEEDED, FAILED_CLEANED,
    /// FAILED), for Phase A (Retire).
    pub async fn tasks_not_retired(&self) -> Result<Vec<Task>, CatalogError> {
        let rows = sqlx::query(
            "SELECT id, fingerprint_id, input_archive_path, output_archive_path, status, inference_server_uid, deleted_local, deleted_remote, created_timestamp FROM tasks WHERE status NOT IN (?, ?, ?)",
        )
        .bind(TaskStatus::Succeeded.code())
        .bind(TaskStatus::FailedCleaned.code())
        .bind(TaskStatus::Failed.code())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    // ------------------------------------------------------------- update

    /// `update_task(id, {..})` (spec.md §4.2): each field optional, absent
    /// fields are untouched. Rejects illegal status transitions at this
    /// boundary (DESIGN NOTES §9).
    pub async fn update_task(&self, id: i64, update: TaskUpdate) -> Result<Task, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let current = {
            let row = sqlx::query(
                "SELECT id, fingerprint_id, input_archive_path, output_archive_path, status, inference_server_uid, deleted_local, deleted_remote, created_timestamp FROM tasks WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(CatalogError::NotFound(id))?;
            row_to_task(row)?
        };
        if let Some(next) = update.status {
            if !current.status.can_transition_to(next) {
                tx.rollback().await?;
                return Err(CatalogError::IllegalTransition {
                    from: current.status,
                    to: next,
                });
            }
        }
        let next_status = update.status.unwrap_or(current.status).code();
        let next_uid = update
            .inference_server_uid
            .as_ref()
            .map(|u| u.as_str().to_string())
            .or_else(|| current.inference_server_uid.as_ref().map(|u| u.as_str().to_string()));
        let next_deleted_local = update.deleted_local.unwrap_or(current.deleted_local);
        let next_deleted_remote = update.deleted_remote.unwrap_or(current.deleted_remote);
        sqlx::query(
            "UPDATE tasks SET status = ?, inference_server_uid = ?, deleted_local = ?, deleted_remote = ? WHERE id = ?",
        )
        .bind(next_status)
        .bind(&next_uid)
        .bind(next_deleted_local)
        .bind(next_deleted_remote)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.get_task(id).await
    }

    /// Append-only audit row recording an HTTP status code observed for a
    /// Task's post/get/delete call (SPEC_FULL.md §3 supplemented feature).
    pub async fn record_inference_response(
        &self,
        task_id: i64,
        operation: &str,
        status_code: u16,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO inference_server_responses (task_id, operation, status_code, observed_timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(operation)
        .bind(status_code as i64)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Audit rows recorded for one Task (operation, status_code), oldest
    /// first, mirroring the `record_inference_response` call sites in
    /// `coordinator::phases`.
    pub async fn inference_responses_for(&self, task_id: i64) -> Result<Vec<(String, u16)>, CatalogError> {
        let rows = sqlx::query("SELECT operation, status_code FROM inference_server_responses WHERE task_id = ? ORDER BY id")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get::<String, _>("operation")?, row.try_get::<i64, _>("status_code")? as u16)))
            .collect()
    }

    /// `delete_fingerprint(id)`: cascades to its Triggers and to join rows
    /// with Destinations; Destinations themselves are not deleted.
    pub async fn delete_fingerprint(&self, id: i64) -> Result<(), CatalogError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM fingerprint_destinations WHERE fingerprint_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM triggers WHERE fingerprint_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM fingerprints WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> Result<Task, CatalogError> {
    let status_code: i64 = row.try_get("status")?;
    let status = TaskStatus::from_code(status_code).ok_or(CatalogError::NotFound(status_code))?;
    let uid: Option<String> = row.try_get("inference_server_uid")?;
    Ok(Task {
        id: row.try_get("id")?,
        fingerprint_id: row.try_get("fingerprint_id")?,
        input_archive_path: Utf8PathBuf::from(row.try_get::<String, _>("input_archive_path")?),
        output_archive_path: Utf8PathBuf::from(row.try_get::<String, _>("output_archive_path")?),
        status,
        inference_server_uid: uid.map(InferenceServerUid::new),
        deleted_local: row.try_get("deleted_local")?,
        deleted_remote: row.try_get("deleted_remote")?,
        created_timestamp: row.try_get("created_timestamp")?,
    })
}

/// Cryptographically random 8-byte folder token (spec.md §4.2), hex-encoded.
fn random_token() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Convenience for tests and the admin API: the path a Task's storage folder
/// lives under, independent of the `input.tar`/`output.tar` leaf names.
pub fn task_folder(input_archive_path: &Utf8Path) -> &Utf8Path {
    input_archive_path.parent().unwrap_or(input_archive_path)
}
