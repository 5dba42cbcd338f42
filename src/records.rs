//! SQLite store for deployment lifecycle records
//!
//! Durable record of each container deployment, keyed by
//! (project_id, deployment_id). Records are created implicitly by the first
//! status write, mutated only through validated transitions, and never
//! deleted; termination and failure are marked, not removed.

use crate::lifecycle::{transition_allowed, DeploymentStatus, ProjectType};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// One deployment's persisted lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub project_id: String,
    pub deployment_id: String,
    pub project_type: ProjectType,
    pub status: DeploymentStatus,
    /// Unix seconds of the last observed traffic, if any
    pub last_ingressed_at: Option<i64>,
    /// Unix seconds the deployment reached TERMINATED, if it has
    pub terminated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Errors from the record store
#[derive(Debug)]
pub enum StoreError {
    /// A reported status would regress the state machine
    IllegalTransition {
        current: DeploymentStatus,
        reported: DeploymentStatus,
    },
    Database(rusqlite::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::IllegalTransition { current, reported } => write!(
                f,
                "Illegal status transition: {} -> {}",
                current, reported
            ),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

/// Thread-safe store handle
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl RecordStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // WAL mode for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!(path = %path.display(), "Deployment record store opened");
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                from = current_version,
                to = SCHEMA_VERSION,
                "Running record store migrations"
            );

            if current_version < 1 {
                conn.execute_batch(
                    "CREATE TABLE deployments (
                        project_id TEXT NOT NULL,
                        deployment_id TEXT NOT NULL,
                        project_type TEXT NOT NULL,
                        status TEXT NOT NULL,
                        last_ingressed_at INTEGER,
                        terminated_at INTEGER,
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL,
                        PRIMARY KEY (project_id, deployment_id)
                    );
                    CREATE INDEX idx_deployments_project
                        ON deployments (project_id, updated_at DESC);",
                )?;
                conn.execute(
                    "INSERT INTO schema_migrations (version) VALUES (1)",
                    [],
                )?;
            }
        }

        Ok(())
    }

    /// Apply a reported status, creating the record on first write.
    ///
    /// The transition is validated against the current row inside one
    /// transaction; a regression is rejected with
    /// [`StoreError::IllegalTransition`] and leaves the row untouched.
    /// `terminated_at` is set only when the new status is TERMINATED.
    pub fn apply_status(
        &self,
        project_id: &str,
        deployment_id: &str,
        project_type: ProjectType,
        status: DeploymentStatus,
    ) -> Result<DeploymentRecord, StoreError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;

        let current = query_record(&tx, project_id, deployment_id)?;

        match current {
            Some(record) => {
                if !transition_allowed(record.status, status) {
                    return Err(StoreError::IllegalTransition {
                        current: record.status,
                        reported: status,
                    });
                }
                let terminated_at = if status == DeploymentStatus::Terminated {
                    record.terminated_at.or(Some(now))
                } else {
                    record.terminated_at
                };
                tx.execute(
                    "UPDATE deployments
                     SET status = ?1, terminated_at = ?2, updated_at = ?3
                     WHERE project_id = ?4 AND deployment_id = ?5",
                    params![status.as_str(), terminated_at, now, project_id, deployment_id],
                )?;
            }
            None => {
                let terminated_at =
                    (status == DeploymentStatus::Terminated).then_some(now);
                tx.execute(
                    "INSERT INTO deployments
                     (project_id, deployment_id, project_type, status,
                      last_ingressed_at, terminated_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?6)",
                    params![
                        project_id,
                        deployment_id,
                        project_type.to_string(),
                        status.as_str(),
                        terminated_at,
                        now
                    ],
                )?;
            }
        }

        let record = query_record(&tx, project_id, deployment_id)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;
        Ok(record)
    }

    /// Update `last_ingressed_at` for an existing record.
    ///
    /// Traffic signals never create records and never touch status; returns
    /// false when no record exists.
    pub fn record_ingress(
        &self,
        project_id: &str,
        deployment_id: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("store mutex poisoned");
        let changed = conn.execute(
            "UPDATE deployments SET last_ingressed_at = ?1, updated_at = ?1
             WHERE project_id = ?2 AND deployment_id = ?3",
            params![now, project_id, deployment_id],
        )?;
        Ok(changed > 0)
    }

    /// Force a deployment to TERMINATED (the expiry-as-timeout path).
    ///
    /// Creates the record if it is somehow missing. Returns the record plus
    /// whether this call performed the termination; an already-terminal
    /// record is left as is.
    pub fn force_terminate(
        &self,
        project_id: &str,
        deployment_id: &str,
        project_type: ProjectType,
    ) -> Result<(DeploymentRecord, bool), StoreError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;

        let current = query_record(&tx, project_id, deployment_id)?;
        let newly_terminated = match &current {
            Some(record) if record.status.is_terminal() => false,
            Some(_) => {
                tx.execute(
                    "UPDATE deployments
                     SET status = 'TERMINATED', terminated_at = ?1, updated_at = ?1
                     WHERE project_id = ?2 AND deployment_id = ?3",
                    params![now, project_id, deployment_id],
                )?;
                true
            }
            None => {
                tx.execute(
                    "INSERT INTO deployments
                     (project_id, deployment_id, project_type, status,
                      last_ingressed_at, terminated_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'TERMINATED', NULL, ?4, ?4, ?4)",
                    params![project_id, deployment_id, project_type.to_string(), now],
                )?;
                true
            }
        };

        let record = query_record(&tx, project_id, deployment_id)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        tx.commit()?;
        Ok((record, newly_terminated))
    }

    pub fn get(
        &self,
        project_id: &str,
        deployment_id: &str,
    ) -> Result<Option<DeploymentRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(query_record(&conn, project_id, deployment_id)?)
    }

    /// All records for a project, most recently updated first
    pub fn latest_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<DeploymentRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT project_id, deployment_id, project_type, status,
                    last_ingressed_at, terminated_at, created_at, updated_at
             FROM deployments WHERE project_id = ?1
             ORDER BY updated_at DESC, created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![project_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn query_record(
    conn: &Connection,
    project_id: &str,
    deployment_id: &str,
) -> Result<Option<DeploymentRecord>, rusqlite::Error> {
    conn.query_row(
        "SELECT project_id, deployment_id, project_type, status,
                last_ingressed_at, terminated_at, created_at, updated_at
         FROM deployments WHERE project_id = ?1 AND deployment_id = ?2",
        params![project_id, deployment_id],
        row_to_record,
    )
    .optional()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<DeploymentRecord, rusqlite::Error> {
    let project_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(DeploymentRecord {
        project_id: row.get(0)?,
        deployment_id: row.get(1)?,
        project_type: ProjectType::from_str(&project_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        status: DeploymentStatus::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        last_ingressed_at: row.get(4)?,
        terminated_at: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RecordStore {
        RecordStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_first_write_creates_record() {
        let store = store();
        let record = store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Provisioning)
            .unwrap();
        assert_eq!(record.status, DeploymentStatus::Provisioning);
        assert_eq!(record.project_type, ProjectType::Dynamic);
        assert!(record.terminated_at.is_none());
        assert!(record.last_ingressed_at.is_none());
    }

    #[test]
    fn test_forward_transition_applied() {
        let store = store();
        store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Provisioning)
            .unwrap();
        let record = store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Running)
            .unwrap();
        assert_eq!(record.status, DeploymentStatus::Running);
    }

    #[test]
    fn test_regression_rejected() {
        let store = store();
        store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Production)
            .unwrap();

        let err = store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Running)
            .unwrap_err();
        match err {
            StoreError::IllegalTransition { current, reported } => {
                assert_eq!(current, DeploymentStatus::Production);
                assert_eq!(reported, DeploymentStatus::Running);
            }
            other => panic!("expected IllegalTransition, got {}", other),
        }

        // Row untouched
        let record = store.get("p1", "d1").unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Production);
    }

    #[test]
    fn test_same_status_idempotent() {
        let store = store();
        store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Running)
            .unwrap();
        let record = store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Running)
            .unwrap();
        assert_eq!(record.status, DeploymentStatus::Running);
    }

    #[test]
    fn test_terminated_sets_timestamp() {
        let store = store();
        store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Running)
            .unwrap();
        let record = store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Terminated)
            .unwrap();
        assert!(record.terminated_at.is_some());
    }

    #[test]
    fn test_record_ingress_only_for_existing() {
        let store = store();
        assert!(!store.record_ingress("p1", "d1").unwrap());

        store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Running)
            .unwrap();
        assert!(store.record_ingress("p1", "d1").unwrap());

        let record = store.get("p1", "d1").unwrap().unwrap();
        assert!(record.last_ingressed_at.is_some());
        // Traffic signal never alters status
        assert_eq!(record.status, DeploymentStatus::Running);
    }

    #[test]
    fn test_force_terminate_non_terminal() {
        let store = store();
        store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Provisioning)
            .unwrap();

        let (record, newly) = store
            .force_terminate("p1", "d1", ProjectType::Dynamic)
            .unwrap();
        assert!(newly);
        assert_eq!(record.status, DeploymentStatus::Terminated);
        assert!(record.terminated_at.is_some());

        // Second force is a no-op
        let (_, newly) = store
            .force_terminate("p1", "d1", ProjectType::Dynamic)
            .unwrap();
        assert!(!newly);
    }

    #[test]
    fn test_force_terminate_creates_missing_record() {
        let store = store();
        let (record, newly) = store
            .force_terminate("p1", "ghost", ProjectType::Dynamic)
            .unwrap();
        assert!(newly);
        assert_eq!(record.status, DeploymentStatus::Terminated);
    }

    #[test]
    fn test_latest_for_project_ordering() {
        let store = store();
        store
            .apply_status("p1", "d1", ProjectType::Dynamic, DeploymentStatus::Terminated)
            .unwrap();
        store
            .apply_status("p1", "d2", ProjectType::Dynamic, DeploymentStatus::Provisioning)
            .unwrap();
        // Touch d2 again so it is unambiguously the most recent
        store
            .apply_status("p1", "d2", ProjectType::Dynamic, DeploymentStatus::Running)
            .unwrap();

        let records = store.latest_for_project("p1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].deployment_id, "d2");
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        {
            let store = RecordStore::open(&path).unwrap();
            store
                .apply_status("p1", "d1", ProjectType::Static, DeploymentStatus::Running)
                .unwrap();
        }
        let store = RecordStore::open(&path).unwrap();
        let record = store.get("p1", "d1").unwrap().unwrap();
        assert_eq!(record.status, DeploymentStatus::Running);
        assert_eq!(record.project_type, ProjectType::Static);
    }
}
