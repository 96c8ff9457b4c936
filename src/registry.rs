//! Persistent dataset registry keyed by dataset name.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row, Rows};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dataset::{DatasetParams, TaskKind};
use crate::status::{IngestionStatus, RunState};

/// Summary of the last successfully written table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub created_at: String,
    pub n_rows: u64,
    /// Includes the `dt` column.
    pub n_cols: u64,
    /// Nulls right after the outer join, before forward-fill.
    pub missing_values: u64,
    pub unfilled_values: u64,
    pub columns: Vec<String>,
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetRecord {
    pub params: DatasetParams,
    pub status: IngestionStatus,
    pub is_valid: bool,
    pub interval_minutes: u32,
    pub meta: Option<DatasetMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyRunning,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Running,
    NotFound,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataset {0} already exists")]
    AlreadyExists(String),
    #[error("dataset {0} not found")]
    NotFound(String),
    #[error("corrupt registry row for {name}: {reason}")]
    Corrupt { name: String, reason: String },
    #[error("registry lock poisoned")]
    LockPoisoned,
}

pub trait DatasetRegistry: Send + Sync {
    fn create(&self, params: &DatasetParams) -> Result<DatasetRecord, RegistryError>;

    fn load(&self, name: &str) -> Result<Option<DatasetRecord>, RegistryError>;

    fn list(&self) -> Result<Vec<DatasetRecord>, RegistryError>;

    fn list_by_task_kind(&self, task_kind: TaskKind) -> Result<Vec<DatasetRecord>, RegistryError>;

    /// Removes the row unless a run is in progress.
    fn delete(&self, name: &str) -> Result<DeleteOutcome, RegistryError>;

    /// Marks the dataset `running` unless a run is already in progress.
    fn claim_run(&self, name: &str) -> Result<ClaimOutcome, RegistryError>;

    fn store_run_state(&self, name: &str, state: &RunState) -> Result<(), RegistryError>;

    /// Every `running` row becomes `failed`. Returns the affected names.
    fn reconcile_orphaned_runs(&self) -> Result<Vec<String>, RegistryError>;
}

pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "
    SELECT name, task_kind, description, features, target, start_date, end_date,
           time_start, time_end, status, is_valid, interval_minutes, meta
    FROM datasets
";

impl SqliteRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|_| RegistryError::LockPoisoned)
    }
}

impl DatasetRegistry for SqliteRegistry {
    fn create(&self, params: &DatasetParams) -> Result<DatasetRecord, RegistryError> {
        let conn = self.lock()?;
        let features = serde_json::to_string(&params.features)?;
        let inserted = conn.execute(
            "
            INSERT INTO datasets (
                name, task_kind, description, features, target, start_date, end_date,
                time_start, time_end, status, is_valid, interval_minutes, meta
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, NULL)
            ON CONFLICT(name) DO NOTHING
            ",
            params![
                params.name,
                params.task_kind.as_str(),
                params.description,
                features,
                params.target,
                params.start_date,
                params.end_date,
                params.time_start,
                params.time_end,
                IngestionStatus::Pending.as_str(),
            ],
        )?;
        if inserted == 0 {
            return Err(RegistryError::AlreadyExists(params.name.clone()));
        }

        Ok(DatasetRecord {
            params: params.clone(),
            status: IngestionStatus::Pending,
            is_valid: false,
            interval_minutes: 0,
            meta: None,
        })
    }

    fn load(&self, name: &str) -> Result<Option<DatasetRecord>, RegistryError> {
        let conn = self.lock()?;
        load_record(&conn, name)
    }

    fn list(&self) -> Result<Vec<DatasetRecord>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY name"))?;
        let rows = stmt.query([])?;
        collect_records(rows)
    }

    fn list_by_task_kind(&self, task_kind: TaskKind) -> Result<Vec<DatasetRecord>, RegistryError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare(&format!("{SELECT_COLUMNS} WHERE task_kind = ?1 ORDER BY name"))?;
        let rows = stmt.query(params![task_kind.as_str()])?;
        collect_records(rows)
    }

    fn delete(&self, name: &str) -> Result<DeleteOutcome, RegistryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM datasets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match status.as_deref().map(IngestionStatus::parse) {
            None => DeleteOutcome::NotFound,
            Some(Some(IngestionStatus::Running)) => DeleteOutcome::Running,
            Some(_) => {
                tx.execute("DELETE FROM datasets WHERE name = ?1", params![name])?;
                DeleteOutcome::Deleted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn claim_run(&self, name: &str) -> Result<ClaimOutcome, RegistryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM datasets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match status.as_deref().map(IngestionStatus::parse) {
            None => ClaimOutcome::NotFound,
            Some(Some(IngestionStatus::Running)) => ClaimOutcome::AlreadyRunning,
            Some(_) => {
                tx.execute(
                    "UPDATE datasets SET status = ?2 WHERE name = ?1",
                    params![name, IngestionStatus::Running.as_str()],
                )?;
                ClaimOutcome::Claimed
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn store_run_state(&self, name: &str, state: &RunState) -> Result<(), RegistryError> {
        let conn = self.lock()?;
        let status = state.status();
        let updated = match status {
            IngestionStatus::Succeeded => {
                let meta = state.meta().map(serde_json::to_string).transpose()?;
                conn.execute(
                    "
                    UPDATE datasets
                    SET status = ?2, is_valid = 1, interval_minutes = ?3, meta = ?4
                    WHERE name = ?1
                    ",
                    params![name, status.as_str(), state.interval_minutes(), meta],
                )?
            }
            IngestionStatus::Failed => conn.execute(
                "UPDATE datasets SET status = ?2, is_valid = 0 WHERE name = ?1",
                params![name, status.as_str()],
            )?,
            IngestionStatus::Pending | IngestionStatus::Running => conn.execute(
                "UPDATE datasets SET status = ?2 WHERE name = ?1",
                params![name, status.as_str()],
            )?,
        };

        if updated == 0 {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn reconcile_orphaned_runs(&self) -> Result<Vec<String>, RegistryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let names = {
            let mut stmt =
                tx.prepare("SELECT name FROM datasets WHERE status = ?1 ORDER BY name")?;
            let rows = stmt.query_map(params![IngestionStatus::Running.as_str()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.execute(
            "UPDATE datasets SET status = ?1, is_valid = 0 WHERE status = ?2",
            params![
                IngestionStatus::Failed.as_str(),
                IngestionStatus::Running.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(names)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), RegistryError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS datasets (
            name TEXT PRIMARY KEY,
            task_kind TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            features TEXT NOT NULL,
            target TEXT,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            time_start TEXT NOT NULL,
            time_end TEXT NOT NULL,
            status TEXT NOT NULL,
            is_valid INTEGER NOT NULL DEFAULT 0,
            interval_minutes INTEGER NOT NULL DEFAULT 0,
            meta TEXT
        );
        ",
    )?;
    Ok(())
}

fn load_record(conn: &Connection, name: &str) -> Result<Option<DatasetRecord>, RegistryError> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE name = ?1"))?;
    let mut rows = stmt.query(params![name])?;
    match rows.next()? {
        Some(row) => Ok(Some(record_from_row(row)?)),
        None => Ok(None),
    }
}

fn collect_records(mut rows: Rows<'_>) -> Result<Vec<DatasetRecord>, RegistryError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(record_from_row(row)?);
    }
    Ok(out)
}

fn record_from_row(row: &Row<'_>) -> Result<DatasetRecord, RegistryError> {
    let name: String = row.get(0)?;
    let corrupt = |reason: String| RegistryError::Corrupt {
        name: name.clone(),
        reason,
    };

    let task_kind_raw: String = row.get(1)?;
    let task_kind = TaskKind::parse(&task_kind_raw).map_err(|err| corrupt(err.to_string()))?;
    let features_raw: String = row.get(3)?;
    let features: Vec<String> =
        serde_json::from_str(&features_raw).map_err(|err| corrupt(err.to_string()))?;
    let status_raw: String = row.get(9)?;
    let status = IngestionStatus::parse(&status_raw)
        .ok_or_else(|| corrupt(format!("unknown status '{status_raw}'")))?;
    let interval_raw: i64 = row.get(11)?;
    let interval_minutes = u32::try_from(interval_raw)
        .map_err(|_| corrupt(format!("interval {interval_raw} out of range")))?;
    let meta_raw: Option<String> = row.get(12)?;
    let meta = meta_raw
        .as_deref()
        .map(serde_json::from_str::<DatasetMeta>)
        .transpose()
        .map_err(|err| corrupt(err.to_string()))?;

    Ok(DatasetRecord {
        params: DatasetParams {
            name: name.clone(),
            task_kind,
            description: row.get(2)?,
            features,
            target: row.get(4)?,
            start_date: row.get(5)?,
            end_date: row.get(6)?,
            time_start: row.get(7)?,
            time_end: row.get(8)?,
        },
        status,
        is_valid: row.get(10)?,
        interval_minutes,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DEFAULT_TIME_END, DEFAULT_TIME_START};

    fn params(name: &str) -> DatasetParams {
        DatasetParams {
            name: name.to_string(),
            task_kind: TaskKind::Regression,
            description: "line 7".to_string(),
            features: vec!["100".to_string(), "101".to_string()],
            target: Some("102".to_string()),
            start_date: "20250910".to_string(),
            end_date: "20250911".to_string(),
            time_start: DEFAULT_TIME_START.to_string(),
            time_end: DEFAULT_TIME_END.to_string(),
        }
    }

    fn meta() -> DatasetMeta {
        DatasetMeta {
            created_at: "2025-09-12T00:00:00+07:00".to_string(),
            n_rows: 10,
            n_cols: 4,
            missing_values: 2,
            unfilled_values: 0,
            columns: vec!["dt".into(), "100".into(), "101".into(), "102".into()],
            path: "storages/boiler/data.csv".to_string(),
            size_bytes: 512,
            sha256: "ab".repeat(32),
        }
    }

    #[test]
    fn create_then_load_round_trips_params() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.create(&params("boiler")).unwrap();

        let record = registry.load("boiler").unwrap().unwrap();
        assert_eq!(record.params, params("boiler"));
        assert_eq!(record.status, IngestionStatus::Pending);
        assert!(!record.is_valid);
        assert_eq!(record.interval_minutes, 0);
        assert!(record.meta.is_none());
        assert!(registry.load("missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.create(&params("boiler")).unwrap();
        assert!(matches!(
            registry.create(&params("boiler")).unwrap_err(),
            RegistryError::AlreadyExists(name) if name == "boiler"
        ));
    }

    #[test]
    fn claim_allows_one_run_at_a_time() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.create(&params("boiler")).unwrap();

        assert_eq!(registry.claim_run("boiler").unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            registry.claim_run("boiler").unwrap(),
            ClaimOutcome::AlreadyRunning
        );
        assert_eq!(registry.claim_run("other").unwrap(), ClaimOutcome::NotFound);
    }

    #[test]
    fn success_persists_meta_and_failure_keeps_it() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.create(&params("boiler")).unwrap();

        let mut state = RunState::new();
        state.start().unwrap();
        state.succeed(5, meta()).unwrap();
        registry.store_run_state("boiler", &state).unwrap();

        let record = registry.load("boiler").unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Succeeded);
        assert!(record.is_valid);
        assert_eq!(record.interval_minutes, 5);
        assert_eq!(record.meta, Some(meta()));

        let mut next = RunState::new();
        next.start().unwrap();
        registry.store_run_state("boiler", &next).unwrap();
        let running = registry.load("boiler").unwrap().unwrap();
        assert_eq!(running.status, IngestionStatus::Running);
        assert!(running.is_valid);

        next.fail().unwrap();
        registry.store_run_state("boiler", &next).unwrap();
        let failed = registry.load("boiler").unwrap().unwrap();
        assert_eq!(failed.status, IngestionStatus::Failed);
        assert!(!failed.is_valid);
        assert_eq!(failed.meta, Some(meta()));
    }

    #[test]
    fn list_filters_by_task_kind() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.create(&params("boiler")).unwrap();
        registry
            .create(&DatasetParams {
                task_kind: TaskKind::Anomaly,
                target: None,
                ..params("kiln")
            })
            .unwrap();
        registry.create(&params("turbine")).unwrap();

        let names = |records: Vec<DatasetRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.params.name).collect()
        };
        assert_eq!(
            names(registry.list_by_task_kind(TaskKind::Regression).unwrap()),
            vec!["boiler", "turbine"]
        );
        assert_eq!(
            names(registry.list_by_task_kind(TaskKind::Anomaly).unwrap()),
            vec!["kiln"]
        );
        assert!(registry
            .list_by_task_kind(TaskKind::Classification)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_refuses_running_dataset() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.create(&params("boiler")).unwrap();
        registry.claim_run("boiler").unwrap();

        assert_eq!(registry.delete("boiler").unwrap(), DeleteOutcome::Running);
        assert!(registry.load("boiler").unwrap().is_some());

        registry.reconcile_orphaned_runs().unwrap();
        assert_eq!(registry.delete("boiler").unwrap(), DeleteOutcome::Deleted);
        assert!(registry.load("boiler").unwrap().is_none());
        assert_eq!(registry.delete("boiler").unwrap(), DeleteOutcome::NotFound);

        registry.create(&params("boiler")).unwrap();
    }

    #[test]
    fn storing_state_for_unknown_dataset_fails() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        assert!(matches!(
            registry.store_run_state("ghost", &RunState::new()),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn reconcile_fails_orphaned_runs_only() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        for name in ["a", "b", "c"] {
            registry.create(&params(name)).unwrap();
        }
        registry.claim_run("a").unwrap();
        registry.claim_run("c").unwrap();

        assert_eq!(registry.reconcile_orphaned_runs().unwrap(), vec!["a", "c"]);
        let statuses: Vec<_> = registry
            .list()
            .unwrap()
            .into_iter()
            .map(|r| (r.params.name, r.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("a".to_string(), IngestionStatus::Failed),
                ("b".to_string(), IngestionStatus::Pending),
                ("c".to_string(), IngestionStatus::Failed),
            ]
        );
        assert!(registry.reconcile_orphaned_runs().unwrap().is_empty());
    }

    #[test]
    fn file_backed_registry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtdb").join("data.db");
        {
            let registry = SqliteRegistry::open(&path).unwrap();
            registry.create(&params("boiler")).unwrap();
            registry.claim_run("boiler").unwrap();
        }

        let reopened = SqliteRegistry::open(&path).unwrap();
        assert_eq!(reopened.reconcile_orphaned_runs().unwrap(), vec!["boiler"]);
    }
}
