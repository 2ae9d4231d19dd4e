//! SQLite-backed run repository: `runs`, `run_attempts`, `run_events`, `idempotency_keys`.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use conductor_kernel::{
    check_transition, EventDraft, EventKind, FailureRecord, KernelError, RunEvent, RunId,
    RunState, Seq, TransitionOutcome,
};

use crate::models::{AttemptRecord, AttemptState, RunFilter, RunRecord};
use crate::repository::RunRepository;

/// Checkpoints share the database file through their own connections.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const RUN_COLUMNS: &str = "run_id, graph_name, submitter, state, created_at_ms, updated_at_ms,
    completed_at_ms, error, checkpoint_ref, retry_of, idempotency_key, input_json, failures_json";

#[derive(Clone)]
pub struct SqliteRunRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunRepository {
    pub fn new(db_path: &str) -> Result<Self, KernelError> {
        let conn = Connection::open(db_path)
            .map_err(|e| KernelError::Repository(format!("open sqlite run repo: {}", e)))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| KernelError::Repository(format!("set busy timeout: {}", e)))?;
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KernelError> {
        self.conn
            .lock()
            .map_err(|_| KernelError::Repository("sqlite run repo lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), KernelError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            CREATE TABLE IF NOT EXISTS runs (
              run_id TEXT PRIMARY KEY,
              graph_name TEXT NOT NULL,
              submitter TEXT NOT NULL,
              state TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              completed_at_ms INTEGER NULL,
              error TEXT NULL,
              checkpoint_ref INTEGER NULL,
              retry_of TEXT NULL,
              idempotency_key TEXT NULL,
              input_json TEXT NOT NULL,
              failures_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_attempts (
              attempt_id TEXT PRIMARY KEY,
              run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
              attempt_number INTEGER NOT NULL,
              state TEXT NOT NULL,
              error TEXT NULL,
              started_at_ms INTEGER NOT NULL,
              finished_at_ms INTEGER NULL,
              UNIQUE(run_id, attempt_number)
            );
            CREATE TABLE IF NOT EXISTS run_events (
              run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
              seq INTEGER NOT NULL,
              kind TEXT NOT NULL,
              name TEXT NOT NULL,
              data_json TEXT NOT NULL,
              timestamp_ms INTEGER NOT NULL,
              PRIMARY KEY (run_id, seq)
            );
            CREATE TABLE IF NOT EXISTS idempotency_keys (
              idempotency_key TEXT PRIMARY KEY,
              run_id TEXT NOT NULL,
              bound_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);
            CREATE INDEX IF NOT EXISTS idx_runs_graph_created ON runs(graph_name, created_at_ms DESC);
            "#,
        )
        .map_err(|e| KernelError::Repository(format!("init sqlite run schema: {}", e)))?;
        Ok(())
    }

    fn update_run_column(
        &self,
        run_id: &RunId,
        sql: &str,
        value: &dyn rusqlite::ToSql,
    ) -> Result<(), KernelError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(sql, params![value, dt_to_ms(Utc::now()), run_id])
            .map_err(map_rusqlite_err)?;
        if changed == 0 {
            return Err(KernelError::RunNotFound(run_id.clone()));
        }
        Ok(())
    }
}

impl RunRepository for SqliteRunRepository {
    fn insert_run(&self, record: &RunRecord) -> Result<(), KernelError> {
        let conn = self.lock()?;
        let failures = serde_json::to_string(&record.failures)?;
        conn.execute(
            &format!("INSERT INTO runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
            params![
                record.run_id,
                record.graph_name,
                record.submitter,
                record.state.as_str(),
                dt_to_ms(record.created_at),
                dt_to_ms(record.updated_at),
                record.completed_at.map(dt_to_ms),
                record.error,
                record.checkpoint_ref.map(|s| s as i64),
                record.retry_of,
                record.idempotency_key,
                record.input.to_string(),
                failures,
            ],
        )
        .map_err(|e| KernelError::Repository(format!("insert run {}: {}", record.run_id, e)))?;
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>, KernelError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                read_run_row,
            )
            .optional()
            .map_err(map_rusqlite_err)?;
        row.map(decode_run).transpose()
    }

    fn transition(&self, run_id: &RunId, next: RunState) -> Result<TransitionOutcome, KernelError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_rusqlite_err)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT state FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_rusqlite_err)?;
        let current = current.ok_or_else(|| KernelError::RunNotFound(run_id.clone()))?;
        let current = parse_run_state(&current)?;
        let outcome = check_transition(current, next);
        if outcome.changed() {
            let now = dt_to_ms(Utc::now());
            let completed_at = outcome.current.is_terminal().then_some(now);
            tx.execute(
                "UPDATE runs SET state = ?1, updated_at_ms = ?2,
                   completed_at_ms = COALESCE(?3, completed_at_ms)
                 WHERE run_id = ?4",
                params![outcome.current.as_str(), now, completed_at, run_id],
            )
            .map_err(map_rusqlite_err)?;
        }
        tx.commit().map_err(map_rusqlite_err)?;
        Ok(outcome)
    }

    fn set_error(&self, run_id: &RunId, error: Option<String>) -> Result<(), KernelError> {
        self.update_run_column(
            run_id,
            "UPDATE runs SET error = ?1, updated_at_ms = ?2 WHERE run_id = ?3",
            &error,
        )
    }

    fn set_checkpoint_ref(&self, run_id: &RunId, seq: Seq) -> Result<(), KernelError> {
        self.update_run_column(
            run_id,
            "UPDATE runs SET checkpoint_ref = ?1, updated_at_ms = ?2 WHERE run_id = ?3",
            &(seq as i64),
        )
    }

    fn append_failure(&self, run_id: &RunId, failure: &FailureRecord) -> Result<(), KernelError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_rusqlite_err)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT failures_json FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_rusqlite_err)?;
        let existing = existing.ok_or_else(|| KernelError::RunNotFound(run_id.clone()))?;
        let mut failures: Vec<FailureRecord> = serde_json::from_str(&existing)?;
        failures.push(failure.clone());
        tx.execute(
            "UPDATE runs SET failures_json = ?1, updated_at_ms = ?2 WHERE run_id = ?3",
            params![serde_json::to_string(&failures)?, dt_to_ms(Utc::now()), run_id],
        )
        .map_err(map_rusqlite_err)?;
        tx.commit().map_err(map_rusqlite_err)?;
        Ok(())
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE (?1 IS NULL OR graph_name = ?1) AND (?2 IS NULL OR state = ?2)
                 ORDER BY created_at_ms DESC, run_id DESC
                 LIMIT ?3 OFFSET ?4"
            ))
            .map_err(map_rusqlite_err)?;
        let rows = stmt
            .query_map(
                params![
                    filter.graph_name,
                    filter.state.map(|s| s.as_str()),
                    filter.limit as i64,
                    filter.offset as i64
                ],
                read_run_row,
            )
            .map_err(map_rusqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_run(row.map_err(map_rusqlite_err)?)?);
        }
        Ok(out)
    }

    fn list_non_terminal(&self) -> Result<Vec<RunRecord>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs
                 WHERE state NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
                 ORDER BY created_at_ms ASC"
            ))
            .map_err(map_rusqlite_err)?;
        let rows = stmt.query_map([], read_run_row).map_err(map_rusqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_run(row.map_err(map_rusqlite_err)?)?);
        }
        Ok(out)
    }

    fn create_attempt(&self, run_id: &RunId) -> Result<AttemptRecord, KernelError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_rusqlite_err)?;
        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM runs WHERE run_id = ?1", params![run_id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(map_rusqlite_err)?;
        if exists.is_none() {
            return Err(KernelError::RunNotFound(run_id.clone()));
        }
        let last: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(attempt_number), 0) FROM run_attempts WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(map_rusqlite_err)?;
        let attempt = AttemptRecord {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.clone(),
            attempt_number: (last + 1) as u32,
            state: AttemptState::Running,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        tx.execute(
            "INSERT INTO run_attempts (attempt_id, run_id, attempt_number, state, error, started_at_ms, finished_at_ms)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL)",
            params![
                attempt.attempt_id,
                attempt.run_id,
                attempt.attempt_number as i64,
                attempt.state.as_str(),
                dt_to_ms(attempt.started_at)
            ],
        )
        .map_err(map_rusqlite_err)?;
        tx.commit().map_err(map_rusqlite_err)?;
        Ok(attempt)
    }

    fn finish_attempt(
        &self,
        attempt_id: &str,
        state: AttemptState,
        error: Option<String>,
    ) -> Result<(), KernelError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE run_attempts SET state = ?1, error = ?2, finished_at_ms = ?3 WHERE attempt_id = ?4",
                params![state.as_str(), error, dt_to_ms(Utc::now()), attempt_id],
            )
            .map_err(map_rusqlite_err)?;
        if changed == 0 {
            return Err(KernelError::Repository(format!(
                "attempt not found: {attempt_id}"
            )));
        }
        Ok(())
    }

    fn list_attempts(&self, run_id: &RunId) -> Result<Vec<AttemptRecord>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT attempt_id, run_id, attempt_number, state, error, started_at_ms, finished_at_ms
                 FROM run_attempts WHERE run_id = ?1 ORDER BY attempt_number ASC",
            )
            .map_err(map_rusqlite_err)?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            })
            .map_err(map_rusqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (attempt_id, run_id, number, state, error, started, finished) =
                row.map_err(map_rusqlite_err)?;
            let state = AttemptState::parse(&state).ok_or_else(|| {
                KernelError::Repository(format!("unknown attempt state: {state}"))
            })?;
            out.push(AttemptRecord {
                attempt_id,
                run_id,
                attempt_number: number as u32,
                state,
                error,
                started_at: ms_to_dt(started),
                finished_at: finished.map(ms_to_dt),
            });
        }
        Ok(out)
    }

    fn append_event(&self, run_id: &RunId, draft: EventDraft) -> Result<RunEvent, KernelError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_rusqlite_err)?;
        let head: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM run_events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(map_rusqlite_err)?;
        let event = RunEvent {
            run_id: run_id.clone(),
            seq: (head + 1) as Seq,
            kind: draft.kind,
            name: draft.name,
            data: draft.data,
            timestamp: Utc::now(),
        };
        tx.execute(
            "INSERT INTO run_events (run_id, seq, kind, name, data_json, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.run_id,
                event.seq as i64,
                event.kind.as_str(),
                event.name,
                event.data.to_string(),
                dt_to_ms(event.timestamp)
            ],
        )
        .map_err(|e| KernelError::EventStore(format!("append event: {}", e)))?;
        tx.commit().map_err(map_rusqlite_err)?;
        Ok(event)
    }

    fn list_events(
        &self,
        run_id: &RunId,
        after_seq: Seq,
        limit: usize,
    ) -> Result<Vec<RunEvent>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, kind, name, data_json, timestamp_ms FROM run_events
                 WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
            )
            .map_err(map_rusqlite_err)?;
        let rows = stmt
            .query_map(params![run_id, after_seq as i64, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(map_rusqlite_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, kind, name, data, ts) = row.map_err(map_rusqlite_err)?;
            let kind: EventKind = serde_json::from_value(serde_json::Value::String(kind))?;
            out.push(RunEvent {
                run_id: run_id.clone(),
                seq: seq as Seq,
                kind,
                name,
                data: serde_json::from_str(&data)?,
                timestamp: ms_to_dt(ts),
            });
        }
        Ok(out)
    }

    fn lookup_idempotency_key(&self, key: &str) -> Result<Option<RunId>, KernelError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id FROM idempotency_keys WHERE idempotency_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_rusqlite_err)
    }

    fn bind_idempotency_key(&self, key: &str, run_id: &RunId) -> Result<(), KernelError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO idempotency_keys (idempotency_key, run_id, bound_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT (idempotency_key) DO UPDATE SET run_id = excluded.run_id, bound_at_ms = excluded.bound_at_ms",
            params![key, run_id, dt_to_ms(Utc::now())],
        )
        .map_err(map_rusqlite_err)?;
        Ok(())
    }
}

type RunRow = (
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<i64>,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn read_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn decode_run(row: RunRow) -> Result<RunRecord, KernelError> {
    let (
        run_id,
        graph_name,
        submitter,
        state,
        created_at,
        updated_at,
        completed_at,
        error,
        checkpoint_ref,
        retry_of,
        idempotency_key,
        input_json,
        failures_json,
    ) = row;
    Ok(RunRecord {
        run_id,
        graph_name,
        submitter,
        state: parse_run_state(&state)?,
        created_at: ms_to_dt(created_at),
        updated_at: ms_to_dt(updated_at),
        completed_at: completed_at.map(ms_to_dt),
        error,
        checkpoint_ref: checkpoint_ref.map(|s| s as Seq),
        retry_of,
        idempotency_key,
        input: serde_json::from_str(&input_json)?,
        failures: serde_json::from_str(&failures_json)?,
    })
}

fn parse_run_state(value: &str) -> Result<RunState, KernelError> {
    RunState::parse(value)
        .ok_or_else(|| KernelError::Repository(format!("unknown run state: {value}")))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn map_rusqlite_err(err: rusqlite::Error) -> KernelError {
    KernelError::Repository(format!("sqlite run repo: {}", err))
}
