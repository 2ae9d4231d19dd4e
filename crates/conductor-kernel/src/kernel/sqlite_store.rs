//! SQLite-backed checkpoint and artifact store.
//!
//! This module is feature-gated behind `sqlite-persistence`. One row per run in `checkpoints`
//! (latest overwrites); `checkpoint_artifacts` holds elided content per checkpoint sequence.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::kernel::artifact::{Artifact, ArtifactRef, ArtifactStore};
use crate::kernel::checkpoint::{CheckpointSnapshot, CheckpointStore};
use crate::kernel::event::KernelError;
use crate::kernel::identity::{RunId, Seq};

fn map_checkpoint_err(prefix: &str, err: impl std::fmt::Display) -> KernelError {
    KernelError::CheckpointStore(format!("{prefix}: {err}"))
}

/// SQLite-backed store for checkpoints and their artifacts.
pub struct SqliteCheckpointStore {
    db_path: PathBuf,
    lock: Mutex<()>,
}

impl SqliteCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn open_connection(&self) -> Result<Connection, KernelError> {
        if let Some(parent) = Path::new(&self.db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| map_checkpoint_err("create parent dir", e))?;
        }
        let conn = Connection::open(&self.db_path)
            .map_err(|e| map_checkpoint_err("open sqlite db", e))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| map_checkpoint_err("set busy timeout", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_checkpoint_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| map_checkpoint_err("set synchronous", e))?;
        self.ensure_schema(&conn)?;
        Ok(conn)
    }

    fn ensure_schema(&self, conn: &Connection) -> Result<(), KernelError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS checkpoints (
                run_id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                paused INTEGER NOT NULL,
                snapshot_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_paused
            ON checkpoints (paused, created_at);
            CREATE TABLE IF NOT EXISTS checkpoint_artifacts (
                run_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                artifact_id TEXT NOT NULL,
                uri TEXT NOT NULL,
                content_hash TEXT,
                metadata_json TEXT NOT NULL,
                content_json TEXT NOT NULL,
                PRIMARY KEY (run_id, sequence, artifact_id)
            );
            ",
        )
        .map_err(|e| map_checkpoint_err("ensure schema", e))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, KernelError> {
        self.lock
            .lock()
            .map_err(|_| map_checkpoint_err("lock poisoned", "mutex poisoned"))
    }
}

fn decode_snapshot(json: &str) -> Result<CheckpointSnapshot, KernelError> {
    serde_json::from_str(json).map_err(|e| map_checkpoint_err("decode checkpoint", e))
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, snapshot: &CheckpointSnapshot) -> Result<(), KernelError> {
        let _guard = self.lock()?;
        let mut conn = self.open_connection()?;
        let json = serde_json::to_string(snapshot)
            .map_err(|e| map_checkpoint_err("encode checkpoint", e))?;
        let tx = conn
            .transaction()
            .map_err(|e| map_checkpoint_err("begin tx", e))?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT sequence FROM checkpoints WHERE run_id = ?1",
                params![snapshot.run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| map_checkpoint_err("read sequence", e))?;
        if let Some(existing) = existing {
            if existing as u64 > snapshot.sequence {
                return Err(map_checkpoint_err(
                    "stale checkpoint",
                    format!("{} < {}", snapshot.sequence, existing),
                ));
            }
        }
        tx.execute(
            "INSERT INTO checkpoints (run_id, sequence, paused, snapshot_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (run_id)
             DO UPDATE SET sequence = excluded.sequence, paused = excluded.paused,
                           snapshot_json = excluded.snapshot_json, created_at = excluded.created_at",
            params![
                snapshot.run_id,
                snapshot.sequence as i64,
                snapshot.is_paused() as i64,
                json,
                snapshot.created_at.to_rfc3339()
            ],
        )
        .map_err(|e| map_checkpoint_err("save checkpoint", e))?;
        tx.commit().map_err(|e| map_checkpoint_err("commit tx", e))?;
        Ok(())
    }

    fn load_latest(&self, run_id: &RunId) -> Result<Option<CheckpointSnapshot>, KernelError> {
        let _guard = self.lock()?;
        let conn = self.open_connection()?;
        let row: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM checkpoints WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| map_checkpoint_err("load checkpoint", e))?;
        row.as_deref().map(decode_snapshot).transpose()
    }

    fn delete(&self, run_id: &RunId) -> Result<(), KernelError> {
        let _guard = self.lock()?;
        let conn = self.open_connection()?;
        conn.execute("DELETE FROM checkpoints WHERE run_id = ?1", params![run_id])
            .map_err(|e| map_checkpoint_err("delete checkpoint", e))?;
        Ok(())
    }

    fn list_paused(&self) -> Result<Vec<CheckpointSnapshot>, KernelError> {
        let _guard = self.lock()?;
        let conn = self.open_connection()?;
        let mut stmt = conn
            .prepare("SELECT snapshot_json FROM checkpoints WHERE paused = 1 ORDER BY created_at ASC")
            .map_err(|e| map_checkpoint_err("prepare list paused", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| map_checkpoint_err("list paused", e))?;
        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(|e| map_checkpoint_err("read row", e))?;
            out.push(decode_snapshot(&json)?);
        }
        Ok(out)
    }
}

impl ArtifactStore for SqliteCheckpointStore {
    fn put(&self, run_id: &RunId, sequence: Seq, artifacts: &[Artifact]) -> Result<(), KernelError> {
        let _guard = self.lock()?;
        let mut conn = self.open_connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_checkpoint_err("begin tx", e))?;
        tx.execute(
            "DELETE FROM checkpoint_artifacts WHERE run_id = ?1 AND sequence = ?2",
            params![run_id, sequence as i64],
        )
        .map_err(|e| map_checkpoint_err("clear artifact set", e))?;
        for artifact in artifacts {
            let r = &artifact.reference;
            tx.execute(
                "INSERT INTO checkpoint_artifacts
                   (run_id, sequence, artifact_id, uri, content_hash, metadata_json, content_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    sequence as i64,
                    r.artifact_id,
                    r.uri,
                    r.content_hash,
                    r.metadata.to_string(),
                    artifact.content.to_string()
                ],
            )
            .map_err(|e| map_checkpoint_err("insert artifact", e))?;
        }
        tx.commit().map_err(|e| map_checkpoint_err("commit tx", e))?;
        Ok(())
    }

    fn get(
        &self,
        run_id: &RunId,
        sequence: Seq,
        artifact_id: &str,
    ) -> Result<Option<Artifact>, KernelError> {
        let _guard = self.lock()?;
        let conn = self.open_connection()?;
        let row = conn
            .query_row(
                "SELECT artifact_id, uri, content_hash, metadata_json, content_json
                 FROM checkpoint_artifacts
                 WHERE run_id = ?1 AND sequence = ?2 AND artifact_id = ?3",
                params![run_id, sequence as i64, artifact_id],
                read_artifact_row,
            )
            .optional()
            .map_err(|e| map_checkpoint_err("load artifact", e))?;
        row.map(decode_artifact).transpose()
    }

    fn list(&self, run_id: &RunId, sequence: Seq) -> Result<Vec<Artifact>, KernelError> {
        let _guard = self.lock()?;
        let conn = self.open_connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT artifact_id, uri, content_hash, metadata_json, content_json
                 FROM checkpoint_artifacts WHERE run_id = ?1 AND sequence = ?2
                 ORDER BY artifact_id ASC",
            )
            .map_err(|e| map_checkpoint_err("prepare list artifacts", e))?;
        let rows = stmt
            .query_map(params![run_id, sequence as i64], read_artifact_row)
            .map_err(|e| map_checkpoint_err("list artifacts", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_artifact(
                row.map_err(|e| map_checkpoint_err("read row", e))?,
            )?);
        }
        Ok(out)
    }

    fn retain_only(&self, run_id: &RunId, sequence: Seq) -> Result<usize, KernelError> {
        let _guard = self.lock()?;
        let conn = self.open_connection()?;
        let removed = conn
            .execute(
                "DELETE FROM checkpoint_artifacts WHERE run_id = ?1 AND sequence <> ?2",
                params![run_id, sequence as i64],
            )
            .map_err(|e| map_checkpoint_err("prune artifact sets", e))?;
        Ok(removed)
    }

    fn delete_run(&self, run_id: &RunId) -> Result<(), KernelError> {
        let _guard = self.lock()?;
        let conn = self.open_connection()?;
        conn.execute("DELETE FROM checkpoint_artifacts WHERE run_id = ?1", params![run_id])
            .map_err(|e| map_checkpoint_err("delete artifacts", e))?;
        Ok(())
    }
}

type ArtifactRow = (String, String, Option<String>, String, String);

fn read_artifact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_artifact(row: ArtifactRow) -> Result<Artifact, KernelError> {
    let (artifact_id, uri, content_hash, metadata_json, content_json) = row;
    Ok(Artifact {
        reference: ArtifactRef {
            artifact_id,
            uri,
            content_hash,
            metadata: serde_json::from_str(&metadata_json)
                .map_err(|e| map_checkpoint_err("decode artifact metadata", e))?,
        },
        content: serde_json::from_str(&content_json)
            .map_err(|e| map_checkpoint_err("decode artifact content", e))?,
    })
}
