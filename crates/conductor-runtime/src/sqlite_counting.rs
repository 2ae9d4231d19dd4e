//! SQLite-backed counting store: reservations shared by every worker on the same database.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use conductor_kernel::KernelError;

use crate::concurrency::{CountingStore, ScopeLimit};

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

fn map_err(prefix: &str, err: impl std::fmt::Display) -> KernelError {
    KernelError::Repository(format!("{prefix}: {err}"))
}

#[derive(Clone)]
pub struct SqliteCountingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCountingStore {
    pub fn new(db_path: &str) -> Result<Self, KernelError> {
        let conn = Connection::open(db_path).map_err(|e| map_err("open sqlite counting store", e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| map_err("set busy timeout", e))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
              scope TEXT NOT NULL,
              holder TEXT NOT NULL,
              expires_at_ms INTEGER NOT NULL,
              PRIMARY KEY (scope, holder)
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_expiry ON reservations(expires_at_ms);
            "#,
        )
        .map_err(|e| map_err("init reservations schema", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KernelError> {
        self.conn
            .lock()
            .map_err(|_| KernelError::Repository("sqlite counting store lock poisoned".to_string()))
    }
}

impl CountingStore for SqliteCountingStore {
    fn try_reserve_all(
        &self,
        holder: &str,
        scopes: &[ScopeLimit],
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let mut conn = self.lock()?;
        // Immediate: the count and the insert must see the same reservations across processes.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_err("begin reservation tx", e))?;
        let now_ms = now.timestamp_millis();
        for request in scopes {
            tx.execute(
                "DELETE FROM reservations WHERE scope = ?1 AND expires_at_ms <= ?2",
                params![request.scope, now_ms],
            )
            .map_err(|e| map_err("prune scope", e))?;
            let held: Option<i64> = tx
                .query_row(
                    "SELECT expires_at_ms FROM reservations WHERE scope = ?1 AND holder = ?2",
                    params![request.scope, holder],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| map_err("read reservation", e))?;
            if held.is_some() {
                continue;
            }
            let count: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM reservations WHERE scope = ?1",
                    params![request.scope],
                    |row| row.get(0),
                )
                .map_err(|e| map_err("count scope", e))?;
            if count as usize >= request.limit {
                return Ok(false);
            }
        }
        let expires_at_ms = (now + ttl).timestamp_millis();
        for request in scopes {
            tx.execute(
                "INSERT INTO reservations (scope, holder, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT (scope, holder) DO UPDATE SET expires_at_ms = excluded.expires_at_ms",
                params![request.scope, holder, expires_at_ms],
            )
            .map_err(|e| map_err("insert reservation", e))?;
        }
        tx.commit().map_err(|e| map_err("commit reservation", e))?;
        Ok(true)
    }

    fn release(&self, scope: &str, holder: &str) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM reservations WHERE scope = ?1 AND holder = ?2",
                params![scope, holder],
            )
            .map_err(|e| map_err("release reservation", e))?;
        Ok(removed > 0)
    }

    fn heartbeat(
        &self,
        scope: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let extended = conn
            .execute(
                "UPDATE reservations SET expires_at_ms = ?1
                 WHERE scope = ?2 AND holder = ?3 AND expires_at_ms > ?4",
                params![
                    (now + ttl).timestamp_millis(),
                    scope,
                    holder,
                    now.timestamp_millis()
                ],
            )
            .map_err(|e| map_err("heartbeat reservation", e))?;
        Ok(extended > 0)
    }

    fn is_held(&self, scope: &str, holder: &str, now: DateTime<Utc>) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let held: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM reservations WHERE scope = ?1 AND holder = ?2 AND expires_at_ms > ?3",
                params![scope, holder, now.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| map_err("read reservation", e))?;
        Ok(held.is_some())
    }

    fn count(&self, scope: &str, now: DateTime<Utc>) -> Result<usize, KernelError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reservations WHERE scope = ?1 AND expires_at_ms > ?2",
                params![scope, now.timestamp_millis()],
                |row| row.get(0),
            )
            .map_err(|e| map_err("count scope", e))?;
        Ok(count as usize)
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, KernelError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM reservations WHERE expires_at_ms <= ?1",
            params![now.timestamp_millis()],
        )
        .map_err(|e| map_err("prune reservations", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ACTIVE_SCOPE;

    fn temp_db() -> String {
        std::env::temp_dir()
            .join(format!("conductor-counting-{}.db", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn two_handles_on_one_database_share_the_limit() {
        let path = temp_db();
        let worker_a = SqliteCountingStore::new(&path).unwrap();
        let worker_b = SqliteCountingStore::new(&path).unwrap();
        let now = Utc::now();
        let ttl = Duration::seconds(5);
        let active = [ScopeLimit {
            scope: ACTIVE_SCOPE.into(),
            limit: 1,
        }];

        assert!(worker_a.try_reserve_all("run-a", &active, ttl, now).unwrap());
        assert!(!worker_b.try_reserve_all("run-b", &active, ttl, now).unwrap());
        assert!(worker_b.is_held(ACTIVE_SCOPE, "run-a", now).unwrap());
        // Re-reserving a held slot refreshes it instead of counting twice.
        assert!(worker_a.try_reserve_all("run-a", &active, ttl, now).unwrap());

        let later = now + Duration::seconds(6);
        assert!(!worker_a.heartbeat(ACTIVE_SCOPE, "run-a", ttl, later).unwrap());
        assert_eq!(worker_b.count(ACTIVE_SCOPE, later).unwrap(), 0);
        assert_eq!(worker_a.prune_expired(later).unwrap(), 1);
        assert!(worker_b.try_reserve_all("run-b", &active, ttl, later).unwrap());
        assert!(worker_b.release(ACTIVE_SCOPE, "run-b").unwrap());

        let _ = std::fs::remove_file(&path);
    }
}
