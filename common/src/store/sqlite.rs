use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::{parse_counter, KvStore, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store respaldado por un archivo SQLite. Varios procesos (master y workers)
/// abren el mismo archivo; cada operación compuesta corre dentro de una
/// transacción `BEGIN IMMEDIATE`, así que lectura y escritura son atómicas
/// también entre procesos.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS kv (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              expires_at_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS queue_items (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              queue TEXT NOT NULL,
              value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS queue_items_by_queue ON queue_items(queue, seq);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Poisoned("sqlite connection"))
    }

    /// Corre `f` dentro de una transacción IMMEDIATE; si `f` falla se hace
    /// rollback al soltar la transacción.
    fn immediate<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Borra la clave si expiró y devuelve el valor vigente.
fn live_value(tx: &Transaction<'_>, key: &str, now: i64) -> Result<Option<String>, StoreError> {
    tx.execute(
        "DELETE FROM kv WHERE key = ?1 AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?2",
        params![key, now],
    )?;
    let value = tx
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    Ok(value)
}

fn upsert(
    tx: &Transaction<'_>,
    key: &str,
    value: &str,
    expires_at_ms: Option<i64>,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
        params![key, value, expires_at_ms],
    )?;
    Ok(())
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                params![key, now_ms()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.immediate(|tx| upsert(tx, key, value, None))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        self.immediate(|tx| {
            let current = live_value(tx, key, now_ms())?;
            if current.as_deref() != expected {
                return Ok(false);
            }
            upsert(tx, key, value, None)?;
            Ok(true)
        })
    }

    fn increment_below(
        &self,
        key: &str,
        limit: u64,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        self.immediate(|tx| {
            let now = now_ms();
            let current = parse_counter(live_value(tx, key, now)?.as_deref());
            if current >= limit {
                return Ok(None);
            }

            let updated = current + 1;
            let expires_at = ttl
                .filter(|d| !d.is_zero())
                .map(|d| now + d.as_millis() as i64);
            upsert(tx, key, &updated.to_string(), expires_at)?;
            Ok(Some(updated))
        })
    }

    fn decrement_or_delete(&self, key: &str) -> Result<u64, StoreError> {
        self.immediate(|tx| {
            let current = parse_counter(live_value(tx, key, now_ms())?.as_deref());
            if current <= 1 {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                return Ok(0);
            }

            let updated = current - 1;
            tx.execute(
                "UPDATE kv SET value = ?2 WHERE key = ?1",
                params![key, updated.to_string()],
            )?;
            Ok(updated)
        })
    }

    fn push_back(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO queue_items (queue, value) VALUES (?1, ?2)",
            params![queue, value],
        )?;
        Ok(())
    }

    fn pop_front(&self, queue: &str) -> Result<Option<String>, StoreError> {
        self.immediate(|tx| {
            let head = tx
                .query_row(
                    "SELECT seq, value FROM queue_items WHERE queue = ?1 ORDER BY seq LIMIT 1",
                    params![queue],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;

            let Some((seq, value)) = head else {
                return Ok(None);
            };
            tx.execute("DELETE FROM queue_items WHERE seq = ?1", params![seq])?;
            Ok(Some(value))
        })
    }
}
