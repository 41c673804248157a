//! Store clave-valor compartido: fuente de verdad para los registros de jobs,
//! los flags de cancelación, el contador del semáforo y la cola de despacho.
//!
//! Toda operación de este trait es atómica respecto a otros llamadores del
//! mismo store (incluidos otros procesos en el caso de SQLite).

mod memory;
mod sqlite;

use std::time::Duration;

use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Escribe el valor y elimina cualquier expiración previa.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Escribe `value` sólo si el valor actual es exactamente `expected`
    /// (`None` = la clave no existe). Devuelve si se escribió.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Si el contador está por debajo de `limit` lo incrementa y re-arma la
    /// expiración; si no, no toca nada y devuelve `None`.
    fn increment_below(
        &self,
        key: &str,
        limit: u64,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError>;

    /// Decrementa sin bajar de cero; al llegar a cero borra la clave.
    fn decrement_or_delete(&self, key: &str) -> Result<u64, StoreError>;

    fn push_back(&self, queue: &str, value: &str) -> Result<(), StoreError>;

    fn pop_front(&self, queue: &str) -> Result<Option<String>, StoreError>;
}

/// Valor de contador guardado como texto (como un INCR de Redis).
fn parse_counter(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.max(0) as u64)
        .unwrap_or(0)
}
