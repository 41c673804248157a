use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::store::{KvStore, StoreError};

pub const DEFAULT_SEMAPHORE_KEY: &str = "job:semaphore";

/// Contador distribuido que limita cuántos jobs pueden estar en RUNNING a la
/// vez entre todos los workers. Acquire y release son una única operación
/// atómica en el store; el TTL sólo protege contra un holder que murió sin
/// liberar su slot.
#[derive(Clone)]
pub struct JobSemaphore {
    store: Arc<dyn KvStore>,
    key: String,
}

impl JobSemaphore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_key(store, DEFAULT_SEMAPHORE_KEY)
    }

    pub fn with_key(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Intenta ocupar un slot. No espera: si ya hay `limit` ocupados devuelve
    /// `false` sin modificar nada.
    pub fn acquire(&self, limit: u32, ttl_seconds: u64) -> Result<bool, StoreError> {
        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        match self.store.increment_below(&self.key, u64::from(limit), ttl)? {
            Some(in_use) => {
                debug!("slot adquirido ({}/{})", in_use, limit);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn release(&self) -> Result<(), StoreError> {
        let remaining = self.store.decrement_or_delete(&self.key)?;
        debug!("slot liberado (quedan {})", remaining);
        Ok(())
    }

    /// Slots ocupados en este momento.
    pub fn in_use(&self) -> Result<u64, StoreError> {
        Ok(self
            .store
            .get(&self.key)?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    #[test]
    fn no_supera_el_limite_y_no_deja_claves_al_liberar_todo() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let sem = JobSemaphore::new(store.clone());

        assert!(sem.acquire(2, 60).unwrap());
        assert!(sem.acquire(2, 60).unwrap());
        assert!(!sem.acquire(2, 60).unwrap());
        assert_eq!(sem.in_use().unwrap(), 2);

        sem.release().unwrap();
        assert!(sem.acquire(2, 60).unwrap());
        assert!(!sem.acquire(2, 60).unwrap());

        sem.release().unwrap();
        sem.release().unwrap();
        assert_eq!(store.get(DEFAULT_SEMAPHORE_KEY).unwrap(), None);

        // release de más no deja el contador negativo
        sem.release().unwrap();
        assert_eq!(sem.in_use().unwrap(), 0);
        assert!(sem.acquire(1, 60).unwrap());
        assert!(!sem.acquire(1, 60).unwrap());
    }

    #[test]
    fn limite_cero_rechaza_siempre() {
        let sem = JobSemaphore::new(Arc::new(MemoryStore::new()));
        assert!(!sem.acquire(0, 60).unwrap());
        assert_eq!(sem.in_use().unwrap(), 0);
    }

    #[test]
    fn slot_huerfano_expira_por_ttl() {
        let sem = JobSemaphore::new(Arc::new(MemoryStore::new()));
        assert!(sem
            .store
            .increment_below(&sem.key, 1, Some(Duration::from_millis(20)))
            .unwrap()
            .is_some());
        assert!(!sem.acquire(1, 60).unwrap());

        thread::sleep(Duration::from_millis(60));
        assert!(sem.acquire(1, 60).unwrap());
    }

    #[test]
    fn acquire_release_intercalados_entre_procesos_respetan_el_limite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        SqliteStore::open(&path).unwrap();

        const LIMIT: u32 = 3;
        let holding = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let path = path.clone();
                let holding = holding.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    // una conexión por "proceso"
                    let sem = JobSemaphore::new(Arc::new(SqliteStore::open(&path).unwrap()));
                    for _ in 0..20 {
                        if sem.acquire(LIMIT, 60).unwrap() {
                            let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(1));
                            holding.fetch_sub(1, Ordering::SeqCst);
                            sem.release().unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= u64::from(LIMIT));
        assert!(peak.load(Ordering::SeqCst) >= 1);
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get(DEFAULT_SEMAPHORE_KEY).unwrap(), None);
    }
}
