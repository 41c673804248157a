use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{parse_counter, KvStore, StoreError};

/// Store en memoria del proceso. Útil para tests y despliegues de un solo
/// proceso; cada operación corre bajo un único lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    queues: HashMap<String, VecDeque<String>>,
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryState {
    /// Devuelve el valor vigente, purgando la clave si ya expiró.
    fn live(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|t| t <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Poisoned("memory store"))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.lock()?;
        Ok(state.live(key, Instant::now()).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.entries.remove(key);
        Ok(())
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let current = state.live(key, Instant::now()).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    fn increment_below(
        &self,
        key: &str,
        limit: u64,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let current = parse_counter(state.live(key, now).map(|e| e.value.as_str()));
        if current >= limit {
            return Ok(None);
        }

        let updated = current + 1;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: updated.to_string(),
                expires_at: ttl.filter(|d| !d.is_zero()).map(|d| now + d),
            },
        );
        Ok(Some(updated))
    }

    fn decrement_or_delete(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let current = parse_counter(state.live(key, Instant::now()).map(|e| e.value.as_str()));
        if current <= 1 {
            state.entries.remove(key);
            return Ok(0);
        }

        let updated = current - 1;
        if let Some(entry) = state.entries.get_mut(key) {
            // como DECR: conserva la expiración
            entry.value = updated.to_string();
        }
        Ok(updated)
    }

    fn push_back(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    fn pop_front(&self, queue: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()?
            .queues
            .get_mut(queue)
            .and_then(|q| q.pop_front()))
    }
}
