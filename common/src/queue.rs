use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::job::{JobId, JobType};
use crate::store::KvStore;

pub const DEFAULT_QUEUE: &str = "jobs:queue";

/// Mensaje que el intake deja en la cola para que un worker lo tome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub job_id: JobId,
    pub job_type: JobType,
    pub payload: Value,
}

/// Cola FIFO de despacho sobre el store compartido.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn KvStore>,
    name: String,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_name(store, DEFAULT_QUEUE)
    }

    pub fn with_name(store: Arc<dyn KvStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn push(&self, message: &DispatchMessage) -> Result<()> {
        let raw = serde_json::to_string(message)?;
        self.store.push_back(&self.name, &raw)?;
        debug!("job {} encolado en {}", message.job_id, self.name);
        Ok(())
    }

    /// Siguiente mensaje, o `None` si la cola está vacía. Un mensaje ilegible
    /// se descarta con un warning y se sigue con el siguiente.
    pub fn pop(&self) -> Result<Option<DispatchMessage>> {
        while let Some(raw) = self.store.pop_front(&self.name)? {
            match serde_json::from_str::<DispatchMessage>(&raw) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!("mensaje inválido descartado de {}: {}", self.name, e),
            }
        }
        Ok(None)
    }
}
