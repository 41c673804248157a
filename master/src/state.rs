// master/src/state.rs

use common::JobService;

#[derive(Clone)]
pub struct AppState {
    // toda la lógica de jobs vive en el servicio; el estado compartido real
    // está en el store, no en memoria del master
    pub service: JobService,
}

impl AppState {
    pub fn new(service: JobService) -> Self {
        Self { service }
    }
}
