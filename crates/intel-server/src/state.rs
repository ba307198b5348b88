use intel_core::orchestrator::Orchestrator;

/// Shared state for every handler. The orchestrator owns the store, the
/// run tracker and the event channel; handlers only reach them through it.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}
