//! 应用共享状态

use std::sync::Arc;

use clinic_database::{PageSettings, Repositories, SharedStore};
use clinic_workflow::ClinicWorkflow;

#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub workflow: Arc<ClinicWorkflow>,
    pub pages: PageSettings,
}

impl AppState {
    pub fn new(store: SharedStore, workflow: ClinicWorkflow, pages: PageSettings) -> Self {
        Self {
            repos: Repositories::new(store),
            workflow: Arc::new(workflow),
            pages,
        }
    }
}
