pub mod exam_socket;
pub mod routes;

use crate::config::{AdminConfig, MonitorConfig};
use crate::sync::SyncEngine;

/// Shared state handed to every route.
pub struct AppContext<R, C> {
    pub engine: SyncEngine<R, C>,
    pub admin: AdminConfig,
    pub monitor: MonitorConfig,
}

impl<R, C> Clone for AppContext<R, C> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            admin: self.admin.clone(),
            monitor: self.monitor.clone(),
        }
    }
}
