//! The `PostgreSQL` persistence driver plugin.

use agora_core::capability::PersistenceDriver;
use agora_core::plugin::PluginRegistry;
use std::sync::Arc;

/// Class name to put in `dao.driver` to select this driver.
pub const CLASS_NAME: &str = "agora_postgres::PostgresDriver";

/// Persistence driver for `PostgreSQL` databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PersistenceDriver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }
}

/// Register every plugin this crate provides.
pub fn register_plugins(registry: &mut PluginRegistry) {
    registry.register::<dyn PersistenceDriver>(CLASS_NAME, || {
        let driver: Arc<dyn PersistenceDriver> = Arc::new(PostgresDriver);
        Ok(driver)
    });
    tracing::debug!(class_name = CLASS_NAME, "Registered postgres plugins");
}
