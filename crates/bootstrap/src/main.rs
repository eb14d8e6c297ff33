use std::sync::Arc;

use anyhow::Context;

use commitbox_infra::{Backend, InMemoryStorage, Persistence, PostgresStorage, StorageConfig};

fn main() -> anyhow::Result<()> {
    commitbox_observability::init();

    let config = StorageConfig::from_env().context("invalid storage configuration")?;

    match &config.backend {
        Backend::InMemory => {
            tracing::info!("using in-memory storage");
            let persistence =
                Persistence::with_config(Arc::new(InMemoryStorage::new()), config.unit_of_work);
            commitbox_bootstrap::run(&persistence)?;
        }
        Backend::Postgres { database_url } => {
            tracing::info!("using postgres storage");
            let storage = PostgresStorage::connect(database_url, 5)
                .context("failed to connect to Postgres")?
                .with_lock_timeout(config.unit_of_work.commit_timeout);
            storage.ensure_schema().context("failed to create schema")?;
            let persistence = Persistence::with_config(Arc::new(storage), config.unit_of_work);
            commitbox_bootstrap::run(&persistence)?;
        }
    }

    Ok(())
}
