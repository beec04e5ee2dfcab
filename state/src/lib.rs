//! Canonical persistence for jobs, simulations, heartbeats, and ratings.
//!
//! Two backends satisfy the same [`Store`] contract: an embedded SQLite
//! file (the default) and the Firestore REST API (selected when a cloud
//! project id is configured). Conditional writes use each backend's native
//! primitive: `UPDATE ... WHERE status IN (...)` row matching for SQLite,
//! transactional read-modify-write for Firestore. The contract is the
//! same either way: atomic against concurrent writers, `Ok(false)` when
//! the guard does not match. A `false` is an observed race outcome, never
//! an error.

mod firestore;
mod model;
mod sqlite;
mod store;

pub use firestore::FirestoreConfig;
pub use firestore::FirestoreStore;
pub use firestore::StaticTokenProvider;
pub use firestore::TokenProvider;
pub use model::SimCountProgress;
pub use sqlite::SqliteStore;
pub use sqlite::sqlite_db_path;
pub use store::Store;

use std::path::PathBuf;
use std::sync::Arc;

/// Backend selection, decided once at process start.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Sqlite { data_dir: PathBuf },
    Firestore(FirestoreConfig),
}

impl StoreConfig {
    /// Cloud mode when a project id is present, embedded otherwise.
    pub fn from_env(data_dir: PathBuf) -> Self {
        match std::env::var("GOOGLE_CLOUD_PROJECT") {
            Ok(project_id) if !project_id.is_empty() => {
                Self::Firestore(FirestoreConfig::new(project_id))
            }
            _ => Self::Sqlite { data_dir },
        }
    }
}

/// Open the configured backend and run any pending migrations.
pub async fn init_store(config: StoreConfig) -> anyhow::Result<Arc<dyn Store>> {
    match config {
        StoreConfig::Sqlite { data_dir } => {
            let store = SqliteStore::init(data_dir).await?;
            Ok(Arc::new(store))
        }
        StoreConfig::Firestore(config) => {
            let store = FirestoreStore::new(config)?;
            Ok(Arc::new(store))
        }
    }
}
