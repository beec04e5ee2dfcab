#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::SqliteStore;
use podsim_protocol::CreateJobParams;
use podsim_protocol::DECKS_PER_JOB;
use podsim_protocol::DeckDescriptor;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

pub(crate) fn unique_temp_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    std::env::temp_dir().join(format!("podsim-state-test-{nanos}-{}", Uuid::new_v4()))
}

pub(crate) async fn open_test_store() -> SqliteStore {
    SqliteStore::init(unique_temp_dir())
        .await
        .expect("open test store")
}

pub(crate) fn test_decks() -> Vec<DeckDescriptor> {
    (0..DECKS_PER_JOB)
        .map(|seat| DeckDescriptor {
            name: format!("deck-{seat}"),
            content: format!("1 Island\n1 Mountain\n# seat {seat}"),
        })
        .collect()
}

pub(crate) fn create_params(simulations: u32) -> CreateJobParams {
    CreateJobParams {
        decks: test_decks(),
        deck_ids: None,
        simulations,
        parallelism: 4,
        idempotency_key: None,
        created_by: "tester".to_string(),
    }
}
