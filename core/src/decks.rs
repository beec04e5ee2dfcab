use crate::error::CoreError;
use async_trait::async_trait;
use podsim_protocol::DeckDescriptor;
use std::collections::HashMap;

/// External deck-service seam: turn deck ids from a create request into the
/// four deck lists the containers consume.
#[async_trait]
pub trait DeckResolver: Send + Sync {
    async fn resolve(&self, deck_ids: &[String]) -> Result<Vec<DeckDescriptor>, CoreError>;
}

/// Table-driven resolver for local mode and tests.
#[derive(Default)]
pub struct StaticDeckResolver {
    decks: HashMap<String, DeckDescriptor>,
}

impl StaticDeckResolver {
    pub fn new(decks: impl IntoIterator<Item = (String, DeckDescriptor)>) -> Self {
        Self {
            decks: decks.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DeckResolver for StaticDeckResolver {
    async fn resolve(&self, deck_ids: &[String]) -> Result<Vec<DeckDescriptor>, CoreError> {
        deck_ids
            .iter()
            .map(|deck_id| {
                self.decks
                    .get(deck_id)
                    .cloned()
                    .ok_or_else(|| CoreError::NotFound(format!("deck {deck_id}")))
            })
            .collect()
    }
}
