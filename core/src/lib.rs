//! Job lifecycle and simulation dispatch engine.
//!
//! Everything between the HTTP surface and the store lives here: the
//! dispatcher that fans a job out into container tasks, the recovery
//! engine that re-drives lost work, the aggregator that folds finished
//! simulations into the final artifact and TrueSkill ratings, and the
//! progress streamer observers attach to. External collaborators (deck
//! service, log ingestion, blob storage, ephemeral progress) appear only
//! as traits.

mod aggregator;
mod blob;
mod config;
mod decks;
mod dispatcher;
mod error;
mod ingest;
mod progress;
mod rating;
mod recovery;
mod streamer;

pub use aggregator::Aggregator;
pub use blob::BlobStore;
pub use blob::FsBlobStore;
pub use blob::condensed_path;
pub use blob::raw_log_path;
pub use config::Config;
pub use decks::DeckResolver;
pub use decks::StaticDeckResolver;
pub use dispatcher::CreateJobRequest;
pub use dispatcher::Dispatcher;
pub use error::CoreError;
pub use ingest::LogIngestor;
pub use ingest::RawLogs;
pub use ingest::SummaryIngestor;
pub use progress::InMemoryProgressChannel;
pub use progress::NoopProgressChannel;
pub use progress::ProgressChannel;
pub use rating::RatingState;
pub use rating::RatingUpdater;
pub use rating::TrueSkill;
pub use recovery::RecoveryEngine;
pub use recovery::RecoveryReport;
pub use recovery::RecoveryThresholds;
pub use streamer::ProgressStreamer;
pub use streamer::StreamMode;
pub use streamer::StreamerConfig;
