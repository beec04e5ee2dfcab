use async_trait::async_trait;
use podsim_protocol::Job;
use podsim_protocol::SimState;
use podsim_protocol::Simulation;
use serde_json::Value;
use serde_json::json;
use std::collections::BTreeMap;

/// Raw log text keyed by 1-based container position; indices that never
/// uploaded are simply absent.
pub type RawLogs = BTreeMap<u32, String>;

/// Log-ingestion seam. The production collaborator condenses logs and runs
/// the bracket analysis; the engine only requires *some* aggregate artifact
/// to attach to the finished job.
#[async_trait]
pub trait LogIngestor: Send + Sync {
    async fn ingest(
        &self,
        job: &Job,
        sims: &[Simulation],
        raw_logs: &RawLogs,
    ) -> anyhow::Result<Value>;
}

/// Default artifact: per-game outcomes plus a win tally per deck, built
/// from the simulation rows alone.
#[derive(Default)]
pub struct SummaryIngestor;

#[async_trait]
impl LogIngestor for SummaryIngestor {
    async fn ingest(
        &self,
        job: &Job,
        sims: &[Simulation],
        raw_logs: &RawLogs,
    ) -> anyhow::Result<Value> {
        let mut games = Vec::new();
        let mut win_counts: BTreeMap<String, u32> = BTreeMap::new();
        for sim in sims {
            if sim.state != SimState::Completed {
                continue;
            }
            for (offset, winner) in sim.winners.iter().enumerate() {
                *win_counts.entry(winner.clone()).or_default() += 1;
                games.push(json!({
                    "simId": sim.sim_id,
                    "winner": winner,
                    "winningTurn": sim.winning_turns.get(offset),
                }));
            }
        }
        Ok(json!({
            "jobId": job.id,
            "gamesPlayed": games.len(),
            "games": games,
            "winCounts": win_counts,
            "rawLogCount": raw_logs.len(),
        }))
    }
}
