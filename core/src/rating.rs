use chrono::Utc;
use podsim_protocol::DeckRating;
use podsim_protocol::GAMES_PER_CONTAINER;
use podsim_protocol::Job;
use podsim_protocol::MatchResult;
use podsim_protocol::SimState;
use podsim_protocol::Simulation;
use podsim_protocol::match_result_id;
use podsim_state::Store;
use std::sync::Arc;
use tracing::info;
use tracing::warn;

/// TrueSkill parameters. Display rating is `mu - 3 * sigma`.
#[derive(Debug, Clone, Copy)]
pub struct TrueSkill {
    pub mu0: f64,
    pub sigma0: f64,
    pub beta: f64,
    pub tau: f64,
}

impl Default for TrueSkill {
    fn default() -> Self {
        Self {
            mu0: 25.0,
            sigma0: 25.0 / 3.0,
            beta: 25.0 / 6.0,
            tau: 25.0 / 300.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingState {
    pub mu: f64,
    pub sigma: f64,
}

const DENOM_FLOOR: f64 = 1e-10;
const SIGMA_SQ_FLOOR: f64 = 0.01;

fn normal_pdf(x: f64) -> f64 {
    (-(x * x) / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Abramowitz & Stegun 7.1.26 rational approximation; |error| < 1.5e-7,
/// far below what the update needs.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-(x * x)).exp())
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

impl TrueSkill {
    pub fn initial(&self) -> RatingState {
        RatingState {
            mu: self.mu0,
            sigma: self.sigma0,
        }
    }

    pub fn display_rating(&self, state: RatingState) -> f64 {
        state.mu - 3.0 * state.sigma
    }

    /// One four-player game: the winner beats each of the three losers in
    /// simultaneous pairwise comparisons computed from the ratings the
    /// players brought into the game; loser-vs-loser ties are skipped.
    pub fn update_game(&self, ratings: [RatingState; 4], winner: usize) -> [RatingState; 4] {
        let mut delta_mu = [0.0f64; 4];
        let mut delta_w = [0.0f64; 4];
        for loser in 0..4 {
            if loser == winner {
                continue;
            }
            let (rw, rl) = (ratings[winner], ratings[loser]);
            let c = (rw.sigma * rw.sigma + rl.sigma * rl.sigma + 2.0 * self.beta * self.beta)
                .sqrt();
            let t = (rw.mu - rl.mu) / c;
            let v = normal_pdf(t) / normal_cdf(t).max(DENOM_FLOOR);
            let w = (v * (v + t)).clamp(0.0, 1.0 - DENOM_FLOOR);
            delta_mu[winner] += (rw.sigma * rw.sigma / c) * v;
            delta_mu[loser] -= (rl.sigma * rl.sigma / c) * v;
            delta_w[winner] += (rw.sigma.powi(4) / (c * c)) * w;
            delta_w[loser] += (rl.sigma.powi(4) / (c * c)) * w;
        }
        let mut updated = ratings;
        for seat in 0..4 {
            let sigma_sq = (ratings[seat].sigma * ratings[seat].sigma - delta_w[seat])
                .max(SIGMA_SQ_FLOOR)
                + self.tau * self.tau;
            updated[seat] = RatingState {
                mu: ratings[seat].mu + delta_mu[seat],
                sigma: sigma_sq.sqrt(),
            };
        }
        updated
    }
}

/// One game extracted from a completed simulation row.
struct GameOutcome {
    game_index: u32,
    winner_seat: Option<usize>,
    turn_count: Option<u32>,
}

fn games_from_sims(job: &Job, sims: &[Simulation]) -> Vec<GameOutcome> {
    let mut games = Vec::new();
    for sim in sims {
        if sim.state != SimState::Completed {
            continue;
        }
        for (offset, winner_name) in sim.winners.iter().enumerate() {
            let winner_seat = job
                .decks
                .iter()
                .position(|deck| deck.name == *winner_name);
            games.push(GameOutcome {
                game_index: sim.index * GAMES_PER_CONTAINER + offset as u32,
                winner_seat,
                turn_count: sim.winning_turns.get(offset).copied(),
            });
        }
    }
    games.sort_by_key(|game| game.game_index);
    games
}

/// Applies the per-job rating update. Idempotent at the job level: the
/// `MatchResult` rows are written first, and any existing row for the job
/// aborts the whole update.
pub struct RatingUpdater {
    store: Arc<dyn Store>,
    params: TrueSkill,
}

impl RatingUpdater {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            params: TrueSkill::default(),
        }
    }

    pub async fn apply_job_ratings(&self, job: &Job, sims: &[Simulation]) -> anyhow::Result<()> {
        let Some(deck_ids) = job.deck_ids.as_ref().filter(|ids| ids.len() == 4) else {
            info!(job_id = %job.id, "job has no deck ids, skipping rating update");
            return Ok(());
        };
        let games = games_from_sims(job, sims);
        if games.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let results: Vec<MatchResult> = games
            .iter()
            .map(|game| MatchResult {
                id: match_result_id(&job.id, game.game_index),
                job_id: job.id.clone(),
                game_index: game.game_index,
                deck_ids: deck_ids.clone(),
                winner_deck_id: game.winner_seat.map(|seat| deck_ids[seat].clone()),
                turn_count: game.turn_count,
                played_at: now,
            })
            .collect();
        if !self.store.insert_match_results(&results).await? {
            info!(job_id = %job.id, "match results already recorded, skipping rating update");
            return Ok(());
        }

        let existing = self.store.get_deck_ratings(deck_ids).await?;
        let mut ratings: Vec<DeckRating> = deck_ids
            .iter()
            .map(|deck_id| {
                existing
                    .iter()
                    .find(|rating| rating.deck_id == *deck_id)
                    .cloned()
                    .unwrap_or_else(|| DeckRating {
                        deck_id: deck_id.clone(),
                        mu: self.params.mu0,
                        sigma: self.params.sigma0,
                        games_played: 0,
                        wins: 0,
                        last_updated: now,
                    })
            })
            .collect();

        for game in &games {
            let Some(winner_seat) = game.winner_seat else {
                warn!(
                    job_id = %job.id,
                    game_index = game.game_index,
                    "game has no resolvable winner, skipping its rating update"
                );
                continue;
            };
            let states = [
                RatingState { mu: ratings[0].mu, sigma: ratings[0].sigma },
                RatingState { mu: ratings[1].mu, sigma: ratings[1].sigma },
                RatingState { mu: ratings[2].mu, sigma: ratings[2].sigma },
                RatingState { mu: ratings[3].mu, sigma: ratings[3].sigma },
            ];
            let updated = self.params.update_game(states, winner_seat);
            for seat in 0..4 {
                ratings[seat].mu = updated[seat].mu;
                ratings[seat].sigma = updated[seat].sigma;
                ratings[seat].games_played += 1;
                ratings[seat].last_updated = now;
            }
            ratings[winner_seat].wins += 1;
        }

        self.store.upsert_deck_ratings(&ratings).await?;
        Ok(())
    }
}
