use super::SqliteStore;
#[cfg(test)]
use crate::model::MatchResultRow;
use crate::model::datetime_to_epoch_ms;
use crate::model::epoch_ms_to_datetime;
use podsim_protocol::DeckRating;
use podsim_protocol::MatchResult;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;

impl SqliteStore {
    pub(super) async fn get_deck_ratings_impl(
        &self,
        deck_ids: &[String],
    ) -> anyhow::Result<Vec<DeckRating>> {
        if deck_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT deck_id, mu, sigma, games_played, wins, last_updated FROM ratings WHERE deck_id IN (",
        );
        let mut separated = builder.separated(", ");
        for deck_id in deck_ids {
            separated.push_bind(deck_id.as_str());
        }
        builder.push(")");
        let rows = builder.build().fetch_all(self.pool()).await?;
        rows.into_iter()
            .map(|row| {
                Ok(DeckRating {
                    deck_id: row.try_get("deck_id")?,
                    mu: row.try_get("mu")?,
                    sigma: row.try_get("sigma")?,
                    games_played: u32::try_from(row.try_get::<i64, _>("games_played")?)?,
                    wins: u32::try_from(row.try_get::<i64, _>("wins")?)?,
                    last_updated: epoch_ms_to_datetime(row.try_get("last_updated")?)?,
                })
            })
            .collect()
    }

    pub(super) async fn upsert_deck_ratings_impl(
        &self,
        ratings: &[DeckRating],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool().begin().await?;
        for rating in ratings {
            sqlx::query(
                r#"
INSERT INTO ratings (deck_id, mu, sigma, games_played, wins, last_updated)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT(deck_id) DO UPDATE SET
    mu = excluded.mu,
    sigma = excluded.sigma,
    games_played = excluded.games_played,
    wins = excluded.wins,
    last_updated = excluded.last_updated
                "#,
            )
            .bind(rating.deck_id.as_str())
            .bind(rating.mu)
            .bind(rating.sigma)
            .bind(i64::from(rating.games_played))
            .bind(i64::from(rating.wins))
            .bind(datetime_to_epoch_ms(rating.last_updated))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn insert_match_results_impl(
        &self,
        results: &[MatchResult],
    ) -> anyhow::Result<bool> {
        let Some(first) = results.first() else {
            return Ok(false);
        };
        let mut tx = self.pool().begin().await?;
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM match_results WHERE job_id = ?")
                .bind(first.job_id.as_str())
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        for result in results {
            sqlx::query(
                r#"
INSERT INTO match_results (id, job_id, game_index, deck_ids_json, winner_deck_id, turn_count, played_at)
VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(result.id.as_str())
            .bind(result.job_id.as_str())
            .bind(i64::from(result.game_index))
            .bind(serde_json::to_string(&result.deck_ids)?)
            .bind(result.winner_deck_id.as_deref())
            .bind(result.turn_count.map(i64::from))
            .bind(datetime_to_epoch_ms(result.played_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    pub(super) async fn has_match_results_impl(&self, job_id: &str) -> anyhow::Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM match_results WHERE job_id = ?")
                .bind(job_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count > 0)
    }

    #[cfg(test)]
    pub(crate) async fn list_match_results_for_job(
        &self,
        job_id: &str,
    ) -> anyhow::Result<Vec<MatchResult>> {
        let rows = sqlx::query_as::<_, MatchResultRow>(
            r#"
SELECT id, job_id, game_index, deck_ids_json, winner_deck_id, turn_count, played_at
FROM match_results
WHERE job_id = ?
ORDER BY game_index ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(MatchResult::try_from).collect()
    }
}
