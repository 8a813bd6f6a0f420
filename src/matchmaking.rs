// Matchmaking worker.
//
// Each tick claims the closest-rated eligible pair from the persistent
// queue (the claim also inserts a placeholder `generating` duel, so the
// two players are bound before any network call), then fetches the
// round locations and finalizes the duel with a scheduled start time.
// Location fetching happens outside the claim transaction; if it fails
// the duel is marked `error` and both players are released.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::clock::Clock;
use crate::config::GameplayConfig;
use crate::db::Database;
use crate::error::EngineResult;
use crate::location::LocationProvider;
use crate::metrics;

pub struct Matchmaker {
    db: Arc<Database>,
    provider: Arc<dyn LocationProvider>,
    clock: Arc<dyn Clock>,
    gameplay: GameplayConfig,
}

impl Matchmaker {
    pub fn new(
        db: Arc<Database>,
        provider: Arc<dyn LocationProvider>,
        clock: Arc<dyn Clock>,
        gameplay: GameplayConfig,
    ) -> Self {
        Self {
            db,
            provider,
            clock,
            gameplay,
        }
    }

    /// Run one matchmaking pass. Claims pairs until the queue has no
    /// eligible pair left; returns how many duels were created.
    pub async fn tick(&self) -> EngineResult<usize> {
        let mut created = 0;

        loop {
            let now = self.clock.now();
            let claimed = match self
                .db
                .claim_best_pair(now, self.gameplay.queue_ttl_secs)
                .await
            {
                Ok(Some(claimed)) => claimed,
                Ok(None) => break,
                Err(e) if e.is_retryable() => {
                    tracing::debug!(error = %e, "claim hit contention, retrying next tick");
                    break;
                }
                Err(e) => return Err(e),
            };

            tracing::info!(
                duel_id = %claimed.duel_id,
                player1 = claimed.player1_uid,
                player2 = claimed.player2_uid,
                "pair claimed, fetching locations"
            );

            let fetches = (0..self.gameplay.total_rounds).map(|_| self.provider.pick_location());
            match try_join_all(fetches).await {
                Ok(locations) => {
                    let start_at =
                        self.clock.now() + chrono::Duration::seconds(self.gameplay.start_delay_secs);
                    self.db
                        .finalize_duel(
                            &claimed.duel_id,
                            &locations,
                            start_at,
                            self.gameplay.total_rounds,
                        )
                        .await?;
                    metrics::DUELS_STARTED_TOTAL.inc();
                    created += 1;
                }
                Err(e) => {
                    tracing::error!(
                        duel_id = %claimed.duel_id,
                        error = %e,
                        "location fetch failed, marking duel as errored"
                    );
                    if self.db.mark_duel_error(&claimed.duel_id).await? {
                        metrics::DUELS_ERRORED_TOTAL.inc();
                    }
                }
            }
        }

        let now = self.clock.now();
        let depth = self
            .db
            .eligible_queue_size(now, self.gameplay.queue_ttl_secs)
            .await?;
        metrics::QUEUE_DEPTH.set(depth);
        metrics::ACTIVE_DUELS.set(self.db.count_active_duels().await?);

        Ok(created)
    }
}

/// Spawn the background matchmaking loop. A failed tick is logged and
/// the next tick runs on schedule.
pub fn spawn_matchmaker(matchmaker: Arc<Matchmaker>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            if let Err(e) = matchmaker.tick().await {
                tracing::error!("Matchmaker tick failed: {e}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    use crate::clock::ManualClock;
    use crate::duel::DuelStatus;
    use crate::geo::Coordinate;
    use crate::location::StubProvider;

    fn t0() -> DateTime<Utc> {
        "2026-01-10T12:00:00Z".parse().unwrap()
    }

    async fn setup(provider: StubProvider) -> (Arc<Database>, Matchmaker, ManualClock) {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let clock = ManualClock::new(t0());
        let matchmaker = Matchmaker::new(
            db.clone(),
            Arc::new(provider),
            Arc::new(clock.clone()),
            GameplayConfig::default(),
        );
        (db, matchmaker, clock)
    }

    async fn enqueue_pair(db: &Database, now: DateTime<Utc>) -> (i64, i64) {
        let a = db.create_user("alice", 1500).await.unwrap();
        let b = db.create_user("bob", 1500).await.unwrap();
        db.enqueue(a.uid, now).await.unwrap();
        db.enqueue(b.uid, now).await.unwrap();
        (a.uid, b.uid)
    }

    #[tokio::test]
    async fn test_tick_creates_prepared_duel() {
        let target = Coordinate::new(48.0, 2.0);
        let (db, matchmaker, _clock) = setup(StubProvider::new(vec![target])).await;
        let (a, _b) = enqueue_pair(&db, t0()).await;

        assert_eq!(matchmaker.tick().await.unwrap(), 1);

        let duel = db.active_duel_for(a).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Preparing);
        assert_eq!(duel.total_rounds, 5);
        assert_eq!(duel.locations().unwrap().len(), 5);
        // Start is scheduled for claim time plus the start delay.
        let start = crate::db::parse_ts(duel.game_start_at.as_deref().unwrap()).unwrap();
        assert_eq!(start, t0() + Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_tick_with_empty_queue_is_noop() {
        let (_db, matchmaker, _clock) = setup(StubProvider::new(vec![Coordinate::new(0.0, 0.0)])).await;
        assert_eq!(matchmaker.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tick_with_single_player_waits() {
        let (db, matchmaker, _clock) = setup(StubProvider::new(vec![Coordinate::new(0.0, 0.0)])).await;
        let user = db.create_user("solo", 1500).await.unwrap();
        db.enqueue(user.uid, t0()).await.unwrap();

        assert_eq!(matchmaker.tick().await.unwrap(), 0);
        assert_eq!(db.eligible_queue_size(t0(), 600).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_provider_failure_marks_duel_errored() {
        let (db, matchmaker, _clock) = setup(StubProvider::failing()).await;
        let (a, b) = enqueue_pair(&db, t0()).await;

        assert_eq!(matchmaker.tick().await.unwrap(), 0);

        // No live duel remains and both players can queue again.
        assert!(db.active_duel_for(a).await.unwrap().is_none());
        assert!(db.active_duel_for(b).await.unwrap().is_none());
        db.enqueue(a, t0()).await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_pairs_multiple_waiting_pairs() {
        let (db, matchmaker, _clock) = setup(StubProvider::new(vec![Coordinate::new(10.0, 10.0)])).await;
        for name in ["p1", "p2", "p3", "p4"] {
            let user = db.create_user(name, 1500).await.unwrap();
            db.enqueue(user.uid, t0()).await.unwrap();
        }

        assert_eq!(matchmaker.tick().await.unwrap(), 2);
        assert_eq!(db.eligible_queue_size(t0(), 600).await.unwrap(), 0);
        assert_eq!(db.count_active_duels().await.unwrap(), 2);
    }
}
