// Duel sweep.
//
// All time-driven round progression happens here, by comparing persisted
// timestamps against the injected clock. Every step is an idempotent,
// conditionally-guarded write, so a crashed or doubled sweep converges to
// the same state instead of double-scoring a round.

use std::sync::Arc;

use serde_json::json;

use crate::clock::Clock;
use crate::config::GameplayConfig;
use crate::db::{parse_ts, Database, Duel, RoundAdvance};
use crate::duel::DuelStatus;
use crate::error::EngineResult;
use crate::events::{DuelEventName, EventPublisher};
use crate::metrics;

pub struct Sweeper {
    db: Arc<Database>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    gameplay: GameplayConfig,
}

impl Sweeper {
    pub fn new(
        db: Arc<Database>,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
        gameplay: GameplayConfig,
    ) -> Self {
        Self {
            db,
            publisher,
            clock,
            gameplay,
        }
    }

    /// Run one sweep pass over all live duels. A failure on one duel is
    /// logged and does not stop the pass.
    pub async fn tick(&self) -> EngineResult<()> {
        self.recover_stuck_generating().await?;
        self.start_due_duels().await?;
        self.apply_due_timeouts().await?;
        self.advance_due_results().await?;
        Ok(())
    }

    /// Mark duels stuck in `generating` past the grace period as errored.
    /// Covers a matchmaker that died between claim and finalization.
    async fn recover_stuck_generating(&self) -> EngineResult<()> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::seconds(self.gameplay.generating_grace_secs);

        for duel in self.db.duels_with_status(DuelStatus::Generating).await? {
            let created = match parse_ts(&duel.created_at) {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::error!(duel_id = %duel.id, error = %e, "unreadable created_at");
                    continue;
                }
            };
            if created > cutoff {
                continue;
            }
            tracing::warn!(duel_id = %duel.id, "duel stuck in generating, marking as errored");
            match self.db.mark_duel_error(&duel.id).await {
                Ok(true) => metrics::DUELS_ERRORED_TOTAL.inc(),
                Ok(false) => {}
                Err(e) => tracing::error!(duel_id = %duel.id, error = %e, "error recovery failed"),
            }
        }
        Ok(())
    }

    /// Flip `preparing` duels whose scheduled start has passed to `playing`.
    async fn start_due_duels(&self) -> EngineResult<()> {
        let now = self.clock.now();

        for duel in self.db.duels_with_status(DuelStatus::Preparing).await? {
            if !deadline_passed(duel.game_start_at.as_deref(), now, 0) {
                continue;
            }
            match self.db.start_duel(&duel.id).await {
                Ok(true) => {
                    tracing::info!(duel_id = %duel.id, "duel started");
                    self.publisher.publish(
                        &duel.id,
                        DuelEventName::GameStarted,
                        json!({ "round": 1, "total_rounds": duel.total_rounds }),
                    );
                }
                Ok(false) => {}
                Err(e) => tracing::error!(duel_id = %duel.id, error = %e, "start failed"),
            }
        }
        Ok(())
    }

    /// Close rounds whose timeout window (counted from the first guess)
    /// has elapsed. The missing guess is backfilled from the player's last
    /// pointer position when one exists.
    async fn apply_due_timeouts(&self) -> EngineResult<()> {
        let now = self.clock.now();

        for duel in self.db.duels_with_status(DuelStatus::Playing).await? {
            if !deadline_passed(
                duel.first_guess_at.as_deref(),
                now,
                self.gameplay.round_timeout_secs,
            ) {
                continue;
            }
            match self.db.apply_round_timeout(&duel.id, now).await {
                Ok(true) => {
                    tracing::info!(duel_id = %duel.id, round = duel.current_round, "round timed out");
                    metrics::ROUND_TIMEOUTS_TOTAL.inc();
                    self.publisher.publish(
                        &duel.id,
                        DuelEventName::Timeout,
                        json!({ "round": duel.current_round }),
                    );
                }
                Ok(false) => {}
                Err(e) => tracing::error!(duel_id = %duel.id, error = %e, "timeout failed"),
            }
        }
        Ok(())
    }

    /// Score and advance duels whose results dwell has elapsed.
    async fn advance_due_results(&self) -> EngineResult<()> {
        let now = self.clock.now();

        for duel in self.db.duels_with_status(DuelStatus::Results).await? {
            if !deadline_passed(
                duel.results_start_at.as_deref(),
                now,
                self.gameplay.results_duration_secs,
            ) {
                continue;
            }
            match self.db.advance_results(&duel.id, now).await {
                Ok(advance) => self.publish_advance(&duel, advance),
                // A concurrent sweep already advanced this duel.
                Err(e) if e.category() == "wrong_state" => {
                    tracing::debug!(duel_id = %duel.id, "already advanced by another sweep");
                }
                Err(e) => tracing::error!(duel_id = %duel.id, error = %e, "advance failed"),
            }
        }
        Ok(())
    }

    fn publish_advance(&self, duel: &Duel, advance: RoundAdvance) {
        match advance {
            RoundAdvance::NextRound { round, total_rounds } => {
                tracing::info!(duel_id = %duel.id, round, "next round");
                self.publisher.publish(
                    &duel.id,
                    DuelEventName::NextRound,
                    json!({ "round": round, "total_rounds": total_rounds }),
                );
            }
            RoundAdvance::Finished {
                result,
                winner_uid,
                final_score1,
                final_score2,
                elo,
            } => {
                tracing::info!(
                    duel_id = %duel.id,
                    result = result.to_str_name(),
                    "duel finished"
                );
                metrics::DUELS_FINISHED_TOTAL
                    .with_label_values(&[result.to_str_name()])
                    .inc();
                metrics::ACTIVE_DUELS.dec();
                self.publisher.publish(
                    &duel.id,
                    DuelEventName::DuelFinished,
                    json!({
                        "result": result.to_str_name(),
                        "winner_uid": winner_uid,
                        "final_scores": {
                            "player1": final_score1,
                            "player2": final_score2,
                        },
                        "elo": {
                            "player1": { "new_rating": elo.new_rating1, "change": elo.change1 },
                            "player2": { "new_rating": elo.new_rating2, "change": elo.change2 },
                        },
                    }),
                );
            }
        }
    }
}

/// Whether `stamp + grace_secs` is at or before `now`. An unset stamp
/// (round with no guess yet, duel with no scheduled start) never fires.
fn deadline_passed(stamp: Option<&str>, now: chrono::DateTime<chrono::Utc>, grace_secs: i64) -> bool {
    match stamp.map(parse_ts) {
        Some(Ok(ts)) => ts + chrono::Duration::seconds(grace_secs) <= now,
        Some(Err(_)) | None => false,
    }
}

/// Spawn the background sweep loop. A failed pass is logged and the next
/// one runs on schedule.
pub fn spawn_sweeper(sweeper: Arc<Sweeper>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            if let Err(e) = sweeper.tick().await {
                tracing::error!("Sweep pass failed: {e}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    use crate::clock::ManualClock;
    use crate::geo::Coordinate;
    use crate::location::StubProvider;
    use crate::matchmaking::Matchmaker;

    fn t0() -> DateTime<Utc> {
        "2026-01-10T12:00:00Z".parse().unwrap()
    }

    struct Harness {
        db: Arc<Database>,
        matchmaker: Matchmaker,
        sweeper: Sweeper,
        clock: ManualClock,
        publisher: EventPublisher,
    }

    async fn harness(targets: Vec<Coordinate>) -> Harness {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let clock = ManualClock::new(t0());
        let publisher = EventPublisher::new(64);
        let gameplay = GameplayConfig::default();
        let matchmaker = Matchmaker::new(
            db.clone(),
            Arc::new(StubProvider::new(targets)),
            Arc::new(clock.clone()),
            gameplay.clone(),
        );
        let sweeper = Sweeper::new(
            db.clone(),
            publisher.clone(),
            Arc::new(clock.clone()),
            gameplay,
        );
        Harness {
            db,
            matchmaker,
            sweeper,
            clock,
            publisher,
        }
    }

    async fn paired_duel(h: &Harness) -> (String, i64, i64) {
        let a = h.db.create_user("alice", 1500).await.unwrap();
        let b = h.db.create_user("bob", 1500).await.unwrap();
        h.db.enqueue(a.uid, h.clock.now()).await.unwrap();
        h.db.enqueue(b.uid, h.clock.now()).await.unwrap();
        assert_eq!(h.matchmaker.tick().await.unwrap(), 1);
        let duel = h.db.active_duel_for(a.uid).await.unwrap().unwrap();
        (duel.id, a.uid, b.uid)
    }

    #[tokio::test]
    async fn test_duel_starts_only_after_scheduled_time() {
        let h = harness(vec![Coordinate::new(48.0, 2.0)]).await;
        let (duel_id, _a, _b) = paired_duel(&h).await;

        // Not due yet.
        h.clock.advance(Duration::seconds(4));
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Preparing);

        h.clock.advance(Duration::seconds(1));
        let mut rx = h.publisher.subscribe();
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Playing);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, DuelEventName::GameStarted);
        assert_eq!(event.duel_id, duel_id);
    }

    #[tokio::test]
    async fn test_no_timeout_before_first_guess() {
        let h = harness(vec![Coordinate::new(48.0, 2.0)]).await;
        let (duel_id, _a, _b) = paired_duel(&h).await;

        h.clock.advance(Duration::seconds(5));
        h.sweeper.tick().await.unwrap();

        // Nobody guessed; even a long wait must not close the round.
        h.clock.advance(Duration::minutes(30));
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Playing);
    }

    #[tokio::test]
    async fn test_timeout_fires_fifteen_seconds_after_first_guess() {
        let h = harness(vec![Coordinate::new(48.0, 2.0)]).await;
        let (duel_id, a, _b) = paired_duel(&h).await;

        h.clock.advance(Duration::seconds(5));
        h.sweeper.tick().await.unwrap();

        h.db.submit_guess(&duel_id, a, Coordinate::new(40.0, 3.0), h.clock.now())
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(14));
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Playing);

        let mut rx = h.publisher.subscribe();
        h.clock.advance(Duration::seconds(1));
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Results);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, DuelEventName::Timeout);
    }

    #[tokio::test]
    async fn test_results_advance_to_next_round_after_dwell() {
        let targets = vec![Coordinate::new(48.0, 2.0), Coordinate::new(-20.0, 140.0)];
        let h = harness(targets).await;
        let (duel_id, a, b) = paired_duel(&h).await;

        h.clock.advance(Duration::seconds(5));
        h.sweeper.tick().await.unwrap();

        h.db.submit_guess(&duel_id, a, Coordinate::new(47.0, 2.0), h.clock.now())
            .await
            .unwrap();
        h.db.submit_guess(&duel_id, b, Coordinate::new(48.0, 3.0), h.clock.now())
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(9));
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Results);

        let mut rx = h.publisher.subscribe();
        h.clock.advance(Duration::seconds(1));
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Playing);
        assert_eq!(duel.current_round, 2);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, DuelEventName::NextRound);
        assert_eq!(event.payload["round"], 2);
    }

    #[tokio::test]
    async fn test_double_tick_is_idempotent() {
        let h = harness(vec![Coordinate::new(48.0, 2.0), Coordinate::new(0.0, 0.0)]).await;
        let (duel_id, a, b) = paired_duel(&h).await;

        h.clock.advance(Duration::seconds(5));
        h.sweeper.tick().await.unwrap();
        h.db.submit_guess(&duel_id, a, Coordinate::new(47.0, 2.0), h.clock.now())
            .await
            .unwrap();
        h.db.submit_guess(&duel_id, b, Coordinate::new(10.0, 10.0), h.clock.now())
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(10));

        h.sweeper.tick().await.unwrap();
        h.sweeper.tick().await.unwrap();

        let duel = h.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.current_round, 2);
        assert_eq!(h.db.rounds_for_duel(&duel_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_generating_duel_is_errored() {
        let h = harness(vec![]).await;
        let a = h.db.create_user("alice", 1500).await.unwrap();
        let b = h.db.create_user("bob", 1500).await.unwrap();
        h.db.enqueue(a.uid, h.clock.now()).await.unwrap();
        h.db.enqueue(b.uid, h.clock.now()).await.unwrap();
        // Claim directly so the duel stays in `generating`.
        let claimed = h.db.claim_best_pair(h.clock.now(), 600).await.unwrap().unwrap();

        h.clock.advance(Duration::seconds(119));
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&claimed.duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Generating);

        h.clock.advance(Duration::seconds(2));
        h.sweeper.tick().await.unwrap();
        let duel = h.db.get_duel(&claimed.duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Error);
    }

    #[tokio::test]
    async fn test_final_round_finishes_duel_with_elo() {
        let h = harness(vec![Coordinate::new(48.0, 2.0)]).await;
        // One-round duel.
        let db = h.db.clone();
        let a = db.create_user("alice", 1500).await.unwrap();
        let b = db.create_user("bob", 1500).await.unwrap();
        db.enqueue(a.uid, h.clock.now()).await.unwrap();
        db.enqueue(b.uid, h.clock.now()).await.unwrap();
        let claimed = db.claim_best_pair(h.clock.now(), 600).await.unwrap().unwrap();
        db.finalize_duel(
            &claimed.duel_id,
            &[Coordinate::new(48.0, 2.0)],
            h.clock.now() + Duration::seconds(5),
            1,
        )
        .await
        .unwrap();

        h.clock.advance(Duration::seconds(5));
        h.sweeper.tick().await.unwrap();

        db.submit_guess(&claimed.duel_id, a.uid, Coordinate::new(48.0, 2.0), h.clock.now())
            .await
            .unwrap();
        db.submit_guess(&claimed.duel_id, b.uid, Coordinate::new(-30.0, 100.0), h.clock.now())
            .await
            .unwrap();

        let mut rx = h.publisher.subscribe();
        h.clock.advance(Duration::seconds(10));
        h.sweeper.tick().await.unwrap();

        let duel = db.get_duel(&claimed.duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Finished);
        assert_eq!(duel.winner_uid, Some(a.uid));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.action, DuelEventName::DuelFinished);
        assert_eq!(event.payload["result"], "player1_wins");
        assert_eq!(event.payload["elo"]["player1"]["change"], 32);
        assert_eq!(event.payload["elo"]["player2"]["change"], -32);
    }
}
