// End-to-end duel lifecycle: queue two players, pair them, and drive a
// full five-round duel through the sweep with a manual clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use whereami_backend::clock::{Clock, ManualClock};
use whereami_backend::config::GameplayConfig;
use whereami_backend::db::Database;
use whereami_backend::duel::DuelStatus;
use whereami_backend::events::EventPublisher;
use whereami_backend::geo::Coordinate;
use whereami_backend::location::StubProvider;
use whereami_backend::matchmaking::Matchmaker;
use whereami_backend::sweep::Sweeper;

fn t0() -> DateTime<Utc> {
    "2026-02-01T09:00:00Z".parse().unwrap()
}

fn targets() -> Vec<Coordinate> {
    vec![
        Coordinate::new(48.8566, 2.3522),
        Coordinate::new(35.6762, 139.6503),
        Coordinate::new(-33.8688, 151.2093),
        Coordinate::new(40.7128, -74.0060),
        Coordinate::new(55.7558, 37.6173),
    ]
}

struct World {
    db: Arc<Database>,
    matchmaker: Matchmaker,
    sweeper: Sweeper,
    clock: ManualClock,
}

async fn world() -> World {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    let clock = ManualClock::new(t0());
    let gameplay = GameplayConfig::default();
    let matchmaker = Matchmaker::new(
        db.clone(),
        Arc::new(StubProvider::new(targets())),
        Arc::new(clock.clone()),
        gameplay.clone(),
    );
    let sweeper = Sweeper::new(
        db.clone(),
        EventPublisher::new(256),
        Arc::new(clock.clone()),
        gameplay,
    );
    World {
        db,
        matchmaker,
        sweeper,
        clock,
    }
}

#[tokio::test]
async fn full_five_round_duel_updates_ratings() {
    let w = world().await;

    let alice = w.db.create_user("alice", 1500).await.unwrap();
    let bob = w.db.create_user("bob", 1500).await.unwrap();
    w.db.enqueue(alice.uid, w.clock.now()).await.unwrap();
    w.db.enqueue(bob.uid, w.clock.now()).await.unwrap();

    assert_eq!(w.matchmaker.tick().await.unwrap(), 1);
    let duel = w.db.active_duel_for(alice.uid).await.unwrap().unwrap();
    assert_eq!(duel.status().unwrap(), DuelStatus::Preparing);
    let duel_id = duel.id;

    // Start delay elapses, the sweep flips the duel to playing.
    w.clock.advance(Duration::seconds(5));
    w.sweeper.tick().await.unwrap();
    let duel = w.db.get_duel(&duel_id).await.unwrap().unwrap();
    assert_eq!(duel.status().unwrap(), DuelStatus::Playing);

    // Alice nails every target, Bob is always far off.
    for round in 1..=5 {
        let duel = w.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.current_round, round);
        assert_eq!(duel.status().unwrap(), DuelStatus::Playing);
        let target = targets()[(round - 1) as usize];

        w.db.submit_guess(&duel_id, alice.uid, target, w.clock.now())
            .await
            .unwrap();
        w.db.submit_guess(
            &duel_id,
            bob.uid,
            Coordinate::new(-target.lat, 0.0),
            w.clock.now(),
        )
        .await
        .unwrap();

        // Results dwell, then the sweep advances.
        w.clock.advance(Duration::seconds(10));
        w.sweeper.tick().await.unwrap();
    }

    let duel = w.db.get_duel(&duel_id).await.unwrap().unwrap();
    assert_eq!(duel.status().unwrap(), DuelStatus::Finished);
    assert_eq!(duel.winner_uid, Some(alice.uid));
    assert_eq!(duel.player1_score, 25000);
    assert!(duel.player2_score < 25000);
    assert_eq!(duel.player1_elo_after, Some(1532));
    assert_eq!(duel.player2_elo_after, Some(1468));

    // Exactly one history row per player, with symmetric deltas.
    let history = w.db.history_for_duel(&duel_id).await.unwrap();
    assert_eq!(history.len(), 2);
    let alice_row = history.iter().find(|h| h.user_uid == alice.uid).unwrap();
    let bob_row = history.iter().find(|h| h.user_uid == bob.uid).unwrap();
    assert_eq!(alice_row.elo_change + bob_row.elo_change, 0);
    assert_eq!(alice_row.new_elo, 1532);
    assert_eq!(bob_row.new_elo, 1468);

    let alice_after = w.db.get_user(alice.uid).await.unwrap().unwrap();
    assert_eq!(alice_after.elo_rating, 1532);
    assert_eq!(alice_after.total_wins, 1);
    assert_eq!(alice_after.elo_games, 1);

    // All five rounds were recorded exactly once.
    assert_eq!(w.db.rounds_for_duel(&duel_id).await.unwrap().len(), 5);
}

#[tokio::test]
async fn timed_out_rounds_resolve_via_sweep() {
    let w = world().await;

    let alice = w.db.create_user("alice", 1500).await.unwrap();
    let bob = w.db.create_user("bob", 1500).await.unwrap();
    w.db.enqueue(alice.uid, w.clock.now()).await.unwrap();
    w.db.enqueue(bob.uid, w.clock.now()).await.unwrap();
    w.matchmaker.tick().await.unwrap();
    let duel_id = w.db.active_duel_for(alice.uid).await.unwrap().unwrap().id;

    w.clock.advance(Duration::seconds(5));
    w.sweeper.tick().await.unwrap();

    for round in 1..=5 {
        let duel = w.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.current_round, round);
        let target = targets()[(round - 1) as usize];

        // Only Alice guesses; Bob runs out the clock every round.
        w.db.submit_guess(&duel_id, alice.uid, target, w.clock.now())
            .await
            .unwrap();
        w.clock.advance(Duration::seconds(15));
        w.sweeper.tick().await.unwrap();
        let duel = w.db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Results);

        w.clock.advance(Duration::seconds(10));
        w.sweeper.tick().await.unwrap();
    }

    let duel = w.db.get_duel(&duel_id).await.unwrap().unwrap();
    assert_eq!(duel.status().unwrap(), DuelStatus::Finished);
    assert_eq!(duel.winner_uid, Some(alice.uid));
    assert_eq!(duel.player1_score, 25000);
    assert_eq!(duel.player2_score, 0);
}

#[tokio::test]
async fn simultaneous_guesses_resolve_to_one_scored_round() {
    // Both players submit at the same instant on separate pooled
    // connections of a shared file database. The write conflict must
    // surface as the retryable contention category, a retry must land
    // the losing guess, and each round still scores exactly once.
    let path = std::env::temp_dir().join(format!("whereami-race-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let db = Arc::new(Database::new(&url).await.unwrap());
    let clock = ManualClock::new(t0());
    let gameplay = GameplayConfig::default();
    let matchmaker = Matchmaker::new(
        db.clone(),
        Arc::new(StubProvider::new(targets())),
        Arc::new(clock.clone()),
        gameplay.clone(),
    );
    let sweeper = Sweeper::new(
        db.clone(),
        EventPublisher::new(256),
        Arc::new(clock.clone()),
        gameplay,
    );

    let alice = db.create_user("alice", 1500).await.unwrap().uid;
    let bob = db.create_user("bob", 1500).await.unwrap().uid;
    db.enqueue(alice, clock.now()).await.unwrap();
    db.enqueue(bob, clock.now()).await.unwrap();
    assert_eq!(matchmaker.tick().await.unwrap(), 1);
    let duel_id = db.active_duel_for(alice).await.unwrap().unwrap().id;

    clock.advance(Duration::seconds(5));
    sweeper.tick().await.unwrap();

    for round in 1..=5 {
        let target = targets()[(round - 1) as usize];
        let bob_guess = Coordinate::new(0.0, 0.0);
        let now = clock.now();

        let task1 = {
            let db = db.clone();
            let id = duel_id.clone();
            tokio::spawn(async move { db.submit_guess(&id, alice, target, now).await })
        };
        let task2 = {
            let db = db.clone();
            let id = duel_id.clone();
            tokio::spawn(async move { db.submit_guess(&id, bob, bob_guess, now).await })
        };
        let results = [
            (alice, target, task1.await.unwrap()),
            (bob, bob_guess, task2.await.unwrap()),
        ];

        let mut committed = 0;
        for (uid, guess, result) in results {
            match result {
                Ok(_) => committed += 1,
                Err(e) => {
                    assert_eq!(e.category(), "contention", "round {round}: {e}");
                    assert!(e.is_retryable());
                    // The losing transaction rolled back in full, so the
                    // same guess goes through on retry.
                    db.submit_guess(&duel_id, uid, guess, clock.now()).await.unwrap();
                }
            }
        }
        assert!(committed >= 1, "round {round}: no guess committed");

        let duel = db.get_duel(&duel_id).await.unwrap().unwrap();
        assert_eq!(duel.status().unwrap(), DuelStatus::Results);

        clock.advance(Duration::seconds(10));
        sweeper.tick().await.unwrap();
    }

    let duel = db.get_duel(&duel_id).await.unwrap().unwrap();
    assert_eq!(duel.status().unwrap(), DuelStatus::Finished);
    assert_eq!(db.rounds_for_duel(&duel_id).await.unwrap().len(), 5);
    assert_eq!(db.history_for_duel(&duel_id).await.unwrap().len(), 2);

    for suffix in ["", "-wal", "-shm"] {
        std::fs::remove_file(format!("{}{suffix}", path.display())).ok();
    }
}

#[tokio::test]
async fn double_sweep_ticks_change_nothing() {
    let w = world().await;

    let alice = w.db.create_user("alice", 1500).await.unwrap();
    let bob = w.db.create_user("bob", 1500).await.unwrap();
    w.db.enqueue(alice.uid, w.clock.now()).await.unwrap();
    w.db.enqueue(bob.uid, w.clock.now()).await.unwrap();
    w.matchmaker.tick().await.unwrap();
    let duel_id = w.db.active_duel_for(alice.uid).await.unwrap().unwrap().id;

    w.clock.advance(Duration::seconds(5));
    w.sweeper.tick().await.unwrap();
    w.sweeper.tick().await.unwrap();

    let target = targets()[0];
    w.db.submit_guess(&duel_id, alice.uid, target, w.clock.now())
        .await
        .unwrap();
    w.db.submit_guess(&duel_id, bob.uid, Coordinate::new(0.0, 0.0), w.clock.now())
        .await
        .unwrap();
    w.clock.advance(Duration::seconds(10));

    w.sweeper.tick().await.unwrap();
    w.sweeper.tick().await.unwrap();

    let duel = w.db.get_duel(&duel_id).await.unwrap().unwrap();
    assert_eq!(duel.current_round, 2);
    assert_eq!(duel.status().unwrap(), DuelStatus::Playing);
    assert_eq!(w.db.rounds_for_duel(&duel_id).await.unwrap().len(), 1);
}
