// Database access layer (SQLite via sqlx).
//
// Every state-changing gameplay operation here runs inside a single
// transaction. SQLite serializes writers, which gives the claim/guess
// paths the row-claim atomicity the engine needs; busy/locked errors are
// classified as retryable contention for the calling loop.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::duel::{DuelSnapshot, DuelStatus, FinishedView, RoundResultView};
use crate::elo::{self, DuelResult};
use crate::error::{classify_db_error, EngineError, EngineResult};
use crate::geo::{self, Coordinate};

/// Format a timestamp as fixed-width RFC 3339 (UTC, microseconds). The
/// fixed width keeps lexicographic comparison consistent with time order,
/// which the stale-queue cutoff relies on.
pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_ts(s: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::CorruptRecord(format!("bad timestamp {s:?}: {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub uid: i64,
    pub username: String,
    pub banned: i64,
    pub elo_rating: i64,
    pub peak_elo: i64,
    pub elo_games: i64,
    pub total_wins: i64,
    pub total_losses: i64,
    pub total_draws: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Duel {
    pub id: String,
    pub player1_uid: i64,
    pub player2_uid: i64,
    pub status: String,
    pub current_round: i64,
    pub total_rounds: i64,
    pub locations: Option<String>,
    pub player1_score: i64,
    pub player2_score: i64,
    pub player1_guess_lat: Option<f64>,
    pub player1_guess_lng: Option<f64>,
    pub player2_guess_lat: Option<f64>,
    pub player2_guess_lng: Option<f64>,
    pub player1_last_click_lat: Option<f64>,
    pub player1_last_click_lng: Option<f64>,
    pub player2_last_click_lat: Option<f64>,
    pub player2_last_click_lng: Option<f64>,
    pub game_start_at: Option<String>,
    pub first_guess_at: Option<String>,
    pub results_start_at: Option<String>,
    pub winner_uid: Option<i64>,
    pub finished_at: Option<String>,
    pub player1_elo_before: i64,
    pub player2_elo_before: i64,
    pub player1_elo_after: Option<i64>,
    pub player2_elo_after: Option<i64>,
    pub elo_change_player1: Option<i64>,
    pub elo_change_player2: Option<i64>,
    pub created_at: String,
}

impl Duel {
    pub fn status(&self) -> EngineResult<DuelStatus> {
        DuelStatus::from_str_name(&self.status)
            .ok_or_else(|| EngineError::CorruptRecord(format!("unknown status {:?}", self.status)))
    }

    pub fn is_participant(&self, uid: i64) -> bool {
        self.player1_uid == uid || self.player2_uid == uid
    }

    /// Ordered round targets, immutable once set.
    pub fn locations(&self) -> EngineResult<Vec<Coordinate>> {
        match &self.locations {
            None => Ok(Vec::new()),
            Some(json) => serde_json::from_str(json)
                .map_err(|e| EngineError::CorruptRecord(format!("bad locations json: {e}"))),
        }
    }

    /// Target coordinate of the current round.
    pub fn current_target(&self) -> EngineResult<Coordinate> {
        let locations = self.locations()?;
        let index = (self.current_round - 1) as usize;
        locations.get(index).copied().ok_or_else(|| {
            EngineError::CorruptRecord(format!(
                "round {} out of range for {} locations",
                self.current_round,
                locations.len()
            ))
        })
    }

    pub fn guess_of(&self, uid: i64) -> Option<Coordinate> {
        let (lat, lng) = if uid == self.player1_uid {
            (self.player1_guess_lat, self.player1_guess_lng)
        } else {
            (self.player2_guess_lat, self.player2_guess_lng)
        };
        match (lat, lng) {
            (Some(lat), Some(lng)) => Some(Coordinate::new(lat, lng)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DuelRound {
    pub id: i64,
    pub duel_id: String,
    pub round_number: i64,
    pub location_lat: f64,
    pub location_lng: f64,
    pub player1_guess_lat: Option<f64>,
    pub player1_guess_lng: Option<f64>,
    pub player2_guess_lat: Option<f64>,
    pub player2_guess_lng: Option<f64>,
    pub player1_distance: f64,
    pub player2_distance: f64,
    pub player1_score: i64,
    pub player2_score: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EloHistoryEntry {
    pub id: i64,
    pub user_uid: i64,
    pub duel_id: String,
    pub old_elo: i64,
    pub new_elo: i64,
    pub elo_change: i64,
    pub opponent_uid: i64,
    pub opponent_elo: i64,
    pub result: String,
    pub created_at: String,
}

/// Both players atomically removed from the queue and bound to a fresh
/// placeholder duel.
#[derive(Debug, Clone)]
pub struct ClaimedDuel {
    pub duel_id: String,
    pub player1_uid: i64,
    pub player2_uid: i64,
}

/// What a successful guess submission did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessOutcome {
    /// First guess of the round; the timeout window is now running.
    FirstGuess,
    /// The other player had already guessed; the duel moved to `results`.
    BothGuessed,
}

/// What the results sweep did to one duel.
#[derive(Debug, Clone)]
pub enum RoundAdvance {
    NextRound {
        round: i64,
        total_rounds: i64,
    },
    Finished {
        result: DuelResult,
        winner_uid: Option<i64>,
        final_score1: i64,
        final_score2: i64,
        elo: elo::EloUpdate,
    },
}

/// Queue reply for a polling client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueueStatus {
    Found { duel_id: String },
    Waiting { queue_size: i64 },
    NotInQueue,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct QueueCandidate {
    user_uid: i64,
    elo_rating: i64,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                uid INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                banned INTEGER NOT NULL DEFAULT 0,
                elo_rating INTEGER NOT NULL DEFAULT {starting},
                peak_elo INTEGER NOT NULL DEFAULT {starting},
                elo_games INTEGER NOT NULL DEFAULT 0,
                total_wins INTEGER NOT NULL DEFAULT 0,
                total_losses INTEGER NOT NULL DEFAULT 0,
                total_draws INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
        "#,
            starting = elo::STARTING_ELO
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS matchmaking_queue (
                user_uid INTEGER PRIMARY KEY REFERENCES users(uid) ON DELETE CASCADE,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS duels (
                id TEXT PRIMARY KEY,
                player1_uid INTEGER NOT NULL REFERENCES users(uid),
                player2_uid INTEGER NOT NULL REFERENCES users(uid),
                status TEXT NOT NULL DEFAULT 'generating',
                current_round INTEGER NOT NULL DEFAULT 1,
                total_rounds INTEGER NOT NULL DEFAULT 0,
                locations TEXT,
                player1_score INTEGER NOT NULL DEFAULT 0,
                player2_score INTEGER NOT NULL DEFAULT 0,
                player1_guess_lat REAL,
                player1_guess_lng REAL,
                player2_guess_lat REAL,
                player2_guess_lng REAL,
                player1_last_click_lat REAL,
                player1_last_click_lng REAL,
                player2_last_click_lat REAL,
                player2_last_click_lng REAL,
                game_start_at TEXT,
                first_guess_at TEXT,
                results_start_at TEXT,
                winner_uid INTEGER,
                finished_at TEXT,
                player1_elo_before INTEGER NOT NULL DEFAULT {starting},
                player2_elo_before INTEGER NOT NULL DEFAULT {starting},
                player1_elo_after INTEGER,
                player2_elo_after INTEGER,
                elo_change_player1 INTEGER,
                elo_change_player2 INTEGER,
                created_at TEXT NOT NULL
            )
        "#,
            starting = elo::STARTING_ELO
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS duel_rounds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                duel_id TEXT NOT NULL REFERENCES duels(id) ON DELETE CASCADE,
                round_number INTEGER NOT NULL,
                location_lat REAL NOT NULL,
                location_lng REAL NOT NULL,
                player1_guess_lat REAL,
                player1_guess_lng REAL,
                player2_guess_lat REAL,
                player2_guess_lng REAL,
                player1_distance REAL NOT NULL,
                player2_distance REAL NOT NULL,
                player1_score INTEGER NOT NULL,
                player2_score INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(duel_id, round_number)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS elo_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_uid INTEGER NOT NULL REFERENCES users(uid),
                duel_id TEXT NOT NULL REFERENCES duels(id),
                old_elo INTEGER NOT NULL,
                new_elo INTEGER NOT NULL,
                elo_change INTEGER NOT NULL,
                opponent_uid INTEGER NOT NULL,
                opponent_elo INTEGER NOT NULL,
                result TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub async fn create_user(&self, username: &str, elo_rating: i64) -> EngineResult<User> {
        let row = sqlx::query_as::<_, User>(
            "INSERT INTO users (username, elo_rating, peak_elo) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(username)
        .bind(elo_rating)
        .bind(elo_rating)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(row)
    }

    pub async fn get_user(&self, uid: i64) -> EngineResult<Option<User>> {
        let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_db_error)?;
        Ok(row)
    }

    pub async fn set_banned(&self, uid: i64, banned: bool) -> EngineResult<bool> {
        let result = sqlx::query("UPDATE users SET banned = ? WHERE uid = ?")
            .bind(banned as i64)
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(classify_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    // ── Matchmaking queue ─────────────────────────────────────────────

    /// Add a player to the queue, or refresh their timestamp if already
    /// queued. One entry per user.
    pub async fn enqueue(&self, user_uid: i64, now: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO matchmaking_queue (user_uid, created_at) VALUES (?, ?)
             ON CONFLICT(user_uid) DO UPDATE SET created_at = excluded.created_at",
        )
        .bind(user_uid)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(())
    }

    pub async fn cancel_queue(&self, user_uid: i64) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM matchmaking_queue WHERE user_uid = ?")
            .bind(user_uid)
            .execute(&self.pool)
            .await
            .map_err(classify_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    /// Most recent non-terminal duel the user participates in, if any.
    pub async fn active_duel_for(&self, user_uid: i64) -> EngineResult<Option<Duel>> {
        let row = sqlx::query_as::<_, Duel>(
            "SELECT * FROM duels
             WHERE (player1_uid = ? OR player2_uid = ?)
               AND status NOT IN ('finished', 'cancelled', 'error')
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_uid)
        .bind(user_uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(row)
    }

    /// Queue poll for one player: an active duel wins over a queue slot.
    pub async fn queue_status(
        &self,
        user_uid: i64,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> EngineResult<QueueStatus> {
        if let Some(duel) = self.active_duel_for(user_uid).await? {
            return Ok(QueueStatus::Found { duel_id: duel.id });
        }

        let in_queue: Option<i64> =
            sqlx::query_scalar("SELECT user_uid FROM matchmaking_queue WHERE user_uid = ?")
                .bind(user_uid)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify_db_error)?;

        if in_queue.is_none() {
            return Ok(QueueStatus::NotInQueue);
        }

        let queue_size = self.eligible_queue_size(now, ttl_secs).await?;
        Ok(QueueStatus::Waiting { queue_size })
    }

    /// Number of queue entries eligible for pairing: fresh, not banned.
    pub async fn eligible_queue_size(
        &self,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> EngineResult<i64> {
        let cutoff = fmt_ts(now - Duration::seconds(ttl_secs));
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM matchmaking_queue mq
             JOIN users u ON mq.user_uid = u.uid
             WHERE mq.created_at > ? AND u.banned = 0",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(count)
    }

    // ── Matchmaking claim ─────────────────────────────────────────────

    /// Pair the two eligible queued players with the smallest rating
    /// difference and atomically claim them: remove both queue entries and
    /// insert a placeholder duel in the same transaction.
    ///
    /// Pairing is an exhaustive O(n²) scan of the live queue; candidates
    /// are ordered by enqueue time and only a strictly smaller difference
    /// replaces the best pair, so ties resolve to the earliest-enqueued
    /// pair and the choice is deterministic per snapshot.
    pub async fn claim_best_pair(
        &self,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> EngineResult<Option<ClaimedDuel>> {
        let mut tx = self.pool.begin().await.map_err(classify_db_error)?;

        let cutoff = fmt_ts(now - Duration::seconds(ttl_secs));
        let candidates = sqlx::query_as::<_, QueueCandidate>(
            "SELECT mq.user_uid, u.elo_rating FROM matchmaking_queue mq
             JOIN users u ON mq.user_uid = u.uid
             WHERE mq.created_at > ?
               AND u.banned = 0
               AND NOT EXISTS (
                 SELECT 1 FROM duels d
                 WHERE (d.player1_uid = u.uid OR d.player2_uid = u.uid)
                   AND d.status NOT IN ('finished', 'cancelled', 'error')
               )
             ORDER BY mq.created_at ASC, mq.user_uid ASC",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(classify_db_error)?;

        if candidates.len() < 2 {
            tx.commit().await.map_err(classify_db_error)?;
            return Ok(None);
        }

        let mut best = (0, 1);
        let mut smallest_diff =
            (candidates[0].elo_rating - candidates[1].elo_rating).abs();
        for i in 0..candidates.len() - 1 {
            for j in i + 1..candidates.len() {
                let diff = (candidates[i].elo_rating - candidates[j].elo_rating).abs();
                if diff < smallest_diff {
                    smallest_diff = diff;
                    best = (i, j);
                }
            }
        }
        let (player1, player2) = (&candidates[best.0], &candidates[best.1]);

        sqlx::query("DELETE FROM matchmaking_queue WHERE user_uid IN (?, ?)")
            .bind(player1.user_uid)
            .bind(player2.user_uid)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;

        let duel_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO duels (id, player1_uid, player2_uid, status,
                                player1_elo_before, player2_elo_before, created_at)
             VALUES (?, ?, ?, 'generating', ?, ?, ?)",
        )
        .bind(&duel_id)
        .bind(player1.user_uid)
        .bind(player2.user_uid)
        .bind(player1.elo_rating)
        .bind(player2.elo_rating)
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await
        .map_err(classify_db_error)?;

        tx.commit().await.map_err(classify_db_error)?;

        Ok(Some(ClaimedDuel {
            duel_id,
            player1_uid: player1.user_uid,
            player2_uid: player2.user_uid,
        }))
    }

    /// Attach the generated round locations and schedule the start.
    /// Only legal from `generating`.
    pub async fn finalize_duel(
        &self,
        duel_id: &str,
        locations: &[Coordinate],
        start_at: DateTime<Utc>,
        total_rounds: i64,
    ) -> EngineResult<()> {
        let locations_json = serde_json::to_string(locations)
            .map_err(|e| EngineError::CorruptRecord(format!("locations serialize: {e}")))?;
        let result = sqlx::query(
            "UPDATE duels
             SET status = 'preparing', game_start_at = ?, total_rounds = ?, locations = ?
             WHERE id = ? AND status = 'generating'",
        )
        .bind(fmt_ts(start_at))
        .bind(total_rounds)
        .bind(locations_json)
        .bind(duel_id)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;

        if result.rows_affected() == 0 {
            let actual = self
                .get_duel(duel_id)
                .await?
                .map(|d| d.status)
                .unwrap_or_else(|| "missing".into());
            return Err(EngineError::WrongState {
                expected: "generating",
                actual,
            });
        }
        Ok(())
    }

    /// Mark a non-terminal duel as errored, releasing both players for
    /// future pairing. Idempotent.
    pub async fn mark_duel_error(&self, duel_id: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE duels SET status = 'error'
             WHERE id = ? AND status NOT IN ('finished', 'cancelled', 'error')",
        )
        .bind(duel_id)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    // ── Player operations ─────────────────────────────────────────────

    /// Record a guess for the current round. All preconditions are checked
    /// inside one transaction; if the opponent already guessed, the duel
    /// moves straight to `results` without waiting for the sweep.
    pub async fn submit_guess(
        &self,
        duel_id: &str,
        user_uid: i64,
        guess: Coordinate,
        now: DateTime<Utc>,
    ) -> EngineResult<GuessOutcome> {
        if !guess.is_valid() {
            return Err(EngineError::InvalidCoordinates {
                lat: guess.lat,
                lng: guess.lng,
            });
        }

        let mut tx = self.pool.begin().await.map_err(classify_db_error)?;

        let duel = sqlx::query_as::<_, Duel>("SELECT * FROM duels WHERE id = ?")
            .bind(duel_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify_db_error)?
            .ok_or(EngineError::DuelNotFound)?;

        if !duel.is_participant(user_uid) {
            return Err(EngineError::NotParticipant);
        }
        if duel.status()? != DuelStatus::Playing {
            return Err(EngineError::WrongState {
                expected: "playing",
                actual: duel.status.clone(),
            });
        }
        if duel.guess_of(user_uid).is_some() {
            return Err(EngineError::AlreadyGuessed);
        }

        let is_player1 = duel.player1_uid == user_uid;
        let other_guessed = duel
            .guess_of(if is_player1 {
                duel.player2_uid
            } else {
                duel.player1_uid
            })
            .is_some();
        let is_round_first = duel.first_guess_at.is_none();

        let (guess_lat_col, guess_lng_col, click_lat_col, click_lng_col) = if is_player1 {
            (
                "player1_guess_lat",
                "player1_guess_lng",
                "player1_last_click_lat",
                "player1_last_click_lng",
            )
        } else {
            (
                "player2_guess_lat",
                "player2_guess_lng",
                "player2_last_click_lat",
                "player2_last_click_lng",
            )
        };

        let mut sql = format!(
            "UPDATE duels SET {guess_lat_col} = ?, {guess_lng_col} = ?, \
             {click_lat_col} = ?, {click_lng_col} = ?"
        );
        if is_round_first {
            sql.push_str(", first_guess_at = ?");
        }
        if other_guessed {
            sql.push_str(", status = 'results', results_start_at = ?");
        }
        sql.push_str(" WHERE id = ?");

        let mut query = sqlx::query(&sql)
            .bind(guess.lat)
            .bind(guess.lng)
            .bind(guess.lat)
            .bind(guess.lng);
        if is_round_first {
            query = query.bind(fmt_ts(now));
        }
        if other_guessed {
            query = query.bind(fmt_ts(now));
        }
        query = query.bind(duel_id);

        query.execute(&mut *tx).await.map_err(classify_db_error)?;
        tx.commit().await.map_err(classify_db_error)?;

        Ok(if other_guessed {
            GuessOutcome::BothGuessed
        } else {
            GuessOutcome::FirstGuess
        })
    }

    /// Record a pointer position without committing a guess. Used as the
    /// timeout fallback. Same preconditions as a guess, minus side effects.
    pub async fn record_click(
        &self,
        duel_id: &str,
        user_uid: i64,
        position: Coordinate,
    ) -> EngineResult<()> {
        if !position.is_valid() {
            return Err(EngineError::InvalidCoordinates {
                lat: position.lat,
                lng: position.lng,
            });
        }

        let mut tx = self.pool.begin().await.map_err(classify_db_error)?;

        let duel = sqlx::query_as::<_, Duel>("SELECT * FROM duels WHERE id = ?")
            .bind(duel_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify_db_error)?
            .ok_or(EngineError::DuelNotFound)?;

        if !duel.is_participant(user_uid) {
            return Err(EngineError::NotParticipant);
        }
        if duel.status()? != DuelStatus::Playing {
            return Err(EngineError::WrongState {
                expected: "playing",
                actual: duel.status.clone(),
            });
        }
        if duel.guess_of(user_uid).is_some() {
            return Err(EngineError::AlreadyGuessed);
        }

        let (lat_col, lng_col) = if duel.player1_uid == user_uid {
            ("player1_last_click_lat", "player1_last_click_lng")
        } else {
            ("player2_last_click_lat", "player2_last_click_lng")
        };
        let sql = format!("UPDATE duels SET {lat_col} = ?, {lng_col} = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(position.lat)
            .bind(position.lng)
            .bind(duel_id)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;
        tx.commit().await.map_err(classify_db_error)?;
        Ok(())
    }

    // ── Sweep support ─────────────────────────────────────────────────

    pub async fn duels_with_status(&self, status: DuelStatus) -> EngineResult<Vec<Duel>> {
        let rows = sqlx::query_as::<_, Duel>("SELECT * FROM duels WHERE status = ?")
            .bind(status.to_str_name())
            .fetch_all(&self.pool)
            .await
            .map_err(classify_db_error)?;
        Ok(rows)
    }

    /// Flip a due duel from `preparing` to `playing`. Returns false if a
    /// concurrent sweep got there first.
    pub async fn start_duel(&self, duel_id: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE duels SET status = 'playing' WHERE id = ? AND status = 'preparing'",
        )
        .bind(duel_id)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    /// Resolve a timed-out round: backfill missing guesses from each
    /// player's last recorded pointer position (or leave them null) and
    /// enter `results`. A single conditional UPDATE keeps this atomic
    /// against a racing second guess.
    pub async fn apply_round_timeout(
        &self,
        duel_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE duels SET
                player1_guess_lat = COALESCE(player1_guess_lat, player1_last_click_lat),
                player1_guess_lng = COALESCE(player1_guess_lng, player1_last_click_lng),
                player2_guess_lat = COALESCE(player2_guess_lat, player2_last_click_lat),
                player2_guess_lng = COALESCE(player2_guess_lng, player2_last_click_lng),
                status = 'results',
                results_start_at = ?
             WHERE id = ? AND status = 'playing'
               AND (player1_guess_lat IS NULL OR player2_guess_lat IS NULL)",
        )
        .bind(fmt_ts(now))
        .bind(duel_id)
        .execute(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(result.rows_affected() > 0)
    }

    /// Score the current round of a duel sitting in `results` and advance
    /// it: next round, or finalization with the Elo commit.
    ///
    /// Safely re-runnable: the duel_rounds UNIQUE key is the idempotency
    /// guard. If the round row already exists (a prior sweep crashed after
    /// scoring, or a concurrent sweep won the insert), scoring is skipped
    /// and only the advance side effect is performed.
    pub async fn advance_results(
        &self,
        duel_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<RoundAdvance> {
        let mut tx = self.pool.begin().await.map_err(classify_db_error)?;

        let duel = sqlx::query_as::<_, Duel>("SELECT * FROM duels WHERE id = ?")
            .bind(duel_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(classify_db_error)?
            .ok_or(EngineError::DuelNotFound)?;

        if duel.status()? != DuelStatus::Results {
            return Err(EngineError::WrongState {
                expected: "results",
                actual: duel.status.clone(),
            });
        }

        let target = duel.current_target()?;

        let existing = sqlx::query_as::<_, DuelRound>(
            "SELECT * FROM duel_rounds WHERE duel_id = ? AND round_number = ?",
        )
        .bind(duel_id)
        .bind(duel.current_round)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify_db_error)?;

        match existing {
            Some(_) => {
                tracing::warn!(
                    duel_id,
                    round = duel.current_round,
                    "round already scored, advancing only"
                );
            }
            None => {
                let guess1 = duel.guess_of(duel.player1_uid);
                let guess2 = duel.guess_of(duel.player2_uid);
                let distance1 = geo::guess_distance_km(target, guess1);
                let distance2 = geo::guess_distance_km(target, guess2);
                let score1 = geo::round_score(distance1);
                let score2 = geo::round_score(distance2);

                let inserted = sqlx::query(
                    "INSERT INTO duel_rounds (duel_id, round_number, location_lat, location_lng,
                        player1_guess_lat, player1_guess_lng, player2_guess_lat, player2_guess_lng,
                        player1_distance, player2_distance, player1_score, player2_score, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     ON CONFLICT(duel_id, round_number) DO NOTHING",
                )
                .bind(duel_id)
                .bind(duel.current_round)
                .bind(target.lat)
                .bind(target.lng)
                .bind(guess1.map(|g| g.lat))
                .bind(guess1.map(|g| g.lng))
                .bind(guess2.map(|g| g.lat))
                .bind(guess2.map(|g| g.lng))
                .bind(distance1)
                .bind(distance2)
                .bind(score1)
                .bind(score2)
                .bind(fmt_ts(now))
                .execute(&mut *tx)
                .await
                .map_err(classify_db_error)?;

                if inserted.rows_affected() == 0 {
                    // Lost the insert race; the winner's row is truth and
                    // the totals below pick it up.
                    tracing::warn!(
                        duel_id,
                        round = duel.current_round,
                        "concurrent sweep inserted this round first"
                    );
                }
            }
        }

        // Cumulative totals derived from the round records, so a crashed
        // sweep can never double-count a round into the duel score.
        let (total1, total2): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(player1_score), 0), COALESCE(SUM(player2_score), 0)
             FROM duel_rounds WHERE duel_id = ?",
        )
        .bind(duel_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(classify_db_error)?;

        let next_round = duel.current_round + 1;
        let advance = if next_round > duel.total_rounds {
            let result = if total1 > total2 {
                DuelResult::Player1Wins
            } else if total2 > total1 {
                DuelResult::Player2Wins
            } else {
                DuelResult::Draw
            };
            let winner_uid = match result {
                DuelResult::Player1Wins => Some(duel.player1_uid),
                DuelResult::Player2Wins => Some(duel.player2_uid),
                DuelResult::Draw => None,
            };

            sqlx::query(
                "UPDATE duels SET player1_score = ?, player2_score = ?, status = 'finished',
                    winner_uid = ?, finished_at = ?
                 WHERE id = ?",
            )
            .bind(total1)
            .bind(total2)
            .bind(winner_uid)
            .bind(fmt_ts(now))
            .bind(duel_id)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;

            let elo = Self::commit_rating_update(&mut tx, &duel, result, now).await?;

            RoundAdvance::Finished {
                result,
                winner_uid,
                final_score1: total1,
                final_score2: total2,
                elo,
            }
        } else {
            sqlx::query(
                "UPDATE duels SET player1_score = ?, player2_score = ?, current_round = ?,
                    player1_guess_lat = NULL, player1_guess_lng = NULL,
                    player2_guess_lat = NULL, player2_guess_lng = NULL,
                    player1_last_click_lat = NULL, player1_last_click_lng = NULL,
                    player2_last_click_lat = NULL, player2_last_click_lng = NULL,
                    first_guess_at = NULL, results_start_at = NULL, status = 'playing'
                 WHERE id = ?",
            )
            .bind(total1)
            .bind(total2)
            .bind(next_round)
            .bind(duel_id)
            .execute(&mut *tx)
            .await
            .map_err(classify_db_error)?;

            RoundAdvance::NextRound {
                round: next_round,
                total_rounds: duel.total_rounds,
            }
        };

        tx.commit().await.map_err(classify_db_error)?;
        Ok(advance)
    }

    /// Apply the Elo result to both players inside the finalization
    /// transaction: new ratings, peaks, win/loss/draw counts, the duel's
    /// before/after fields, and one history row per player.
    async fn commit_rating_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        duel: &Duel,
        result: DuelResult,
        now: DateTime<Utc>,
    ) -> EngineResult<elo::EloUpdate> {
        let player1 = sqlx::query_as::<_, User>("SELECT * FROM users WHERE uid = ?")
            .bind(duel.player1_uid)
            .fetch_one(&mut **tx)
            .await
            .map_err(classify_db_error)?;
        let player2 = sqlx::query_as::<_, User>("SELECT * FROM users WHERE uid = ?")
            .bind(duel.player2_uid)
            .fetch_one(&mut **tx)
            .await
            .map_err(classify_db_error)?;

        let update = elo::calculate(player1.elo_rating, player2.elo_rating, result);
        let (outcome1, outcome2) = result.outcomes();

        for (user, new_rating, outcome) in [
            (&player1, update.new_rating1, outcome1),
            (&player2, update.new_rating2, outcome2),
        ] {
            let (wins, losses, draws) = match outcome {
                elo::Outcome::Win => (user.total_wins + 1, user.total_losses, user.total_draws),
                elo::Outcome::Loss => (user.total_wins, user.total_losses + 1, user.total_draws),
                elo::Outcome::Draw => (user.total_wins, user.total_losses, user.total_draws + 1),
            };
            sqlx::query(
                "UPDATE users SET elo_rating = ?, peak_elo = MAX(peak_elo, ?),
                    elo_games = elo_games + 1, total_wins = ?, total_losses = ?, total_draws = ?
                 WHERE uid = ?",
            )
            .bind(new_rating)
            .bind(new_rating)
            .bind(wins)
            .bind(losses)
            .bind(draws)
            .bind(user.uid)
            .execute(&mut **tx)
            .await
            .map_err(classify_db_error)?;
        }

        sqlx::query(
            "UPDATE duels SET player1_elo_before = ?, player2_elo_before = ?,
                player1_elo_after = ?, player2_elo_after = ?,
                elo_change_player1 = ?, elo_change_player2 = ?
             WHERE id = ?",
        )
        .bind(player1.elo_rating)
        .bind(player2.elo_rating)
        .bind(update.new_rating1)
        .bind(update.new_rating2)
        .bind(update.change1)
        .bind(update.change2)
        .bind(&duel.id)
        .execute(&mut **tx)
        .await
        .map_err(classify_db_error)?;

        for (user, opponent, new_rating, change, outcome) in [
            (&player1, &player2, update.new_rating1, update.change1, outcome1),
            (&player2, &player1, update.new_rating2, update.change2, outcome2),
        ] {
            sqlx::query(
                "INSERT INTO elo_history (user_uid, duel_id, old_elo, new_elo, elo_change,
                    opponent_uid, opponent_elo, result, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(user.uid)
            .bind(&duel.id)
            .bind(user.elo_rating)
            .bind(new_rating)
            .bind(change)
            .bind(opponent.uid)
            .bind(opponent.elo_rating)
            .bind(outcome.to_str_name())
            .bind(fmt_ts(now))
            .execute(&mut **tx)
            .await
            .map_err(classify_db_error)?;
        }

        Ok(update)
    }

    // ── Reads ─────────────────────────────────────────────────────────

    pub async fn get_duel(&self, duel_id: &str) -> EngineResult<Option<Duel>> {
        let row = sqlx::query_as::<_, Duel>("SELECT * FROM duels WHERE id = ?")
            .bind(duel_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_db_error)?;
        Ok(row)
    }

    pub async fn get_round(
        &self,
        duel_id: &str,
        round_number: i64,
    ) -> EngineResult<Option<DuelRound>> {
        let row = sqlx::query_as::<_, DuelRound>(
            "SELECT * FROM duel_rounds WHERE duel_id = ? AND round_number = ?",
        )
        .bind(duel_id)
        .bind(round_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(row)
    }

    pub async fn rounds_for_duel(&self, duel_id: &str) -> EngineResult<Vec<DuelRound>> {
        let rows = sqlx::query_as::<_, DuelRound>(
            "SELECT * FROM duel_rounds WHERE duel_id = ? ORDER BY round_number",
        )
        .bind(duel_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(rows)
    }

    pub async fn rating_history(&self, user_uid: i64) -> EngineResult<Vec<EloHistoryEntry>> {
        let rows = sqlx::query_as::<_, EloHistoryEntry>(
            "SELECT * FROM elo_history WHERE user_uid = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(user_uid)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(rows)
    }

    pub async fn history_for_duel(&self, duel_id: &str) -> EngineResult<Vec<EloHistoryEntry>> {
        let rows = sqlx::query_as::<_, EloHistoryEntry>(
            "SELECT * FROM elo_history WHERE duel_id = ? ORDER BY id ASC",
        )
        .bind(duel_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(rows)
    }

    pub async fn count_active_duels(&self) -> EngineResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM duels WHERE status NOT IN ('finished', 'cancelled', 'error')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify_db_error)?;
        Ok(count)
    }

    /// Per-player projection of a duel for the API layer.
    pub async fn snapshot_for(&self, duel_id: &str, user_uid: i64) -> EngineResult<DuelSnapshot> {
        let duel = self.get_duel(duel_id).await?.ok_or(EngineError::DuelNotFound)?;
        if !duel.is_participant(user_uid) {
            return Err(EngineError::NotParticipant);
        }

        let status = duel.status()?;
        let is_player1 = duel.player1_uid == user_uid;
        let opponent_uid = if is_player1 {
            duel.player2_uid
        } else {
            duel.player1_uid
        };

        let my_guess = duel.guess_of(user_uid);
        let opponent_guess_raw = duel.guess_of(opponent_uid);
        // Opponent guesses stay hidden until the round resolves.
        let opponent_guess = if status == DuelStatus::Playing {
            None
        } else {
            opponent_guess_raw
        };

        let round_result = if status == DuelStatus::Results || status == DuelStatus::Finished {
            self.get_round(duel_id, duel.current_round)
                .await?
                .map(|round| {
                    let distance = |d: f64| if d < 0.0 { None } else { Some(d) };
                    RoundResultView {
                        round_number: round.round_number,
                        target: Coordinate::new(round.location_lat, round.location_lng),
                        my_distance_km: distance(if is_player1 {
                            round.player1_distance
                        } else {
                            round.player2_distance
                        }),
                        opponent_distance_km: distance(if is_player1 {
                            round.player2_distance
                        } else {
                            round.player1_distance
                        }),
                        my_round_score: if is_player1 {
                            round.player1_score
                        } else {
                            round.player2_score
                        },
                        opponent_round_score: if is_player1 {
                            round.player2_score
                        } else {
                            round.player1_score
                        },
                    }
                })
        } else {
            None
        };

        let outcome = if status == DuelStatus::Finished {
            Some(FinishedView {
                won: duel.winner_uid == Some(user_uid),
                draw: duel.winner_uid.is_none(),
                my_rating_change: if is_player1 {
                    duel.elo_change_player1
                } else {
                    duel.elo_change_player2
                },
                opponent_rating_change: if is_player1 {
                    duel.elo_change_player2
                } else {
                    duel.elo_change_player1
                },
            })
        } else {
            None
        };

        Ok(DuelSnapshot {
            duel_id: duel.id.clone(),
            status,
            current_round: duel.current_round,
            total_rounds: duel.total_rounds,
            my_score: if is_player1 {
                duel.player1_score
            } else {
                duel.player2_score
            },
            opponent_score: if is_player1 {
                duel.player2_score
            } else {
                duel.player1_score
            },
            my_guess,
            opponent_guess,
            opponent_has_guessed: opponent_guess_raw.is_some(),
            game_start_at: duel.game_start_at.clone(),
            first_guess_at: duel.first_guess_at.clone(),
            results_start_at: duel.results_start_at.clone(),
            round_result,
            outcome,
        })
    }
}
