// Elo rating calculation for 1v1 duels.
//
// Pure computation only; the commit step (writing user stats and history)
// lives in the db layer so it shares the duel-finalization transaction.

use serde::{Deserialize, Serialize};

pub const STARTING_ELO: i64 = 1500;
pub const K_FACTOR: f64 = 64.0;
const ELO_DIVISOR: f64 = 400.0;

/// Duel outcome from the perspective of player 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelResult {
    Player1Wins,
    Player2Wins,
    Draw,
}

impl DuelResult {
    /// Parse a DB-stored result string.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "player1_wins" => Some(Self::Player1Wins),
            "player2_wins" => Some(Self::Player2Wins),
            "draw" => Some(Self::Draw),
            _ => None,
        }
    }

    pub fn to_str_name(self) -> &'static str {
        match self {
            Self::Player1Wins => "player1_wins",
            Self::Player2Wins => "player2_wins",
            Self::Draw => "draw",
        }
    }

    /// Outcome for each player, (player1, player2).
    pub fn outcomes(self) -> (Outcome, Outcome) {
        match self {
            Self::Player1Wins => (Outcome::Win, Outcome::Loss),
            Self::Player2Wins => (Outcome::Loss, Outcome::Win),
            Self::Draw => (Outcome::Draw, Outcome::Draw),
        }
    }
}

/// Match outcome from the perspective of one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win,
    Draw,
    Loss,
}

impl Outcome {
    pub fn score(self) -> f64 {
        match self {
            Outcome::Win => 1.0,
            Outcome::Draw => 0.5,
            Outcome::Loss => 0.0,
        }
    }

    pub fn to_str_name(self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Draw => "draw",
            Outcome::Loss => "loss",
        }
    }
}

/// One duel's rating change for both players.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EloUpdate {
    pub new_rating1: i64,
    pub new_rating2: i64,
    pub change1: i64,
    pub change2: i64,
}

/// Expected score for player A against player B.
pub fn expected_score(rating_a: i64, rating_b: i64) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf((rating_b - rating_a) as f64 / ELO_DIVISOR))
}

/// New ratings after a duel. The change is computed once from player 1's
/// side and applied with opposite sign to player 2, so deltas always sum
/// to zero.
pub fn calculate(rating1: i64, rating2: i64, result: DuelResult) -> EloUpdate {
    let (outcome1, _) = result.outcomes();
    let expected1 = expected_score(rating1, rating2);
    let change = (K_FACTOR * (outcome1.score() - expected1)).round() as i64;

    EloUpdate {
        new_rating1: rating1 + change,
        new_rating2: rating2 - change,
        change1: change,
        change2: -change,
    }
}
