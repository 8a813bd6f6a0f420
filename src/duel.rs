// Duel lifecycle states and the transition table that gates them.

use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

/// Lifecycle state of a duel.
///
/// The happy path is generating → preparing → playing ⇄ results → finished;
/// `error` and `cancelled` are alternate terminals reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelStatus {
    Generating,
    Preparing,
    Playing,
    Results,
    Finished,
    Cancelled,
    Error,
}

impl DuelStatus {
    /// Parse a DB-stored status string.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "generating" => Some(Self::Generating),
            "preparing" => Some(Self::Preparing),
            "playing" => Some(Self::Playing),
            "results" => Some(Self::Results),
            "finished" => Some(Self::Finished),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn to_str_name(self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Preparing => "preparing",
            Self::Playing => "playing",
            Self::Results => "results",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Terminal states never change again and release both players for
    /// matchmaking.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Error)
    }

    /// Whether `self → to` is a legal transition. The sweep and the guess
    /// path both validate against this table before writing a new status.
    pub fn can_transition(self, to: DuelStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Self::Generating, Self::Preparing) => true,
            (Self::Preparing, Self::Playing) => true,
            (Self::Playing, Self::Results) => true,
            (Self::Results, Self::Playing) => true,
            (Self::Results, Self::Finished) => true,
            // Any live duel can be abandoned or fail.
            (_, Self::Cancelled) | (_, Self::Error) => true,
            _ => false,
        }
    }
}

/// Per-player projection of a duel, as served to the API layer. Fields are
/// already flipped to "me" and "opponent" for the requesting player.
#[derive(Debug, Clone, Serialize)]
pub struct DuelSnapshot {
    pub duel_id: String,
    pub status: DuelStatus,
    pub current_round: i64,
    pub total_rounds: i64,
    pub my_score: i64,
    pub opponent_score: i64,
    pub my_guess: Option<Coordinate>,
    /// Only revealed once the round is out of `playing`.
    pub opponent_guess: Option<Coordinate>,
    pub opponent_has_guessed: bool,
    pub game_start_at: Option<String>,
    pub first_guess_at: Option<String>,
    pub results_start_at: Option<String>,
    pub round_result: Option<RoundResultView>,
    pub outcome: Option<FinishedView>,
}

/// Scored round data shown while a duel sits in `results`.
#[derive(Debug, Clone, Serialize)]
pub struct RoundResultView {
    pub round_number: i64,
    pub target: Coordinate,
    pub my_distance_km: Option<f64>,
    pub opponent_distance_km: Option<f64>,
    pub my_round_score: i64,
    pub opponent_round_score: i64,
}

/// Final outcome data, present once `status = finished`.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedView {
    pub won: bool,
    pub draw: bool,
    pub my_rating_change: Option<i64>,
    pub opponent_rating_change: Option<i64>,
}
