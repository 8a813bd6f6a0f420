pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod duel;
pub mod elo;
pub mod error;
pub mod events;
pub mod geo;
pub mod location;
pub mod matchmaking;
pub mod metrics;
pub mod sweep;
