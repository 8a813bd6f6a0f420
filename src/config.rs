// Application configuration, loaded from environment variables and CLI flags.

use std::collections::HashMap;

/// Gameplay timing knobs. All deadlines are evaluated by the sweep against
/// persisted timestamps, so changing these only affects newly reached
/// transitions.
#[derive(Debug, Clone)]
pub struct GameplayConfig {
    /// Rounds per duel.
    pub total_rounds: i64,
    /// Delay between duel finalization and the scheduled start.
    pub start_delay_secs: i64,
    /// Round timeout, counted from the first guess of the round.
    pub round_timeout_secs: i64,
    /// How long a duel dwells in `results` before advancing.
    pub results_duration_secs: i64,
    /// Queue entries older than this are ignored by pairing.
    pub queue_ttl_secs: i64,
    /// Duels stuck in `generating` longer than this are marked `error`.
    pub generating_grace_secs: i64,
}

impl Default for GameplayConfig {
    fn default() -> Self {
        Self {
            total_rounds: 5,
            start_delay_secs: 5,
            round_timeout_secs: 15,
            results_duration_secs: 10,
            queue_ttl_secs: 600,
            generating_grace_secs: 120,
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Google Maps API key for the street-view location provider.
    pub maps_api_key: String,
    /// Gameplay timings.
    pub gameplay: GameplayConfig,
    /// Per-country reselection probability for location sampling, keyed by
    /// two-letter country code. Tunable policy, not a structural rule.
    pub region_reselect_weights: HashMap<String, f64>,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:whereami.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `GOOGLE_MAPS_API_KEY` - street-view metadata / geocoding key
    /// - `TOTAL_ROUNDS`, `ROUND_TIMEOUT_SECS`, `RESULTS_DURATION_SECS`,
    ///   `QUEUE_TTL_SECS` - gameplay timing overrides
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:whereami.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        let maps_api_key = std::env::var("GOOGLE_MAPS_API_KEY").unwrap_or_default();

        let mut gameplay = GameplayConfig::default();
        if let Some(v) = Self::parse_env_i64("TOTAL_ROUNDS") {
            gameplay.total_rounds = v;
        }
        if let Some(v) = Self::parse_env_i64("ROUND_TIMEOUT_SECS") {
            gameplay.round_timeout_secs = v;
        }
        if let Some(v) = Self::parse_env_i64("RESULTS_DURATION_SECS") {
            gameplay.results_duration_secs = v;
        }
        if let Some(v) = Self::parse_env_i64("QUEUE_TTL_SECS") {
            gameplay.queue_ttl_secs = v;
        }

        Config {
            database_url,
            port,
            maps_api_key,
            gameplay,
            region_reselect_weights: default_region_weights(),
        }
    }

    fn parse_env_i64(name: &str) -> Option<i64> {
        std::env::var(name).ok().and_then(|v| v.parse().ok())
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

/// Default reselection probabilities, chosen to thin out countries with
/// very large street-view coverage.
pub fn default_region_weights() -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    weights.insert("US".to_string(), 0.30);
    weights.insert("CA".to_string(), 0.30);
    weights.insert("RU".to_string(), 0.50);
    weights.insert("AU".to_string(), 0.20);
    weights.insert("BR".to_string(), 0.20);
    weights
}
