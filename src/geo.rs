// Great-circle geometry and round scoring.

use serde::{Deserialize, Serialize};

/// Earth's mean radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Half of Earth's circumference in kilometers; the largest possible
/// great-circle distance between two points.
pub const MAX_DISTANCE_KM: f64 = 20037.5;

/// Reserved distance value meaning "no guess was made". Never a valid
/// great-circle distance, so it cannot collide with a perfect guess.
pub const NO_GUESS_DISTANCE: f64 = -1.0;

/// Maximum score for a perfect (zero-distance) guess.
pub const MAX_ROUND_SCORE: i64 = 5000;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Whether the pair is a plausible WGS84 coordinate.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Haversine great-circle distance in kilometers between two coordinates.
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Distance from a target to an optional guess. A missing guess yields the
/// reserved sentinel instead of a distance.
pub fn guess_distance_km(target: Coordinate, guess: Option<Coordinate>) -> f64 {
    match guess {
        Some(g) => haversine_km(target, g),
        None => NO_GUESS_DISTANCE,
    }
}

/// Round score for a distance: 5000 at distance zero, decaying exponentially
/// toward zero at the antipode. The no-guess sentinel scores exactly 0.
pub fn round_score(distance_km: f64) -> i64 {
    if distance_km < 0.0 || !distance_km.is_finite() {
        return 0;
    }
    (MAX_ROUND_SCORE as f64 * (-10.0 * distance_km / MAX_DISTANCE_KM).exp()).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_zero_for_same_point() {
        let p = Coordinate::new(48.8566, 2.3522);
        assert!(haversine_km(p, p) < 1e-9);
    }

    #[test]
    fn test_distance_symmetric() {
        let a = Coordinate::new(35.6762, 139.6503);
        let b = Coordinate::new(-33.8688, 151.2093);
        let d1 = haversine_km(a, b);
        let d2 = haversine_km(b, a);
        assert!((d1 - d2).abs() < 1e-9);
        assert!(d1 > 0.0);
    }

    #[test]
    fn test_distance_known_pair() {
        // Paris to London is roughly 344 km.
        let paris = Coordinate::new(48.8566, 2.3522);
        let london = Coordinate::new(51.5074, -0.1278);
        let d = haversine_km(paris, london);
        assert!(d > 330.0 && d < 360.0, "got {d}");
    }

    #[test]
    fn test_antipodal_distance_near_max() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(0.0, 180.0);
        let d = haversine_km(a, b);
        assert!((d - 20015.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn test_no_guess_sentinel() {
        let target = Coordinate::new(10.0, 10.0);
        assert_eq!(guess_distance_km(target, None), NO_GUESS_DISTANCE);
        assert_eq!(round_score(NO_GUESS_DISTANCE), 0);
    }

    #[test]
    fn test_score_ceiling_at_zero_distance() {
        assert_eq!(round_score(0.0), MAX_ROUND_SCORE);
    }

    #[test]
    fn test_score_strictly_decreasing() {
        let mut prev = round_score(0.0) as f64;
        // Sample distances across the full range; the underlying curve is
        // strictly decreasing even where rounding plateaus.
        for step in 1..=20 {
            let d = step as f64 * 1000.0;
            let raw = MAX_ROUND_SCORE as f64 * (-10.0 * d / MAX_DISTANCE_KM).exp();
            assert!(raw < prev, "score not decreasing at {d} km");
            prev = raw;
        }
    }

    #[test]
    fn test_score_never_negative() {
        assert!(round_score(MAX_DISTANCE_KM) >= 0);
        assert_eq!(round_score(f64::NAN), 0);
    }

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate::new(45.0, 90.0).is_valid());
        assert!(!Coordinate::new(91.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, 181.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }
}
