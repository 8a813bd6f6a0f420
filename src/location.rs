// Street-view location sourcing.
//
// Providers are called by the matchmaker after a pair is claimed, never
// inside the claim transaction. A provider that cannot find a panorama
// falls back to a fixed coordinate rather than failing the duel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::geo::Coordinate;
use crate::metrics;

/// Returned when the sampler exhausts its attempt budget or a panorama
/// fails the radius-1 recheck.
pub const FALLBACK_LOCATION: Coordinate = Coordinate {
    lat: 39.0194608,
    lng: 125.75355107,
};

const MAX_ATTEMPTS: u32 = 50;
const SEARCH_RADIUS_M: u32 = 50_000;
const OUTDOOR_PROBABILITY: f64 = 0.75;

/// Source of playable street-view coordinates.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Pick one playable coordinate.
    async fn pick_location(&self) -> EngineResult<Coordinate>;
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    status: String,
    location: Option<LatLng>,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    address_components: Vec<AddressComponent>,
}

#[derive(Debug, Deserialize)]
struct AddressComponent {
    short_name: String,
    types: Vec<String>,
}

/// Google street-view metadata + geocoding backed provider.
///
/// Sampling loop: draw a uniform random coordinate, validate it against
/// the metadata API within a 50 km radius (75% of draws restricted to
/// outdoor panoramas), recheck the snapped panorama at radius 1, then
/// geocode the country and reject with the configured per-country
/// probability to thin out over-covered regions.
pub struct StreetViewProvider {
    http: reqwest::Client,
    api_key: String,
    reselect_weights: HashMap<String, f64>,
}

impl StreetViewProvider {
    pub fn new(api_key: String, reselect_weights: HashMap<String, f64>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            reselect_weights,
        }
    }

    async fn metadata(&self, lat: f64, lng: f64, radius: u32, outdoor: bool) -> EngineResult<MetadataResponse> {
        let mut url = format!(
            "https://maps.googleapis.com/maps/api/streetview/metadata?location={lat},{lng}&radius={radius}&key={}",
            self.api_key
        );
        if outdoor {
            url.push_str("&source=outdoor");
        }
        let response = self.http.get(&url).send().await?;
        Ok(response.json().await?)
    }

    async fn country_code(&self, lat: f64, lng: f64) -> EngineResult<Option<String>> {
        let url = format!(
            "https://maps.googleapis.com/maps/api/geocode/json?latlng={lat},{lng}&key={}&result_type=country",
            self.api_key
        );
        let response = self.http.get(&url).send().await?;
        let body: GeocodeResponse = response.json().await?;

        if body.status != "OK" {
            return Ok(None);
        }
        let code = body.results.first().and_then(|r| {
            r.address_components
                .iter()
                .find(|c| c.types.iter().any(|t| t == "country"))
                .map(|c| c.short_name.clone())
        });
        Ok(code)
    }

    fn fallback(&self) -> Coordinate {
        metrics::LOCATION_LOOKUPS_TOTAL
            .with_label_values(&["fallback"])
            .inc();
        FALLBACK_LOCATION
    }
}

#[async_trait]
impl LocationProvider for StreetViewProvider {
    async fn pick_location(&self) -> EngineResult<Coordinate> {
        for attempt in 1..=MAX_ATTEMPTS {
            let lat = rand::random::<f64>() * 180.0 - 90.0;
            let lng = rand::random::<f64>() * 360.0 - 180.0;
            // Panoramas below 80S are mostly broken interior captures.
            if lat < -80.0 {
                continue;
            }

            let outdoor = rand::random::<f64>() < OUTDOOR_PROBABILITY;
            let meta = match self.metadata(lat, lng, SEARCH_RADIUS_M, outdoor).await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "street view lookup failed");
                    continue;
                }
            };
            if meta.status != "OK" {
                continue;
            }
            let Some(snapped) = meta.location else {
                continue;
            };

            // The metadata API snaps to the nearest panorama within the
            // search radius; confirm one actually exists at that point.
            let recheck = match self.metadata(snapped.lat, snapped.lng, 1, false).await {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "panorama recheck failed");
                    continue;
                }
            };
            if recheck.status != "OK" {
                return Ok(self.fallback());
            }

            let country = match self.country_code(snapped.lat, snapped.lng).await {
                Ok(Some(code)) => code,
                Ok(None) => {
                    tracing::debug!(attempt, "no country for panorama, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "geocode failed");
                    continue;
                }
            };

            if let Some(weight) = self.reselect_weights.get(&country) {
                if rand::random::<f64>() < *weight {
                    tracing::debug!(attempt, country = %country, "reselecting for geographic balance");
                    continue;
                }
            }

            tracing::debug!(attempt, country = %country, lat = snapped.lat, lng = snapped.lng, "panorama selected");
            metrics::LOCATION_LOOKUPS_TOTAL.with_label_values(&["ok"]).inc();
            return Ok(Coordinate::new(snapped.lat, snapped.lng));
        }

        tracing::warn!("location sampling exhausted {MAX_ATTEMPTS} attempts, using fallback");
        Ok(self.fallback())
    }
}

/// Deterministic provider for tests. Hands out the configured coordinates
/// in order, repeating the last one, or fails every call when constructed
/// with `failing()`.
pub struct StubProvider {
    locations: Vec<Coordinate>,
    next: AtomicUsize,
    fail: bool,
}

impl StubProvider {
    pub fn new(locations: Vec<Coordinate>) -> Self {
        Self {
            locations,
            next: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            locations: Vec::new(),
            next: AtomicUsize::new(0),
            fail: true,
        }
    }
}

#[async_trait]
impl LocationProvider for StubProvider {
    async fn pick_location(&self) -> EngineResult<Coordinate> {
        if self.fail || self.locations.is_empty() {
            return Err(EngineError::ProviderExhausted);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(self.locations[i.min(self.locations.len() - 1)])
    }
}
