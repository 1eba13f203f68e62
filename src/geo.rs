//! Geospatial neighbor resolution.
//!
//! Given an alert origin and a radius, [`NeighborResolver`] answers: which
//! device tokens should be notified? The contract guarantees a deduplicated
//! set that excludes the reporter's own devices, computed fresh per alert.
//! Positions move, so results are never cached across alerts.
//!
//! A store failure is [`ResolutionUnavailable`](crate::error::FanoutError::ResolutionUnavailable),
//! never an empty result: callers must be able to tell "no neighbors" from
//! "could not resolve".

use std::collections::HashSet;
use std::future::Future;

use crate::error::FanoutError;
use crate::model::NeighborCandidate;
use crate::storage::Storage;

/// Fixed geofence radius defining "nearby" for push eligibility.
pub const DEFAULT_RADIUS_METERS: f64 = 500.0;

/// Mean meters per degree of latitude on the WGS-84 sphere.
const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// Mean earth radius in meters, for the haversine formula.
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// An alert origin point in WGS-84 degrees.
#[derive(Debug, Clone, Copy)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Resolves the set of notifiable device tokens around an origin.
pub trait NeighborResolver: Send + Sync {
    /// Resolve all candidate tokens within `radius_meters` of `origin`,
    /// excluding devices owned by `exclude_user_id`.
    ///
    /// An empty vector is a valid success. Store failures surface as
    /// `ResolutionUnavailable`.
    fn resolve(
        &self,
        origin: GeoPoint,
        radius_meters: f64,
        exclude_user_id: &str,
    ) -> impl Future<Output = Result<Vec<NeighborCandidate>, FanoutError>> + Send;
}

/// Great-circle distance between two WGS-84 points, in meters.
///
/// Haversine on a spherical earth. At the 500 m geofence scale the error
/// against an ellipsoidal model is well under a meter.
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_METERS * c
}

/// Production resolver backed by the SQLite device registry.
///
/// Uses an indexed bounding-box prefilter, then exact haversine filtering
/// on the handful of rows returned.
#[derive(Clone)]
pub struct StoreResolver {
    storage: Storage,
}

impl StoreResolver {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Degrees of latitude/longitude spanning `radius_meters` at `latitude`.
    fn bbox_deltas(latitude: f64, radius_meters: f64) -> (f64, f64) {
        let lat_delta = radius_meters / METERS_PER_DEGREE_LAT;
        // Longitude degrees shrink toward the poles; clamp the cosine so
        // the box degrades to "all longitudes" instead of dividing by zero.
        let cos_lat = latitude.to_radians().cos().max(1e-6);
        let lng_delta = (radius_meters / (METERS_PER_DEGREE_LAT * cos_lat)).min(180.0);
        (lat_delta, lng_delta)
    }
}

impl NeighborResolver for StoreResolver {
    async fn resolve(
        &self,
        origin: GeoPoint,
        radius_meters: f64,
        exclude_user_id: &str,
    ) -> Result<Vec<NeighborCandidate>, FanoutError> {
        let (lat_delta, lng_delta) = Self::bbox_deltas(origin.latitude, radius_meters);

        let rows = self
            .storage
            .devices_in_bbox(
                origin.latitude - lat_delta,
                origin.latitude + lat_delta,
                origin.longitude - lng_delta,
                origin.longitude + lng_delta,
                exclude_user_id,
            )
            .await
            .map_err(|e| FanoutError::ResolutionUnavailable(e.to_string()))?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();

        for row in rows {
            let distance =
                haversine_meters(origin.latitude, origin.longitude, row.latitude, row.longitude);
            if distance > radius_meters {
                continue;
            }
            if seen.insert(row.token.clone()) {
                candidates.push(NeighborCandidate {
                    token: row.token,
                    distance_meters: Some(distance),
                });
            }
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_haversine_degree_of_latitude() {
        // One degree of latitude is ~111.2 km
        let d = haversine_meters(10.0, 20.0, 11.0, 20.0);
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn test_haversine_zero_distance() {
        assert_eq!(haversine_meters(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    /// Offset a latitude by roughly `meters` northward.
    fn lat_offset(meters: f64) -> f64 {
        meters / METERS_PER_DEGREE_LAT
    }

    #[tokio::test]
    async fn test_resolve_respects_radius() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        // ~400 m north: inside. ~600 m north: outside.
        storage
            .upsert_device("U2", "tok-near", 10.0 + lat_offset(400.0), 20.0, now)
            .await
            .unwrap();
        storage
            .upsert_device("U3", "tok-far", 10.0 + lat_offset(600.0), 20.0, now)
            .await
            .unwrap();

        let resolver = StoreResolver::new(storage);
        let origin = GeoPoint {
            latitude: 10.0,
            longitude: 20.0,
        };
        let candidates = resolver
            .resolve(origin, DEFAULT_RADIUS_METERS, "U1")
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].token, "tok-near");
        let distance = candidates[0].distance_meters.unwrap();
        assert!((350.0..450.0).contains(&distance), "got {distance}");
    }

    #[tokio::test]
    async fn test_resolve_excludes_reporter_at_distance_zero() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        // Reporter's own device sits exactly at the origin.
        storage
            .upsert_device("U1", "tok-reporter", 10.0, 20.0, now)
            .await
            .unwrap();
        storage
            .upsert_device("U2", "tok-neighbor", 10.0, 20.0, now)
            .await
            .unwrap();

        let resolver = StoreResolver::new(storage);
        let origin = GeoPoint {
            latitude: 10.0,
            longitude: 20.0,
        };
        let candidates = resolver
            .resolve(origin, DEFAULT_RADIUS_METERS, "U1")
            .await
            .unwrap();

        let tokens: Vec<_> = candidates.iter().map(|c| c.token.as_str()).collect();
        assert_eq!(tokens, vec!["tok-neighbor"]);
    }

    #[tokio::test]
    async fn test_resolve_never_duplicates_tokens() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let now = Utc::now();

        for user in ["U2", "U3", "U4"] {
            storage
                .upsert_device(user, &format!("tok-{user}"), 10.0, 20.0, now)
                .await
                .unwrap();
        }

        let resolver = StoreResolver::new(storage);
        let origin = GeoPoint {
            latitude: 10.0,
            longitude: 20.0,
        };
        let candidates = resolver
            .resolve(origin, DEFAULT_RADIUS_METERS, "U1")
            .await
            .unwrap();

        let mut tokens: Vec<_> = candidates.iter().map(|c| c.token.clone()).collect();
        let before = tokens.len();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), before);
        assert_eq!(before, 3);
    }

    #[tokio::test]
    async fn test_empty_result_is_success() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let resolver = StoreResolver::new(storage);

        let candidates = resolver
            .resolve(
                GeoPoint {
                    latitude: 0.0,
                    longitude: 0.0,
                },
                DEFAULT_RADIUS_METERS,
                "U1",
            )
            .await
            .unwrap();

        assert!(candidates.is_empty());
    }
}
