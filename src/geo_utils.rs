//! Geographic utilities.
//!
//! Every distance in the crate goes through [`haversine_distance`]. Nothing
//! else computes great-circle distance, so metrics, records and snapshot
//! recovery always agree on the same numbers.

use geo::{BoundingRect, Coord, LineString};

use crate::{Bounds, GeoSample};

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates in meters.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Clamp guards against a > 1 from rounding on antipodal points
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_METERS * c
}

/// Calculate haversine distance between two samples in meters.
pub fn haversine_distance(p1: &GeoSample, p2: &GeoSample) -> f64 {
    haversine(p1.latitude, p1.longitude, p2.latitude, p2.longitude)
}

/// Total distance along a sequence of samples.
pub fn path_distance(samples: &[GeoSample]) -> f64 {
    samples
        .windows(2)
        .map(|pair| haversine_distance(&pair[0], &pair[1]))
        .sum()
}

/// Point reached by travelling `distance` meters from a coordinate on an
/// initial bearing (degrees clockwise from north). Returns `(lat, lon)`.
pub fn destination_point(lat: f64, lon: f64, bearing_deg: f64, distance: f64) -> (f64, f64) {
    let delta = distance / EARTH_RADIUS_METERS;
    let theta = bearing_deg.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    // Normalize longitude to [-180, 180)
    let lon2 = (lambda2.to_degrees() + 540.0) % 360.0 - 180.0;
    (phi2.to_degrees(), lon2)
}

/// Bounding box of a track, `None` when it has no samples.
pub fn track_bounds(samples: &[GeoSample]) -> Option<Bounds> {
    let coords: Vec<Coord> = samples
        .iter()
        .map(|s| Coord {
            x: s.longitude,
            y: s.latitude,
        })
        .collect();

    let rect = LineString::new(coords).bounding_rect()?;
    Some(Bounds {
        min_lat: rect.min().y,
        max_lat: rect.max().y,
        min_lng: rect.min().x,
        max_lng: rect.max().x,
    })
}
