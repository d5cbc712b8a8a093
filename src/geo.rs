//! Great-circle geometry on a spherical Earth.

use crate::models::{Coordinates, LocationSample};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two points
pub fn distance_meters(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lon = (b.longitude - a.longitude).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);

    // Rounding can push h marginally above 1 for antipodal points
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// True iff `point` lies within `radius_meters` of `center`, boundary included
pub fn is_within_geofence(point: Coordinates, center: Coordinates, radius_meters: f64) -> bool {
    distance_meters(point, center) <= radius_meters
}

/// Length of a trail in meters, summing consecutive legs
pub fn trail_distance_meters(samples: &[LocationSample]) -> f64 {
    samples
        .windows(2)
        .map(|leg| distance_meters(leg[0].coordinates(), leg[1].coordinates()))
        .sum()
}

/// Human-readable distance: whole meters below 1 km, one decimal in km above
pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{}m", meters.round())
    } else {
        format!("{:.1}km", meters / 1000.0)
    }
}

/// Smallest span of a map viewport, in degrees
const MIN_REGION_DELTA: f64 = 0.01;

/// Padding applied around the bounding box of the points
const REGION_PADDING: f64 = 1.2;

/// Map viewport: centre plus latitude/longitude spans in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub center: Coordinates,
    pub latitude_delta: f64,
    pub longitude_delta: f64,
}

impl Region {
    /// Viewport around a single point
    pub fn around(center: Coordinates) -> Self {
        Self {
            center,
            latitude_delta: MIN_REGION_DELTA,
            longitude_delta: MIN_REGION_DELTA,
        }
    }

    /// Viewport enclosing all points with some padding, None if there are none
    pub fn enclosing<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = Coordinates>,
    {
        let mut points = points.into_iter();
        let first = points.next()?;
        let (mut min_lat, mut max_lat) = (first.latitude, first.latitude);
        let (mut min_lon, mut max_lon) = (first.longitude, first.longitude);

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lon = min_lon.min(p.longitude);
            max_lon = max_lon.max(p.longitude);
        }

        Some(Self {
            center: Coordinates::new((min_lat + max_lat) / 2.0, (min_lon + max_lon) / 2.0),
            latitude_delta: ((max_lat - min_lat) * REGION_PADDING).max(MIN_REGION_DELTA),
            longitude_delta: ((max_lon - min_lon) * REGION_PADDING).max(MIN_REGION_DELTA),
        })
    }
}
