//! Geodesic helpers shared by the splicer, emitter and transit splicer.

use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

pub fn haversine_distance(a: LatLng, b: LatLng) -> f64 {
    let p1 = Point::new(a.lng, a.lat);
    let p2 = Point::new(b.lng, b.lat);
    p1.haversine_distance(&p2)
}

/// Total geodesic length of a polyline in meters.
pub fn polyline_length(shape: &[LatLng]) -> f64 {
    shape
        .windows(2)
        .map(|w| haversine_distance(w[0], w[1]))
        .sum()
}

/// Closest point on a polyline to a target, with the approximate distance in
/// meters and the index of the segment start vertex. Uses a planar
/// approximation scaled by meters-per-degree at the target latitude, which is
/// plenty for the short distances involved in snapping stops to ways.
pub fn closest_point(target: LatLng, shape: &[LatLng]) -> Option<(LatLng, f64, usize)> {
    if shape.is_empty() {
        return None;
    }
    if shape.len() == 1 {
        return Some((shape[0], haversine_distance(target, shape[0]), 0));
    }

    let m_per_deg_lat = 110_567.0;
    let m_per_deg_lng = 111_321.0 * target.lat.to_radians().cos();

    let mut best: Option<(LatLng, f64, usize)> = None;
    for (i, seg) in shape.windows(2).enumerate() {
        let (a, b) = (seg[0], seg[1]);
        let dx = (b.lng - a.lng) * m_per_deg_lng;
        let dy = (b.lat - a.lat) * m_per_deg_lat;
        let px = (target.lng - a.lng) * m_per_deg_lng;
        let py = (target.lat - a.lat) * m_per_deg_lat;

        let seg_len2 = dx * dx + dy * dy;
        let t = if seg_len2 > 0.0 {
            ((px * dx + py * dy) / seg_len2).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let proj = LatLng::new(a.lat + (b.lat - a.lat) * t, a.lng + (b.lng - a.lng) * t);
        let ex = px - t * dx;
        let ey = py - t * dy;
        let dist = (ex * ex + ey * ey).sqrt();

        match best {
            Some((_, d, _)) if dist >= d => {}
            _ => best = Some((proj, dist, i)),
        }
    }
    best
}
