//! Great-circle distance and proximity confidence

use super::types::Coordinate;

/// Mean Earth radius used for haversine distance (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance between two coordinates, in meters
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lng = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    // Rounding can push h just past 1.0 for antipodal points
    let c = 2.0 * h.sqrt().min(1.0).asin();
    EARTH_RADIUS_M * c
}

/// Proximity confidence in [0, 1]: 1.0 at the venue, 0.0 at or beyond `radius_m`
pub fn confidence(distance_m: f64, radius_m: f64) -> f64 {
    if radius_m <= 0.0 {
        return 0.0;
    }
    (1.0 - distance_m / radius_m).clamp(0.0, 1.0)
}

/// Largest distance that still reaches `min_confidence` inside `radius_m`
#[inline]
pub fn active_radius(radius_m: f64, min_confidence: f64) -> f64 {
    (1.0 - min_confidence) * radius_m
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn points() -> Vec<Coordinate> {
        vec![
            Coordinate::new(0.0, 0.0),
            Coordinate::new(40.7128, -74.0060),
            Coordinate::new(51.5074, -0.1278),
            Coordinate::new(-33.8688, 151.2093),
            Coordinate::new(89.9, 179.9),
            Coordinate::new(-89.9, -179.9),
        ]
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        for p in points() {
            assert_eq!(distance_meters(&p, &p), 0.0);
        }
    }

    #[test]
    fn test_distance_is_symmetric() {
        let pts = points();
        for a in &pts {
            for b in &pts {
                let ab = distance_meters(a, b);
                let ba = distance_meters(b, a);
                assert!((ab - ba).abs() < EPS, "{ab} vs {ba}");
            }
        }
    }

    #[test]
    fn test_known_distance_new_york_london() {
        let nyc = Coordinate::new(40.7128, -74.0060);
        let london = Coordinate::new(51.5074, -0.1278);
        let d = distance_meters(&nyc, &london);
        // ~5570 km
        assert!((d - 5_570_000.0).abs() < 10_000.0, "got {d}");
    }

    #[test]
    fn test_small_offset_in_meters() {
        // One degree of latitude is ~111.195 km on this sphere
        let a = Coordinate::new(10.0, 20.0);
        let b = Coordinate::new(10.0 + 5.0 / 111_195.0, 20.0);
        let d = distance_meters(&a, &b);
        assert!((d - 5.0).abs() < 0.01, "got {d}");
    }

    #[test]
    fn test_antipodal_points_do_not_produce_nan() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(0.0, 180.0);
        let d = distance_meters(&a, &b);
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn test_confidence_endpoints() {
        for r in [1.0, 30.0, 250.0] {
            assert_eq!(confidence(0.0, r), 1.0);
            assert_eq!(confidence(r, r), 0.0);
            assert_eq!(confidence(r * 3.0, r), 0.0);
        }
    }

    #[test]
    fn test_confidence_non_increasing() {
        let mut last = f64::INFINITY;
        for step in 0..=400 {
            let c = confidence(step as f64 * 0.1, 30.0);
            assert!(c <= last);
            assert!((0.0..=1.0).contains(&c));
            last = c;
        }
    }

    #[test]
    fn test_confidence_at_5m_and_15m() {
        assert!((confidence(5.0, 30.0) - 0.8333).abs() < 1e-3);
        assert!((confidence(15.0, 30.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_active_radius_pair() {
        assert!((active_radius(30.0, 0.7) - 9.0).abs() < 1e-9);
    }
}
