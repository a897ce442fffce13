use crate::config::MapConfig;
use geo::{LineString, MultiPolygon};
use std::f64::consts::PI;
use std::fmt::Write;

// Beyond this the Mercator y coordinate runs off to infinity.
const MAX_LATITUDE: f64 = 85.051_128_78;

/// Spherical Mercator mapping lon/lat degrees onto the map canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mercator {
    pub scale: f64,
    pub translate: (f64, f64),
}

impl Mercator {
    pub fn new(scale: f64, translate: (f64, f64)) -> Self {
        Self { scale, translate }
    }

    /// Projection used for the world map: centred horizontally, equator low
    /// enough that the southern hemisphere fits above the bottom margin.
    pub fn for_map(map: &MapConfig) -> Self {
        let (width, height) = map.inner_size();
        Self::new(map.scale, (width / 2.0, height / 1.2))
    }

    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let lambda = lon.to_radians();
        let phi = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
        let x = self.scale * lambda + self.translate.0;
        let y = self.translate.1 - self.scale * (PI / 4.0 + phi / 2.0).tan().ln();
        (x, y)
    }

    /// SVG path data for a multipolygon, one closed subpath per ring.
    pub fn path_data(&self, geometry: &MultiPolygon<f64>) -> String {
        let mut d = String::new();
        for polygon in geometry {
            self.push_ring(&mut d, polygon.exterior());
            for ring in polygon.interiors() {
                self.push_ring(&mut d, ring);
            }
        }
        d
    }

    fn push_ring(&self, d: &mut String, ring: &LineString<f64>) {
        let mut coords = ring.coords();
        let Some(first) = coords.next() else {
            return;
        };
        let (x, y) = self.project(first.x, first.y);
        let _ = write!(d, "M{x:.2},{y:.2}");
        for c in coords {
            let (x, y) = self.project(c.x, c.y);
            let _ = write!(d, "L{x:.2},{y:.2}");
        }
        d.push('Z');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn origin_maps_to_translate() {
        let m = Mercator::new(140.0, (462.5, 437.5));
        let (x, y) = m.project(0.0, 0.0);
        assert!(approx(x, 462.5));
        assert!(approx(y, 437.5));
    }

    #[test]
    fn north_is_up_and_east_is_right() {
        let m = Mercator::new(140.0, (0.0, 0.0));
        let (x, y) = m.project(10.0, 45.0);
        assert!(x > 0.0);
        assert!(y < 0.0);
        assert!(approx(x, 140.0 * 10f64.to_radians()));
    }

    #[test]
    fn poles_stay_finite() {
        let m = Mercator::new(140.0, (0.0, 0.0));
        let (_, north) = m.project(0.0, 90.0);
        let (_, south) = m.project(0.0, -90.0);
        assert!(north.is_finite());
        assert!(south.is_finite());
        assert!(approx(north, -south));
    }

    #[test]
    fn map_projection_uses_inner_canvas() {
        let m = Mercator::for_map(&MapConfig::default());
        assert_eq!(m.scale, 140.0);
        assert!(approx(m.translate.0, 925.0 / 2.0));
        assert!(approx(m.translate.1, 525.0 / 1.2));
    }

    #[test]
    fn path_data_closes_each_ring() {
        let m = Mercator::new(1.0, (0.0, 0.0));
        let square = polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ];
        let d = m.path_data(&MultiPolygon::new(vec![square.clone(), square]));
        assert_eq!(d.matches('M').count(), 2);
        assert_eq!(d.matches('Z').count(), 2);
        assert!(d.starts_with("M0.00,-0.00") || d.starts_with("M0.00,0.00"));
    }

    #[test]
    fn empty_geometry_has_empty_path() {
        let m = Mercator::new(1.0, (0.0, 0.0));
        assert!(m.path_data(&MultiPolygon::new(vec![])).is_empty());
    }
}
