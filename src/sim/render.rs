//! Synthetic marker images.

use image::{Rgba, RgbaImage};
use nalgebra::Point2;

use crate::geometry::{CameraModel, SE3};
use crate::tracking::marker::MarkerModel;
use crate::tracking::roi::{project_points, Roi};

pub const BACKGROUND: u8 = 230;
pub const BAND: u8 = 30;

/// Render the dark band between the projected outer and inner outlines on a
/// bright background. A marker partly behind the camera is not drawn.
pub fn render_marker(
    model: &MarkerModel,
    pose: &SE3,
    camera: &CameraModel,
    width: u32,
    height: u32,
) -> RgbaImage {
    let mut image = RgbaImage::from_pixel(width, height, gray(BACKGROUND));

    let outer: Option<Vec<Point2<f64>>> = project_points(model.outer(), pose, camera).into_iter().collect();
    let inner: Option<Vec<Point2<f64>>> = project_points(model.inner(), pose, camera).into_iter().collect();
    let (Some(outer), Some(inner)) = (outer, inner) else {
        return image;
    };

    let bounds = Roi::bounding(&outer, width, height);
    for y in bounds.y..bounds.y + bounds.height {
        for x in bounds.x..bounds.x + bounds.width {
            let p = Point2::new(x as f64, y as f64);
            if contains(&outer, &p) && !contains(&inner, &p) {
                image.put_pixel(x, y, gray(BAND));
            }
        }
    }
    image
}

fn gray(value: u8) -> Rgba<u8> {
    Rgba([value, value, value, 255])
}

/// Even-odd point in polygon test.
fn contains(polygon: &[Point2<f64>], p: &Point2<f64>) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (a, b) = (polygon[i], polygon[j]);
        if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MarkerConfig, TrackerConfig};
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_band_is_dark_and_center_is_bright() {
        let config = TrackerConfig {
            marker: MarkerConfig::square(0.03, 0.04, 0.05),
            ..Default::default()
        };
        let model = MarkerModel::from_config(&config).unwrap();
        let pose = SE3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 0.0, 0.5),
        };
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0);
        let image = render_marker(&model, &pose, &camera, 640, 480);

        // band spans 40..50 px from the center
        assert_eq!(image.get_pixel(320 + 45, 240).0[0], BAND);
        assert_eq!(image.get_pixel(320, 240 - 45).0[0], BAND);
        assert_eq!(image.get_pixel(320, 240).0[0], BACKGROUND);
        assert_eq!(image.get_pixel(320 + 60, 240).0[0], BACKGROUND);
    }
}
