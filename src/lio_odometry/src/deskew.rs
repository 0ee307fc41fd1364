//! Motion compensation for scans with per-point timestamps.
//!
//! The platform is assumed to move with a constant body twist during the
//! sweep. A point captured at offset `tau` from the scan timestamp is
//! moved into the scan-time frame by `p' = Exp(w tau) p + v tau`.

use nalgebra::{Point3, UnitQuaternion, Vector3};
use tracing::warn;

use crate::types::LidarScan;

const LOGGER_NAME: &str = "lio_odometry.deskew";

/// Constant body-frame velocity over one sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyTwist {
    pub linear: Vector3<f64>,
    pub angular: Vector3<f64>,
}

/// Points of `scan` expressed at the scan timestamp.
///
/// Scans without per-point times, or with a mismatched count, are returned
/// unchanged.
pub fn deskew_scan(scan: &LidarScan, twist: &BodyTwist) -> Vec<[f32; 3]> {
    let Some(times) = &scan.point_times else {
        return scan.points.clone();
    };
    if times.len() != scan.points.len() {
        warn!(
            target: LOGGER_NAME,
            points = scan.points.len(),
            times = times.len(),
            "point time count mismatch, skipping deskew"
        );
        return scan.points.clone();
    }

    scan.points
        .iter()
        .zip(times)
        .map(|(p, &tau)| {
            let tau = tau as f64;
            let rotation = UnitQuaternion::from_scaled_axis(twist.angular * tau);
            let q = rotation * Point3::new(p[0] as f64, p[1] as f64, p[2] as f64)
                + twist.linear * tau;
            [q.x as f32, q.y as f32, q.z as f32]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_no_times_passthrough() {
        let scan = LidarScan::new(1.0, vec![[1.0, 2.0, 3.0]]);
        let twist = BodyTwist {
            linear: Vector3::new(1.0, 0.0, 0.0),
            angular: Vector3::zeros(),
        };
        assert_eq!(deskew_scan(&scan, &twist), scan.points);
    }

    #[test]
    fn test_translation_compensated() {
        // Moving forward at 2 m/s, a wall point seen 0.1 s early appears
        // 0.2 m farther away than it does at scan time.
        let scan = LidarScan::new(1.0, vec![[10.2, 0.0, 0.0], [10.0, 0.0, 0.0]])
            .with_point_times(vec![-0.1, 0.0]);
        let twist = BodyTwist {
            linear: Vector3::new(2.0, 0.0, 0.0),
            angular: Vector3::zeros(),
        };

        let out = deskew_scan(&scan, &twist);
        assert_relative_eq!(out[0][0], 10.0, epsilon = 1e-5);
        assert_relative_eq!(out[1][0], 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rotation_compensated() {
        let scan = LidarScan::new(0.0, vec![[1.0, 0.0, 0.0]]).with_point_times(vec![-0.5]);
        let twist = BodyTwist {
            linear: Vector3::zeros(),
            angular: Vector3::new(0.0, 0.0, std::f64::consts::PI),
        };
        // Half a second at pi rad/s is a quarter turn back.
        let out = deskew_scan(&scan, &twist);
        assert_relative_eq!(out[0][0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out[0][1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_mismatched_times_ignored() {
        let scan = LidarScan::new(0.0, vec![[1.0, 0.0, 0.0]]).with_point_times(vec![]);
        let twist = BodyTwist {
            linear: Vector3::new(1.0, 0.0, 0.0),
            angular: Vector3::zeros(),
        };
        assert_eq!(deskew_scan(&scan, &twist), scan.points);
    }
}
