//! Synthetic point clouds for tests and demos.

use nalgebra::{Isometry3, Point3};

/// Three orthogonal square planes meeting at the origin.
///
/// The floor spans `z = 0`, the walls `x = 0` and `y = 0`, each with side
/// `length` and grid spacing `interval`. All six degrees of freedom are
/// observable, which makes it a convenient registration target.
pub fn make_half_cubic_pcd(length: f32, interval: f32) -> Vec<[f32; 3]> {
    let steps = (length / interval) as usize + 1;
    let mut points = Vec::with_capacity(3 * steps * steps);

    for i in 0..steps {
        let v = interval * i as f32;
        for j in 0..steps {
            let u = interval * j as f32;
            points.push([u, v, 0.0]);
            points.push([0.0, u, v]);
            points.push([u, 0.0, v]);
        }
    }

    points
}

/// Square grid in the plane `z = height`.
pub fn make_xy_plane(size: f32, interval: f32, height: f32) -> Vec<[f32; 3]> {
    let steps = (size / interval) as usize + 1;
    (0..steps * steps)
        .map(|n| {
            let (i, j) = (n / steps, n % steps);
            [interval * j as f32, interval * i as f32, height]
        })
        .collect()
}

/// Apply `pose` to every point.
pub fn transform_points(points: &[[f32; 3]], pose: &Isometry3<f64>) -> Vec<[f32; 3]> {
    points
        .iter()
        .map(|p| {
            let q = pose * Point3::new(p[0] as f64, p[1] as f64, p[2] as f64);
            [q.x as f32, q.y as f32, q.z as f32]
        })
        .collect()
}
