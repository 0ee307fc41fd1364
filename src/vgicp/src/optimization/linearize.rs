//! Linearization of the distribution-to-distribution cost.
//!
//! For a source point `p` with covariance `C_p` matched to a voxel with mean
//! `mu` and covariance `C_v`, the residual is
//!
//! ```text
//! e = mu - (R p + t)
//! W = (C_v + R C_p R^T)^-1
//! cost = e^T W e
//! ```
//!
//! Under the right perturbation `t' = t + R rho`, `R' = R Exp(phi)` the
//! Jacobian of `e` with respect to `[rho, phi]` is `[-R, R [p]x]`.

use std::ops::Add;

use nalgebra::{Isometry3, Matrix3, Matrix6, SMatrix, Vector3, Vector6};
use rayon::prelude::*;

use super::types::skew;
use crate::covariance::SourceCloud;
use crate::voxel_grid::VoxelGrid;

/// Summed normal equations over all correspondences.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub hessian: Matrix6<f64>,
    pub gradient: Vector6<f64>,
    pub error: f64,
    pub num_correspondences: usize,
}

impl Default for Linearization {
    fn default() -> Self {
        Self {
            hessian: Matrix6::zeros(),
            gradient: Vector6::zeros(),
            error: 0.0,
            num_correspondences: 0,
        }
    }
}

impl Add for Linearization {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            hessian: self.hessian + rhs.hessian,
            gradient: self.gradient + rhs.gradient,
            error: self.error + rhs.error,
            num_correspondences: self.num_correspondences + rhs.num_correspondences,
        }
    }
}

/// A matched source point: residual and inverse combined covariance.
struct Correspondence {
    residual: Vector3<f64>,
    weight: Matrix3<f64>,
}

fn correspond(
    point: &Vector3<f64>,
    covariance: &Matrix3<f64>,
    pose: &Isometry3<f64>,
    target: &VoxelGrid,
    max_distance: f32,
) -> Option<Correspondence> {
    let transformed = pose * nalgebra::Point3::from(*point);
    let query = [
        transformed.x as f32,
        transformed.y as f32,
        transformed.z as f32,
    ];
    let voxel = target.nearest_within(&query, max_distance)?;

    let rotation = pose.rotation.to_rotation_matrix();
    let r = rotation.matrix();
    let combined = voxel.covariance + r * covariance * r.transpose();
    let weight = combined.try_inverse()?;

    Some(Correspondence {
        residual: voxel.mean - transformed.coords,
        weight,
    })
}

/// Build the normal equations at `pose`.
pub fn linearize(
    source: &SourceCloud,
    target: &VoxelGrid,
    pose: &Isometry3<f64>,
    max_correspondence_distance: f64,
) -> Linearization {
    let max_distance = max_correspondence_distance as f32;
    let rotation = pose.rotation.to_rotation_matrix();
    let r = *rotation.matrix();

    source
        .points
        .par_iter()
        .zip(source.covariances.par_iter())
        .filter_map(|(p, c)| {
            let corr = correspond(p, c, pose, target, max_distance)?;

            let mut jacobian = SMatrix::<f64, 3, 6>::zeros();
            jacobian.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-r));
            jacobian
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(r * skew(p)));

            let jt_w = jacobian.transpose() * corr.weight;
            Some(Linearization {
                hessian: jt_w * jacobian,
                gradient: jt_w * corr.residual,
                error: corr.residual.dot(&(corr.weight * corr.residual)),
                num_correspondences: 1,
            })
        })
        .reduce(Linearization::default, |a, b| a + b)
}

/// Total cost and correspondence count at `pose` without derivatives.
pub fn evaluate_error(
    source: &SourceCloud,
    target: &VoxelGrid,
    pose: &Isometry3<f64>,
    max_correspondence_distance: f64,
) -> (f64, usize) {
    let max_distance = max_correspondence_distance as f32;
    source
        .points
        .par_iter()
        .zip(source.covariances.par_iter())
        .filter_map(|(p, c)| {
            let corr = correspond(p, c, pose, target, max_distance)?;
            Some((corr.residual.dot(&(corr.weight * corr.residual)), 1usize))
        })
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
}
