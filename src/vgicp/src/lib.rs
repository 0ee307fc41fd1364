//! Voxelized GICP scan-to-map registration on the CPU.
//!
//! # Architecture
//!
//! - `voxel_grid`: map points summarized as one Gaussian per voxel, with a
//!   KD-tree over the voxel means
//! - `covariance`: per-point plane-like covariances for the source scan
//! - `optimization`: damped Gauss-Newton over SE(3)
//! - `filtering`: crop box and voxel downsampling for raw scans
//! - `spatial`: KD-tree index shared by the covariance and voxel searches
//!
//! [`Vgicp`] wraps the pieces behind a set-target / align interface.

pub mod covariance;
pub mod filtering;
pub mod optimization;
pub mod registration;
pub mod spatial;
pub mod test_utils;
pub mod voxel_grid;

pub use covariance::{estimate_covariances, CovarianceConfig, SourceCloud};
pub use filtering::{filter_points, CropBox, CropMode, FilterParams, FilterResult};
pub use optimization::{apply_increment, skew, ConvergenceStatus, RegistrationResult, SolverConfig};
pub use registration::{AlignResult, Vgicp, VgicpBuilder, VgicpConfig};
pub use spatial::PointIndex;
pub use voxel_grid::{Voxel, VoxelGrid, VoxelGridConfig};
