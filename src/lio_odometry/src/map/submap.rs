//! Bounded window of keyframes around the current pose.

use std::collections::VecDeque;

use nalgebra::{Isometry3, Point3, Vector3};
use vgicp::filtering::voxel_downsample;

/// A scan selected for the map, stored in world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyframe {
    pub id: u64,
    pub timestamp: f64,
    pub pose: Isometry3<f64>,
    pub points: Vec<[f32; 3]>,
}

/// Read-only snapshot of the local map handed to readers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalMap {
    /// Incremented on every rebuild.
    pub version: u64,
    pub points: Vec<[f32; 3]>,
    pub keyframe_poses: Vec<Isometry3<f64>>,
}

impl LocalMap {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Keyframes in insertion order with distance and count bounds.
#[derive(Debug, Clone)]
pub struct Submap {
    keyframes: VecDeque<Keyframe>,
    max_keyframes: usize,
    removal_distance: f64,
    voxel_resolution: f32,
    next_id: u64,
}

impl Submap {
    pub fn new(max_keyframes: usize, removal_distance: f64, voxel_resolution: f64) -> Self {
        Self {
            keyframes: VecDeque::with_capacity(max_keyframes + 1),
            max_keyframes,
            removal_distance,
            voxel_resolution: voxel_resolution as f32,
            next_id: 0,
        }
    }

    /// Add a scan taken at `pose`, then evict around `pose` and drop the
    /// oldest keyframes beyond the size cap.
    ///
    /// Returns the id of the new keyframe.
    pub fn insert(&mut self, pose: &Isometry3<f64>, timestamp: f64, scan: &[[f32; 3]]) -> u64 {
        let world: Vec<[f32; 3]> = scan
            .iter()
            .map(|p| {
                let q = pose * Point3::new(p[0] as f64, p[1] as f64, p[2] as f64);
                [q.x as f32, q.y as f32, q.z as f32]
            })
            .collect();
        let id = self.next_id;
        self.next_id += 1;

        self.keyframes.push_back(Keyframe {
            id,
            timestamp,
            pose: *pose,
            points: voxel_downsample(&world, self.voxel_resolution),
        });

        self.evict(&pose.translation.vector);
        while self.keyframes.len() > self.max_keyframes {
            self.keyframes.pop_front();
        }
        id
    }

    /// Remove every point farther than the removal distance from `center`.
    ///
    /// Keyframes left without points stay in the window. Returns the
    /// number of removed points.
    pub fn evict(&mut self, center: &Vector3<f64>) -> usize {
        let max_sq = self.removal_distance * self.removal_distance;
        let mut removed = 0;

        for keyframe in &mut self.keyframes {
            let before = keyframe.points.len();
            keyframe.points.retain(|p| {
                let d = Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64) - center;
                d.norm_squared() <= max_sq
            });
            removed += before - keyframe.points.len();
        }
        removed
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &Keyframe> {
        self.keyframes.iter()
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn point_count(&self) -> usize {
        self.keyframes.iter().map(|k| k.points.len()).sum()
    }

    pub fn points(&self) -> Vec<[f32; 3]> {
        let mut points = Vec::with_capacity(self.point_count());
        for keyframe in &self.keyframes {
            points.extend_from_slice(&keyframe.points);
        }
        points
    }

    pub fn snapshot(&self, version: u64) -> LocalMap {
        LocalMap {
            version,
            points: self.points(),
            keyframe_poses: self.keyframes.iter().map(|k| k.pose).collect(),
        }
    }
}
