//! Nearest-neighbour index over 3D points.
//!
//! A kiddo bucket cannot be split when every point in it shares the value
//! on the split axis. Structured scenes produce exactly that: floors and
//! walls put thousands of points on one axis-aligned coordinate, and
//! sensors report missing returns at the origin. The index therefore keeps
//! each distinct point once and stores it in a fixed oblique frame, where
//! distinct points of an axis-aligned plane no longer share coordinates.
//! Distances do not change under rotation, so queries only rotate the
//! query point. Inputs that still pile up on one coordinate are searched
//! linearly.

use std::collections::HashSet;

use kiddo::float::kdtree::KdTree;
use kiddo::SquaredEuclidean;
use nalgebra::{Rotation3, Vector3};

/// Bucket size for the KD-tree.
pub const BUCKET_SIZE: usize = 64;

type Tree = KdTree<f64, u64, 3, BUCKET_SIZE, u32>;

#[derive(Debug)]
enum Backend {
    Tree(Tree),
    Linear,
}

/// Frame the points are indexed in. Every entry of the matrix is far from
/// zero, so no input axis maps onto an index axis.
fn index_frame() -> Rotation3<f64> {
    Rotation3::from_euler_angles(0.3711, 0.5827, 0.9132)
}

/// KD-tree over the distinct finite points of a cloud.
#[derive(Debug)]
pub struct PointIndex {
    frame: Rotation3<f64>,
    /// Distinct points in the index frame.
    points: Vec<[f64; 3]>,
    /// Input position of each distinct point (first occurrence).
    items: Vec<usize>,
    backend: Backend,
}

impl PointIndex {
    /// Index `points`. Non-finite points are skipped and exact duplicates
    /// collapse onto their first occurrence.
    ///
    /// Returns `None` when no finite point remains.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = Vector3<f64>>,
    {
        let frame = index_frame();
        let mut seen = HashSet::new();
        let mut rotated = Vec::new();
        let mut items = Vec::new();

        for (i, p) in points.into_iter().enumerate() {
            if !p.iter().all(|c| c.is_finite()) {
                continue;
            }
            // Adding zero folds -0.0 into 0.0.
            let key = [(p.x + 0.0).to_bits(), (p.y + 0.0).to_bits(), (p.z + 0.0).to_bits()];
            if !seen.insert(key) {
                continue;
            }
            let q = frame * p;
            rotated.push([q.x, q.y, q.z]);
            items.push(i);
        }

        if rotated.is_empty() {
            return None;
        }

        let backend = if max_axis_multiplicity(&rotated) < BUCKET_SIZE {
            let mut tree = Tree::with_capacity(rotated.len());
            for (i, p) in rotated.iter().enumerate() {
                tree.add(p, i as u64);
            }
            Backend::Tree(tree)
        } else {
            Backend::Linear
        };

        Some(Self {
            frame,
            points: rotated,
            items,
            backend,
        })
    }

    /// Number of distinct indexed points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether the KD-tree is in use rather than the linear scan.
    pub fn is_tree(&self) -> bool {
        matches!(self.backend, Backend::Tree(_))
    }

    fn to_frame(&self, query: &Vector3<f64>) -> Option<[f64; 3]> {
        if !query.iter().all(|c| c.is_finite()) {
            return None;
        }
        let q = self.frame * query;
        Some([q.x, q.y, q.z])
    }

    /// Input position and squared distance of the point nearest to `query`.
    ///
    /// `None` for a non-finite query.
    pub fn nearest(&self, query: &Vector3<f64>) -> Option<(usize, f64)> {
        let q = self.to_frame(query)?;
        let (slot, dist_sq) = match &self.backend {
            Backend::Tree(tree) => {
                let nn = tree.nearest_one::<SquaredEuclidean>(&q);
                (nn.item as usize, nn.distance)
            }
            Backend::Linear => self
                .points
                .iter()
                .enumerate()
                .map(|(i, p)| (i, squared_distance(p, &q)))
                .min_by(|a, b| a.1.total_cmp(&b.1))?,
        };
        Some((self.items[slot], dist_sq))
    }

    /// Input positions and squared distances of all points within
    /// `radius` of `query`, nearest first.
    pub fn within(&self, query: &Vector3<f64>, radius: f64) -> Vec<(usize, f64)> {
        let Some(q) = self.to_frame(query) else {
            return Vec::new();
        };
        let radius_sq = radius * radius;

        match &self.backend {
            Backend::Tree(tree) => tree
                .within::<SquaredEuclidean>(&q, radius_sq)
                .into_iter()
                .map(|nn| (self.items[nn.item as usize], nn.distance))
                .collect(),
            Backend::Linear => {
                let mut found: Vec<(usize, f64)> = self
                    .points
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (self.items[i], squared_distance(p, &q)))
                    .filter(|(_, d)| *d <= radius_sq)
                    .collect();
                found.sort_by(|a, b| a.1.total_cmp(&b.1));
                found
            }
        }
    }
}

fn squared_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (0..3).map(|i| (a[i] - b[i]) * (a[i] - b[i])).sum()
}

/// Largest number of points sharing one value on any axis.
fn max_axis_multiplicity(points: &[[f64; 3]]) -> usize {
    (0..3)
        .map(|axis| {
            let mut values: Vec<f64> = points.iter().map(|p| p[axis]).collect();
            values.sort_unstable_by(f64::total_cmp);
            values
                .chunk_by(|a, b| a == b)
                .map(<[f64]>::len)
                .max()
                .unwrap_or(0)
        })
        .max()
        .unwrap_or(0)
}
