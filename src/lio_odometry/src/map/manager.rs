//! Keyframe selection and non-blocking local map rebuilds.
//!
//! The submap and the registration target are rebuilt on a worker thread
//! while alignment keeps using the previous target:
//!
//! - `request_update` moves the submap into a worker, which inserts the
//!   keyframe, evicts, and builds the voxel grid
//! - `swap_if_ready` joins a finished worker, installs the grid on the
//!   matcher under its lock, and swaps the published snapshot
//! - a request arriving while a worker runs replaces any earlier pending
//!   request and starts after the swap

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use nalgebra::Isometry3;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use vgicp::{VoxelGrid, VoxelGridConfig};

use super::submap::{LocalMap, Submap};
use crate::config::LioConfig;
use crate::matcher::ScanMatcher;

const LOGGER_NAME: &str = "lio_odometry.map_manager";

/// Why a map update is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapUpdateTrigger {
    /// No keyframe has been taken yet.
    FirstKeyframe,
    Translation,
    Rotation,
    Both,
}

/// Local map snapshot shared with readers.
pub type SharedLocalMap = Arc<RwLock<Arc<LocalMap>>>;

/// Worker output.
struct RebuiltMap {
    submap: Submap,
    local_map: LocalMap,
    grid: Option<Arc<VoxelGrid>>,
    elapsed_ms: f64,
}

/// Keyframe insertion request.
#[derive(Debug, Clone)]
struct KeyframeRequest {
    pose: Isometry3<f64>,
    timestamp: f64,
    points: Vec<[f32; 3]>,
}

/// Rebuild statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapStatus {
    pub rebuilding: bool,
    pub pending_request: bool,
    pub swap_count: usize,
    pub keyframes: usize,
    pub last_rebuild_ms: f64,
}

pub struct MapManager {
    translation_threshold: f64,
    rotation_threshold: f64,
    grid_config: VoxelGridConfig,

    /// `None` while a worker holds it.
    submap: Option<Submap>,
    last_keyframe_pose: Option<Isometry3<f64>>,
    version: u64,

    local_map: SharedLocalMap,
    worker: Option<JoinHandle<RebuiltMap>>,
    in_flight: Arc<AtomicBool>,
    pending: Option<KeyframeRequest>,

    swap_count: usize,
    last_rebuild_ms: f64,
    submap_template: Submap,
}

impl std::fmt::Debug for MapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapManager")
            .field("status", &self.status())
            .finish()
    }
}

impl MapManager {
    pub fn new(config: &LioConfig) -> Self {
        let submap = Submap::new(
            config.max_submap_size,
            config.map_removal_distance,
            config.voxel_map_resolution,
        );

        Self {
            translation_threshold: config.translation_threshold,
            rotation_threshold: config.rotation_threshold,
            grid_config: config.registration_config().voxel_config(),
            submap: Some(submap.clone()),
            last_keyframe_pose: None,
            version: 0,
            local_map: Arc::new(RwLock::new(Arc::new(LocalMap::default()))),
            worker: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            pending: None,
            swap_count: 0,
            last_rebuild_ms: 0.0,
            submap_template: submap,
        }
    }

    /// Handle for readers on other threads.
    pub fn shared_local_map(&self) -> SharedLocalMap {
        Arc::clone(&self.local_map)
    }

    /// Current published snapshot.
    pub fn local_map(&self) -> Arc<LocalMap> {
        Arc::clone(&self.local_map.read())
    }

    pub fn is_rebuilding(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> MapStatus {
        MapStatus {
            rebuilding: self.is_rebuilding(),
            pending_request: self.pending.is_some(),
            swap_count: self.swap_count,
            keyframes: self.submap.as_ref().map_or(0, Submap::len),
            last_rebuild_ms: self.last_rebuild_ms,
        }
    }

    /// Whether `pose` has moved far enough from the last keyframe.
    ///
    /// Both thresholds are strict: moving exactly the threshold does not
    /// trigger.
    pub fn is_update_required(&self, pose: &Isometry3<f64>) -> Option<MapUpdateTrigger> {
        let Some(last) = &self.last_keyframe_pose else {
            return Some(MapUpdateTrigger::FirstKeyframe);
        };

        let delta = last.inverse() * pose;
        let translated = delta.translation.vector.norm() > self.translation_threshold;
        let rotated = delta.rotation.angle() > self.rotation_threshold;

        match (translated, rotated) {
            (true, true) => Some(MapUpdateTrigger::Both),
            (true, false) => Some(MapUpdateTrigger::Translation),
            (false, true) => Some(MapUpdateTrigger::Rotation),
            (false, false) => None,
        }
    }

    /// Fold a scan (sensor frame) taken at `pose` into the map.
    ///
    /// Returns immediately. If a rebuild is already running the request is
    /// kept as the single pending one, replacing any earlier request, and
    /// `false` is returned.
    pub fn request_update(&mut self, pose: &Isometry3<f64>, timestamp: f64, points: &[[f32; 3]]) -> bool {
        self.last_keyframe_pose = Some(*pose);
        let request = KeyframeRequest {
            pose: *pose,
            timestamp,
            points: points.to_vec(),
        };

        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!(
                target: LOGGER_NAME,
                points = points.len(),
                "rebuild in progress, deferring keyframe"
            );
            self.pending = Some(request);
            return false;
        }

        self.spawn_rebuild(request);
        true
    }

    /// Insert a keyframe and rebuild synchronously.
    ///
    /// Used for the first map so the first steady-state cycle has a
    /// target. Returns whether a target was installed.
    pub fn build_now(
        &mut self,
        matcher: &ScanMatcher,
        pose: &Isometry3<f64>,
        timestamp: f64,
        points: &[[f32; 3]],
    ) -> bool {
        self.wait_for_rebuild(matcher);
        self.last_keyframe_pose = Some(*pose);
        let submap = self.take_submap();
        let rebuilt = rebuild(
            submap,
            self.grid_config.clone(),
            self.version + 1,
            KeyframeRequest {
                pose: *pose,
                timestamp,
                points: points.to_vec(),
            },
        );
        let installed = rebuilt.grid.is_some();
        self.apply(rebuilt, matcher);
        installed
    }

    /// Install a finished rebuild, if any. Never blocks on the worker.
    pub fn swap_if_ready(&mut self, matcher: &ScanMatcher) -> bool {
        if !self.worker.as_ref().is_some_and(|w| w.is_finished()) {
            return false;
        }
        self.join_and_apply(matcher)
    }

    /// Block until the running rebuild and any pending request are done.
    ///
    /// Returns whether anything was swapped in.
    pub fn wait_for_rebuild(&mut self, matcher: &ScanMatcher) -> bool {
        let mut swapped = false;
        while self.worker.is_some() {
            swapped |= self.join_and_apply(matcher);
        }
        swapped
    }

    fn take_submap(&mut self) -> Submap {
        self.submap
            .take()
            .unwrap_or_else(|| self.submap_template.clone())
    }

    fn spawn_rebuild(&mut self, request: KeyframeRequest) {
        let submap = self.take_submap();
        let grid_config = self.grid_config.clone();
        let version = self.version + 1;

        self.worker = Some(thread::spawn(move || {
            rebuild(submap, grid_config, version, request)
        }));
    }

    fn join_and_apply(&mut self, matcher: &ScanMatcher) -> bool {
        let Some(handle) = self.worker.take() else {
            return false;
        };

        let swapped = match handle.join() {
            Ok(rebuilt) => {
                self.apply(rebuilt, matcher);
                true
            }
            Err(_) => {
                warn!(target: LOGGER_NAME, "map rebuild worker panicked, keeping previous map");
                false
            }
        };

        self.in_flight.store(false, Ordering::SeqCst);
        if let Some(request) = self.pending.take() {
            debug!(target: LOGGER_NAME, "starting deferred keyframe rebuild");
            self.in_flight.store(true, Ordering::SeqCst);
            self.spawn_rebuild(request);
        }
        swapped
    }

    fn apply(&mut self, rebuilt: RebuiltMap, matcher: &ScanMatcher) {
        if let Some(grid) = rebuilt.grid {
            matcher.set_target_grid(grid);
        }
        self.version = rebuilt.local_map.version;
        info!(
            target: LOGGER_NAME,
            version = self.version,
            keyframes = rebuilt.submap.len(),
            points = rebuilt.local_map.len(),
            elapsed_ms = rebuilt.elapsed_ms,
            "local map swapped"
        );
        *self.local_map.write() = Arc::new(rebuilt.local_map);
        self.submap = Some(rebuilt.submap);
        self.swap_count += 1;
        self.last_rebuild_ms = rebuilt.elapsed_ms;
    }
}

fn rebuild(
    mut submap: Submap,
    grid_config: VoxelGridConfig,
    version: u64,
    request: KeyframeRequest,
) -> RebuiltMap {
    let start = Instant::now();
    submap.insert(&request.pose, request.timestamp, &request.points);
    let local_map = submap.snapshot(version);

    let grid = match VoxelGrid::from_points_with_config(&local_map.points, grid_config) {
        Ok(grid) => Some(Arc::new(grid)),
        Err(e) => {
            warn!(target: LOGGER_NAME, "could not build map target: {e:#}");
            None
        }
    };

    RebuiltMap {
        submap,
        local_map,
        grid,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};
    use vgicp::test_utils::make_half_cubic_pcd;

    fn config() -> LioConfig {
        LioConfig {
            translation_threshold: 0.2,
            rotation_threshold: 0.3,
            max_submap_size: 5,
            map_removal_distance: 50.0,
            voxel_map_resolution: 0.5,
            ..Default::default()
        }
    }

    fn setup() -> (MapManager, ScanMatcher) {
        let config = config();
        (MapManager::new(&config), ScanMatcher::new(&config).unwrap())
    }

    #[test]
    fn test_translation_trigger_is_cumulative() {
        let (mut manager, matcher) = setup();
        let scan = make_half_cubic_pcd(5.0, 0.25);
        manager.build_now(&matcher, &Isometry3::identity(), 0.0, &scan);

        assert_eq!(manager.is_update_required(&Isometry3::translation(0.15, 0.0, 0.0)), None);
        assert_eq!(
            manager.is_update_required(&Isometry3::translation(0.25, 0.0, 0.0)),
            Some(MapUpdateTrigger::Translation)
        );
    }

    #[test]
    fn test_rotation_and_both_triggers() {
        let (mut manager, matcher) = setup();
        assert_eq!(
            manager.is_update_required(&Isometry3::identity()),
            Some(MapUpdateTrigger::FirstKeyframe)
        );
        manager.build_now(&matcher, &Isometry3::identity(), 0.0, &make_half_cubic_pcd(5.0, 0.25));

        let yawed = Isometry3::from_parts(
            Vector3::zeros().into(),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4),
        );
        assert_eq!(manager.is_update_required(&yawed), Some(MapUpdateTrigger::Rotation));

        let both = Isometry3::from_parts(
            Vector3::new(1.0, 0.0, 0.0).into(),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4),
        );
        assert_eq!(manager.is_update_required(&both), Some(MapUpdateTrigger::Both));
    }

    #[test]
    fn test_exact_threshold_does_not_trigger() {
        let mut config = config();
        // Exactly representable, so the offset norm equals the threshold.
        config.translation_threshold = 0.125;
        let mut manager = MapManager::new(&config);
        let matcher = ScanMatcher::new(&config).unwrap();
        manager.build_now(&matcher, &Isometry3::identity(), 0.0, &make_half_cubic_pcd(5.0, 0.25));

        assert_eq!(manager.is_update_required(&Isometry3::translation(0.125, 0.0, 0.0)), None);
    }

    #[test]
    fn test_initial_build_installs_target() {
        let (mut manager, matcher) = setup();
        assert!(!matcher.has_target());
        assert!(manager.local_map().is_empty());

        assert!(manager.build_now(&matcher, &Isometry3::identity(), 0.0, &make_half_cubic_pcd(5.0, 0.25)));
        assert!(matcher.has_target());
        assert!(!manager.local_map().is_empty());
        assert_eq!(manager.local_map().version, 1);
    }

    #[test]
    fn test_submap_bounded_after_six_updates() {
        let (mut manager, matcher) = setup();
        let scan = make_half_cubic_pcd(5.0, 0.25);

        for i in 0..6 {
            let pose = Isometry3::translation(i as f64 * 0.5, 0.0, 0.0);
            manager.request_update(&pose, i as f64, &scan);
            manager.wait_for_rebuild(&matcher);
        }

        let map = manager.local_map();
        assert_eq!(map.keyframe_poses.len(), 5);
        assert_eq!(manager.status().keyframes, 5);
        // The five most recent keyframes remain.
        assert_eq!(map.keyframe_poses[0].translation.vector.x, 0.5);
        assert_eq!(map.keyframe_poses[4].translation.vector.x, 2.5);
    }

    #[test]
    fn test_eviction_after_update() {
        let mut config = config();
        config.map_removal_distance = 6.0;
        config.max_submap_size = 10;
        let mut manager = MapManager::new(&config);
        let matcher = ScanMatcher::new(&config).unwrap();
        let scan = make_half_cubic_pcd(5.0, 0.25);

        let mut last = Isometry3::identity();
        for i in 0..4 {
            last = Isometry3::translation(i as f64 * 2.0, 0.0, 0.0);
            manager.request_update(&last, i as f64, &scan);
            manager.wait_for_rebuild(&matcher);
        }

        let center = last.translation.vector;
        for p in &manager.local_map().points {
            let d = Vector3::new(p[0] as f64, p[1] as f64, p[2] as f64) - center;
            assert!(d.norm() <= 6.0 + 1e-6, "point {p:?} too far");
        }
    }

    #[test]
    fn test_single_rebuild_in_flight() {
        let (mut manager, matcher) = setup();
        let scan = make_half_cubic_pcd(5.0, 0.25);

        assert!(manager.request_update(&Isometry3::identity(), 0.0, &scan));
        assert!(manager.is_rebuilding());

        // Deferred while the first worker is unjoined; the latest wins.
        assert!(!manager.request_update(&Isometry3::translation(1.0, 0.0, 0.0), 1.0, &scan));
        assert!(!manager.request_update(&Isometry3::translation(2.0, 0.0, 0.0), 2.0, &scan));
        assert!(manager.status().pending_request);

        manager.wait_for_rebuild(&matcher);
        assert!(!manager.is_rebuilding());
        assert!(!manager.status().pending_request);

        let map = manager.local_map();
        let xs: Vec<f64> = map.keyframe_poses.iter().map(|p| p.translation.vector.x).collect();
        assert_eq!(xs, vec![0.0, 2.0]);
        assert_eq!(manager.status().swap_count, 2);
    }

    #[test]
    fn test_previous_map_visible_until_swap() {
        let (mut manager, matcher) = setup();
        let scan = make_half_cubic_pcd(5.0, 0.25);
        manager.build_now(&matcher, &Isometry3::identity(), 0.0, &scan);
        let before = manager.local_map();

        manager.request_update(&Isometry3::translation(1.0, 0.0, 0.0), 1.0, &scan);
        assert_eq!(manager.local_map().version, before.version);

        while !manager.swap_if_ready(&matcher) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(manager.local_map().version, before.version + 1);
        assert_eq!(manager.local_map().keyframe_poses.len(), 2);
    }
}
