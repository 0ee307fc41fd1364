//! Synthetic sensor streams for tests and the replay binary.
//!
//! The platform stands still, accelerates uniformly along a fixed
//! direction, then keeps a constant velocity. Orientation stays level and
//! world-aligned. The world frame is the sensor pose at `t = 0`.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::types::{ImuSample, LidarScan};

/// Motion profile and sensor rates.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub imu_rate: f64,
    pub scan_rate: f64,
    /// Time at rest before the platform starts moving.
    pub static_duration: f64,
    /// Time spent reaching `velocity`.
    pub acceleration_duration: f64,
    /// Total simulated time.
    pub duration: f64,
    /// Cruise velocity in the world frame.
    pub velocity: Vector3<f64>,
    pub gravity: f64,
    pub gyro_noise: f64,
    pub accel_noise: f64,
    /// Standard deviation added to every scan point.
    pub point_noise: f32,
    /// Sweep length; when positive, scans carry per-point time offsets in
    /// `[-sweep_duration, 0]` and points are captured along the motion.
    pub sweep_duration: f64,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            imu_rate: 200.0,
            scan_rate: 10.0,
            static_duration: 2.0,
            acceleration_duration: 0.5,
            duration: 5.0,
            velocity: Vector3::new(0.8, 0.2, 0.0),
            gravity: 9.80665,
            gyro_noise: 1e-3,
            accel_noise: 1e-2,
            point_noise: 0.01,
            sweep_duration: 0.0,
            seed: 42,
        }
    }
}

/// Generated streams plus the true sensor trajectory.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub imu: Vec<ImuSample>,
    pub scans: Vec<LidarScan>,
    pub config: SimulationConfig,
}

/// Floor and four walls around the start position.
///
/// The walls sit at different distances so the room has no rotational
/// symmetry. The sensor starts 1.5 m above the floor.
pub fn make_room(spacing: f32) -> Vec<[f32; 3]> {
    let (x_min, x_max, y_min, y_max) = (-8.0f32, 12.0f32, -6.0f32, 5.0f32);
    let (floor, ceiling) = (-1.5f32, 2.5f32);
    let grid = |from: f32, to: f32| {
        let steps = ((to - from) / spacing) as usize + 1;
        (0..steps).map(move |i| from + spacing * i as f32)
    };

    let mut points = Vec::new();
    for x in grid(x_min, x_max) {
        for y in grid(y_min, y_max) {
            points.push([x, y, floor]);
        }
        for z in grid(floor, ceiling) {
            points.push([x, y_min, z]);
            points.push([x, y_max, z]);
        }
    }
    for y in grid(y_min, y_max) {
        for z in grid(floor, ceiling) {
            points.push([x_min, y, z]);
            points.push([x_max, y, z]);
        }
    }
    points
}

impl SimulationConfig {
    fn acceleration(&self) -> Vector3<f64> {
        self.velocity / self.acceleration_duration
    }

    /// True sensor position at `t`.
    pub fn position(&self, t: f64) -> Vector3<f64> {
        let moving = (t - self.static_duration).max(0.0);
        let ramp = moving.min(self.acceleration_duration);
        let cruise = (moving - self.acceleration_duration).max(0.0);
        0.5 * self.acceleration() * ramp * ramp + self.velocity * cruise
    }

    pub fn velocity_at(&self, t: f64) -> Vector3<f64> {
        let moving = (t - self.static_duration).max(0.0);
        self.acceleration() * moving.min(self.acceleration_duration)
    }

    fn acceleration_at(&self, t: f64) -> Vector3<f64> {
        let moving = t - self.static_duration;
        if moving >= 0.0 && moving < self.acceleration_duration {
            self.acceleration()
        } else {
            Vector3::zeros()
        }
    }

    pub fn pose(&self, t: f64) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.position(t)), UnitQuaternion::identity())
    }
}

impl Simulation {
    /// Generate IMU and scan streams observing `world`.
    pub fn generate(config: SimulationConfig, world: &[[f32; 3]]) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let gyro_noise = Normal::new(0.0, config.gyro_noise).ok();
        let accel_noise = Normal::new(0.0, config.accel_noise).ok();
        let point_noise = Normal::new(0.0f32, config.point_noise).ok();
        let gravity = Vector3::new(0.0, 0.0, config.gravity);

        let imu_steps = (config.duration * config.imu_rate) as usize;
        let mut imu = Vec::with_capacity(imu_steps + 1);
        for i in 0..=imu_steps {
            let t = i as f64 / config.imu_rate;
            let specific_force = config.acceleration_at(t) + gravity;
            imu.push(ImuSample::new(
                t,
                sample_vector(gyro_noise, &mut rng),
                specific_force + sample_vector(accel_noise, &mut rng),
            ));
        }

        let scan_steps = (config.duration * config.scan_rate) as usize;
        let mut scans = Vec::with_capacity(scan_steps);
        for k in 1..=scan_steps {
            let t = k as f64 / config.scan_rate;
            let count = world.len().max(1);
            let mut times = Vec::with_capacity(world.len());

            let points = world
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let tau = if config.sweep_duration > 0.0 {
                        -config.sweep_duration * (1.0 - i as f64 / count as f64)
                    } else {
                        0.0
                    };
                    times.push(tau as f32);
                    let local = config.pose(t + tau).inverse()
                        * Point3::new(p[0] as f64, p[1] as f64, p[2] as f64);
                    let mut jitter = || point_noise.map_or(0.0, |d| d.sample(&mut rng));
                    [
                        local.x as f32 + jitter(),
                        local.y as f32 + jitter(),
                        local.z as f32 + jitter(),
                    ]
                })
                .collect();

            let scan = LidarScan::new(t, points);
            scans.push(if config.sweep_duration > 0.0 {
                scan.with_point_times(times)
            } else {
                scan
            });
        }

        Self { imu, scans, config }
    }

    /// Ground-truth pose at `t`.
    pub fn pose(&self, t: f64) -> Isometry3<f64> {
        self.config.pose(t)
    }
}

fn sample_vector(dist: Option<Normal<f64>>, rng: &mut StdRng) -> Vector3<f64> {
    Vector3::from_fn(|_, _| dist.map_or(0.0, |d| d.sample(&mut *rng)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_motion_profile_is_continuous() {
        let config = SimulationConfig::default();
        let end_of_ramp = config.static_duration + config.acceleration_duration;

        assert_eq!(config.position(1.0), Vector3::zeros());
        assert_relative_eq!(config.velocity_at(end_of_ramp), config.velocity, epsilon = 1e-12);
        assert_relative_eq!(
            config.position(end_of_ramp + 1.0) - config.position(end_of_ramp),
            config.velocity,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_static_imu_reads_gravity() {
        let config = SimulationConfig {
            duration: 1.0,
            ..Default::default()
        };
        let sim = Simulation::generate(config, &[[1.0, 0.0, 0.0]]);

        assert_eq!(sim.imu.len(), 201);
        let mean_z = sim.imu.iter().map(|s| s.linear_acceleration.z).sum::<f64>() / 201.0;
        assert_relative_eq!(mean_z, 9.80665, epsilon = 0.01);
        assert_eq!(sim.scans.len(), 10);
        assert!(sim.scans.iter().all(|s| s.point_times.is_none()));
    }

    #[test]
    fn test_scans_in_sensor_frame() {
        let config = SimulationConfig {
            point_noise: 0.0,
            ..Default::default()
        };
        let sim = Simulation::generate(config, &[[10.0, 0.0, 0.0]]);
        let last = sim.scans.last().unwrap();
        let expected = 10.0 - sim.pose(last.timestamp).translation.vector.x;
        assert_relative_eq!(last.points[0][0] as f64, expected, epsilon = 1e-4);
    }

    #[test]
    fn test_sweep_attaches_point_times() {
        let config = SimulationConfig {
            duration: 0.5,
            sweep_duration: 0.1,
            ..Default::default()
        };
        let sim = Simulation::generate(config, &make_room(1.0));
        let scan = &sim.scans[0];
        let times = scan.point_times.as_ref().unwrap();
        assert_eq!(times.len(), scan.len());
        assert!(times.iter().all(|&t| (-0.1..=0.0).contains(&t)));
    }

    #[test]
    fn test_room_is_asymmetric() {
        let room = make_room(0.5);
        let max_x = room.iter().map(|p| p[0]).fold(f32::MIN, f32::max);
        let min_x = room.iter().map(|p| p[0]).fold(f32::MAX, f32::min);
        assert_eq!(max_x, 12.0);
        assert_eq!(min_x, -8.0);
    }
}
