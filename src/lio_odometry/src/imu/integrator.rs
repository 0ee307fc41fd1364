//! IMU preintegration and state prediction.
//!
//! Readings are held constant from their timestamp until the next sample
//! (zero-order hold). The interval before the first sample uses the first
//! sample and the tail up to the target time uses the last sample at or
//! before it. Rotation is accumulated multiplicatively.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use crate::config::ImuNoise;
use crate::types::{
    ImuBias, ImuSample, NavState, StateCovariance, ERR_BA, ERR_BG, ERR_POS, ERR_ROT, ERR_VEL,
};
use vgicp::skew;

/// Relative motion between two timestamps, expressed in the body frame at
/// the start time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preintegration {
    pub delta_rotation: UnitQuaternion<f64>,
    pub delta_velocity: Vector3<f64>,
    pub delta_position: Vector3<f64>,
    pub duration: f64,
}

impl Default for Preintegration {
    fn default() -> Self {
        Self {
            delta_rotation: UnitQuaternion::identity(),
            delta_velocity: Vector3::zeros(),
            delta_position: Vector3::zeros(),
            duration: 0.0,
        }
    }
}

/// Predicted state with its propagated error-state covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub state: NavState,
    pub covariance: StateCovariance,
}

/// Split `[start, end]` into constant-reading segments.
///
/// Returns `(sample, dt)` pairs with positive `dt` summing to
/// `end - start`, or nothing when `samples` is empty or `end <= start`.
pub fn zero_order_hold(samples: &[ImuSample], start: f64, end: f64) -> Vec<(ImuSample, f64)> {
    let mut segments = Vec::with_capacity(samples.len() + 1);
    let mut t = start;

    for (i, sample) in samples.iter().enumerate() {
        let next = samples.get(i + 1).map_or(end, |n| n.timestamp.min(end));
        if next > t {
            segments.push((*sample, next - t));
            t = next;
        }
    }

    segments
}

/// Bias-corrected preintegration plus covariance propagation.
#[derive(Debug, Clone)]
pub struct ImuIntegrator {
    gravity: Vector3<f64>,
    noise: ImuNoise,
}

impl ImuIntegrator {
    pub fn new(gravity: f64, noise: ImuNoise) -> Self {
        Self {
            gravity: Vector3::new(0.0, 0.0, -gravity),
            noise,
        }
    }

    /// Gravity vector in the world frame.
    pub fn gravity(&self) -> &Vector3<f64> {
        &self.gravity
    }

    pub fn preintegrate(
        &self,
        bias: &ImuBias,
        samples: &[ImuSample],
        start: f64,
        end: f64,
    ) -> Preintegration {
        zero_order_hold(samples, start, end)
            .into_iter()
            .fold(Preintegration::default(), |mut acc, (sample, dt)| {
                let omega = sample.angular_velocity - bias.gyro;
                let accel = acc.delta_rotation * (sample.linear_acceleration - bias.accel);

                acc.delta_position += acc.delta_velocity * dt + 0.5 * accel * dt * dt;
                acc.delta_velocity += accel * dt;
                acc.delta_rotation *= UnitQuaternion::from_scaled_axis(omega * dt);
                acc.duration += dt;
                acc
            })
    }

    /// Propagate `state` to `target_time`.
    ///
    /// A target at or before the state time returns the state unchanged.
    /// Without samples the velocity is held constant.
    pub fn predict(
        &self,
        state: &NavState,
        covariance: &StateCovariance,
        samples: &[ImuSample],
        target_time: f64,
    ) -> Prediction {
        let dt_total = target_time - state.timestamp;
        if dt_total <= 0.0 {
            return Prediction {
                state: *state,
                covariance: *covariance,
            };
        }

        let segments = zero_order_hold(samples, state.timestamp, target_time);
        if segments.is_empty() {
            let mut predicted = *state;
            predicted.timestamp = target_time;
            predicted.position += state.velocity * dt_total;
            return Prediction {
                state: predicted,
                covariance: *covariance,
            };
        }

        let pre = self.preintegrate(&state.bias, samples, state.timestamp, target_time);
        let r0 = state.orientation;
        let t = pre.duration;

        let predicted = NavState {
            timestamp: target_time,
            position: state.position
                + state.velocity * t
                + 0.5 * self.gravity * t * t
                + r0 * pre.delta_position,
            orientation: r0 * pre.delta_rotation,
            velocity: state.velocity + self.gravity * t + r0 * pre.delta_velocity,
            bias: state.bias,
        };

        Prediction {
            state: predicted,
            covariance: self.propagate_covariance(state, covariance, &segments),
        }
    }

    /// Discrete error-state propagation `P <- F P F^T + Q` per segment.
    fn propagate_covariance(
        &self,
        state: &NavState,
        covariance: &StateCovariance,
        segments: &[(ImuSample, f64)],
    ) -> StateCovariance {
        let identity = Matrix3::<f64>::identity();
        let mut rotation = state.orientation;
        let mut p = *covariance;

        for (sample, dt) in segments {
            let dt = *dt;
            let omega = sample.angular_velocity - state.bias.gyro;
            let accel = sample.linear_acceleration - state.bias.accel;
            let r = rotation.to_rotation_matrix().into_inner();
            let step = UnitQuaternion::from_scaled_axis(omega * dt);

            let mut f = StateCovariance::identity();
            f.fixed_view_mut::<3, 3>(ERR_POS, ERR_VEL)
                .copy_from(&(identity * dt));
            f.fixed_view_mut::<3, 3>(ERR_ROT, ERR_ROT)
                .copy_from(&step.inverse().to_rotation_matrix().into_inner());
            f.fixed_view_mut::<3, 3>(ERR_ROT, ERR_BG)
                .copy_from(&(-identity * dt));
            f.fixed_view_mut::<3, 3>(ERR_VEL, ERR_ROT)
                .copy_from(&(-r * skew(&accel) * dt));
            f.fixed_view_mut::<3, 3>(ERR_VEL, ERR_BA)
                .copy_from(&(-r * dt));

            let mut q = StateCovariance::zeros();
            let noise = &self.noise;
            for (offset, sigma) in [
                (ERR_ROT, noise.gyro_noise),
                (ERR_VEL, noise.accel_noise),
                (ERR_BG, noise.gyro_bias_walk),
                (ERR_BA, noise.accel_bias_walk),
            ] {
                q.fixed_view_mut::<3, 3>(offset, offset)
                    .copy_from(&(identity * sigma * sigma * dt));
            }

            p = f * p * f.transpose() + q;
            rotation *= step;
        }

        0.5 * (p + p.transpose())
    }
}
