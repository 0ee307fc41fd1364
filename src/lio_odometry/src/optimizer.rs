//! Fusion of the IMU prediction with pose observations.
//!
//! An error-state Kalman filter over position, rotation, velocity and both
//! biases. The prediction carries the propagated covariance; each pose
//! observation (scan registration, map pose prior) directly measures the
//! first six error-state components, so `H = [I6 0]`.

use nalgebra::{Isometry3, Matrix6, SMatrix, Vector6};
use tracing::trace;

use crate::covariance::nearest_psd;
use crate::error::LioError;
use crate::imu::Prediction;
use crate::types::{NavState, StateCovariance, ERR_BA, ERR_BG, ERR_POS, ERR_ROT, ERR_VEL};

const LOGGER_NAME: &str = "lio_odometry.optimizer";

/// A full pose measurement.
///
/// The covariance is over `[world position, body rotation]`, matching the
/// first six error-state components.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseObservation {
    pub pose: Isometry3<f64>,
    pub covariance: Matrix6<f64>,
}

/// Owner of the single authoritative [`NavState`].
#[derive(Debug, Clone)]
pub struct Optimizer {
    state: Option<NavState>,
    covariance: StateCovariance,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            state: None,
            covariance: StateCovariance::identity(),
        }
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, state: NavState, covariance: StateCovariance) {
        self.state = Some(state);
        self.covariance = covariance;
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Copy of the current state.
    pub fn state(&self) -> Option<NavState> {
        self.state
    }

    pub fn state_covariance(&self) -> &StateCovariance {
        &self.covariance
    }

    /// Symmetric PSD 6x6 covariance of the pose.
    pub fn pose_covariance(&self) -> Matrix6<f64> {
        nearest_psd(&self.covariance.fixed_view::<6, 6>(0, 0).into_owned())
    }

    /// Correct `prediction` with `observations` and commit the result.
    ///
    /// With no observations the prediction is committed unchanged. A
    /// non-finite result is rejected and the previous state kept.
    pub fn fuse(
        &mut self,
        prediction: &Prediction,
        observations: &[PoseObservation],
    ) -> Result<NavState, LioError> {
        let mut state = prediction.state;
        let mut covariance = prediction.covariance;

        for observation in observations {
            (state, covariance) = kalman_update(&state, &covariance, observation);
        }

        let covariance_finite = covariance.iter().all(|v| v.is_finite());
        if !state.is_finite() || !covariance_finite {
            return Err(LioError::NonFiniteState {
                timestamp: state.timestamp,
            });
        }

        trace!(
            target: LOGGER_NAME,
            timestamp = state.timestamp,
            observations = observations.len(),
            position_variance = covariance.fixed_view::<3, 3>(ERR_POS, ERR_POS).trace(),
            "state fused"
        );

        self.state = Some(state);
        self.covariance = covariance;
        Ok(state)
    }
}

/// One Joseph-form update with a pose observation.
fn kalman_update(
    state: &NavState,
    covariance: &StateCovariance,
    observation: &PoseObservation,
) -> (NavState, StateCovariance) {
    let mut h = SMatrix::<f64, 6, 15>::zeros();
    h.fixed_view_mut::<6, 6>(0, 0).fill_with_identity();

    let innovation_cov = h * covariance * h.transpose() + observation.covariance;
    let Some(innovation_inv) = innovation_cov.try_inverse() else {
        return (*state, *covariance);
    };
    let gain = covariance * h.transpose() * innovation_inv;

    let mut residual = Vector6::zeros();
    residual
        .fixed_rows_mut::<3>(0)
        .copy_from(&(observation.pose.translation.vector - state.position));
    residual
        .fixed_rows_mut::<3>(3)
        .copy_from(&(state.orientation.inverse() * observation.pose.rotation).scaled_axis());

    let dx = gain * residual;
    let mut corrected = *state;
    corrected.position += dx.fixed_rows::<3>(ERR_POS);
    corrected.orientation *=
        nalgebra::UnitQuaternion::from_scaled_axis(dx.fixed_rows::<3>(ERR_ROT).into_owned());
    corrected.velocity += dx.fixed_rows::<3>(ERR_VEL);
    corrected.bias.gyro += dx.fixed_rows::<3>(ERR_BG);
    corrected.bias.accel += dx.fixed_rows::<3>(ERR_BA);

    let i_kh = StateCovariance::identity() - gain * h;
    let updated = i_kh * covariance * i_kh.transpose()
        + gain * observation.covariance * gain.transpose();

    (corrected, 0.5 * (updated + updated.transpose()))
}
