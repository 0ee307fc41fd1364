//! Inertial processing: static calibration and preintegration.

mod initializer;
mod integrator;

pub use initializer::{ImuCalibration, ImuInitializer};
pub use integrator::{zero_order_hold, ImuIntegrator, Prediction, Preintegration};
