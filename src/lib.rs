//! Visual-inertial extended Kalman filter with inverse-depth bearing features
//!
//! This crate implements a recursive state estimator that fuses IMU measurements
//! (specific force and angular rate) with bearing observations to a variable
//! number of visual landmarks. The filter produces a pose estimate together with
//! the inverse depths of the tracked features. It is a library only: an external
//! driver feeds IMU samples to [`ViEkf::propagate`] and associated measurements
//! to [`ViEkf::update`] in timestamp order, and an external vision front-end is
//! responsible for detecting and associating the pixel observations.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filter.
//! - [`log`](https://crates.io/crates/log): Diagnostic logging facade for sanitizer and health events.
//! - [`serde`](https://crates.io/crates/serde): Serialization derives for the configuration block.
//!
//! The partial-update correction follows "Partial-Update Schmidt-Kalman Filter"
//! by Brink, modified to operate on the manifold. The inverse-depth inequality
//! constraint follows "Avoiding Negative Depth in Inverse Depth Bearing-Only
//! SLAM" by Parsley and Julier.
//!
//! ## Crate overview
//!
//! - [manifold]: Quaternion exp/log, boxplus/boxminus retractions on S³ and on
//!   the unit bearing sphere S², and the tangent basis `T_ζ`.
//! - [state]: The composite filter state (mean vector plus error covariance),
//!   preallocated at capacity with an active prefix that grows and shrinks as
//!   features come and go.
//! - [config]: Filter configuration (priors, process noise, partial-update
//!   gains, camera calibration).
//! - [dynamics]: Continuous-time dynamics with analytic state and input
//!   Jacobians.
//! - [measurement]: Measurement kinds with their predictions and Jacobians.
//! - [filter]: The filter itself: propagation, partial-update corrections,
//!   depth sanitation, and health probes.
//! - [features]: Feature slot management (insertion, removal, compaction).
//! - [logger]: Optional persisted telemetry streams.
//!
//! ## State layout and conventions
//!
//! The mean state vector is a flat vector of length `17 + 5·N`:
//!
//! ```text
//! x = [p (3), v (3), q_IB (4), b_a (3), b_g (3), mu (1),
//!      q_zeta_0 (4), rho_0 (1), ..., q_zeta_{N-1} (4), rho_{N-1} (1)]
//! ```
//!
//! where `p` is inertial position, `v` is body-frame velocity, `q_IB` is the
//! Hamilton attitude quaternion (scalar part first), `b_a`/`b_g` are the
//! accelerometer and gyro biases, `mu` is the rotor-drag coefficient, each
//! `q_zeta_i` rotates `e_z = (0,0,1)` onto the camera-frame bearing of feature
//! `i`, and `rho_i` is that feature's inverse depth.
//!
//! The error state is a tangent vector of length `16 + 3·N`: attitude uses a
//! 3-dimensional tangent, each bearing a 2-dimensional tangent restricted to
//! the sphere, and every other component is Euclidean. Ambient and tangent
//! offsets are distinct and are always derived from the named index constants
//! below; mixing them up is the classic way to corrupt a block Jacobian.
//!
//! The inertial frame is z-down, so gravity is `(0, 0, +9.80665)` and a
//! stationary accelerometer reads a specific force of `(0, 0, -9.80665)`.
//!
//! ## Example
//!
//! ```rust
//! use nalgebra::{DVector, Vector3};
//! use vi_ekf::{ImuData, ViEkf, X_ATT, X_FEAT};
//! use vi_ekf::config::FilterConfig;
//!
//! let mut x0 = DVector::zeros(X_FEAT);
//! x0[X_ATT] = 1.0; // identity attitude
//! let mut ekf = ViEkf::new(x0, FilterConfig::default());
//!
//! // A stationary platform: specific force cancels gravity.
//! let u = ImuData {
//!     accel: Vector3::new(0.0, 0.0, -vi_ekf::GRAVITY_MAGNITUDE),
//!     gyro: Vector3::zeros(),
//! };
//! ekf.propagate(&u, 0.00); // first sample only latches the clock
//! ekf.propagate(&u, 0.01);
//! assert!(ekf.state().velocity().norm() < 1e-12);
//! ```
pub mod config;
pub mod dynamics;
pub mod features;
pub mod filter;
pub mod logger;
pub mod manifold;
pub mod measurement;
pub mod state;

pub use crate::config::FilterConfig;
pub use crate::filter::{UpdateOutcome, ViEkf};
pub use crate::measurement::MeasurementKind;
pub use crate::state::FilterState;

use nalgebra::{DVector, Vector3, Vector6};
use std::fmt::{self, Display};

/// Maximum number of simultaneously tracked features (compile-time capacity).
///
/// All state and covariance storage is preallocated for this many feature
/// slots; [`ViEkf::init_feature`](crate::ViEkf::init_feature) reports failure
/// rather than growing beyond it.
pub const MAX_FEATURES: usize = 16;

// Ambient state indices (into the mean vector).
/// Inertial position, 3 elements.
pub const X_POS: usize = 0;
/// Body-frame velocity, 3 elements.
pub const X_VEL: usize = 3;
/// Attitude quaternion (w, x, y, z), 4 elements.
pub const X_ATT: usize = 6;
/// Accelerometer bias, 3 elements.
pub const X_BA: usize = 10;
/// Gyro bias, 3 elements.
pub const X_BG: usize = 13;
/// Rotor-drag coefficient, 1 element.
pub const X_MU: usize = 16;
/// Start of the per-feature blocks; each slot is 4 quaternion + 1 inverse depth.
pub const X_FEAT: usize = 17;

// Tangent (error-state) indices (into covariance rows/columns and Jacobians).
/// Position error, 3 elements.
pub const DX_POS: usize = 0;
/// Velocity error, 3 elements.
pub const DX_VEL: usize = 3;
/// Attitude error (3-dimensional tangent of S³).
pub const DX_ATT: usize = 6;
/// Accelerometer bias error, 3 elements.
pub const DX_BA: usize = 9;
/// Gyro bias error, 3 elements.
pub const DX_BG: usize = 12;
/// Drag coefficient error, 1 element.
pub const DX_MU: usize = 15;
/// Start of the per-feature tangent blocks; each slot is 2 bearing + 1 depth.
pub const DX_FEAT: usize = 16;

// Input vector indices.
/// Accelerometer input, 3 elements.
pub const U_A: usize = 0;
/// Gyro input, 3 elements.
pub const U_G: usize = 3;
/// Total input dimension.
pub const U_TOTAL: usize = 6;

/// Ambient state length for a given number of active features.
pub const fn ambient_dim(num_features: usize) -> usize {
    X_FEAT + 5 * num_features
}

/// Tangent (error-state) length for a given number of active features.
pub const fn tangent_dim(num_features: usize) -> usize {
    DX_FEAT + 3 * num_features
}

/// Preallocated ambient state capacity.
pub const STATE_CAP: usize = ambient_dim(MAX_FEATURES);
/// Preallocated tangent capacity.
pub const TANGENT_CAP: usize = tangent_dim(MAX_FEATURES);

/// Standard gravity magnitude in m/s².
pub const GRAVITY_MAGNITUDE: f64 = 9.80665;
/// Gravity vector in the inertial frame (z down).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE);

/// One IMU sample: sensed specific force and angular rate in the body frame.
///
/// The data is assumed to be raw in the sense that the accelerometer channel
/// still contains the reaction to gravity; the filter subtracts its own bias
/// estimates and adds the gravity model during propagation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImuData {
    /// Specific force in m/s², body frame x, y, z axis.
    pub accel: Vector3<f64>,
    /// Angular rate in rad/s, body frame x, y, z axis.
    pub gyro: Vector3<f64>,
}

impl ImuData {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        ImuData { accel, gyro }
    }
}

impl Display for ImuData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImuData {{ accel: [{:.4}, {:.4}, {:.4}], gyro: [{:.4}, {:.4}, {:.4}] }}",
            self.accel[0], self.accel[1], self.accel[2], self.gyro[0], self.gyro[1], self.gyro[2]
        )
    }
}

impl From<Vector6<f64>> for ImuData {
    /// Splits a stacked `[accel; gyro]` input vector into an `ImuData`.
    fn from(u: Vector6<f64>) -> Self {
        ImuData {
            accel: Vector3::new(u[U_A], u[U_A + 1], u[U_A + 2]),
            gyro: Vector3::new(u[U_G], u[U_G + 1], u[U_G + 2]),
        }
    }
}

impl From<ImuData> for Vector6<f64> {
    fn from(u: ImuData) -> Self {
        Vector6::new(
            u.accel[0], u.accel[1], u.accel[2], u.gyro[0], u.gyro[1], u.gyro[2],
        )
    }
}

impl From<ImuData> for DVector<f64> {
    fn from(u: ImuData) -> Self {
        DVector::from_vec(vec![
            u.accel[0], u.accel[1], u.accel[2], u.gyro[0], u.gyro[1], u.gyro[2],
        ])
    }
}
