//! Filter configuration
//!
//! All tuning lives in one plain struct: initial uncertainty, process noise,
//! the fixed partial-update gains, the inverse-depth prior, the camera
//! calibration, and the optional telemetry directory. The struct derives
//! serde traits so a snapshot can be persisted alongside a run, and a
//! `Default` impl carries plausible values for a small multirotor with a
//! forward-ish camera so examples and tests have a sane starting point.

use nalgebra::{SVector, UnitQuaternion, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration block for [`ViEkf`](crate::ViEkf).
///
/// Diagonal vectors cover the fixed 16-dimensional error state in tangent
/// order (position, velocity, attitude, accel bias, gyro bias, drag); the
/// `*_feat` vectors cover one feature slot (2 bearing + 1 inverse depth) and
/// are replicated across every active slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Initial fixed-block covariance diagonal.
    pub p0: SVector<f64, 16>,
    /// Fixed-block process noise diagonal (continuous-time, applied per second).
    pub qx: SVector<f64, 16>,
    /// Input (IMU) noise diagonal: accelerometer then gyro.
    pub qu: SVector<f64, 6>,
    /// Initial covariance diagonal of a freshly inserted feature slot.
    pub p0_feat: Vector3<f64>,
    /// Process noise diagonal of one feature slot.
    pub qx_feat: Vector3<f64>,
    /// Fixed partial-update gains for the fixed block, each in `[0, 1]`;
    /// `1` applies the full Kalman correction, `0` freezes the state.
    pub gamma: SVector<f64, 16>,
    /// Fixed partial-update gains for one feature slot.
    pub gamma_feat: Vector3<f64>,
    /// Closest depth the front-end is expected to produce, in meters. New
    /// features without a depth hint start at twice this distance.
    pub min_depth: f64,
    /// Model x/y body acceleration as rotor drag proportional to velocity
    /// instead of trusting the accelerometer x/y channels.
    pub use_drag_term: bool,
    /// Image center in pixels.
    pub cam_center: Vector2<f64>,
    /// Focal lengths in pixels (f_x, f_y).
    pub focal_len: Vector2<f64>,
    /// Camera position in the body frame.
    pub p_b_c: Vector3<f64>,
    /// Rotation aligning the body frame with the camera frame.
    pub q_b_c: UnitQuaternion<f64>,
    /// Directory for the persisted telemetry streams; `None` disables them.
    pub log_directory: Option<PathBuf>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let mut p0 = SVector::<f64, 16>::zeros();
        let mut qx = SVector::<f64, 16>::zeros();
        for k in 0..3 {
            p0[crate::DX_POS + k] = 1e-2;
            p0[crate::DX_VEL + k] = 1e-2;
            p0[crate::DX_ATT + k] = 1e-3;
            p0[crate::DX_BA + k] = 1e-2;
            p0[crate::DX_BG + k] = 1e-3;
            qx[crate::DX_POS + k] = 1e-7;
            qx[crate::DX_VEL + k] = 1e-6;
            qx[crate::DX_ATT + k] = 1e-7;
            qx[crate::DX_BA + k] = 1e-8;
            qx[crate::DX_BG + k] = 1e-9;
        }
        p0[crate::DX_MU] = 1e-2;
        qx[crate::DX_MU] = 1e-8;

        let mut qu = SVector::<f64, 6>::zeros();
        for k in 0..3 {
            qu[crate::U_A + k] = 1e-2;
            qu[crate::U_G + k] = 1e-3;
        }

        FilterConfig {
            p0,
            qx,
            qu,
            p0_feat: Vector3::new(1e-2, 1e-2, 1e-1),
            qx_feat: Vector3::new(1e-6, 1e-6, 1e-4),
            gamma: SVector::repeat(1.0),
            gamma_feat: Vector3::new(1.0, 1.0, 1.0),
            min_depth: 0.5,
            use_drag_term: true,
            cam_center: Vector2::new(320.0, 240.0),
            focal_len: Vector2::new(500.0, 500.0),
            p_b_c: Vector3::zeros(),
            q_b_c: UnitQuaternion::identity(),
            log_directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let cfg = FilterConfig::default();
        assert!(cfg.p0.iter().all(|&v| v > 0.0));
        assert!(cfg.qx.iter().all(|&v| v > 0.0));
        assert!(cfg.qu.iter().all(|&v| v > 0.0));
        assert!(cfg.gamma.iter().all(|&g| (0.0..=1.0).contains(&g)));
        assert!(cfg.min_depth > 0.0);
        assert!(cfg.log_directory.is_none());
        assert_eq!(cfg.q_b_c, UnitQuaternion::identity());
    }
}
