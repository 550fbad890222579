//! Measurement models
//!
//! Each supported measurement kind provides a prediction `ẑ = h(x)` and the
//! Jacobian `H = ∂h/∂δx` with respect to the error state. The filter selects
//! the model with a `match` on [`MeasurementKind`] at the top of
//! [`update`](crate::ViEkf::update); every model is a pure function of the
//! state vector (plus the camera calibration where needed) so the
//! finite-difference tests can evaluate them at perturbed states.
//!
//! | Kind        | `ẑ`                      | Residual                  |
//! |-------------|--------------------------|---------------------------|
//! | `Acc`       | `(−μ·v + b_a)_xy`        | `z − ẑ` (2)               |
//! | `Alt`       | `−p_z`                   | `z − ẑ` (1)               |
//! | `Att`       | `q_IB`                   | quaternion ⊟ (3)          |
//! | `Pos`       | `p`                      | `z − ẑ` (3)               |
//! | `Vel`       | `v`                      | `z − ẑ` (3)               |
//! | `QZeta`     | `q_ζ`                    | bearing ⊟ (2)             |
//! | `Feat`      | `F·ζ/(e_zᵀζ) + c`        | `z − ẑ` (2)               |
//! | `Depth`     | `1/ρ`                    | `z − ẑ` (1)               |
//! | `InvDepth`  | `ρ`                      | `z − ẑ` (1)               |
//! | `PixelVel`  | unsupported              | rejected by `update`      |
//!
//! Quaternion-valued measurements (`Att`, `QZeta`) are supplied scalar-first,
//! matching the state storage. Every `H` block is written against the
//! tangent-index constants; prediction buffers hold up to 4 rows and Jacobian
//! buffers up to 3 rows, of which only the leading rows for the given kind
//! are meaningful.

use nalgebra::{DMatrix, DVector, Matrix2x3, Vector2, Vector3};

use crate::manifold::{skew, t_zeta};
use crate::state::read_quaternion;
use crate::{DX_ATT, DX_BA, DX_FEAT, DX_MU, DX_POS, DX_VEL, X_ATT, X_BA, X_FEAT, X_MU, X_POS, X_VEL};

/// Maximum rows of a measurement prediction (quaternion-valued kinds).
pub const MAX_Z: usize = 4;
/// Maximum rows of a measurement residual / Jacobian.
pub const MAX_DZ: usize = 3;

/// The kinds of measurement the filter accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MeasurementKind {
    /// Lateral accelerometer channels, observing drag and accel bias.
    Acc,
    /// Altimeter: negative z position.
    Alt,
    /// Full attitude (quaternion, scalar first).
    Att,
    /// Inertial position.
    Pos,
    /// Body-frame velocity.
    Vel,
    /// Bearing quaternion of a tracked feature (scalar first).
    QZeta,
    /// Pixel location of a tracked feature.
    Feat,
    /// Pixel velocity of a tracked feature; declared but not implemented.
    PixelVel,
    /// Scalar depth of a tracked feature.
    Depth,
    /// Scalar inverse depth of a tracked feature.
    InvDepth,
}

impl MeasurementKind {
    /// Number of kinds, for per-kind bookkeeping arrays.
    pub const COUNT: usize = 10;

    /// Stable index of this kind into per-kind arrays.
    pub fn index(self) -> usize {
        match self {
            MeasurementKind::Acc => 0,
            MeasurementKind::Alt => 1,
            MeasurementKind::Att => 2,
            MeasurementKind::Pos => 3,
            MeasurementKind::Vel => 4,
            MeasurementKind::QZeta => 5,
            MeasurementKind::Feat => 6,
            MeasurementKind::PixelVel => 7,
            MeasurementKind::Depth => 8,
            MeasurementKind::InvDepth => 9,
        }
    }

    /// Short upper-case name used in the measurement log stream.
    pub fn name(self) -> &'static str {
        match self {
            MeasurementKind::Acc => "ACC",
            MeasurementKind::Alt => "ALT",
            MeasurementKind::Att => "ATT",
            MeasurementKind::Pos => "POS",
            MeasurementKind::Vel => "VEL",
            MeasurementKind::QZeta => "QZETA",
            MeasurementKind::Feat => "FEAT",
            MeasurementKind::PixelVel => "PIXEL_VEL",
            MeasurementKind::Depth => "DEPTH",
            MeasurementKind::InvDepth => "INV_DEPTH",
        }
    }

    /// Whether this kind addresses a tracked feature and therefore carries an
    /// id that must resolve to an active slot.
    pub fn needs_feature(self) -> bool {
        matches!(
            self,
            MeasurementKind::QZeta
                | MeasurementKind::Feat
                | MeasurementKind::PixelVel
                | MeasurementKind::Depth
                | MeasurementKind::InvDepth
        )
    }
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lateral accelerometer model: in the drag formulation the x/y specific
/// force is `−μ·v_xy + b_a,xy`.
pub fn h_acc(x: &DVector<f64>, zhat: &mut DVector<f64>, h: &mut DMatrix<f64>) {
    zhat.fill(0.0);
    h.fill(0.0);
    let mu = x[X_MU];
    for row in 0..2 {
        zhat[row] = -mu * x[X_VEL + row] + x[X_BA + row];
        h[(row, DX_VEL + row)] = -mu;
        h[(row, DX_BA + row)] = 1.0;
        h[(row, DX_MU)] = -x[X_VEL + row];
    }
}

/// Altimeter model: altitude is `−p_z` in the z-down inertial frame.
pub fn h_alt(x: &DVector<f64>, zhat: &mut DVector<f64>, h: &mut DMatrix<f64>) {
    zhat.fill(0.0);
    h.fill(0.0);
    zhat[0] = -x[X_POS + 2];
    h[(0, DX_POS + 2)] = -1.0;
}

/// Attitude model: predicts the quaternion itself; the residual is formed
/// with the S³ boxminus, so `H` is identity on the attitude tangent.
pub fn h_att(x: &DVector<f64>, zhat: &mut DVector<f64>, h: &mut DMatrix<f64>) {
    zhat.fill(0.0);
    h.fill(0.0);
    for k in 0..4 {
        zhat[k] = x[X_ATT + k];
    }
    for k in 0..3 {
        h[(k, DX_ATT + k)] = 1.0;
    }
}

/// Position model.
pub fn h_pos(x: &DVector<f64>, zhat: &mut DVector<f64>, h: &mut DMatrix<f64>) {
    zhat.fill(0.0);
    h.fill(0.0);
    for k in 0..3 {
        zhat[k] = x[X_POS + k];
        h[(k, DX_POS + k)] = 1.0;
    }
}

/// Body-frame velocity model.
pub fn h_vel(x: &DVector<f64>, zhat: &mut DVector<f64>, h: &mut DMatrix<f64>) {
    zhat.fill(0.0);
    h.fill(0.0);
    for k in 0..3 {
        zhat[k] = x[X_VEL + k];
        h[(k, DX_VEL + k)] = 1.0;
    }
}

/// Bearing-quaternion model for a tracked feature; the residual is formed
/// with the S² boxminus, so `H` is identity on the slot's bearing tangent.
pub fn h_qzeta(x: &DVector<f64>, slot: usize, zhat: &mut DVector<f64>, h: &mut DMatrix<f64>) {
    zhat.fill(0.0);
    h.fill(0.0);
    let xz = X_FEAT + 5 * slot;
    let dxz = DX_FEAT + 3 * slot;
    for k in 0..4 {
        zhat[k] = x[xz + k];
    }
    h[(0, dxz)] = 1.0;
    h[(1, dxz + 1)] = 1.0;
}

/// Pixel projection of a tracked feature: `ẑ = F·ζ/(e_zᵀζ) + c` with
/// `F = [[f_x,0,0],[0,f_y,0]]`.
pub fn h_feat(
    x: &DVector<f64>,
    slot: usize,
    cam_f: &Matrix2x3<f64>,
    cam_center: &Vector2<f64>,
    zhat: &mut DVector<f64>,
    h: &mut DMatrix<f64>,
) {
    zhat.fill(0.0);
    h.fill(0.0);
    let xz = X_FEAT + 5 * slot;
    let dxz = DX_FEAT + 3 * slot;
    let q_zeta = read_quaternion(x, xz);
    let zeta = q_zeta * Vector3::z();
    let sk_zeta = skew(&zeta);
    let t_z = t_zeta(&q_zeta);
    let ez_zeta = zeta.z;

    zhat.fixed_rows_mut::<2>(0)
        .copy_from(&(cam_f * zeta / ez_zeta + cam_center));

    let term1: nalgebra::Matrix3x2<f64> = (sk_zeta * t_z) / ez_zeta;
    let row: nalgebra::Matrix1x3<f64> = Vector3::z().transpose();
    let term2: nalgebra::Matrix3x2<f64> = (zeta * (row * sk_zeta * t_z)) / (ez_zeta * ez_zeta);
    let block: nalgebra::Matrix2<f64> = -cam_f * (term1 - term2);
    h.fixed_view_mut::<2, 2>(0, dxz).copy_from(&block);
}

/// Depth model for a tracked feature: `ẑ = 1/ρ`.
pub fn h_depth(x: &DVector<f64>, slot: usize, zhat: &mut DVector<f64>, h: &mut DMatrix<f64>) {
    zhat.fill(0.0);
    h.fill(0.0);
    let rho = x[X_FEAT + 5 * slot + 4];
    zhat[0] = 1.0 / rho;
    h[(0, DX_FEAT + 3 * slot + 2)] = -1.0 / (rho * rho);
}

/// Inverse-depth model for a tracked feature: `ẑ = ρ`.
pub fn h_inv_depth(x: &DVector<f64>, slot: usize, zhat: &mut DVector<f64>, h: &mut DMatrix<f64>) {
    zhat.fill(0.0);
    h.fill(0.0);
    zhat[0] = x[X_FEAT + 5 * slot + 4];
    h[(0, DX_FEAT + 3 * slot + 2)] = 1.0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::write_quaternion;
    use crate::TANGENT_CAP;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::UnitQuaternion;

    fn buffers() -> (DVector<f64>, DMatrix<f64>) {
        (DVector::zeros(MAX_Z), DMatrix::zeros(MAX_DZ, TANGENT_CAP))
    }

    fn base_state() -> DVector<f64> {
        let mut x = DVector::zeros(crate::STATE_CAP);
        x[crate::X_ATT] = 1.0;
        x
    }

    #[test]
    fn kind_indices_are_a_bijection() {
        let kinds = [
            MeasurementKind::Acc,
            MeasurementKind::Alt,
            MeasurementKind::Att,
            MeasurementKind::Pos,
            MeasurementKind::Vel,
            MeasurementKind::QZeta,
            MeasurementKind::Feat,
            MeasurementKind::PixelVel,
            MeasurementKind::Depth,
            MeasurementKind::InvDepth,
        ];
        let mut seen = [false; MeasurementKind::COUNT];
        for kind in kinds {
            assert!(!seen[kind.index()]);
            seen[kind.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn acc_prediction_combines_drag_and_bias() {
        let mut x = base_state();
        x[X_VEL] = 2.0;
        x[X_VEL + 1] = -1.0;
        x[X_BA] = 0.1;
        x[X_BA + 1] = 0.2;
        x[X_MU] = 0.3;
        let (mut zhat, mut h) = buffers();
        h_acc(&x, &mut zhat, &mut h);
        assert_approx_eq!(zhat[0], -0.3 * 2.0 + 0.1);
        assert_approx_eq!(zhat[1], -0.3 * (-1.0) + 0.2);
        assert_approx_eq!(h[(0, DX_VEL)], -0.3);
        assert_approx_eq!(h[(0, DX_MU)], -2.0);
        assert_approx_eq!(h[(1, DX_MU)], 1.0);
    }

    #[test]
    fn alt_is_negative_down_position() {
        let mut x = base_state();
        x[X_POS + 2] = -12.5; // 12.5 m above the origin in a z-down frame
        let (mut zhat, mut h) = buffers();
        h_alt(&x, &mut zhat, &mut h);
        assert_approx_eq!(zhat[0], 12.5);
        assert_approx_eq!(h[(0, DX_POS + 2)], -1.0);
    }

    #[test]
    fn centered_pixel_projects_back_to_center() {
        let mut x = base_state();
        write_quaternion(&mut x, X_FEAT, &UnitQuaternion::identity());
        x[X_FEAT + 4] = 0.2;
        let cam_f = Matrix2x3::new(500.0, 0.0, 0.0, 0.0, 500.0, 0.0);
        let center = Vector2::new(320.0, 240.0);
        let (mut zhat, mut h) = buffers();
        h_feat(&x, 0, &cam_f, &center, &mut zhat, &mut h);
        assert_approx_eq!(zhat[0], 320.0, 1e-9);
        assert_approx_eq!(zhat[1], 240.0, 1e-9);
    }

    #[test]
    fn depth_and_inverse_depth_agree() {
        let mut x = base_state();
        write_quaternion(&mut x, X_FEAT, &UnitQuaternion::identity());
        x[X_FEAT + 4] = 0.25;
        let (mut zhat, mut h) = buffers();
        h_depth(&x, 0, &mut zhat, &mut h);
        assert_approx_eq!(zhat[0], 4.0);
        assert_approx_eq!(h[(0, DX_FEAT + 2)], -16.0);
        h_inv_depth(&x, 0, &mut zhat, &mut h);
        assert_approx_eq!(zhat[0], 0.25);
        assert_approx_eq!(h[(0, DX_FEAT + 2)], 1.0);
    }

    #[test]
    fn identity_rows_land_on_tangent_indices() {
        let x = base_state();
        let (mut zhat, mut h) = buffers();
        h_pos(&x, &mut zhat, &mut h);
        for k in 0..3 {
            assert_approx_eq!(h[(k, DX_POS + k)], 1.0);
        }
        h_vel(&x, &mut zhat, &mut h);
        for k in 0..3 {
            assert_approx_eq!(h[(k, DX_VEL + k)], 1.0);
        }
        h_att(&x, &mut zhat, &mut h);
        for k in 0..3 {
            assert_approx_eq!(h[(k, DX_ATT + k)], 1.0);
        }
        assert_approx_eq!(zhat[0], 1.0); // quaternion scalar part
    }
}
