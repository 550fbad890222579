//! The visual-inertial extended Kalman filter
//!
//! [`ViEkf`] owns the composite state, the configuration, the preallocated
//! Jacobian workspace, and the optional telemetry streams. An external driver
//! calls [`ViEkf::propagate`] for every IMU sample and [`ViEkf::update`] for
//! every associated measurement, interleaved in non-decreasing timestamp
//! order. Features appear implicitly with the first [`MeasurementKind::Feat`]
//! update carrying a new id and disappear through the explicit calls in
//! [`crate::features`].
//!
//! The correction step is a fixed-gain partial update: each error-state
//! dimension receives only the configured fraction `γ_i` of its Kalman
//! correction, with the covariance reduction scaled by `γ_i·γ_j` (Brink,
//! "Partial-Update Schmidt-Kalman Filter"). Weakly observable states such as
//! the drag coefficient or a fresh inverse depth can so be held on a leash
//! without removing them from the state.
//!
//! The filter never fails on numeric conditions: NaN measurements are
//! skipped, a singular innovation covariance skips the correction, and the
//! inverse-depth sanitizer clamps pathological depths in place. The health
//! probes ([`ViEkf::has_nans`], [`ViEkf::is_blowing_up`],
//! [`ViEkf::has_negative_depth`]) let the caller decide when a reset is
//! warranted.

use std::time::Instant;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Matrix2x3, Vector3};

use crate::config::FilterConfig;
use crate::dynamics::continuous_dynamics;
use crate::logger::FilterLogger;
use crate::manifold;
use crate::measurement::{
    h_acc, h_alt, h_att, h_depth, h_feat, h_inv_depth, h_pos, h_qzeta, h_vel, MeasurementKind,
    MAX_DZ, MAX_Z,
};
use crate::state::{read_quaternion, FilterState};
use crate::{ImuData, DX_FEAT, TANGENT_CAP, U_TOTAL, X_BA, X_BG, X_FEAT};

/// Inverse depth assigned by the sanitizer when a slot's depth state has
/// gone NaN, negative, or unreasonably large (corresponds to 0.5 m range).
pub const RESET_INVERSE_DEPTH: f64 = 2.0;
/// Inverse depths beyond this are treated as runaway and reset.
pub const MAX_INVERSE_DEPTH: f64 = 1e2;
/// Threshold for the blow-up health probe.
const BLOW_UP_LIMIT: f64 = 1e6;

/// What [`ViEkf::update`] did with a measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The state and covariance were corrected.
    Applied,
    /// Passive mode: prediction and residual were computed, nothing mutated.
    Passive,
    /// A `Feat` measurement with a new id seeded a feature slot instead of
    /// updating.
    Initialized,
    /// The measurement was skipped (NaN content, full feature set, or a
    /// singular innovation covariance).
    Rejected,
    /// The measurement kind is declared but not implemented.
    Unsupported,
}

/// Visual-inertial EKF over the composite manifold state.
pub struct ViEkf {
    pub(crate) state: FilterState,
    cfg: FilterConfig,
    cam_f: Matrix2x3<f64>,
    /// Process noise at capacity, feature blocks replicated.
    qx: DMatrix<f64>,
    /// Input noise.
    qu: DMatrix<f64>,
    /// Partial-update gains at capacity, feature blocks replicated.
    gamma: DVector<f64>,
    /// Outer product `γ·γᵀ` for the covariance reduction.
    ggt: DMatrix<f64>,
    // Preallocated workspace for the propagation and update hot paths.
    xdot: DVector<f64>,
    a: DMatrix<f64>,
    g: DMatrix<f64>,
    h: DMatrix<f64>,
    zhat: DVector<f64>,
    k: DMatrix<f64>,
    prev_t: Option<f64>,
    start_t: f64,
    pub(crate) next_feature_id: u32,
    pub(crate) logger: Option<FilterLogger>,
}

impl std::fmt::Debug for ViEkf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViEkf")
            .field("num_features", &self.state.num_features())
            .field("position", &self.state.position())
            .field("velocity", &self.state.velocity())
            .field("attitude", &self.state.attitude())
            .field("use_drag_term", &self.cfg.use_drag_term)
            .finish()
    }
}

impl ViEkf {
    /// Build a filter from the fixed state block `x0` (length 17, quaternion
    /// scalar-first) and a configuration.
    ///
    /// If the configuration names a log directory that cannot be opened, a
    /// warning is emitted and the filter runs without telemetry.
    ///
    /// # Panics
    /// Panics if `x0` does not have exactly 17 rows.
    pub fn new(x0: DVector<f64>, cfg: FilterConfig) -> Self {
        let state = FilterState::new(&x0, &cfg.p0);

        let mut qx = DMatrix::zeros(TANGENT_CAP, TANGENT_CAP);
        let mut gamma = DVector::zeros(TANGENT_CAP);
        for i in 0..DX_FEAT {
            qx[(i, i)] = cfg.qx[i];
            gamma[i] = cfg.gamma[i];
        }
        for slot in 0..crate::MAX_FEATURES {
            let dxz = DX_FEAT + 3 * slot;
            for k in 0..3 {
                qx[(dxz + k, dxz + k)] = cfg.qx_feat[k];
                gamma[dxz + k] = cfg.gamma_feat[k];
            }
        }
        let ggt = &gamma * gamma.transpose();

        let mut qu = DMatrix::zeros(U_TOTAL, U_TOTAL);
        for i in 0..U_TOTAL {
            qu[(i, i)] = cfg.qu[i];
        }

        let cam_f = Matrix2x3::new(
            cfg.focal_len.x,
            0.0,
            0.0,
            0.0,
            cfg.focal_len.y,
            0.0,
        );

        let logger = cfg.log_directory.as_ref().and_then(|dir| {
            match FilterLogger::create(dir, &cfg) {
                Ok(logger) => Some(logger),
                Err(err) => {
                    warn!("could not open log directory {}: {err}", dir.display());
                    None
                }
            }
        });

        ViEkf {
            state,
            cfg,
            cam_f,
            qx,
            qu,
            gamma,
            ggt,
            xdot: DVector::zeros(TANGENT_CAP),
            a: DMatrix::zeros(TANGENT_CAP, TANGENT_CAP),
            g: DMatrix::zeros(TANGENT_CAP, U_TOTAL),
            h: DMatrix::zeros(MAX_DZ, TANGENT_CAP),
            zhat: DVector::zeros(MAX_Z),
            k: DMatrix::zeros(TANGENT_CAP, MAX_DZ),
            prev_t: None,
            start_t: 0.0,
            next_feature_id: 0,
            logger,
        }
    }

    /// The composite state (mean, covariance, feature slots).
    pub fn state(&self) -> &FilterState {
        &self.state
    }

    /// The configuration the filter was built with.
    pub fn config(&self) -> &FilterConfig {
        &self.cfg
    }

    /// The 2×3 pixel projection matrix built from the configured intrinsics.
    pub fn cam_projection(&self) -> &Matrix2x3<f64> {
        &self.cam_f
    }

    /// Overwrite the IMU bias states.
    pub fn set_imu_bias(&mut self, gyro_bias: &Vector3<f64>, accel_bias: &Vector3<f64>) {
        for k in 0..3 {
            self.state.x[X_BG + k] = gyro_bias[k];
            self.state.x[X_BA + k] = accel_bias[k];
        }
    }

    /// Predicted pixel location of a tracked feature.
    ///
    /// # Panics
    /// Panics if `id` is not an active feature.
    pub fn get_feat(&self, id: u32) -> nalgebra::Vector2<f64> {
        let slot = self.expect_slot(id);
        let zeta = self.state.zeta(slot);
        self.cam_f * zeta / zeta.z + self.cfg.cam_center
    }

    /// Estimated depth of a tracked feature.
    ///
    /// # Panics
    /// Panics if `id` is not an active feature.
    pub fn get_depth(&self, id: u32) -> f64 {
        1.0 / self.state.rho(self.expect_slot(id))
    }

    pub(crate) fn expect_slot(&self, id: u32) -> usize {
        self.state
            .slot_of(id)
            .unwrap_or_else(|| panic!("feature id {id} is not tracked"))
    }

    /// Integrate one IMU sample.
    ///
    /// The very first call only latches the clock; from then on each call
    /// advances the mean on the manifold and the covariance with an Euler
    /// step over `dt = t − t_prev`. Timestamps must be non-decreasing.
    pub fn propagate(&mut self, u: &ImuData, t: f64) {
        let timer = Instant::now();
        let prev = match self.prev_t {
            Some(prev) => prev,
            None => {
                self.prev_t = Some(t);
                self.start_t = t;
                return;
            }
        };
        let dt = t - prev;
        self.prev_t = Some(t);

        continuous_dynamics(
            &self.state.x,
            self.state.num_features(),
            u,
            &self.cfg,
            &mut self.xdot,
            &mut self.a,
            &mut self.g,
        );

        let n = self.state.tangent_dim();
        let step = &self.xdot * dt;
        self.state.retract(&step);

        let dp = {
            let a = self.a.view((0, 0), (n, n));
            let g = self.g.view((0, 0), (n, U_TOTAL));
            let p = self.state.p.view((0, 0), (n, n));
            let qx = self.qx.view((0, 0), (n, n));
            (&a * &p + &p * a.transpose() + &g * &self.qu * g.transpose() + qx) * dt
        };
        {
            let mut p = self.state.p.view_mut((0, 0), (n, n));
            p += &dp;
        }

        self.sanitize_depths();
        debug_assert!(!self.has_nans(), "NaN after propagation");

        if let Some(logger) = &mut self.logger {
            let rel_t = t - self.start_t;
            logger.note_propagation(rel_t, timer.elapsed().as_secs_f64());
            let p_diag = DVector::from_fn(n, |i, _| self.state.p[(i, i)]);
            logger.record_prop(rel_t, &self.state.x, self.state.ambient_dim(), &p_diag);
        }
    }

    /// Apply one measurement.
    ///
    /// * `z` - the measurement; quaternion-valued kinds are scalar-first.
    /// * `r` - measurement noise, sized to the residual dimension.
    /// * `passive` - compute the prediction and residual without mutating
    ///   the state or covariance (external diagnostics).
    /// * `id` - the feature id for feature-addressed kinds; a `Feat`
    ///   measurement with an unseen id seeds a new slot instead of updating.
    /// * `depth` - optional depth hint used only when seeding a new feature.
    ///
    /// # Panics
    /// Panics if a feature-addressed kind other than `Feat` carries an id
    /// that is not tracked; the id must have been introduced by a prior
    /// `Feat` update.
    pub fn update(
        &mut self,
        z: &DVector<f64>,
        kind: MeasurementKind,
        r: &DMatrix<f64>,
        passive: bool,
        id: Option<u32>,
        depth: Option<f64>,
    ) -> UpdateOutcome {
        let timer = Instant::now();

        if z.iter().any(|v| v.is_nan()) {
            debug!("skipping {kind} update containing NaN");
            return UpdateOutcome::Rejected;
        }
        if kind == MeasurementKind::PixelVel {
            warn!("{kind} measurements are not supported");
            return UpdateOutcome::Unsupported;
        }

        if kind == MeasurementKind::Feat {
            let id = id.expect("Feat update requires a feature id");
            if self.state.slot_of(id).is_none() {
                let pixel = nalgebra::Vector2::new(z[0], z[1]);
                return if self.init_feature(&pixel, Some(id), depth) {
                    UpdateOutcome::Initialized
                } else {
                    UpdateOutcome::Rejected
                };
            }
        }
        let slot = if kind.needs_feature() {
            Some(self.expect_slot(id.expect("feature-addressed update requires an id")))
        } else {
            None
        };

        match kind {
            MeasurementKind::Acc => h_acc(&self.state.x, &mut self.zhat, &mut self.h),
            MeasurementKind::Alt => h_alt(&self.state.x, &mut self.zhat, &mut self.h),
            MeasurementKind::Att => h_att(&self.state.x, &mut self.zhat, &mut self.h),
            MeasurementKind::Pos => h_pos(&self.state.x, &mut self.zhat, &mut self.h),
            MeasurementKind::Vel => h_vel(&self.state.x, &mut self.zhat, &mut self.h),
            MeasurementKind::QZeta => {
                h_qzeta(&self.state.x, slot.unwrap(), &mut self.zhat, &mut self.h)
            }
            MeasurementKind::Feat => h_feat(
                &self.state.x,
                slot.unwrap(),
                &self.cam_f,
                &self.cfg.cam_center,
                &mut self.zhat,
                &mut self.h,
            ),
            MeasurementKind::Depth => {
                h_depth(&self.state.x, slot.unwrap(), &mut self.zhat, &mut self.h)
            }
            MeasurementKind::InvDepth => {
                h_inv_depth(&self.state.x, slot.unwrap(), &mut self.zhat, &mut self.h)
            }
            MeasurementKind::PixelVel => unreachable!("rejected above"),
        }

        let mut residual = DVector::zeros(MAX_DZ);
        let z_dim = match kind {
            MeasurementKind::Att => {
                let q_meas = read_quaternion(z, 0);
                let q_pred = read_quaternion(&self.zhat, 0);
                residual
                    .fixed_rows_mut::<3>(0)
                    .copy_from(&manifold::boxminus(&q_meas, &q_pred));
                3
            }
            MeasurementKind::QZeta => {
                let q_meas = read_quaternion(z, 0);
                let q_pred = read_quaternion(&self.zhat, 0);
                residual
                    .fixed_rows_mut::<2>(0)
                    .copy_from(&manifold::bearing_boxminus(&q_meas, &q_pred));
                2
            }
            _ => {
                let z_dim = z.len();
                assert!(z_dim <= MAX_DZ, "measurement dimension {z_dim} too large");
                for k in 0..z_dim {
                    residual[k] = z[k] - self.zhat[k];
                }
                z_dim
            }
        };
        assert_eq!(r.nrows(), z_dim, "noise matrix must match the residual");

        let outcome = if passive {
            UpdateOutcome::Passive
        } else {
            let n = self.state.tangent_dim();
            let correction = {
                let h = self.h.view((0, 0), (z_dim, n));
                let p = self.state.p.view((0, 0), (n, n));
                let s = r + &h * &p * h.transpose();
                match s.try_inverse() {
                    None => None,
                    Some(s_inv) => {
                        let gain = &p * h.transpose() * s_inv;
                        let khp = &gain * &h * &p;
                        let mut dx = &gain * residual.rows(0, z_dim);
                        for i in 0..n {
                            dx[i] *= self.gamma[i];
                        }
                        let reduction = self.ggt.view((0, 0), (n, n)).component_mul(&khp);
                        Some((gain, dx, reduction))
                    }
                }
            };
            match correction {
                None => {
                    warn!("singular innovation covariance in {kind} update");
                    return UpdateOutcome::Rejected;
                }
                Some((gain, dx, reduction)) => {
                    self.k.view_mut((0, 0), (n, z_dim)).copy_from(&gain);
                    self.state.retract(&dx);
                    {
                        let mut p = self.state.p.view_mut((0, 0), (n, n));
                        p -= &reduction;
                    }
                    self.state.symmetrize_active();
                    UpdateOutcome::Applied
                }
            }
        };

        self.sanitize_depths();
        debug_assert!(!self.has_nans(), "NaN after {kind} update");

        if let Some(logger) = &mut self.logger {
            let rel_t = self.prev_t.unwrap_or(self.start_t) - self.start_t;
            let variance = slot
                .filter(|_| {
                    matches!(kind, MeasurementKind::Depth | MeasurementKind::InvDepth)
                })
                .map(|s| self.state.p[(DX_FEAT + 3 * s + 2, DX_FEAT + 3 * s + 2)]);
            logger.record_meas(kind, rel_t, z, &self.zhat, z_dim, variance, id);
            logger.note_update(kind, timer.elapsed().as_secs_f64());
        }
        outcome
    }

    /// Clamp pathological inverse depths in place.
    ///
    /// NaN depths are reset outright; negative depths are reset with the
    /// covariance inflated by the squared correction (Parsley & Julier's
    /// inequality-constraint treatment); runaway depths are reset with the
    /// slot's depth variance restored to its insertion prior.
    pub fn sanitize_depths(&mut self) {
        for slot in 0..self.state.num_features() {
            let xr = X_FEAT + 5 * slot + 4;
            let dxr = DX_FEAT + 3 * slot + 2;
            let rho = self.state.x[xr];
            if rho.is_nan() {
                warn!("inverse depth of slot {slot} went NaN; resetting");
                self.state.x[xr] = RESET_INVERSE_DEPTH;
            } else if rho < 0.0 {
                let err = RESET_INVERSE_DEPTH - rho;
                debug!("negative inverse depth {rho} in slot {slot}; resetting");
                self.state.p[(dxr, dxr)] += err * err;
                self.state.x[xr] = RESET_INVERSE_DEPTH;
            } else if rho > MAX_INVERSE_DEPTH {
                debug!("runaway inverse depth {rho} in slot {slot}; resetting");
                self.state.p[(dxr, dxr)] = self.cfg.p0_feat[2];
                self.state.x[xr] = RESET_INVERSE_DEPTH;
            }
        }
    }

    /// True if the active state or covariance prefix contains a NaN.
    pub fn has_nans(&self) -> bool {
        let ambient = self.state.ambient_dim();
        let n = self.state.tangent_dim();
        self.state.x.rows(0, ambient).iter().any(|v| v.is_nan())
            || self
                .state
                .p
                .view((0, 0), (n, n))
                .iter()
                .any(|v| v.is_nan())
    }

    /// True if any state or covariance element has grown beyond reason.
    pub fn is_blowing_up(&self) -> bool {
        self.state.x.iter().any(|v| v.abs() > BLOW_UP_LIMIT)
            || self.state.p.iter().any(|v| v.abs() > BLOW_UP_LIMIT)
    }

    /// True if any active slot currently carries a negative inverse depth.
    pub fn has_negative_depth(&self) -> bool {
        (0..self.state.num_features()).any(|slot| self.state.rho(slot) < 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tangent_dim, GRAVITY_MAGNITUDE, X_ATT, X_POS};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector2;

    fn identity_x0() -> DVector<f64> {
        let mut x0 = DVector::zeros(X_FEAT);
        x0[X_ATT] = 1.0;
        x0
    }

    fn stationary_input() -> ImuData {
        ImuData::new(Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE), Vector3::zeros())
    }

    fn quiet_config() -> FilterConfig {
        FilterConfig {
            qx_feat: Vector3::zeros(),
            ..FilterConfig::default()
        }
    }

    #[test]
    fn first_propagate_only_latches_the_clock() {
        let mut ekf = ViEkf::new(identity_x0(), FilterConfig::default());
        let p_before = ekf.state().p().clone();
        ekf.propagate(&ImuData::default(), 3.5);
        assert_eq!(ekf.state().p(), &p_before);
        assert_eq!(ekf.state().velocity(), Vector3::zeros());
    }

    #[test]
    fn nan_measurement_is_rejected_without_touching_state() {
        let mut ekf = ViEkf::new(identity_x0(), FilterConfig::default());
        let x_before = ekf.state().x().clone();
        let z = DVector::from_vec(vec![1.0, f64::NAN, 0.0]);
        let r = DMatrix::identity(3, 3);
        let outcome = ekf.update(&z, MeasurementKind::Pos, &r, false, None, None);
        assert_eq!(outcome, UpdateOutcome::Rejected);
        assert_eq!(ekf.state().x(), &x_before);
    }

    #[test]
    fn pixel_velocity_is_unsupported() {
        let mut ekf = ViEkf::new(identity_x0(), FilterConfig::default());
        ekf.init_feature(&Vector2::new(100.0, 100.0), Some(0), None);
        let z = DVector::from_vec(vec![1.0, 1.0]);
        let r = DMatrix::identity(2, 2);
        let outcome = ekf.update(&z, MeasurementKind::PixelVel, &r, false, Some(0), None);
        assert_eq!(outcome, UpdateOutcome::Unsupported);
    }

    #[test]
    fn passive_update_leaves_state_and_covariance_alone() {
        let mut ekf = ViEkf::new(identity_x0(), FilterConfig::default());
        let x_before = ekf.state().x().clone();
        let p_before = ekf.state().p().clone();
        let z = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let r = DMatrix::identity(3, 3) * 0.01;
        let outcome = ekf.update(&z, MeasurementKind::Pos, &r, true, None, None);
        assert_eq!(outcome, UpdateOutcome::Passive);
        assert_eq!(ekf.state().x(), &x_before);
        assert_eq!(ekf.state().p(), &p_before);
    }

    #[test]
    #[should_panic(expected = "not tracked")]
    fn unknown_feature_id_on_depth_update_is_a_programmer_error() {
        let mut ekf = ViEkf::new(identity_x0(), FilterConfig::default());
        let z = DVector::from_vec(vec![2.0]);
        let r = DMatrix::identity(1, 1);
        ekf.update(&z, MeasurementKind::Depth, &r, false, Some(42), None);
    }

    #[test]
    fn partial_update_applies_exactly_the_configured_fraction() {
        let mut cfg = FilterConfig::default();
        for k in 0..3 {
            cfg.gamma[crate::DX_POS + k] = 0.5;
        }
        let mut ekf = ViEkf::new(identity_x0(), cfg.clone());
        let p_pos_before = ekf
            .state()
            .p()
            .fixed_view::<3, 3>(crate::DX_POS, crate::DX_POS)
            .into_owned();

        // Exact position measurement: the full Kalman correction would move
        // the mean all the way to z.
        let z = DVector::from_vec(vec![2.0, -4.0, 6.0]);
        let r = DMatrix::zeros(3, 3);
        let outcome = ekf.update(&z, MeasurementKind::Pos, &r, false, None, None);
        assert_eq!(outcome, UpdateOutcome::Applied);
        for k in 0..3 {
            assert_approx_eq!(ekf.state().x()[X_POS + k], 0.5 * z[k], 1e-12);
        }
        // With diagonal P and an exact measurement, K·H·P is the position
        // block itself, so the reduction is γ²·P_pos.
        for i in 0..3 {
            for j in 0..3 {
                let expected = p_pos_before[(i, j)] * if i == j { 0.75 } else { 1.0 };
                assert_approx_eq!(
                    ekf.state().p()[(crate::DX_POS + i, crate::DX_POS + j)],
                    expected,
                    1e-12
                );
            }
        }
    }

    #[test]
    fn sanitizer_resets_negative_depth_and_inflates_variance() {
        let mut ekf = ViEkf::new(identity_x0(), quiet_config());
        ekf.init_feature(&Vector2::new(320.0, 240.0), Some(0), Some(5.0));
        ekf.propagate(&stationary_input(), 0.0);

        let xr = X_FEAT + 4;
        let dxr = DX_FEAT + 2;
        ekf.state.x[xr] = -0.1;
        assert!(ekf.has_negative_depth());
        let p_before = ekf.state().p()[(dxr, dxr)];

        ekf.propagate(&stationary_input(), 0.01);
        assert!(!ekf.has_negative_depth());
        assert_approx_eq!(ekf.state().rho(0), RESET_INVERSE_DEPTH, 1e-12);
        let expected = p_before + (RESET_INVERSE_DEPTH - (-0.1)).powi(2);
        assert_approx_eq!(ekf.state().p()[(dxr, dxr)], expected, 1e-9);
    }

    #[test]
    fn sanitizer_resets_nan_and_runaway_depths() {
        let mut ekf = ViEkf::new(identity_x0(), quiet_config());
        ekf.init_feature(&Vector2::new(100.0, 50.0), Some(0), Some(2.0));
        ekf.init_feature(&Vector2::new(500.0, 400.0), Some(1), Some(3.0));

        ekf.state.x[X_FEAT + 4] = f64::NAN;
        ekf.state.x[X_FEAT + 9] = 2.0 * MAX_INVERSE_DEPTH;
        ekf.sanitize_depths();

        assert_approx_eq!(ekf.state().rho(0), RESET_INVERSE_DEPTH, 1e-12);
        assert_approx_eq!(ekf.state().rho(1), RESET_INVERSE_DEPTH, 1e-12);
        let dxr1 = DX_FEAT + 3 + 2;
        assert_approx_eq!(
            ekf.state().p()[(dxr1, dxr1)],
            ekf.config().p0_feat[2],
            1e-12
        );
        assert!(!ekf.has_nans());
    }

    #[test]
    fn health_probes_flag_pathological_states() {
        let mut ekf = ViEkf::new(identity_x0(), FilterConfig::default());
        assert!(!ekf.has_nans());
        assert!(!ekf.is_blowing_up());
        ekf.state.x[X_POS] = 2e6;
        assert!(ekf.is_blowing_up());
        ekf.state.x[X_POS] = f64::NAN;
        assert!(ekf.has_nans());
    }

    #[test]
    fn singular_innovation_is_rejected() {
        // Zero prior and zero measurement noise make S exactly singular.
        let mut cfg = FilterConfig::default();
        cfg.p0 = nalgebra::SVector::zeros();
        let mut ekf = ViEkf::new(identity_x0(), cfg);
        let z = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        let r = DMatrix::zeros(3, 3);
        let outcome = ekf.update(&z, MeasurementKind::Pos, &r, false, None, None);
        assert_eq!(outcome, UpdateOutcome::Rejected);
    }

    #[test]
    fn covariance_stays_symmetric_through_updates() {
        let mut ekf = ViEkf::new(identity_x0(), FilterConfig::default());
        ekf.propagate(&stationary_input(), 0.0);
        for step in 1..20 {
            ekf.propagate(&stationary_input(), step as f64 * 0.01);
        }
        let z = DVector::from_vec(vec![0.1, 0.2, -0.1]);
        let r = DMatrix::identity(3, 3) * 0.01;
        ekf.update(&z, MeasurementKind::Pos, &r, false, None, None);
        let n = tangent_dim(ekf.state().num_features());
        for i in 0..n {
            for j in 0..n {
                assert_approx_eq!(ekf.state().p()[(i, j)], ekf.state().p()[(j, i)], 1e-12);
            }
        }
    }
}
