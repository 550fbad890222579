//! Continuous-time dynamics and analytic Jacobians
//!
//! This module evaluates the error-state dynamics `ẋ = f(x, u)` together with
//! its analytic linearizations `A = ∂f/∂δx` and `G = ∂f/∂u`, which the filter
//! integrates with a first-order Euler step:
//!
//! ```text
//! x ← x ⊞ (ẋ · dt)
//! P ← P + (A·P + P·Aᵀ + G·Q_u·Gᵀ + Q_x) · dt
//! ```
//!
//! # Model
//!
//! With bias-corrected inputs `â = a_m − b_a`, `ω̂ = ω_m − b_g` and the
//! body-frame gravity `g_B = q_IB⁻¹·g`:
//!
//! ```text
//! ṗ  = q_IB⁻¹·v
//! v̇  = â + g_B                         (accelerometer model)
//! v̇  = (0,0,â_z) + g_B − μ·v_xy        (rotor-drag model)
//! q̇  = ω̂                               (tangent increment)
//! ḃ_a = ḃ_g = μ̇ = 0
//! ```
//!
//! Each feature slot evolves with the camera-frame motion
//! `v_c = q_BC⁻¹·(v − ω̂ × p_BC)`, `ω_c = q_BC⁻¹·ω̂`:
//!
//! ```text
//! ζ̇ = −T_ζᵀ·(ω_c + ρ·ζ × v_c)          (2-dimensional tangent rate)
//! ρ̇ = ρ²·ζ·v_c
//! ```
//!
//! The drag model treats x/y body acceleration as rotor drag `−μ·v_xy`
//! rather than trusting the accelerometer x/y channels, so in that mode the
//! accelerometer only enters through its z axis (and the bias Jacobian
//! shrinks accordingly).
//!
//! # Jacobian layout
//!
//! Every non-zero block is written explicitly against the tangent-index
//! constants; anything not assigned below is structurally zero. The feature
//! blocks repeatedly use `∂ζ/∂δ = −skew(ζ)·T_ζ` and
//! `∂(T_ζᵀu)/∂δ = T_ζᵀ·skew(u)·T_ζ`, both consequences of the S² retraction
//! in [`crate::manifold`]. `tests/jacobians.rs` validates all blocks of `A`
//! and `G` against central differences of the boxplus-evolved dynamics.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use crate::config::FilterConfig;
use crate::manifold::{dcm, skew, t_zeta};
use crate::state::read_quaternion;
use crate::{
    ImuData, DX_ATT, DX_BA, DX_BG, DX_FEAT, DX_MU, DX_POS, DX_VEL, GRAVITY, U_A, U_G, X_ATT, X_BA,
    X_BG, X_FEAT, X_MU, X_VEL,
};

/// Evaluate `ẋ`, `A`, and `G` at an arbitrary state.
///
/// `x` is a full ambient state vector with `num_features` active slots. The
/// output buffers must be at least `tangent_dim(num_features)` rows (the
/// filter passes its capacity-sized workspace); they are zeroed before the
/// active blocks are written.
///
/// This is a free function rather than a private filter method so the
/// finite-difference tests can evaluate it at perturbed states with their own
/// buffers.
pub fn continuous_dynamics(
    x: &DVector<f64>,
    num_features: usize,
    u: &ImuData,
    cfg: &FilterConfig,
    xdot: &mut DVector<f64>,
    a: &mut DMatrix<f64>,
    g: &mut DMatrix<f64>,
) {
    xdot.fill(0.0);
    a.fill(0.0);
    g.fill(0.0);

    let vel = x.fixed_rows::<3>(X_VEL).into_owned();
    let q_i_b = read_quaternion(x, X_ATT);
    let omega = u.gyro - x.fixed_rows::<3>(X_BG).into_owned();
    let accel = u.accel - x.fixed_rows::<3>(X_BA).into_owned();
    let mu = x[X_MU];

    let gravity_b = q_i_b.inverse_transform_vector(&GRAVITY);
    let vel_i = q_i_b.inverse_transform_vector(&vel);
    let vel_xy = Vector3::new(vel.x, vel.y, 0.0);

    xdot.fixed_rows_mut::<3>(DX_POS).copy_from(&vel_i);
    if cfg.use_drag_term {
        let accel_z = Vector3::new(0.0, 0.0, accel.z);
        xdot.fixed_rows_mut::<3>(DX_VEL)
            .copy_from(&(accel_z + gravity_b - mu * vel_xy));
    } else {
        xdot.fixed_rows_mut::<3>(DX_VEL)
            .copy_from(&(accel + gravity_b));
    }
    xdot.fixed_rows_mut::<3>(DX_ATT).copy_from(&omega);

    a.fixed_view_mut::<3, 3>(DX_POS, DX_VEL)
        .copy_from(&dcm(&q_i_b));
    a.fixed_view_mut::<3, 3>(DX_POS, DX_ATT)
        .copy_from(&skew(&vel_i));
    a.fixed_view_mut::<3, 3>(DX_VEL, DX_ATT)
        .copy_from(&skew(&gravity_b));
    if cfg.use_drag_term {
        a[(DX_VEL, DX_VEL)] = -mu;
        a[(DX_VEL + 1, DX_VEL + 1)] = -mu;
        a[(DX_VEL + 2, DX_BA + 2)] = -1.0;
        a.fixed_view_mut::<3, 1>(DX_VEL, DX_MU).copy_from(&-vel_xy);
        g[(DX_VEL + 2, U_A + 2)] = 1.0;
    } else {
        a.fixed_view_mut::<3, 3>(DX_VEL, DX_BA)
            .copy_from(&-Matrix3::identity());
        g.fixed_view_mut::<3, 3>(DX_VEL, U_A)
            .copy_from(&Matrix3::identity());
    }
    a.fixed_view_mut::<3, 3>(DX_ATT, DX_BG)
        .copy_from(&-Matrix3::identity());
    g.fixed_view_mut::<3, 3>(DX_ATT, U_G)
        .copy_from(&Matrix3::identity());

    if num_features == 0 {
        return;
    }

    // Camera-frame motion shared by every slot.
    let r_b_c = dcm(&cfg.q_b_c);
    let vel_c = cfg
        .q_b_c
        .inverse_transform_vector(&(vel - omega.cross(&cfg.p_b_c)));
    let omega_c = cfg.q_b_c.inverse_transform_vector(&omega);
    let skew_vel_c = skew(&vel_c);
    let skew_p_b_c = skew(&cfg.p_b_c);

    for i in 0..num_features {
        let xz = X_FEAT + 5 * i;
        let dxz = DX_FEAT + 3 * i;
        let dxr = dxz + 2;

        let q_zeta = read_quaternion(x, xz);
        let rho = x[xz + 4];
        let zeta = q_zeta * Vector3::z();
        let t_z = t_zeta(&q_zeta);
        let skew_zeta = skew(&zeta);
        let rho2 = rho * rho;

        let zeta_dot = -t_z.transpose() * (omega_c + rho * zeta.cross(&vel_c));
        xdot.fixed_rows_mut::<2>(dxz).copy_from(&zeta_dot);
        xdot[dxr] = rho2 * zeta.dot(&vel_c);

        a.fixed_view_mut::<2, 3>(dxz, DX_VEL)
            .copy_from(&(-rho * t_z.transpose() * skew_zeta * r_b_c));
        a.fixed_view_mut::<2, 3>(dxz, DX_BG)
            .copy_from(&(t_z.transpose() * (rho * skew_zeta * r_b_c * skew_p_b_c + r_b_c)));
        a.fixed_view_mut::<2, 2>(dxz, dxz).copy_from(
            &(-t_z.transpose()
                * (skew(&(rho * skew_zeta * vel_c + omega_c)) + rho * skew_vel_c * skew_zeta)
                * t_z),
        );
        a.fixed_view_mut::<2, 1>(dxz, dxr)
            .copy_from(&(-t_z.transpose() * zeta.cross(&vel_c)));
        a.fixed_view_mut::<1, 3>(dxr, DX_VEL)
            .copy_from(&(rho2 * zeta.transpose() * r_b_c));
        a.fixed_view_mut::<1, 3>(dxr, DX_BG)
            .copy_from(&(-rho2 * zeta.transpose() * r_b_c * skew_p_b_c));
        a.fixed_view_mut::<1, 2>(dxr, dxz)
            .copy_from(&(-rho2 * vel_c.transpose() * skew_zeta * t_z));
        a[(dxr, dxr)] = 2.0 * rho * zeta.dot(&vel_c);

        g.fixed_view_mut::<2, 3>(dxz, U_G)
            .copy_from(&(-t_z.transpose() * (r_b_c + rho * skew_zeta * r_b_c * skew_p_b_c)));
        g.fixed_view_mut::<1, 3>(dxr, U_G)
            .copy_from(&(rho2 * zeta.transpose() * r_b_c * skew_p_b_c));
    }
}
