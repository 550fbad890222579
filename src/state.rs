//! Composite filter state: mean vector, error covariance, and feature slots
//!
//! The mean lives in the ambient space (length `17 + 5·N`) and the covariance
//! on the tangent space (length `16 + 3·N`). Both are preallocated at the
//! compile-time capacity and only an *active prefix* is ever touched: adding a
//! feature grows the prefix by 5 ambient / 3 tangent entries, removing one
//! shifts the trailing strip up-and-left and zeroes the vacated region, so no
//! allocation happens after construction.
//!
//! Feature identity is a dense ordered list of global ids: slot `i` holds the
//! id at position `i` of that list, slots are in insertion order, and removal
//! compacts the list. [`FilterState::slot_of`] resolves an id back to a slot.
//!
//! The composite retraction [`boxplus`] (and its inverse [`boxminus`]) applies
//! each field explicitly: Euclidean fields add, the attitude quaternion uses
//! the S³ retraction, and each feature bearing uses the 2-dimensional S²
//! retraction with a Euclidean inverse depth.

use nalgebra::{DMatrix, DVector, Quaternion, UnitQuaternion, Vector3};

use crate::manifold;
use crate::{
    ambient_dim, tangent_dim, DX_ATT, DX_BA, DX_BG, DX_FEAT, DX_MU, DX_POS, DX_VEL, STATE_CAP,
    TANGENT_CAP, X_ATT, X_BA, X_BG, X_FEAT, X_MU, X_POS, X_VEL,
};

/// Read a quaternion stored scalar-first at `idx..idx+4` of a flat state
/// vector. The result is renormalized by construction.
pub fn read_quaternion(x: &DVector<f64>, idx: usize) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(x[idx], x[idx + 1], x[idx + 2], x[idx + 3]))
}

/// Write a quaternion scalar-first into `idx..idx+4` of a flat state vector.
pub fn write_quaternion(x: &mut DVector<f64>, idx: usize, q: &UnitQuaternion<f64>) {
    x[idx] = q.w;
    x[idx + 1] = q.i;
    x[idx + 2] = q.j;
    x[idx + 3] = q.k;
}

/// Composite retraction `x ⊞ dx` over the full state.
///
/// `dx` must have at least `tangent_dim(num_features)` rows; entries beyond
/// the active prefix are ignored. The returned vector keeps the full
/// preallocated length of `x`.
pub fn boxplus(x: &DVector<f64>, dx: &DVector<f64>, num_features: usize) -> DVector<f64> {
    let mut out = x.clone();
    for k in 0..3 {
        out[X_POS + k] = x[X_POS + k] + dx[DX_POS + k];
        out[X_VEL + k] = x[X_VEL + k] + dx[DX_VEL + k];
        out[X_BA + k] = x[X_BA + k] + dx[DX_BA + k];
        out[X_BG + k] = x[X_BG + k] + dx[DX_BG + k];
    }
    out[X_MU] = x[X_MU] + dx[DX_MU];

    let q = read_quaternion(x, X_ATT);
    let delta_att = Vector3::new(dx[DX_ATT], dx[DX_ATT + 1], dx[DX_ATT + 2]);
    write_quaternion(&mut out, X_ATT, &manifold::boxplus(&q, &delta_att));

    for i in 0..num_features {
        let xz = X_FEAT + 5 * i;
        let dxz = DX_FEAT + 3 * i;
        let q_zeta = read_quaternion(x, xz);
        let delta = nalgebra::Vector2::new(dx[dxz], dx[dxz + 1]);
        write_quaternion(&mut out, xz, &manifold::bearing_boxplus(&q_zeta, &delta));
        out[xz + 4] = x[xz + 4] + dx[dxz + 2];
    }
    out
}

/// Composite inverse retraction `x1 ⊟ x2` over the full state, returning a
/// tangent vector of length `tangent_dim(num_features)`.
pub fn boxminus(x1: &DVector<f64>, x2: &DVector<f64>, num_features: usize) -> DVector<f64> {
    let mut out = DVector::zeros(tangent_dim(num_features));
    for k in 0..3 {
        out[DX_POS + k] = x1[X_POS + k] - x2[X_POS + k];
        out[DX_VEL + k] = x1[X_VEL + k] - x2[X_VEL + k];
        out[DX_BA + k] = x1[X_BA + k] - x2[X_BA + k];
        out[DX_BG + k] = x1[X_BG + k] - x2[X_BG + k];
    }
    out[DX_MU] = x1[X_MU] - x2[X_MU];

    let q1 = read_quaternion(x1, X_ATT);
    let q2 = read_quaternion(x2, X_ATT);
    out.fixed_rows_mut::<3>(DX_ATT)
        .copy_from(&manifold::boxminus(&q1, &q2));

    for i in 0..num_features {
        let xz = X_FEAT + 5 * i;
        let dxz = DX_FEAT + 3 * i;
        let qz1 = read_quaternion(x1, xz);
        let qz2 = read_quaternion(x2, xz);
        out.fixed_rows_mut::<2>(dxz)
            .copy_from(&manifold::bearing_boxminus(&qz1, &qz2));
        out[dxz + 2] = x1[xz + 4] - x2[xz + 4];
    }
    out
}

/// The filter's composite state: mean vector, error covariance, and the
/// id↔slot mapping for the active feature slots.
#[derive(Clone, Debug)]
pub struct FilterState {
    pub(crate) x: DVector<f64>,
    pub(crate) p: DMatrix<f64>,
    pub(crate) feature_ids: Vec<u32>,
}

impl FilterState {
    /// Build a state from the fixed block `x0` (length 17) and the initial
    /// fixed-block covariance diagonal (length 16). The attitude quaternion in
    /// `x0` is renormalized; feature slots start inactive and all-zero.
    ///
    /// # Panics
    /// Panics if `x0` does not have exactly 17 rows.
    pub fn new(x0: &DVector<f64>, p0_diag: &nalgebra::SVector<f64, 16>) -> Self {
        assert_eq!(
            x0.len(),
            X_FEAT,
            "fixed state block must have length {}",
            X_FEAT
        );
        let mut x = DVector::zeros(STATE_CAP);
        x.rows_mut(0, X_FEAT).copy_from(x0);
        let q = read_quaternion(&x, X_ATT);
        write_quaternion(&mut x, X_ATT, &q);

        let mut p = DMatrix::zeros(TANGENT_CAP, TANGENT_CAP);
        for i in 0..DX_FEAT {
            p[(i, i)] = p0_diag[i];
        }
        FilterState {
            x,
            p,
            feature_ids: Vec::with_capacity(crate::MAX_FEATURES),
        }
    }

    /// Full preallocated mean vector (active prefix first, zero tail).
    pub fn x(&self) -> &DVector<f64> {
        &self.x
    }

    /// Full preallocated error covariance (active prefix first, zero tail).
    pub fn p(&self) -> &DMatrix<f64> {
        &self.p
    }

    pub(crate) fn p_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.p
    }

    /// Number of active feature slots.
    pub fn num_features(&self) -> usize {
        self.feature_ids.len()
    }

    /// Active ambient state length.
    pub fn ambient_dim(&self) -> usize {
        ambient_dim(self.num_features())
    }

    /// Active tangent (error-state) length.
    pub fn tangent_dim(&self) -> usize {
        tangent_dim(self.num_features())
    }

    /// Global ids of the active slots, in slot order.
    pub fn feature_ids(&self) -> &[u32] {
        &self.feature_ids
    }

    /// Slot index of a global feature id, if it is currently tracked.
    pub fn slot_of(&self, id: u32) -> Option<usize> {
        self.feature_ids.iter().position(|&f| f == id)
    }

    /// Inertial position.
    pub fn position(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(X_POS).into_owned()
    }

    /// Body-frame velocity.
    pub fn velocity(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(X_VEL).into_owned()
    }

    /// Attitude quaternion.
    pub fn attitude(&self) -> UnitQuaternion<f64> {
        read_quaternion(&self.x, X_ATT)
    }

    /// Accelerometer bias.
    pub fn accel_bias(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(X_BA).into_owned()
    }

    /// Gyro bias.
    pub fn gyro_bias(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(X_BG).into_owned()
    }

    /// Rotor-drag coefficient.
    pub fn drag_coefficient(&self) -> f64 {
        self.x[X_MU]
    }

    /// Bearing quaternion of an active slot.
    pub fn qzeta(&self, slot: usize) -> UnitQuaternion<f64> {
        assert!(slot < self.num_features(), "inactive feature slot {slot}");
        read_quaternion(&self.x, X_FEAT + 5 * slot)
    }

    /// Unit bearing of an active slot in the camera frame.
    pub fn zeta(&self, slot: usize) -> Vector3<f64> {
        self.qzeta(slot) * Vector3::z()
    }

    /// Inverse depth of an active slot.
    pub fn rho(&self, slot: usize) -> f64 {
        assert!(slot < self.num_features(), "inactive feature slot {slot}");
        self.x[X_FEAT + 5 * slot + 4]
    }

    /// Depths (1/ρ) of all active slots, in slot order.
    pub fn depths(&self) -> DVector<f64> {
        DVector::from_fn(self.num_features(), |i, _| 1.0 / self.rho(i))
    }

    /// Unit bearings of all active slots as the columns of a 3×N matrix.
    pub fn zetas(&self) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(3, self.num_features());
        for i in 0..self.num_features() {
            out.column_mut(i).copy_from(&self.zeta(i));
        }
        out
    }

    /// Bearing quaternions of all active slots as the columns (w, x, y, z) of
    /// a 4×N matrix.
    pub fn qzetas(&self) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(4, self.num_features());
        for i in 0..self.num_features() {
            let q = self.qzeta(i);
            out[(0, i)] = q.w;
            out[(1, i)] = q.i;
            out[(2, i)] = q.j;
            out[(3, i)] = q.k;
        }
        out
    }

    /// Move the mean along a tangent vector: `x ← x ⊞ dx`.
    pub(crate) fn retract(&mut self, dx: &DVector<f64>) {
        self.x = boxplus(&self.x, dx, self.num_features());
    }

    /// Append a feature slot: writes the bearing and inverse depth into the
    /// mean, zeroes the slot's cross-covariance, and seeds its marginal
    /// covariance with the supplied prior diagonal. Returns the new slot index.
    pub(crate) fn push_slot(
        &mut self,
        id: u32,
        q_zeta: &UnitQuaternion<f64>,
        rho: f64,
        p0_feat: &Vector3<f64>,
    ) -> usize {
        debug_assert!(self.feature_ids.len() < crate::MAX_FEATURES);
        debug_assert!(self.slot_of(id).is_none(), "duplicate feature id {id}");
        let slot = self.feature_ids.len();
        let xz = X_FEAT + 5 * slot;
        write_quaternion(&mut self.x, xz, q_zeta);
        self.x[xz + 4] = rho;

        let dxz = DX_FEAT + 3 * slot;
        for k in 0..3 {
            for c in 0..TANGENT_CAP {
                self.p[(dxz + k, c)] = 0.0;
                self.p[(c, dxz + k)] = 0.0;
            }
            self.p[(dxz + k, dxz + k)] = p0_feat[k];
        }
        self.feature_ids.push(id);
        slot
    }

    /// Remove a feature slot: shifts the trailing ambient and tangent strips
    /// up (and left, for the covariance), zeroes the vacated tail, and
    /// compacts the id list.
    pub(crate) fn remove_slot(&mut self, slot: usize) {
        assert!(slot < self.num_features(), "inactive feature slot {slot}");
        let xz = X_FEAT + 5 * slot;
        let dxz = DX_FEAT + 3 * slot;
        self.feature_ids.remove(slot);
        let new_ambient = self.ambient_dim();
        let new_tangent = self.tangent_dim();

        for r in xz..STATE_CAP - 5 {
            self.x[r] = self.x[r + 5];
        }
        for r in new_ambient..STATE_CAP {
            self.x[r] = 0.0;
        }

        for r in dxz..TANGENT_CAP - 3 {
            for c in 0..TANGENT_CAP {
                self.p[(r, c)] = self.p[(r + 3, c)];
            }
        }
        for c in dxz..TANGENT_CAP - 3 {
            for r in 0..TANGENT_CAP {
                self.p[(r, c)] = self.p[(r, c + 3)];
            }
        }
        for r in new_tangent..TANGENT_CAP {
            for c in 0..TANGENT_CAP {
                self.p[(r, c)] = 0.0;
                self.p[(c, r)] = 0.0;
            }
        }
    }

    /// Force exact symmetry of the active covariance block.
    pub(crate) fn symmetrize_active(&mut self) {
        let n = self.tangent_dim();
        for i in 0..n {
            for j in (i + 1)..n {
                let v = 0.5 * (self.p[(i, j)] + self.p[(j, i)]);
                self.p[(i, j)] = v;
                self.p[(j, i)] = v;
            }
        }
    }
}
