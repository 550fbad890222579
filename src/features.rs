//! Feature slot management
//!
//! Features are inserted by back-projecting a pixel into a unit bearing,
//! removed by global id, and pruned in bulk when the front-end reports which
//! ids survived a frame. The underlying state and covariance reshaping lives
//! in [`crate::state`]; this module supplies the policy: capacity limits, id
//! allocation, the pixel inverse projection, and the default depth prior.

use log::debug;
use nalgebra::{Vector2, Vector3};

use crate::manifold::from_two_unit_vectors;
use crate::{ViEkf, MAX_FEATURES};

impl ViEkf {
    /// Insert a new feature slot from a pixel observation.
    ///
    /// The bearing is the normalized inverse projection
    /// `ζ = normalize((u − c_x, (v − c_y)·f_x/f_y, f_x))` and the slot's
    /// bearing quaternion rotates `e_z` onto it. The inverse depth starts at
    /// `1/depth` when a depth hint is supplied and at `1/(2·min_depth)`
    /// otherwise. With `id` of `None` the next sequential global id is
    /// assigned; a supplied id is used verbatim (this is how `Feat` updates
    /// introduce front-end track ids).
    ///
    /// Returns `false`, leaving the filter untouched, when every slot is
    /// occupied.
    ///
    /// # Panics
    /// Panics if the supplied id is already tracked.
    pub fn init_feature(&mut self, pixel: &Vector2<f64>, id: Option<u32>, depth: Option<f64>) -> bool {
        if self.state().num_features() >= MAX_FEATURES {
            debug!("feature set is full; not adding pixel ({}, {})", pixel.x, pixel.y);
            return false;
        }
        let cfg = self.config();
        let centered = pixel - cfg.cam_center;
        let zeta = Vector3::new(
            centered.x,
            centered.y * cfg.focal_len.x / cfg.focal_len.y,
            cfg.focal_len.x,
        )
        .normalize();
        let q_zeta = from_two_unit_vectors(&Vector3::z(), &zeta);

        let init_depth = depth.unwrap_or(2.0 * cfg.min_depth);
        let rho = 1.0 / init_depth;
        let p0_feat = cfg.p0_feat;

        let id = id.unwrap_or(self.next_feature_id);
        assert!(
            self.state().slot_of(id).is_none(),
            "feature id {id} is already tracked"
        );
        self.next_feature_id = self.next_feature_id.max(id + 1);
        self.state.push_slot(id, &q_zeta, rho, &p0_feat);

        debug_assert!(!self.has_nans(), "NaN after feature insertion");
        true
    }

    /// Remove a feature by global id, compacting the trailing slots.
    ///
    /// # Panics
    /// Panics if `id` is not an active feature.
    pub fn clear_feature(&mut self, id: u32) {
        let slot = self.expect_slot(id);
        self.state.remove_slot(slot);
        debug_assert!(!self.has_nans(), "NaN after feature removal");
    }

    /// Remove every tracked feature whose id is not in `ids`. Survivors keep
    /// their relative slot order.
    pub fn keep_only(&mut self, ids: &[u32]) {
        let stale: Vec<u32> = self
            .state()
            .feature_ids()
            .iter()
            .copied()
            .filter(|id| !ids.contains(id))
            .collect();
        for id in stale {
            self.clear_feature(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::{TANGENT_CAP, X_ATT, X_FEAT};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DVector;

    fn new_filter() -> ViEkf {
        let mut x0 = DVector::zeros(X_FEAT);
        x0[X_ATT] = 1.0;
        ViEkf::new(x0, FilterConfig::default())
    }

    #[test]
    fn centered_pixel_yields_identity_bearing() {
        let mut ekf = new_filter();
        assert!(ekf.init_feature(&Vector2::new(320.0, 240.0), None, Some(5.0)));
        assert_eq!(ekf.state().num_features(), 1);
        let zeta = ekf.state().zeta(0);
        assert!((zeta - Vector3::z()).norm() < 1e-12);
        let q = ekf.state().qzeta(0);
        assert!(crate::manifold::boxminus(&q, &nalgebra::UnitQuaternion::identity()).norm() < 1e-12);
        assert_approx_eq!(ekf.state().rho(0), 0.2, 1e-12);
        assert_approx_eq!(ekf.get_depth(0), 5.0, 1e-12);
    }

    #[test]
    fn missing_depth_hint_starts_at_twice_min_depth() {
        let mut ekf = new_filter();
        ekf.init_feature(&Vector2::new(400.0, 200.0), None, None);
        let expected_rho = 1.0 / (2.0 * ekf.config().min_depth);
        assert_approx_eq!(ekf.state().rho(0), expected_rho, 1e-12);
    }

    #[test]
    fn off_center_pixel_reprojects_to_itself() {
        let mut ekf = new_filter();
        let pixel = Vector2::new(412.5, 163.0);
        ekf.init_feature(&pixel, Some(3), Some(4.0));
        let reprojected = ekf.get_feat(3);
        assert_approx_eq!(reprojected.x, pixel.x, 1e-9);
        assert_approx_eq!(reprojected.y, pixel.y, 1e-9);
    }

    #[test]
    fn capacity_limit_reports_not_added() {
        let mut ekf = new_filter();
        for i in 0..crate::MAX_FEATURES {
            assert!(ekf.init_feature(
                &Vector2::new(100.0 + i as f64, 120.0),
                None,
                Some(3.0)
            ));
        }
        assert!(!ekf.init_feature(&Vector2::new(9.0, 9.0), None, Some(3.0)));
        assert_eq!(ekf.state().num_features(), crate::MAX_FEATURES);
    }

    #[test]
    fn sequential_ids_continue_after_supplied_ids() {
        let mut ekf = new_filter();
        ekf.init_feature(&Vector2::new(10.0, 10.0), Some(7), None);
        ekf.init_feature(&Vector2::new(20.0, 20.0), None, None);
        assert_eq!(ekf.state().feature_ids(), &[7, 8]);
    }

    #[test]
    fn keep_only_preserves_slot_order_and_compacts() {
        let mut ekf = new_filter();
        ekf.init_feature(&Vector2::new(100.0, 100.0), Some(7), Some(2.0));
        ekf.init_feature(&Vector2::new(200.0, 150.0), Some(3), Some(3.0));
        ekf.init_feature(&Vector2::new(300.0, 200.0), Some(11), Some(4.0));
        let zeta_7 = ekf.state().zeta(0);
        let zeta_11 = ekf.state().zeta(2);

        ekf.keep_only(&[7, 11]);

        assert_eq!(ekf.state().feature_ids(), &[7, 11]);
        assert!((ekf.state().zeta(0) - zeta_7).norm() < 1e-14);
        assert!((ekf.state().zeta(1) - zeta_11).norm() < 1e-14);
        assert_approx_eq!(ekf.state().rho(0), 0.5, 1e-12);
        assert_approx_eq!(ekf.state().rho(1), 0.25, 1e-12);

        // The vacated tail is zero and the covariance stays symmetric.
        for r in ekf.state().ambient_dim()..crate::STATE_CAP {
            assert_eq!(ekf.state().x()[r], 0.0);
        }
        let n = ekf.state().tangent_dim();
        for r in n..TANGENT_CAP {
            for c in 0..TANGENT_CAP {
                assert_eq!(ekf.state().p()[(r, c)], 0.0);
                assert_eq!(ekf.state().p()[(c, r)], 0.0);
            }
        }
        for i in 0..n {
            for j in 0..n {
                assert_approx_eq!(ekf.state().p()[(i, j)], ekf.state().p()[(j, i)], 1e-12);
            }
        }
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn duplicate_id_is_a_programmer_error() {
        let mut ekf = new_filter();
        ekf.init_feature(&Vector2::new(10.0, 10.0), Some(5), None);
        ekf.init_feature(&Vector2::new(20.0, 20.0), Some(5), None);
    }
}
