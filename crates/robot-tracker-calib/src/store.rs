use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use robot_tracker_core::CameraId;

use crate::{
    calibrate_extrinsics, calibrate_intrinsics, CalibrationError, CalibrationParams,
    CalibrationSet, CancelToken, ExtrinsicView, IntrinsicView,
};

/// Holder of the active [`CalibrationSet`].
///
/// Readers take a snapshot with [`load`](Self::load) once per cycle and keep
/// using it; [`swap`](Self::swap) publishes a complete new set, so a reader sees
/// either the old or the new set and never a mix. Calibration runs are
/// serialized against each other and only swap on success.
#[derive(Clone, Debug, Default)]
pub struct CalibrationStore {
    active: Arc<RwLock<Arc<CalibrationSet>>>,
    runs: Arc<Mutex<()>>,
}

impl CalibrationStore {
    pub fn new(initial: CalibrationSet) -> Self {
        Self {
            active: Arc::new(RwLock::new(Arc::new(initial))),
            runs: Arc::default(),
        }
    }

    pub fn load(&self) -> Arc<CalibrationSet> {
        // the guarded value is a whole Arc; a poisoned lock still holds a complete set
        let guard = self.active.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Publish `next`, returning the set it replaced.
    pub fn swap(&self, next: CalibrationSet) -> Arc<CalibrationSet> {
        self.publish(Arc::new(next))
    }

    fn publish(&self, next: Arc<CalibrationSet>) -> Arc<CalibrationSet> {
        let mut guard = self.active.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, next)
    }

    fn run(
        &self,
        what: &str,
        solve: impl FnOnce(&CalibrationSet) -> Result<CalibrationSet, CalibrationError>,
        cancel: &CancelToken,
    ) -> Result<Arc<CalibrationSet>, CalibrationError> {
        let _serial = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.load();
        let next = solve(&current).and_then(|next| {
            // a cancel that lands after the solve still discards its result
            cancel.check()?;
            Ok(next)
        });
        match next {
            Ok(next) => {
                log::info!(
                    "{what} calibration accepted, residual {:.3} px",
                    next.residual_error
                );
                let next = Arc::new(next);
                self.publish(Arc::clone(&next));
                Ok(next)
            }
            Err(e) => {
                log::warn!("{what} calibration rejected, keeping previous set: {e}");
                Err(e)
            }
        }
    }

    /// Calibrate `camera`'s lens model and publish the result.
    pub fn run_intrinsic(
        &self,
        camera: CameraId,
        views: &[IntrinsicView],
        params: &CalibrationParams,
        cancel: &CancelToken,
    ) -> Result<Arc<CalibrationSet>, CalibrationError> {
        self.run(
            "intrinsic",
            |current| {
                let calib = calibrate_intrinsics(camera, views, params, cancel)?;
                Ok(current.with_intrinsics(&calib, SystemTime::now()))
            },
            cancel,
        )
    }

    /// Solve camera-to-robot transforms with the active lens models and
    /// publish the result.
    pub fn run_extrinsic(
        &self,
        views: &[ExtrinsicView],
        params: &CalibrationParams,
        cancel: &CancelToken,
    ) -> Result<Arc<CalibrationSet>, CalibrationError> {
        self.run(
            "extrinsic",
            |current| {
                let models: BTreeMap<_, _> = current
                    .cameras
                    .iter()
                    .map(|(&id, c)| (id, c.model))
                    .collect();
                let calib = calibrate_extrinsics(views, &models, params, cancel)?;
                current.with_extrinsics(&calib, SystemTime::now())
            },
            cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extrinsic::synthetic;

    #[test]
    fn readers_keep_their_snapshot_across_a_swap() {
        let store = CalibrationStore::default();
        let before = store.load();
        let old = store.swap(CalibrationSet::from_models(synthetic::models(&[CameraId(0)])));
        assert!(Arc::ptr_eq(&before, &old));
        assert!(before.cameras.is_empty());
        assert_eq!(store.load().cameras.len(), 1);
    }

    #[test]
    fn clones_share_the_active_set() {
        let store = CalibrationStore::default();
        let other = store.clone();
        store.swap(CalibrationSet::from_models(synthetic::models(&[CameraId(3)])));
        assert!(other.load().camera(CameraId(3)).is_some());
    }

    #[test]
    fn extrinsic_run_publishes_a_valid_set() {
        let cams = [CameraId(0), CameraId(1)];
        let store = CalibrationStore::new(CalibrationSet::from_models(synthetic::models(&cams)));
        let set = store
            .run_extrinsic(
                &synthetic::views(&cams, 2),
                &CalibrationParams::default(),
                &CancelToken::new(),
            )
            .expect("extrinsic run");
        assert_eq!(set.reference, Some(CameraId(0)));
        assert!(set.is_valid(1.0));
        assert!(Arc::ptr_eq(&set, &store.load()));
    }

    #[test]
    fn cancelled_run_keeps_the_previous_set() {
        let cams = [CameraId(0)];
        let store = CalibrationStore::new(CalibrationSet::from_models(synthetic::models(&cams)));
        let before = store.load();
        let cancel = CancelToken::new();
        cancel.cancel();
        let res = store.run_extrinsic(
            &synthetic::views(&cams, 1),
            &CalibrationParams::default(),
            &cancel,
        );
        assert_eq!(res, Err(CalibrationError::Cancelled));
        assert!(Arc::ptr_eq(&before, &store.load()));
    }
}
