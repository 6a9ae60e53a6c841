//! Association and lifecycle management over all tracks.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use robot_tracker_core::{CameraId, Modality, Pt2, TargetId};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    KalmanState, Measurement, Track, TrackConfigError, TrackFrame, TrackParams, TrackStatus,
};

/// One observation applied to a track in a cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Association {
    pub target: TargetId,
    pub camera: CameraId,
    pub modality: Modality,
    pub centroid: Pt2,
}

/// What happened during one [`TrackFilter::step`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepReport {
    /// Applied observations, including the ones that seeded new tracks.
    pub associations: Vec<Association>,
    pub born: Vec<TargetId>,
    pub confirmed: Vec<TargetId>,
    pub reacquired: Vec<TargetId>,
    pub lost: Vec<TargetId>,
    pub deleted: Vec<TargetId>,
    /// Observations that neither associated nor seeded a track.
    pub discarded: usize,
}

impl StepReport {
    pub fn is_associated(&self, target: TargetId, camera: CameraId) -> bool {
        self.associations
            .iter()
            .any(|a| a.target == target && a.camera == camera)
    }
}

/// All live tracks, keyed by target id.
#[derive(Clone, Debug)]
pub struct TrackFilter {
    params: TrackParams,
    tracks: BTreeMap<TargetId, Track>,
    next_auto_id: u32,
}

impl TrackFilter {
    pub fn new(params: TrackParams) -> Result<Self, TrackConfigError> {
        params.validate()?;
        Ok(Self {
            next_auto_id: params.auto_id_base,
            params,
            tracks: BTreeMap::new(),
        })
    }

    pub fn params(&self) -> &TrackParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn track(&self, id: TargetId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Tracks in ascending id order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> + '_ {
        self.tracks.values()
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &Track> + '_ {
        self.tracks.values().filter(|t| t.is_confirmed())
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.next_auto_id = self.params.auto_id_base;
    }

    /// One association + update pass over every observation of a cycle.
    ///
    /// 1. every track is predicted to `now`;
    /// 2. each observation picks, among same-frame tracks inside the Euclidean
    ///    gate and with a compatible id, the one with the smallest Mahalanobis
    ///    distance (exact ties go to the lowest id);
    /// 3. per (track, camera, modality) only the closest observation is kept;
    /// 4. unmatched confident observations seed Tentative tracks, strongest
    ///    first; a later unmatched observation from another camera or modality
    ///    may join a track born in the same cycle;
    /// 5. kept observations are fused as sequential updates, then lifecycle
    ///    transitions and deletions are applied.
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "debug",
            skip_all,
            fields(observations = measurements.len(), tracks = self.tracks.len())
        )
    )]
    pub fn step(&mut self, measurements: &[Measurement], now: Duration) -> StepReport {
        let mut report = StepReport::default();

        for track in self.tracks.values_mut() {
            let dt = now.saturating_sub(track.last_predict).as_secs_f64();
            track.state.predict(dt);
            track.last_predict = track.last_predict.max(now);
        }

        type Slot = (TargetId, CameraId, Modality);
        let mut slots: BTreeMap<Slot, (f64, usize)> = BTreeMap::new();
        let mut unmatched = Vec::new();
        for (i, m) in measurements.iter().enumerate() {
            match self.best_candidate(m, |_| true) {
                Some((id, d2)) => keep_closest(&mut slots, (id, m.camera_id, m.modality), d2, i),
                None => unmatched.push(i),
            }
        }

        // Births, strongest evidence first.
        unmatched.sort_by(|&a, &b| {
            measurements[b]
                .confidence
                .total_cmp(&measurements[a].confidence)
                .then(a.cmp(&b))
        });
        let mut newborn = BTreeSet::new();
        let mut seeds: BTreeSet<Slot> = BTreeSet::new();
        for i in unmatched {
            let m = &measurements[i];
            // another camera or modality seeing a target born this cycle
            let seed = |id: TargetId| (id, m.camera_id, m.modality);
            let joinable = |id: TargetId| newborn.contains(&id) && !seeds.contains(&seed(id));
            if let Some((id, d2)) = self.best_candidate(m, joinable) {
                keep_closest(&mut slots, (id, m.camera_id, m.modality), d2, i);
                continue;
            }
            if m.confidence < self.params.birth_confidence {
                continue;
            }
            let id = self.birth(m, now);
            log::debug!("track {id} born in {} from {}", m.frame, m.modality);
            newborn.insert(id);
            seeds.insert((id, m.camera_id, m.modality));
            report.born.push(id);
            report.associations.push(Association {
                target: id,
                camera: m.camera_id,
                modality: m.modality,
                centroid: m.centroid,
            });
        }

        let mut matched: BTreeSet<TargetId> = BTreeSet::new();
        for (&(id, camera, modality), &(_, i)) in &slots {
            let Some(track) = self.tracks.get_mut(&id) else {
                continue;
            };
            let m = &measurements[i];
            let noise = self.params.kalman.noise_for(modality);
            if !track.state.update(&m.position, m.orientation, noise) {
                log::warn!("track {id}: degenerate update from {camera}/{modality} skipped");
            }
            track.cameras.insert(camera);
            matched.insert(id);
            report.associations.push(Association {
                target: id,
                camera,
                modality,
                centroid: m.centroid,
            });
        }
        // every observation is a seed, a slot winner or discarded
        report.discarded = measurements.len() - slots.len() - report.born.len();

        let confirm_hits = self.params.confirm_hits;
        for id in &matched {
            let Some(track) = self.tracks.get_mut(id) else {
                continue;
            };
            track.last_update = now;
            if newborn.contains(id) {
                continue;
            }
            match track.status {
                TrackStatus::Tentative => {
                    track.hits += 1;
                    if track.hits >= confirm_hits {
                        track.status = TrackStatus::Confirmed;
                        track.ever_confirmed = true;
                        report.confirmed.push(*id);
                        log::debug!("track {id} confirmed");
                    }
                }
                TrackStatus::Confirmed => track.hits += 1,
                TrackStatus::Lost => {
                    track.lost_since = None;
                    if track.ever_confirmed {
                        track.status = TrackStatus::Confirmed;
                        track.hits += 1;
                    } else {
                        track.status = TrackStatus::Tentative;
                        track.hits = 1;
                    }
                    report.reacquired.push(*id);
                    log::info!("track {id} re-acquired");
                }
            }
        }

        let lost_timeout = self.params.lost_timeout();
        let retention = self.params.retention_window();
        for track in self.tracks.values_mut() {
            if matched.contains(&track.id) || newborn.contains(&track.id) {
                continue;
            }
            match track.status {
                TrackStatus::Tentative | TrackStatus::Confirmed => {
                    if track.status == TrackStatus::Tentative {
                        track.hits = 0;
                    }
                    if now.saturating_sub(track.last_update) > lost_timeout {
                        track.status = TrackStatus::Lost;
                        track.lost_since = Some(now);
                        report.lost.push(track.id);
                        log::info!("track {} lost", track.id);
                    }
                }
                TrackStatus::Lost => {}
            }
        }
        self.tracks.retain(|&id, t| {
            let expired = t.status == TrackStatus::Lost
                && t
                    .lost_since
                    .is_some_and(|since| now.saturating_sub(since) > retention);
            if expired {
                report.deleted.push(id);
                log::info!("track {id} deleted");
            }
            !expired
        });

        report
    }

    /// Closest admissible track for `m` among those accepted by `filter`.
    fn best_candidate(
        &self,
        m: &Measurement,
        filter: impl Fn(TargetId) -> bool,
    ) -> Option<(TargetId, f64)> {
        let gate = match m.frame {
            TrackFrame::Image(_) => self.params.gate_radius_px,
            TrackFrame::Rig => self.params.gate_radius_m,
        };
        let noise = self.params.kalman.noise_for(m.modality);
        let mut best: Option<(TargetId, f64)> = None;
        for (&id, track) in &self.tracks {
            if track.frame != m.frame || !filter(id) {
                continue;
            }
            if let (Some(hint), true) = (m.target_hint, track.labelled) {
                if hint != id {
                    continue;
                }
            }
            if track.state.distance(&m.position) > gate {
                continue;
            }
            let d2 = track.state.mahalanobis_sq(&m.position, noise);
            match best {
                Some((best_id, best_d2)) if d2 >= best_d2 => {
                    if d2 == best_d2 {
                        log::debug!("tie between {best_id} and {id}, keeping {best_id}");
                    }
                }
                _ => best = Some((id, d2)),
            }
        }
        best
    }

    fn birth(&mut self, m: &Measurement, now: Duration) -> TargetId {
        let (id, labelled) = match m.target_hint {
            Some(hint) if !self.tracks.contains_key(&hint) => (hint, true),
            _ => (self.allocate_id(), false),
        };
        let k = &self.params.kalman;
        let motion = match m.frame {
            TrackFrame::Image(_) => &k.image_motion,
            TrackFrame::Rig => &k.rig_motion,
        };
        let state = KalmanState::new(
            m.position,
            m.orientation,
            m.frame.spatial_dims(),
            motion,
            k,
            k.noise_for(m.modality),
        );
        let confirmed = self.params.confirm_hits <= 1;
        self.tracks.insert(
            id,
            Track {
                id,
                frame: m.frame,
                state,
                status: if confirmed {
                    TrackStatus::Confirmed
                } else {
                    TrackStatus::Tentative
                },
                hits: 1,
                ever_confirmed: confirmed,
                labelled,
                created: now,
                last_update: now,
                last_predict: now,
                lost_since: None,
                cameras: BTreeSet::from([m.camera_id]),
            },
        );
        id
    }

    fn allocate_id(&mut self) -> TargetId {
        while self.tracks.contains_key(&TargetId(self.next_auto_id)) {
            self.next_auto_id = self.next_auto_id.wrapping_add(1);
        }
        let id = TargetId(self.next_auto_id);
        self.next_auto_id = self.next_auto_id.wrapping_add(1);
        id
    }
}

fn keep_closest<K: Ord>(slots: &mut BTreeMap<K, (f64, usize)>, key: K, d2: f64, index: usize) {
    slots
        .entry(key)
        .and_modify(|cur| {
            if d2 < cur.0 {
                *cur = (d2, index);
            }
        })
        .or_insert((d2, index));
}
