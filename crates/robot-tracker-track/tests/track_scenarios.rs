use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use approx::assert_relative_eq;
use robot_tracker_core::{CameraId, Modality, Observation, Pt2, Pt3, TargetId};
use robot_tracker_track::{Measurement, TrackFilter, TrackFrame, TrackParams, TrackStatus};

const CAM: CameraId = CameraId(0);

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn image(modality: Modality, x: f64, y: f64, t: Duration, hint: Option<u32>) -> Measurement {
    let mut obs = Observation::new(modality, Pt2::new(x, y), 0.9, CAM, t);
    obs.target_hint = hint.map(TargetId);
    Measurement::image(&obs)
}

fn filter() -> TrackFilter {
    TrackFilter::new(TrackParams::default()).expect("params")
}

#[test]
fn three_detections_confirm_a_marker_moving_right() {
    let mut f = filter();
    let id = TargetId(7);
    let mut statuses = Vec::new();
    for (k, (x, y)) in [(100.0, 100.0), (102.0, 101.0), (104.0, 103.0)]
        .into_iter()
        .enumerate()
    {
        let t = ms(33 * k as u64);
        let report = f.step(&[image(Modality::ArucoMarker, x, y, t, Some(7))], t);
        assert!(report.is_associated(id, CAM));
        statuses.push(f.track(id).expect("track 7").status());
    }
    assert_eq!(
        statuses,
        vec![
            TrackStatus::Tentative,
            TrackStatus::Tentative,
            TrackStatus::Confirmed
        ]
    );
    let track = f.track(id).expect("track 7");
    assert_eq!(track.frame(), TrackFrame::Image(CAM));
    assert!(track.velocity().x > 0.0, "{:?}", track.velocity());
    assert_eq!(f.len(), 1);
}

#[test]
fn confirmed_track_is_lost_then_deleted() {
    let mut f = filter();
    for k in 0..3u64 {
        let t = ms(33 * k);
        f.step(&[image(Modality::ArucoMarker, 100.0, 100.0, t, Some(3))], t);
    }
    let id = TargetId(3);
    assert!(f.track(id).expect("track").is_confirmed());
    let last = ms(66);

    let mut lost_at = None;
    let mut deleted_at = None;
    for k in 1..200u64 {
        let t = last + ms(33 * k);
        let report = f.step(&[], t);
        if report.lost.contains(&id) {
            lost_at = Some(t);
            assert_eq!(f.track(id).expect("lost track").lost_since(), Some(t));
        }
        if report.deleted.contains(&id) {
            deleted_at = Some(t);
            break;
        }
    }
    let lost_at = lost_at.expect("went lost");
    let deleted_at = deleted_at.expect("deleted");
    let since_update = lost_at - last;
    assert!(since_update > ms(500) && since_update <= ms(533), "{since_update:?}");
    let retained = deleted_at - lost_at;
    assert!(retained > ms(2000) && retained <= ms(2033), "{retained:?}");
    assert!(f.is_empty());
}

#[test]
fn lost_track_predicts_forward_and_is_reacquired() {
    let mut f = filter();
    for k in 0..6u64 {
        let t = ms(33 * k);
        let x = 100.0 + 3.0 * k as f64;
        f.step(&[image(Modality::ArucoMarker, x, 100.0, t, Some(1))], t);
    }
    let id = TargetId(1);
    let x_before = f.track(id).expect("track").position().x;
    let t_lost = ms(165 + 600);
    let report = f.step(&[], t_lost);
    assert!(report.lost.contains(&id));
    let track = f.track(id).expect("track");
    assert_eq!(track.status(), TrackStatus::Lost);
    assert!(track.position().x > x_before + 20.0);

    let x_pred = track.position().x;
    let t = t_lost + ms(33);
    let report = f.step(&[image(Modality::ArucoMarker, x_pred + 3.0, 100.0, t, Some(1))], t);
    assert_eq!(report.reacquired, vec![id]);
    assert_eq!(f.track(id).expect("track").status(), TrackStatus::Confirmed);
}

#[test]
fn two_modalities_fuse_into_one_track_with_lower_covariance() {
    let mut base = filter();
    for k in 0..3u64 {
        let t = ms(33 * k);
        base.step(&[image(Modality::ArucoMarker, 200.0, 150.0, t, Some(4))], t);
    }
    let id = TargetId(4);
    let t = ms(99);
    let aruco = image(Modality::ArucoMarker, 200.5, 150.0, t, Some(4));
    let blob = image(Modality::ReflectiveBlob, 200.0, 150.5, t, None);

    let trace_after = |ms: &[Measurement]| {
        let mut f = base.clone();
        let report = f.step(ms, t);
        assert!(report.born.is_empty());
        assert_eq!(f.len(), 1);
        f.track(id).expect("track").state().position_variance()
    };
    let only_aruco = trace_after(std::slice::from_ref(&aruco));
    let only_blob = trace_after(std::slice::from_ref(&blob));
    let both = trace_after(&[aruco, blob]);
    assert!(both < only_aruco && both < only_blob, "{both} {only_aruco} {only_blob}");
}

#[test]
fn covariance_grows_on_prediction_and_shrinks_on_update() {
    let mut f = filter();
    for k in 0..4u64 {
        let t = ms(33 * k);
        f.step(&[image(Modality::Led, 50.0 + k as f64, 60.0, t, None)], t);
    }
    let state = f.tracks().next().expect("track").state().clone();
    let mut predicted = state.clone();
    predicted.predict(0.033);
    assert!(predicted.covariance_trace() >= state.covariance_trace());
    let mut updated = predicted.clone();
    let params = TrackParams::default();
    updated.update(
        &robot_tracker_core::Vec3::new(54.0, 60.0, 0.0),
        None,
        &params.kalman.led,
    );
    assert!(updated.covariance_trace() <= predicted.covariance_trace());
}

#[test]
fn hints_must_match_labelled_tracks() {
    let mut f = filter();
    let t0 = ms(0);
    f.step(&[image(Modality::ArucoMarker, 100.0, 100.0, t0, Some(7))], t0);
    let t1 = ms(33);
    let report = f.step(&[image(Modality::ArucoMarker, 101.0, 100.0, t1, Some(8))], t1);
    assert_eq!(report.born, vec![TargetId(8)]);
    assert_eq!(f.len(), 2);
}

#[test]
fn unlabelled_blobs_get_auto_ids_and_ties_go_to_lowest_id() {
    let mut f = filter();
    let t0 = ms(0);
    let report = f.step(
        &[
            image(Modality::ReflectiveBlob, 100.0, 100.0, t0, None),
            image(Modality::ReflectiveBlob, 140.0, 100.0, t0, None),
        ],
        t0,
    );
    assert_eq!(report.born, vec![TargetId(1000), TargetId(1001)]);

    let t1 = ms(33);
    let report = f.step(&[image(Modality::ReflectiveBlob, 120.0, 100.0, t1, None)], t1);
    assert_eq!(report.associations.len(), 1);
    assert_eq!(report.associations[0].target, TargetId(1000));
}

#[test]
fn weak_unmatched_observations_do_not_seed_tracks() {
    let mut f = filter();
    let mut obs = Observation::new(Modality::Led, Pt2::new(10.0, 10.0), 0.2, CAM, ms(0));
    obs.target_hint = None;
    let report = f.step(&[Measurement::image(&obs)], ms(0));
    assert!(report.born.is_empty());
    assert_eq!(report.discarded, 1);
    assert!(f.is_empty());
}

#[test]
fn rig_and_image_tracks_do_not_mix() {
    let mut f = filter();
    let obs = Observation::new(Modality::ReflectiveBlob, Pt2::new(1.0, 1.0), 0.9, CAM, ms(0));
    let rig = Measurement::rig(&obs, Pt3::new(0.0, 0.0, 1.0), None);
    let img = Measurement::image(&obs);
    let report = f.step(&[rig, img], ms(0));
    assert_eq!(report.born.len(), 2);
    let frames: BTreeSet<_> = f.tracks().map(|t| t.frame()).collect();
    assert!(frames.contains(&TrackFrame::Rig));
    assert!(frames.contains(&TrackFrame::Image(CAM)));
    let rig_track = f
        .tracks()
        .find(|t| t.frame() == TrackFrame::Rig)
        .expect("rig track");
    assert_relative_eq!(rig_track.position().z, 1.0);
}

#[test]
fn confirmed_count_never_exceeds_ids_with_k_consecutive_hits() {
    let params = TrackParams::default();
    let k = params.confirm_hits;
    let mut f = TrackFilter::new(params).expect("params");

    // three markers wandering on well separated lanes, randomly occluded
    let mut seed = 0x2545_f491_4f6c_dd1d_u64;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };
    let mut streak: BTreeMap<TargetId, u32> = BTreeMap::new();
    let mut qualified: BTreeSet<TargetId> = BTreeSet::new();
    for cycle in 0..400u64 {
        let t = ms(33 * cycle);
        let mut batch = Vec::new();
        for lane in 0..3u32 {
            if next() % 3 == 0 {
                continue;
            }
            let x = 100.0 + (cycle % 50) as f64;
            let y = 100.0 + 150.0 * lane as f64;
            batch.push(image(Modality::ArucoMarker, x, y, t, Some(lane)));
        }
        let report = f.step(&batch, t);
        let hit: BTreeSet<TargetId> = report.associations.iter().map(|a| a.target).collect();
        for id in f.tracks().map(|t| t.id()).chain(hit.iter().copied()) {
            let s = streak.entry(id).or_insert(0);
            *s = if hit.contains(&id) { *s + 1 } else { 0 };
            if *s >= k {
                qualified.insert(id);
            }
        }
        assert!(f.confirmed().count() <= qualified.len());
        assert!(f.confirmed().all(|t| qualified.contains(&t.id())));
    }
}
