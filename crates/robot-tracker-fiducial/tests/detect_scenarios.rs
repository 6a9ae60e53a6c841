use std::time::Duration;

use approx::assert_relative_eq;
use robot_tracker_core::synthetic::{fill_disk, render_marker, square_corners, WHITE};
use robot_tracker_core::{
    CameraId, CameraIntrinsics, CameraModel, ColorImage, DepthMap, Frame, Modality, PixelRect,
    Pt2, TargetId,
};
use robot_tracker_fiducial::{DetectorParams, Dictionary, FiducialDetector};

fn scene() -> ColorImage {
    let mut img = ColorImage::filled(320, 240, [128, 128, 128]).expect("image");
    let dict = Dictionary::default();
    let corners = square_corners(Pt2::new(80.0, 80.0), 60.0, 0.0);
    // white quiet zone around the marker
    fill_disk(&mut img, Pt2::new(80.0, 80.0), 50.0, WHITE);
    assert!(render_marker(&mut img, dict.codes[7], dict.marker_size, corners));
    fill_disk(&mut img, Pt2::new(220.0, 60.0), 9.0, WHITE);
    fill_disk(&mut img, Pt2::new(240.0, 180.0), 7.0, [255, 0, 0]);
    img
}

fn frame() -> Frame {
    Frame::new(CameraId(0), Duration::from_millis(33), scene())
}

#[test]
fn every_modality_fires_on_a_mixed_scene() {
    let mut det = FiducialDetector::new(DetectorParams::default()).expect("detector");
    let obs = det.detect_all(&frame(), &[]);

    let aruco: Vec<_> = obs
        .iter()
        .filter(|o| o.modality == Modality::ArucoMarker)
        .collect();
    assert_eq!(aruco.len(), 1);
    assert_eq!(aruco[0].target_hint, Some(TargetId(7)));
    assert_relative_eq!(aruco[0].centroid.x, 80.0, epsilon = 1.0);
    assert_relative_eq!(aruco[0].centroid.y, 80.0, epsilon = 1.0);

    let reflective: Vec<_> = obs
        .iter()
        .filter(|o| o.modality == Modality::ReflectiveBlob)
        .collect();
    assert_eq!(reflective.len(), 1);
    assert_relative_eq!(reflective[0].centroid.x, 220.0, epsilon = 0.5);

    let led: Vec<_> = obs.iter().filter(|o| o.modality == Modality::Led).collect();
    assert_eq!(led.len(), 1);
    assert_relative_eq!(led[0].centroid.y, 180.0, epsilon = 0.5);

    for o in &obs {
        assert!((0.0..=1.0).contains(&o.confidence));
        assert_eq!(o.camera_id, CameraId(0));
        assert_eq!(o.timestamp, Duration::from_millis(33));
    }
    assert_eq!(det.stats().frames, 1);
    assert_eq!(det.stats().total_detections, 3);
    assert_eq!(det.stats().count(Modality::ArucoMarker), 1);
}

#[test]
fn replaying_the_same_frame_is_idempotent() {
    let det = FiducialDetector::new(DetectorParams::default()).expect("detector");
    let f = frame();
    let rois = [PixelRect {
        x: 20,
        y: 20,
        width: 230,
        height: 200,
    }];
    let a: Vec<_> = det.detect(&f, &rois).collect();
    let b: Vec<_> = det.detect(&f, &rois).collect();
    assert!(!a.is_empty());
    assert_eq!(a, b);
}

#[test]
fn rois_restrict_the_search() {
    let det = FiducialDetector::new(DetectorParams::default()).expect("detector");
    let roi = PixelRect {
        x: 195,
        y: 35,
        width: 50,
        height: 50,
    };
    let obs: Vec<_> = det.detect(&frame(), &[roi]).collect();
    assert!(obs.iter().all(|o| roi.contains_point(o.centroid)));
    assert_eq!(
        obs.iter()
            .filter(|o| o.modality == Modality::ReflectiveBlob)
            .count(),
        1
    );
    assert!(obs.iter().all(|o| o.modality != Modality::Led));
}

#[test]
fn empty_scene_is_not_an_error() {
    let mut det = FiducialDetector::new(DetectorParams::default()).expect("detector");
    let img = ColorImage::filled(64, 48, [30, 30, 30]).expect("image");
    let f = Frame::new(CameraId(2), Duration::ZERO, img);
    assert!(det.detect_all(&f, &[]).is_empty());
    assert_eq!(det.stats().frames, 1);
}

#[test]
fn depth_map_lifts_blobs_to_3d() {
    let model = CameraModel::pinhole(CameraIntrinsics {
        fx: 300.0,
        fy: 300.0,
        cx: 160.0,
        cy: 120.0,
        skew: 0.0,
    });
    let depth = DepthMap::from_raw(320, 240, vec![1.5; 320 * 240]).expect("depth");
    let f = frame()
        .with_depth(depth)
        .expect("matching size")
        .with_intrinsics(model);
    let params = DetectorParams {
        led: robot_tracker_fiducial::LedParams {
            enabled: false,
            ..Default::default()
        },
        ..DetectorParams::default()
    };
    let det = FiducialDetector::new(params).expect("detector");
    let blob = det
        .detect(&f, &[])
        .find(|o| o.modality == Modality::ReflectiveBlob)
        .expect("blob");
    let p = blob.point_3d.expect("lifted");
    assert_relative_eq!(p.z, 1.5, epsilon = 1e-9);
    assert_relative_eq!(p.x, (220.0 - 160.0) / 300.0 * 1.5, epsilon = 5e-3);
}

#[test]
fn disabled_modalities_do_not_run() {
    let mut params = DetectorParams::default();
    params.aruco.enabled = false;
    params.reflective.enabled = false;
    let det = FiducialDetector::new(params).expect("detector");
    assert_eq!(det.modalities().collect::<Vec<_>>(), vec![Modality::Led]);
    assert!(det.detect(&frame(), &[]).all(|o| o.modality == Modality::Led));
}

#[test]
fn modalities_can_be_toggled_at_runtime() {
    let mut params = DetectorParams::default();
    params.aruco.enabled = false;
    let mut det = FiducialDetector::new(params).expect("detector");
    assert!(!det.is_enabled(Modality::ArucoMarker));
    assert!(det.detect(&frame(), &[]).all(|o| o.modality != Modality::ArucoMarker));

    assert!(det.set_enabled(Modality::ArucoMarker, true));
    assert!(det.set_enabled(Modality::ReflectiveBlob, false));
    let obs: Vec<_> = det.detect(&frame(), &[]).collect();
    assert!(obs.iter().any(|o| o.modality == Modality::ArucoMarker));
    assert!(obs.iter().all(|o| o.modality != Modality::ReflectiveBlob));
    assert_eq!(
        det.modalities().collect::<Vec<_>>(),
        vec![Modality::ArucoMarker, Modality::Led]
    );
}

#[test]
fn invalid_disabled_modality_cannot_be_switched_on() {
    let mut params = DetectorParams::default();
    params.aruco.enabled = false;
    params.aruco.dictionary = Dictionary {
        codes: Vec::new(),
        ..Dictionary::default()
    };
    let mut det = FiducialDetector::new(params).expect("disabled modality is not validated");
    assert!(!det.set_enabled(Modality::ArucoMarker, true));
    assert!(!det.is_enabled(Modality::ArucoMarker));
}
