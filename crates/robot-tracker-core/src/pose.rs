use crate::{Iso3, Mat3, Vec3};
use nalgebra::{Rotation3, Translation3, UnitQuaternion};

/// Decompose a plane-to-image homography `H = K [r1 r2 t]` into the pose of the
/// plane (`Z = 0` in its own frame) relative to the camera.
///
/// The rotation is projected onto SO(3) and the sign is chosen so the plane
/// origin lies in front of the camera.
pub fn planar_pose_from_homography(k: &Mat3, h: &Mat3) -> Option<Iso3> {
    let k_inv = k.try_inverse()?;
    let a1: Vec3 = k_inv * h.column(0);
    let a2: Vec3 = k_inv * h.column(1);
    let a3: Vec3 = k_inv * h.column(2);

    let norm = 0.5 * (a1.norm() + a2.norm());
    if norm < 1e-12 {
        return None;
    }
    let mut lambda = 1.0 / norm;
    if (lambda * a3).z < 0.0 {
        lambda = -lambda;
    }

    let r1 = lambda * a1;
    let r2 = lambda * a2;
    let r = Mat3::from_columns(&[r1, r2, r1.cross(&r2)]);

    let svd = r.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let rot = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    Some(Iso3::from_parts(Translation3::from(lambda * a3), rot))
}

/// Rotation angle between two isometries, radians.
pub fn rotation_angle_between(a: &Iso3, b: &Iso3) -> f64 {
    a.rotation.angle_to(&b.rotation)
}

/// Average a set of rigid transforms: arithmetic mean of translations and a
/// normalized quaternion mean with every quaternion flipped onto the first one's
/// hemisphere.
pub fn average_isometries(poses: &[Iso3]) -> Option<Iso3> {
    let first = poses.first()?;
    let q0 = first.rotation.into_inner();

    let mut t_sum = Vec3::zeros();
    let mut q_sum = nalgebra::Vector4::<f64>::zeros();
    for p in poses {
        t_sum += p.translation.vector;
        let q = p.rotation.into_inner();
        let c = if q.coords.dot(&q0.coords) < 0.0 {
            -q.coords
        } else {
            q.coords
        };
        q_sum += c;
    }
    let n = poses.len() as f64;
    let q = nalgebra::Quaternion::from(q_sum / n);
    if q.norm() < 1e-12 {
        return None;
    }
    Some(Iso3::from_parts(
        Translation3::from(t_sum / n),
        UnitQuaternion::from_quaternion(q),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn k() -> Mat3 {
        Mat3::new(800.0, 0.0, 640.0, 0.0, 780.0, 360.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn planar_pose_recovers_ground_truth() {
        let rot = Rotation3::from_euler_angles(0.1, -0.05, 0.2);
        let gt = Iso3::from_parts(Translation3::new(0.1, -0.05, 1.0), rot.into());
        let r = gt.rotation.to_rotation_matrix();
        let h = k() * Mat3::from_columns(&[
            r.matrix().column(0).into_owned(),
            r.matrix().column(1).into_owned(),
            gt.translation.vector,
        ]);
        // Arbitrary negative scale must not flip the plane behind the camera.
        let est = planar_pose_from_homography(&k(), &(h * -2.5)).expect("pose");
        assert_relative_eq!(est.translation.vector, gt.translation.vector, epsilon = 1e-9);
        assert!(rotation_angle_between(&est, &gt) < 1e-9);
    }

    #[test]
    fn averaging_handles_quaternion_sign() {
        let a = Iso3::from_parts(
            Translation3::new(1.0, 0.0, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.1),
        );
        let q = a.rotation.into_inner();
        let flipped = UnitQuaternion::new_unchecked(-q);
        let b = Iso3::from_parts(Translation3::new(3.0, 0.0, 0.0), flipped);
        let avg = average_isometries(&[a, b]).expect("average");
        assert_relative_eq!(avg.translation.vector.x, 2.0);
        assert!(rotation_angle_between(&avg, &a) < 1e-12);
        assert!(average_isometries(&[]).is_none());
    }
}
