//! Rigid-body helpers shared by the kinematic model and the residual functions.
//!
//! Everything that is evaluated inside the optimizer is written over a generic
//! scalar `T: RealField`, so the same code runs on `f64` and on the dual numbers
//! used for automatic differentiation. Rotations inside the solver are carried as
//! scaled-axis (rotation vector) parameters and the 6-vector pose layout used
//! throughout the crate is `[x, y, z, rx, ry, rz]`.

use nalgebra::{
    Isometry3, Matrix3, Matrix4, RealField, Rotation3, Translation3, UnitQuaternion, Vector3,
};

/// Number of components in a pose parameter block `[x, y, z, rx, ry, rz]`.
pub const POSE_DIM: usize = 6;

/// Converts an `f64` constant into the generic scalar type.
#[inline]
pub fn real<T: RealField>(value: f64) -> T {
    nalgebra::convert(value)
}

/// Returns the cross-product matrix `[w]x` of a 3-vector.
pub fn skew<T: RealField>(w: &Vector3<T>) -> Matrix3<T> {
    let zero = T::zero();
    Matrix3::new(
        zero.clone(),
        -w.z.clone(),
        w.y.clone(),
        w.z.clone(),
        zero.clone(),
        -w.x.clone(),
        -w.y.clone(),
        w.x.clone(),
        zero,
    )
}

/// Exponential map from a rotation vector to a rotation matrix (Rodrigues formula).
///
/// Near the identity the trigonometric coefficients are replaced by their Taylor
/// expansions so the derivative with respect to `w` stays exact at `w = 0`.
pub fn rotation_from_scaled_axis<T: RealField>(w: &Vector3<T>) -> Matrix3<T> {
    let theta2 = w.norm_squared();
    let k = skew(w);
    let k2 = &k * &k;

    let (a, b) = if theta2 < real(1e-12) {
        (
            T::one() - theta2.clone() / real(6.0),
            real::<T>(0.5) - theta2 / real(24.0),
        )
    } else {
        let theta = theta2.clone().sqrt();
        (
            theta.clone().sin() / theta.clone(),
            (T::one() - theta.cos()) / theta2,
        )
    };

    Matrix3::identity() + k * a + k2 * b
}

/// Logarithm map of a rotation matrix, returning the rotation vector.
///
/// Handles the small-angle case with a series expansion and the case of
/// rotations close to `pi`, where the antisymmetric part vanishes.
pub fn log_rotation<T: RealField>(r: &Matrix3<T>) -> Vector3<T> {
    let half = real::<T>(0.5);
    let s = Vector3::new(
        r[(2, 1)].clone() - r[(1, 2)].clone(),
        r[(0, 2)].clone() - r[(2, 0)].clone(),
        r[(1, 0)].clone() - r[(0, 1)].clone(),
    ) * half.clone();
    let c = (r.trace() - T::one()) * half.clone();
    let sin2 = s.norm_squared();

    if sin2 < real(1e-18) && c > T::zero() {
        let scale = T::one() + sin2 / real(6.0);
        return s * scale;
    }

    let sin = sin2.sqrt();
    let theta = sin.clone().atan2(c.clone());

    if c > real(-0.99) {
        return s * (theta / sin);
    }

    // Near pi: R + I ~ 2 n n^T, take the column with the largest diagonal entry.
    let b = (r + Matrix3::identity()) * half;
    let mut best = 0;
    for i in 1..3 {
        if b[(i, i)] > b[(best, best)] {
            best = i;
        }
    }
    let mut axis = b.column(best).into_owned() / b[(best, best)].clone().sqrt();
    axis.normalize_mut();
    if axis.dot(&s) < T::zero() {
        axis = -axis;
    }
    axis * theta
}

/// Assembles a homogeneous 4x4 transform from a rotation matrix and a translation.
pub fn homogeneous<T: RealField>(rotation: &Matrix3<T>, translation: &Vector3<T>) -> Matrix4<T> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    m
}

/// Rotation block of a homogeneous transform.
pub fn rotation_part<T: RealField>(m: &Matrix4<T>) -> Matrix3<T> {
    m.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Translation column of a homogeneous transform.
pub fn translation_part<T: RealField>(m: &Matrix4<T>) -> Vector3<T> {
    m.fixed_view::<3, 1>(0, 3).into_owned()
}

/// Inverse of a rigid transform, exploiting the orthonormal rotation block.
pub fn rigid_inverse<T: RealField>(m: &Matrix4<T>) -> Matrix4<T> {
    let rt = rotation_part(m).transpose();
    let t = translation_part(m);
    let t_inv = -(&rt * t);
    homogeneous(&rt, &t_inv)
}

/// Applies a homogeneous transform to a point.
pub fn transform_point<T: RealField>(m: &Matrix4<T>, p: &Vector3<T>) -> Vector3<T> {
    rotation_part(m) * p + translation_part(m)
}

/// Builds a homogeneous transform from a pose block `[x, y, z, rx, ry, rz]`.
pub fn pose6_to_matrix<T: RealField>(pose: &[T]) -> Matrix4<T> {
    let t = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
    let w = Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone());
    homogeneous(&rotation_from_scaled_axis(&w), &t)
}

/// Lifts a fixed `f64` isometry into the generic scalar type.
pub fn isometry_to_matrix<T: RealField>(iso: &Isometry3<f64>) -> Matrix4<T> {
    iso.to_homogeneous().map(real::<T>)
}

/// Converts a homogeneous `f64` transform back into an isometry.
///
/// The rotation block is re-orthonormalised through a unit quaternion.
pub fn matrix_to_isometry(m: &Matrix4<f64>) -> Isometry3<f64> {
    let rotation = Rotation3::from_matrix(&rotation_part(m));
    Isometry3::from_parts(
        Translation3::from(translation_part(m)),
        UnitQuaternion::from_rotation_matrix(&rotation),
    )
}

/// Pose block `[x, y, z, rx, ry, rz]` of an isometry.
pub fn pose6_from_isometry(iso: &Isometry3<f64>) -> [f64; POSE_DIM] {
    let t = iso.translation.vector;
    let w = iso.rotation.scaled_axis();
    [t.x, t.y, t.z, w.x, w.y, w.z]
}

/// Isometry described by a pose block `[x, y, z, rx, ry, rz]`.
pub fn isometry_from_pose6(pose: &[f64]) -> Isometry3<f64> {
    Isometry3::new(
        Vector3::new(pose[0], pose[1], pose[2]),
        Vector3::new(pose[3], pose[4], pose[5]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_rodrigues_matches_nalgebra() {
        let samples = [
            Vector3::new(0.1, -0.2, 0.3),
            Vector3::new(1.2, 0.4, -0.7),
            Vector3::new(0.0, 0.0, 3.0),
            Vector3::new(1e-8, 0.0, -2e-8),
        ];
        for w in samples {
            let ours = rotation_from_scaled_axis(&w);
            let reference = Rotation3::from_scaled_axis(w);
            assert_relative_eq!(ours, *reference.matrix(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_log_inverts_exp() {
        let samples = [
            Vector3::new(0.1, -0.2, 0.3),
            Vector3::new(-1.0, 0.5, 2.0),
            Vector3::new(1e-10, 2e-10, 0.0),
            Vector3::new(0.0, 0.0, 0.0),
        ];
        for w in samples {
            let r = rotation_from_scaled_axis(&w);
            assert_relative_eq!(log_rotation(&r), w, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_log_near_pi() {
        let axis = Vector3::new(1.0, 2.0, -0.5).normalize();
        let w = axis * (PI - 1e-7);
        let r = rotation_from_scaled_axis(&w);
        let recovered = log_rotation(&r);
        assert_relative_eq!(recovered.norm(), PI - 1e-7, epsilon = 1e-6);
        let back = rotation_from_scaled_axis(&recovered);
        assert_relative_eq!(back, r, epsilon = 1e-6);
    }

    #[test]
    fn test_rigid_inverse() {
        let iso = isometry_from_pose6(&[0.3, -1.2, 2.0, 0.4, -0.1, 0.8]);
        let m: Matrix4<f64> = isometry_to_matrix(&iso);
        let product = m * rigid_inverse(&m);
        assert_relative_eq!(product, Matrix4::identity(), epsilon = 1e-12);

        let p = Vector3::new(0.5, 0.6, -0.7);
        let expected = iso * nalgebra::Point3::from(p);
        assert_relative_eq!(transform_point(&m, &p), expected.coords, epsilon = 1e-12);
    }

    #[test]
    fn test_pose6_conversions_agree() {
        let pose = [0.05, 0.1, 0.02, 0.3, -0.1, 0.2];
        let iso = isometry_from_pose6(&pose);
        let from_block: Matrix4<f64> = pose6_to_matrix(&pose);
        assert_relative_eq!(from_block, iso.to_homogeneous(), epsilon = 1e-12);

        let recovered = pose6_from_isometry(&matrix_to_isometry(&from_block));
        for (a, b) in recovered.iter().zip(pose.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }
}
