//! Serial kinematic chains described with Denavit-Hartenberg parameters.
//!
//! A [`DhChain`] is an ordered list of [`DhTransform`] segments preceded by a
//! fixed base offset. Each segment carries its nominal link parameters
//! `[d, theta, r, alpha]`, a [`JointType`] that selects which parameter is driven
//! by the joint variable, and an inclusive joint-limit range.
//!
//! Calibration never mutates a chain. Instead [`DhChain::with_offsets`] produces a
//! new chain whose link parameters are the nominal ones plus a `DOF x 4` offset
//! matrix. The optimizer evaluates the same composition on dual numbers.

use crate::geometry::{isometry_to_matrix, real};
use log::warn;
use nalgebra::{DMatrix, Isometry3, Matrix4, RealField, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of link parameters per segment.
pub const DH_PARAMS_PER_SEGMENT: usize = 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KinematicsError {
    #[error("{what}: expected {expected} values, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
}

/// One of the four Denavit-Hartenberg link parameters, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DhParameter {
    D,
    Theta,
    R,
    Alpha,
}

impl DhParameter {
    pub const ALL: [DhParameter; DH_PARAMS_PER_SEGMENT] = [
        DhParameter::D,
        DhParameter::Theta,
        DhParameter::R,
        DhParameter::Alpha,
    ];

    /// Column of this parameter in a `[d, theta, r, alpha]` row.
    pub fn index(self) -> usize {
        match self {
            DhParameter::D => 0,
            DhParameter::Theta => 1,
            DhParameter::R => 2,
            DhParameter::Alpha => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DhParameter::D => "d",
            DhParameter::Theta => "theta",
            DhParameter::R => "r",
            DhParameter::Alpha => "alpha",
        }
    }
}

/// Kind of joint actuating a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointType {
    /// Rotates about the segment's z axis; the joint value is added to `theta`.
    Revolute,
    /// Slides along the segment's z axis; the joint value is added to `d`.
    Prismatic,
}

impl JointType {
    /// The link parameter driven by the joint variable.
    pub fn live_parameter(self) -> DhParameter {
        match self {
            JointType::Revolute => DhParameter::Theta,
            JointType::Prismatic => DhParameter::D,
        }
    }
}

/// Link parameters `[d, theta, r, alpha]` of a single segment.
///
/// The segment transform is `Tz(d) * Rz(theta) * Tx(r) * Rx(alpha)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DhParameters {
    pub d: f64,
    pub theta: f64,
    pub r: f64,
    pub alpha: f64,
}

impl DhParameters {
    pub fn new(d: f64, theta: f64, r: f64, alpha: f64) -> Self {
        Self { d, theta, r, alpha }
    }

    pub fn as_array(&self) -> [f64; DH_PARAMS_PER_SEGMENT] {
        [self.d, self.theta, self.r, self.alpha]
    }

    pub fn from_array(values: [f64; DH_PARAMS_PER_SEGMENT]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }
}

/// Homogeneous DH transform for generic scalars.
fn dh_matrix<T: RealField>(d: T, theta: T, r: T, alpha: T) -> Matrix4<T> {
    let (st, ct) = theta.sin_cos();
    let (sa, ca) = alpha.sin_cos();
    let zero = T::zero();
    let one = T::one();
    Matrix4::new(
        ct.clone(),
        -st.clone() * ca.clone(),
        st.clone() * sa.clone(),
        r.clone() * ct.clone(),
        st.clone(),
        ct.clone() * ca.clone(),
        -ct * sa.clone(),
        r * st,
        zero.clone(),
        sa,
        ca,
        d,
        zero.clone(),
        zero.clone(),
        zero,
        one,
    )
}

/// A single segment of a serial chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhTransform {
    pub params: DhParameters,
    pub joint_type: JointType,
    /// Lower joint limit (inclusive).
    pub min: f64,
    /// Upper joint limit (inclusive).
    pub max: f64,
    pub name: String,
}

impl DhTransform {
    pub fn new(
        params: DhParameters,
        joint_type: JointType,
        min: f64,
        max: f64,
        name: impl Into<String>,
    ) -> Self {
        Self {
            params,
            joint_type,
            min,
            max,
            name: name.into(),
        }
    }

    /// Revolute segment without effective limits.
    pub fn revolute(params: DhParameters, name: impl Into<String>) -> Self {
        Self::new(
            params,
            JointType::Revolute,
            f64::NEG_INFINITY,
            f64::INFINITY,
            name,
        )
    }

    /// Prismatic segment without effective limits.
    pub fn prismatic(params: DhParameters, name: impl Into<String>) -> Self {
        Self::new(
            params,
            JointType::Prismatic,
            f64::NEG_INFINITY,
            f64::INFINITY,
            name,
        )
    }

    pub fn within_limits(&self, joint: f64) -> bool {
        joint >= self.min && joint <= self.max
    }

    /// Segment transform at the given joint value.
    pub fn transform(&self, joint: f64) -> Isometry3<f64> {
        let zero = [0.0; DH_PARAMS_PER_SEGMENT];
        let m: Matrix4<f64> = self.relative_transform(real(joint), &zero);
        crate::geometry::matrix_to_isometry(&m)
    }

    /// Segment transform with additive parameter offsets `[dd, dtheta, dr, dalpha]`.
    pub(crate) fn relative_transform<T: RealField>(&self, joint: T, offsets: &[T]) -> Matrix4<T> {
        let nominal = self.params.as_array();
        let mut values: [T; DH_PARAMS_PER_SEGMENT] =
            std::array::from_fn(|i| real::<T>(nominal[i]) + offsets[i].clone());
        let live = self.joint_type.live_parameter().index();
        values[live] = values[live].clone() + joint;

        let [d, theta, r, alpha] = values;
        dh_matrix(d, theta, r, alpha)
    }
}

/// Ordered serial linkage with a fixed base offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhChain {
    transforms: Vec<DhTransform>,
    base_offset: Isometry3<f64>,
}

impl DhChain {
    pub fn new(transforms: Vec<DhTransform>, base_offset: Isometry3<f64>) -> Self {
        Self {
            transforms,
            base_offset,
        }
    }

    /// Chain with no joints; its forward kinematics is the base offset.
    pub fn fixed(base_offset: Isometry3<f64>) -> Self {
        Self::new(Vec::new(), base_offset)
    }

    /// Degrees of freedom, equal to the number of segments.
    pub fn dof(&self) -> usize {
        self.transforms.len()
    }

    pub fn transforms(&self) -> &[DhTransform] {
        &self.transforms
    }

    pub fn base_offset(&self) -> &Isometry3<f64> {
        &self.base_offset
    }

    /// Nominal link parameters as a `DOF x 4` matrix, one `[d, theta, r, alpha]` row per segment.
    pub fn dh_parameters(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.dof(), DH_PARAMS_PER_SEGMENT, |row, col| {
            self.transforms[row].params.as_array()[col]
        })
    }

    fn check_joints(&self, joints: &[f64]) -> Result<(), KinematicsError> {
        if joints.len() != self.dof() {
            return Err(KinematicsError::DimensionMismatch {
                what: "joint values".to_string(),
                expected: self.dof(),
                actual: joints.len(),
            });
        }
        Ok(())
    }

    /// Pose of the last segment relative to the chain's reference frame.
    ///
    /// Joint values outside the segment limits are evaluated as given.
    ///
    /// # Errors
    ///
    /// [`KinematicsError::DimensionMismatch`] if `joints.len()` differs from the DOF.
    pub fn forward_kinematics(&self, joints: &[f64]) -> Result<Isometry3<f64>, KinematicsError> {
        self.check_joints(joints)?;
        let mut pose = self.base_offset;
        for (segment, joint) in self.transforms.iter().zip(joints) {
            pose *= segment.transform(*joint);
        }
        Ok(pose)
    }

    /// Generic forward kinematics with row-major additive offsets (`4 * DOF` values).
    ///
    /// Callers are expected to have validated both lengths.
    pub(crate) fn forward_kinematics_generic<T: RealField>(
        &self,
        joints: &[f64],
        offsets: &[T],
    ) -> Matrix4<T> {
        debug_assert_eq!(joints.len(), self.dof());
        debug_assert_eq!(offsets.len(), self.dof() * DH_PARAMS_PER_SEGMENT);
        let mut pose: Matrix4<T> = isometry_to_matrix(&self.base_offset);
        for (i, (segment, joint)) in self.transforms.iter().zip(joints).enumerate() {
            let row = &offsets[i * DH_PARAMS_PER_SEGMENT..(i + 1) * DH_PARAMS_PER_SEGMENT];
            pose *= segment.relative_transform(real::<T>(*joint), row);
        }
        pose
    }

    /// Returns a new chain whose link parameters are nominal plus `offsets`.
    ///
    /// The base offset is unchanged and `self` is left untouched.
    ///
    /// # Errors
    ///
    /// [`KinematicsError::DimensionMismatch`] unless `offsets` is `DOF x 4`.
    pub fn with_offsets(&self, offsets: &DMatrix<f64>) -> Result<DhChain, KinematicsError> {
        if offsets.nrows() != self.dof() {
            return Err(KinematicsError::DimensionMismatch {
                what: "offset rows".to_string(),
                expected: self.dof(),
                actual: offsets.nrows(),
            });
        }
        if offsets.ncols() != DH_PARAMS_PER_SEGMENT {
            return Err(KinematicsError::DimensionMismatch {
                what: "offset columns".to_string(),
                expected: DH_PARAMS_PER_SEGMENT,
                actual: offsets.ncols(),
            });
        }

        let transforms = self
            .transforms
            .iter()
            .enumerate()
            .map(|(row, segment)| {
                let nominal = segment.params.as_array();
                let params = DhParameters::from_array(std::array::from_fn(|col| {
                    nominal[col] + offsets[(row, col)]
                }));
                DhTransform {
                    params,
                    ..segment.clone()
                }
            })
            .collect();

        Ok(DhChain::new(transforms, self.base_offset))
    }

    /// Indices of joints whose value falls outside the segment limits.
    pub fn joints_outside_limits(&self, joints: &[f64]) -> Vec<usize> {
        self.transforms
            .iter()
            .zip(joints)
            .enumerate()
            .filter(|(_, (segment, joint))| !segment.within_limits(**joint))
            .map(|(i, _)| i)
            .collect()
    }

    /// Logs a warning for every out-of-limit joint; never fails.
    pub fn warn_outside_limits(&self, label: &str, joints: &[f64]) {
        for i in self.joints_outside_limits(joints) {
            let segment = &self.transforms[i];
            warn!(
                "{}: joint {} ('{}') value {:.6} outside limits [{}, {}]",
                label, i, segment.name, joints[i], segment.min, segment.max
            );
        }
    }
}

impl fmt::Display for DhChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.base_offset.translation.vector;
        writeln!(
            f,
            "base offset: t = [{:.6}, {:.6}, {:.6}]",
            t.x, t.y, t.z
        )?;
        for (i, segment) in self.transforms.iter().enumerate() {
            let p = &segment.params;
            writeln!(
                f,
                "  {} '{}' {:?}: d = {:.6}, theta = {:.6}, r = {:.6}, alpha = {:.6}",
                i, segment.name, segment.joint_type, p.d, p.theta, p.r, p.alpha
            )?;
        }
        Ok(())
    }
}

/// Isometry translating by `(x, y, z)` followed by a rotation about the x axis.
pub fn translate_rotate_x(x: f64, y: f64, z: f64, angle: f64) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), angle),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn two_segment_chain() -> DhChain {
        DhChain::new(
            vec![
                DhTransform::new(
                    DhParameters::new(0.0, 0.0, 0.0, -FRAC_PI_2),
                    JointType::Revolute,
                    -PI,
                    PI,
                    "j1",
                ),
                DhTransform::new(
                    DhParameters::new(-0.475, -FRAC_PI_2, 0.0, 0.0),
                    JointType::Revolute,
                    -2.0 * PI,
                    2.0 * PI,
                    "j2",
                ),
            ],
            translate_rotate_x(2.2, 0.0, 1.6, FRAC_PI_2),
        )
    }

    #[test]
    fn test_single_segment_matches_dh_definition() {
        let segment = DhTransform::revolute(DhParameters::new(0.3, 0.2, 0.5, 0.4), "s");
        let joint = 0.7;
        let expected = Isometry3::translation(0.0, 0.0, 0.3)
            * Isometry3::rotation(Vector3::z() * (0.2 + joint))
            * Isometry3::translation(0.5, 0.0, 0.0)
            * Isometry3::rotation(Vector3::x() * 0.4);
        assert_relative_eq!(
            segment.transform(joint).to_homogeneous(),
            expected.to_homogeneous(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_prismatic_joint_drives_d() {
        let segment = DhTransform::prismatic(DhParameters::new(0.1, 0.0, 0.0, 0.0), "slide");
        let pose = segment.transform(0.25);
        assert_relative_eq!(pose.translation.vector.z, 0.35, epsilon = 1e-12);
        assert_relative_eq!(pose.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_dof_chain_returns_base() {
        let base = translate_rotate_x(1.0, 2.0, 3.0, 0.3);
        let chain = DhChain::fixed(base);
        assert_eq!(chain.dof(), 0);
        let pose = chain.forward_kinematics(&[]).unwrap();
        assert_relative_eq!(pose.to_homogeneous(), base.to_homogeneous(), epsilon = 1e-12);
        assert!(chain.forward_kinematics(&[0.0]).is_err());
    }

    #[test]
    fn test_joint_count_mismatch() {
        let chain = two_segment_chain();
        let err = chain.forward_kinematics(&[0.1]).unwrap_err();
        assert_eq!(
            err,
            KinematicsError::DimensionMismatch {
                what: "joint values".to_string(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_forward_kinematics_is_deterministic() {
        let chain = two_segment_chain();
        let joints = [0.4, -1.3];
        let a = chain.forward_kinematics(&joints).unwrap();
        let b = chain.forward_kinematics(&joints).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_offsets_leave_chain_unchanged() {
        let chain = two_segment_chain();
        let calibrated = chain.with_offsets(&DMatrix::zeros(2, 4)).unwrap();
        for joints in [[0.0, 0.0], [0.5, -0.2], [-3.0, 6.0]] {
            let a = chain.forward_kinematics(&joints).unwrap();
            let b = calibrated.forward_kinematics(&joints).unwrap();
            assert_relative_eq!(a.to_homogeneous(), b.to_homogeneous(), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_with_offsets_checks_shape_and_keeps_base() {
        let chain = two_segment_chain();
        assert!(chain.with_offsets(&DMatrix::zeros(3, 4)).is_err());
        assert!(chain.with_offsets(&DMatrix::zeros(2, 3)).is_err());

        let mut offsets = DMatrix::zeros(2, 4);
        offsets[(1, 2)] = 0.01;
        let calibrated = chain.with_offsets(&offsets).unwrap();
        assert_relative_eq!(calibrated.transforms()[1].params.r, 0.01);
        assert_eq!(chain.transforms()[1].params.r, 0.0);
        assert_eq!(calibrated.base_offset(), chain.base_offset());
    }

    #[test]
    fn test_generic_matches_f64_path() {
        let chain = two_segment_chain();
        let offsets = [0.01, -0.02, 0.003, 0.004, -0.01, 0.02, 0.0, -0.005];
        let joints = [0.7, -2.1];
        let generic: Matrix4<f64> = chain.forward_kinematics_generic(&joints, &offsets);
        let calibrated = chain
            .with_offsets(&DMatrix::from_row_slice(2, 4, &offsets))
            .unwrap();
        let direct = calibrated.forward_kinematics(&joints).unwrap();
        assert_relative_eq!(generic, direct.to_homogeneous(), epsilon = 1e-12);
    }

    #[test]
    fn test_out_of_limit_joints_are_reported_not_rejected() {
        let chain = two_segment_chain();
        let joints = [4.0, 0.0];
        assert_eq!(chain.joints_outside_limits(&joints), vec![0]);
        assert!(chain.forward_kinematics(&joints).is_ok());
    }
}
