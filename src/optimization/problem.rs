//! Definition of a kinematic calibration problem.

use crate::camera::{CameraModel, PinholeModel};
use crate::kinematics::DhChain;
use crate::observation::{KinObservation2D3D, KinObservation3D3D, KinematicMeasurement};
use crate::optimization::{CalibrationError, Mask};
use log::debug;
use nalgebra::Isometry3;

/// Default standard deviation of the zero-mean prior on DH offsets.
pub const DEFAULT_OFFSET_STDEV: f64 = 1e-3;

/// Measurements a calibration is fitted to.
#[derive(Debug, Clone)]
pub enum CalibrationData {
    /// Full camera-to-target poses.
    Poses(Vec<KinematicMeasurement>),
    /// Pixel observations of target points through a pin-hole camera.
    Image {
        camera: PinholeModel,
        observations: Vec<KinObservation2D3D>,
    },
    /// Metric observations of target points in the sensor frame.
    Points(Vec<KinObservation3D3D>),
}

impl CalibrationData {
    /// Number of observation records.
    pub fn len(&self) -> usize {
        match self {
            CalibrationData::Poses(m) => m.len(),
            CalibrationData::Image { observations, .. } => observations.len(),
            CalibrationData::Points(o) => o.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(camera_chain_joints, target_chain_joints)` of record `index`.
    pub fn joints(&self, index: usize) -> (&[f64], &[f64]) {
        match self {
            CalibrationData::Poses(m) => (&m[index].camera_chain_joints, &m[index].target_chain_joints),
            CalibrationData::Image { observations, .. } => (
                &observations[index].camera_chain_joints,
                &observations[index].target_chain_joints,
            ),
            CalibrationData::Points(o) => (&o[index].camera_chain_joints, &o[index].target_chain_joints),
        }
    }

    fn correspondence_count(&self, index: usize) -> Option<usize> {
        match self {
            CalibrationData::Poses(_) => None,
            CalibrationData::Image { observations, .. } => {
                Some(observations[index].correspondences.len())
            }
            CalibrationData::Points(o) => Some(o[index].correspondences.len()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CalibrationData::Poses(_) => "pose",
            CalibrationData::Image { .. } => "2D-3D",
            CalibrationData::Points(_) => "3D-3D",
        }
    }
}

/// Everything [`crate::optimization::optimize`] needs for one calibration run.
///
/// The problem is only read by the optimizer. Use [`CalibrationProblem::new`]
/// for identity guesses, default offset priors and an all-free mask, then
/// adjust the public fields.
#[derive(Debug, Clone)]
pub struct CalibrationProblem {
    pub camera_chain: DhChain,
    pub target_chain: DhChain,
    pub camera_mount_to_camera_guess: Isometry3<f64>,
    pub target_mount_to_target_guess: Isometry3<f64>,
    pub camera_base_to_target_base_guess: Isometry3<f64>,
    pub data: CalibrationData,
    /// Prior standard deviation of the camera chain's DH offsets.
    pub camera_chain_offset_stdev: f64,
    /// Prior standard deviation of the target chain's DH offsets.
    pub target_chain_offset_stdev: f64,
    pub mask: Mask,
}

impl CalibrationProblem {
    pub fn new(camera_chain: DhChain, target_chain: DhChain, data: CalibrationData) -> Self {
        let mask = Mask::new(camera_chain.dof(), target_chain.dof());
        Self {
            camera_chain,
            target_chain,
            camera_mount_to_camera_guess: Isometry3::identity(),
            target_mount_to_target_guess: Isometry3::identity(),
            camera_base_to_target_base_guess: Isometry3::identity(),
            data,
            camera_chain_offset_stdev: DEFAULT_OFFSET_STDEV,
            target_chain_offset_stdev: DEFAULT_OFFSET_STDEV,
            mask,
        }
    }

    pub fn observation_count(&self) -> usize {
        self.data.len()
    }

    /// Checks the problem for configuration errors before any numerical work.
    ///
    /// Joints outside their limits only produce a warning.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::Configuration`] for an empty data set, an empty
    ///   observation or a non-positive standard deviation.
    /// * [`CalibrationError::Mask`] if a chain mask does not match the chain's DOF.
    /// * [`CalibrationError::JointCountMismatch`] naming the chain and observation.
    /// * [`CalibrationError::Camera`] for invalid intrinsics.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.data.is_empty() {
            return Err(CalibrationError::Configuration(
                "calibration data set is empty".to_string(),
            ));
        }

        let stdevs = [
            ("camera_chain_offset_stdev", self.camera_chain_offset_stdev),
            ("target_chain_offset_stdev", self.target_chain_offset_stdev),
        ];
        for (name, value) in stdevs {
            if !(value.is_finite() && value > 0.0) {
                return Err(CalibrationError::Configuration(format!(
                    "{name} must be positive and finite, got {value}"
                )));
            }
        }

        self.mask
            .check_dofs(self.camera_chain.dof(), self.target_chain.dof())?;

        if let CalibrationData::Image { camera, .. } = &self.data {
            camera.validate_params()?;
        }

        for index in 0..self.data.len() {
            let (camera_joints, target_joints) = self.data.joints(index);
            let chains = [
                ("camera", &self.camera_chain, camera_joints),
                ("target", &self.target_chain, target_joints),
            ];
            for (name, chain, joints) in chains {
                if joints.len() != chain.dof() {
                    return Err(CalibrationError::JointCountMismatch {
                        chain: name,
                        observation: index,
                        expected: chain.dof(),
                        actual: joints.len(),
                    });
                }
                chain.warn_outside_limits(&format!("{name} chain, observation {index}"), joints);
            }

            if self.data.correspondence_count(index) == Some(0) {
                return Err(CalibrationError::Configuration(format!(
                    "observation {index} has no correspondences"
                )));
            }
        }

        debug!(
            "validated {} {} observations, {} free parameters",
            self.data.len(),
            self.data.kind(),
            self.mask.free_parameter_count()
        );
        Ok(())
    }
}
