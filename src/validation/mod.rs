//! Validation of a calibration against measurements.
//!
//! [`compare_to_measurements`] replays pose measurements through the calibrated
//! chains and summarises the translation and rotation errors in [`Stats`].
//! [`compute_reprojection_error`] and [`compute_kinematic_reprojection_error`]
//! do the same for correspondence observations, reporting a
//! [`ProjectionError`] over the per-point residual norms.

use crate::geometry::isometry_to_matrix;
use crate::kinematics::DhChain;
use crate::observation::{Correspondence, KinematicMeasurement, KinematicObservation, Observation};
use crate::optimization::{CalibrationError, CalibrationResult};
use log::info;
use nalgebra::{DMatrix, Isometry3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mean and population standard deviation of position and rotation errors.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Stats {
    pub pos_mean: f64,
    pub pos_stdev: f64,
    pub rot_mean: f64,
    pub rot_stdev: f64,
}

impl Stats {
    /// Per-field `100 * (self - other) / self`.
    ///
    /// Positive values mean `other` has smaller errors than `self`.
    pub fn percent_diff(&self, other: &Stats) -> Stats {
        let pct = |a: f64, b: f64| 100.0 * (a - b) / a;
        Stats {
            pos_mean: pct(self.pos_mean, other.pos_mean),
            pos_stdev: pct(self.pos_stdev, other.pos_stdev),
            rot_mean: pct(self.rot_mean, other.rot_mean),
            rot_stdev: pct(self.rot_stdev, other.rot_stdev),
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Position error: mean = {:.6}, stdev = {:.6}", self.pos_mean, self.pos_stdev)?;
        write!(f, "Rotation error: mean = {:.6}, stdev = {:.6}", self.rot_mean, self.rot_stdev)
    }
}

/// Streaming mean and population variance (Welford).
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    count: usize,
    mean: f64,
    m2: f64,
}

impl Accumulator {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn mean(&self) -> f64 {
        self.mean
    }

    fn stdev(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

/// Both chains with the calibrated offsets applied.
fn calibrated_chains(
    camera_chain: &DhChain,
    target_chain: &DhChain,
    result: &CalibrationResult,
) -> Result<(DhChain, DhChain), CalibrationError> {
    let apply = |chain: &'static str, nominal: &DhChain, offsets: &DMatrix<f64>| {
        nominal
            .with_offsets(offsets)
            .map_err(|source| CalibrationError::ChainOffsets { chain, source })
    };
    Ok((
        apply("camera", camera_chain, &result.camera_chain_offsets)?,
        apply("target", target_chain, &result.target_chain_offsets)?,
    ))
}

/// Camera-to-target transform predicted by calibrated chains and transforms
/// for the joint values of observation `index`.
fn predicted_camera_to_target(
    camera_chain: &DhChain,
    target_chain: &DhChain,
    result: &CalibrationResult,
    index: usize,
    camera_joints: &[f64],
    target_joints: &[f64],
) -> Result<Isometry3<f64>, CalibrationError> {
    let forward = |chain: &'static str,
                   dh: &DhChain,
                   joints: &[f64]|
     -> Result<Isometry3<f64>, CalibrationError> {
        if joints.len() != dh.dof() {
            return Err(CalibrationError::JointCountMismatch {
                chain,
                observation: index,
                expected: dh.dof(),
                actual: joints.len(),
            });
        }
        Ok(dh.forward_kinematics(joints)?)
    };
    let camera_base_to_camera =
        forward("camera", camera_chain, camera_joints)? * result.camera_mount_to_camera;
    let camera_base_to_target = result.camera_base_to_target_base
        * forward("target", target_chain, target_joints)?
        * result.target_mount_to_target;
    Ok(camera_base_to_camera.inverse() * camera_base_to_target)
}

/// Replays `measurements` through the calibrated system and summarises the errors.
///
/// The position error of a measurement is the translation norm of
/// `predicted^-1 * measured`, the rotation error the angle between the
/// predicted and measured orientations. Joint values outside the chain limits
/// are evaluated as given.
///
/// # Errors
///
/// * [`CalibrationError::Configuration`] for an empty measurement set.
/// * [`CalibrationError::ChainOffsets`] if the result's offsets do not match a chain.
/// * [`CalibrationError::JointCountMismatch`] naming the chain and measurement index.
pub fn compare_to_measurements(
    camera_chain: &DhChain,
    target_chain: &DhChain,
    result: &CalibrationResult,
    measurements: &[KinematicMeasurement],
) -> Result<Stats, CalibrationError> {
    if measurements.is_empty() {
        return Err(CalibrationError::Configuration(
            "no measurements to compare against".to_string(),
        ));
    }
    let (camera_chain, target_chain) = calibrated_chains(camera_chain, target_chain, result)?;

    let mut position = Accumulator::default();
    let mut rotation = Accumulator::default();
    for (index, measurement) in measurements.iter().enumerate() {
        let predicted = predicted_camera_to_target(
            &camera_chain,
            &target_chain,
            result,
            index,
            &measurement.camera_chain_joints,
            &measurement.target_chain_joints,
        )?;
        let diff = predicted.inverse() * measurement.camera_to_target;
        position.push(diff.translation.vector.norm());
        rotation.push(predicted.rotation.angle_to(&measurement.camera_to_target.rotation));
    }

    let stats = Stats {
        pos_mean: position.mean(),
        pos_stdev: position.stdev(),
        rot_mean: rotation.mean(),
        rot_stdev: rotation.stdev(),
    };
    info!(
        "Validated against {} measurements: position {:.6} +/- {:.6}, rotation {:.6} +/- {:.6}",
        measurements.len(),
        stats.pos_mean,
        stats.pos_stdev,
        stats.rot_mean,
        stats.rot_stdev
    );
    Ok(stats)
}

/// Summary of per-point residual norms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl ProjectionError {
    fn from_errors(mut errors: Vec<f64>) -> Result<Self, CalibrationError> {
        if errors.is_empty() {
            return Err(CalibrationError::Configuration(
                "no correspondences to evaluate".to_string(),
            ));
        }
        errors.sort_by(f64::total_cmp);
        let n = errors.len();
        let mut acc = Accumulator::default();
        let mut sum_sq = 0.0;
        for &e in &errors {
            acc.push(e);
            sum_sq += e * e;
        }
        let median = if n % 2 == 0 {
            0.5 * (errors[n / 2 - 1] + errors[n / 2])
        } else {
            errors[n / 2]
        };
        Ok(Self {
            rmse: (sum_sq / n as f64).sqrt(),
            min: errors[0],
            max: errors[n - 1],
            mean: acc.mean(),
            stddev: acc.stdev(),
            median,
        })
    }
}

fn push_errors<C: Correspondence>(
    errors: &mut Vec<f64>,
    correspondences: &[C],
    sensor: &C::Sensor,
    camera_to_target: &Isometry3<f64>,
) {
    let m: Matrix4<f64> = isometry_to_matrix(camera_to_target);
    for c in correspondences {
        let in_sensor: Vector3<f64> = crate::geometry::transform_point(&m, c.in_target());
        errors.push(c.residual(sensor, &in_sensor).norm());
    }
}

/// Residual statistics of observations captured at known mount poses.
///
/// # Errors
///
/// [`CalibrationError::Configuration`] if there is no correspondence at all.
pub fn compute_reprojection_error<C: Correspondence>(
    observations: &[Observation<C>],
    sensor: &C::Sensor,
    camera_mount_to_camera: &Isometry3<f64>,
    target_mount_to_target: &Isometry3<f64>,
) -> Result<ProjectionError, CalibrationError> {
    let mut errors = Vec::new();
    for observation in observations {
        let camera = observation.to_camera_mount * camera_mount_to_camera;
        let target = observation.to_target_mount * target_mount_to_target;
        push_errors(
            &mut errors,
            &observation.correspondences,
            sensor,
            &(camera.inverse() * target),
        );
    }
    ProjectionError::from_errors(errors)
}

/// Residual statistics of kinematic observations replayed through a calibration.
///
/// # Errors
///
/// * [`CalibrationError::Configuration`] if there is no correspondence at all.
/// * [`CalibrationError::ChainOffsets`] if the result's offsets do not match a chain.
/// * [`CalibrationError::JointCountMismatch`] naming the chain and observation index.
pub fn compute_kinematic_reprojection_error<C: Correspondence>(
    camera_chain: &DhChain,
    target_chain: &DhChain,
    result: &CalibrationResult,
    observations: &[KinematicObservation<C>],
    sensor: &C::Sensor,
) -> Result<ProjectionError, CalibrationError> {
    let (camera_chain, target_chain) = calibrated_chains(camera_chain, target_chain, result)?;
    let mut errors = Vec::new();
    for (index, observation) in observations.iter().enumerate() {
        let camera_to_target = predicted_camera_to_target(
            &camera_chain,
            &target_chain,
            result,
            index,
            &observation.camera_chain_joints,
            &observation.target_chain_joints,
        )?;
        push_errors(
            &mut errors,
            &observation.correspondences,
            sensor,
            &camera_to_target,
        );
    }
    ProjectionError::from_errors(errors)
}
