//! The `optimization` module calibrates a robot work-cell.
//!
//! Given two kinematic chains (one carrying the camera, one carrying the
//! calibration target), an initial guess for the three unknown rigid transforms
//! and a set of measurements taken at known joint states, [`optimize`] estimates
//!
//! * the camera-mount-to-camera transform,
//! * the target-mount-to-target transform,
//! * the camera-chain-base-to-target-chain-base transform,
//! * additive corrections to the nominal DH parameters of both chains.
//!
//! Which components are estimated is controlled by a [`Mask`]. Offsets are
//! regularised by zero-mean priors so redundant directions stay well posed.
//! The non-linear least-squares problem is solved with the tiny-solver
//! Levenberg-Marquardt optimizer and the parameter covariance is recovered from
//! the Jacobian at the solution ([`Covariance`]).

use crate::camera::CameraModelError;
use crate::kinematics::KinematicsError;
use serde::{Deserialize, Serialize};
use tiny_solver::linear::sparse::LinearSolverType;
use tiny_solver::optimizer::OptimizerOptions;

mod cost;
pub mod covariance;
pub mod kinematic;
mod layout;
pub mod mask;
pub mod problem;

pub use covariance::Covariance;
pub use kinematic::{optimize, CalibrationResult};
pub use mask::{DhMask, Mask, MaskError, ParameterGroup, TransformMask};
pub use problem::{CalibrationData, CalibrationProblem};

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error(transparent)]
    Kinematics(#[from] KinematicsError),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
    #[error("{chain} chain, observation {observation}: expected {expected} joint values, got {actual}")]
    JointCountMismatch {
        chain: &'static str,
        observation: usize,
        expected: usize,
        actual: usize,
    },
    #[error("{chain} chain offsets: {source}")]
    ChainOffsets {
        chain: &'static str,
        source: KinematicsError,
    },
    #[error("mask for {group}: {source}")]
    Mask {
        group: ParameterGroup,
        source: MaskError,
    },
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Covariance estimation failed: {0}")]
    Covariance(String),
    #[error("Failed to build solver thread pool: {0}")]
    ThreadPool(String),
}

/// Sparse linear solver used inside each Levenberg-Marquardt step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverKind {
    #[default]
    SparseCholesky,
    #[serde(rename = "sparse_qr")]
    SparseQR,
}

impl From<LinearSolverKind> for LinearSolverType {
    fn from(kind: LinearSolverKind) -> Self {
        match kind {
            LinearSolverKind::SparseCholesky => LinearSolverType::SparseCholesky,
            LinearSolverKind::SparseQR => LinearSolverType::SparseQR,
        }
    }
}

/// Solver settings for a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Maximum number of Levenberg-Marquardt iterations.
    pub max_iterations: usize,
    /// Worker threads for residual evaluation; `0` uses the rayon default.
    pub num_threads: usize,
    pub linear_solver: LinearSolverKind,
    /// Smallest absolute decrease of the total error accepted as progress.
    pub min_abs_decrease: f64,
    /// Smallest relative decrease of the total error accepted as progress.
    pub min_rel_decrease: f64,
    /// Total error below which the solver stops immediately.
    pub min_error: f64,
    /// Relative first-order cost reduction below which the solution counts as converged.
    pub convergence_tolerance: f64,
    pub verbosity: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            num_threads: 0,
            linear_solver: LinearSolverKind::default(),
            min_abs_decrease: 1e-12,
            min_rel_decrease: 1e-10,
            min_error: 1e-16,
            convergence_tolerance: 1e-6,
            verbosity: 0,
        }
    }
}

impl SolverOptions {
    pub(crate) fn to_optimizer_options(&self) -> OptimizerOptions {
        let mut opts = OptimizerOptions::default();
        opts.max_iteration = self.max_iterations;
        opts.linear_solver_type = self.linear_solver.into();
        opts.verbosity_level = self.verbosity;
        opts.min_abs_error_decrease_threshold = self.min_abs_decrease;
        opts.min_rel_error_decrease_threshold = self.min_rel_decrease;
        opts.min_error_threshold = self.min_error;
        opts
    }

    pub(crate) fn validate(&self) -> Result<(), CalibrationError> {
        if self.max_iterations == 0 {
            return Err(CalibrationError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        let thresholds = [
            ("min_abs_decrease", self.min_abs_decrease),
            ("min_rel_decrease", self.min_rel_decrease),
            ("min_error", self.min_error),
            ("convergence_tolerance", self.convergence_tolerance),
        ];
        for (name, value) in thresholds {
            if !(value.is_finite() && value >= 0.0) {
                return Err(CalibrationError::Configuration(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solver_options_from_partial_yaml() {
        let options: SolverOptions =
            serde_yaml::from_str("max_iterations: 50\nlinear_solver: sparse_qr\n").unwrap();
        assert_eq!(options.max_iterations, 50);
        assert_eq!(options.linear_solver, LinearSolverKind::SparseQR);
        assert_eq!(options.num_threads, 0);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_solver_options_reject_negative_tolerance() {
        let options = SolverOptions {
            convergence_tolerance: -1.0,
            ..SolverOptions::default()
        };
        assert!(matches!(
            options.validate(),
            Err(CalibrationError::Configuration(_))
        ));
    }
}
