//! Kinematic Calibration Tools Library
//!
//! Calibrates a robot work-cell made of two serial kinematic chains: one
//! carrying a camera (or other sensor), one carrying a calibration target.
//! The library provides:
//! - Denavit-Hartenberg chain model with per-parameter offsets
//! - Pin-hole camera model for 2D-3D observations
//! - Masked non-linear least-squares calibration built on tiny-solver
//! - Parameter covariance and correlation analysis
//! - Validation statistics against held measurements
//! - YAML configuration, measurement loading and JSON reporting

pub mod camera;
pub mod geometry;
pub mod kinematics;
pub mod observation;
pub mod optimization;
pub mod synthetic;
pub mod util;
pub mod validation;

// Re-export commonly used types
pub use camera::{CameraModel, CameraModelError, Intrinsics, PinholeModel, Resolution};

pub use kinematics::{DhChain, DhParameter, DhParameters, DhTransform, JointType, KinematicsError};

pub use observation::{
    Correspondence, Correspondence2D3D, Correspondence3D3D, KinObservation2D3D,
    KinObservation3D3D, KinematicMeasurement, KinematicObservation, Observation,
};

pub use optimization::{
    optimize, CalibrationData, CalibrationError, CalibrationProblem, CalibrationResult,
    Covariance, DhMask, Mask, ParameterGroup, SolverOptions, TransformMask,
};

pub use validation::{compare_to_measurements, ProjectionError, Stats};
