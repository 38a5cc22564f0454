//! Configuration, measurement files and reporting.
//!
//! The binary is driven by a YAML [`CalibrationConfig`]. Pose measurements are
//! read from a separate YAML file with [`load_measurements`]. Results are printed
//! with the `display_*` helpers and exported as JSON with
//! [`export_calibration_report`].

use crate::camera::{CameraModel, CameraModelError, PinholeModel};
use crate::kinematics::{DhChain, DhParameters, DhTransform, JointType};
use crate::observation::{
    Correspondence, Correspondence2D3D, Correspondence3D3D, KinematicMeasurement,
    KinematicObservation,
};
use crate::optimization::problem::DEFAULT_OFFSET_STDEV;
use crate::optimization::{
    CalibrationData, CalibrationError, CalibrationProblem, CalibrationResult, Mask,
    ParameterGroup, SolverOptions,
};
use crate::validation::{ProjectionError, Stats};
use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Errors raised while reading configuration and measurement files or
/// writing reports.
#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    /// Malformed YAML. `location` names the file and, when known, the record
    /// key or the line and column.
    #[error("{location}: {message}")]
    Parse { location: String, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("JSON export failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

/// Ensure the output directory exists
///
/// # Arguments
///
/// * `output_dir` - Directory to create, including missing parents.
pub fn ensure_output_dir(output_dir: &Path) -> Result<(), UtilError> {
    if !output_dir.exists() {
        fs::create_dir_all(output_dir).map_err(|e| {
            UtilError::InvalidData(format!(
                "Failed to create output directory {}: {e}",
                output_dir.display()
            ))
        })?;
    }
    Ok(())
}

/// Rigid transform written as a translation and a (not necessarily unit) quaternion.
///
/// All seven fields are required when deserializing. [`Default`] is the identity
/// and only fills in a whole record that is absent from a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
}

impl Default for PoseRecord {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            qw: 1.0,
            qx: 0.0,
            qy: 0.0,
            qz: 0.0,
        }
    }
}

impl PoseRecord {
    /// `translate(x, y, z) * rotate(q)` with `q` normalised.
    ///
    /// # Errors
    ///
    /// [`UtilError::InvalidData`] for a zero or non-finite quaternion.
    pub fn to_isometry(&self) -> Result<Isometry3<f64>, UtilError> {
        let q = Quaternion::new(self.qw, self.qx, self.qy, self.qz);
        let norm = q.norm();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(UtilError::InvalidData(format!(
                "quaternion [{}, {}, {}, {}] cannot be normalised",
                self.qw, self.qx, self.qy, self.qz
            )));
        }
        Ok(Isometry3::from_parts(
            Translation3::new(self.x, self.y, self.z),
            UnitQuaternion::from_quaternion(q),
        ))
    }

    /// Record of a rigid transform, with a unit quaternion.
    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        let t = iso.translation.vector;
        let q = iso.rotation.quaternion();
        Self {
            x: t.x,
            y: t.y,
            z: t.z,
            qw: q.w,
            qx: q.i,
            qy: q.j,
            qz: q.k,
        }
    }
}

/// One record of a pose measurement file.
///
/// Joint lists may be omitted for a chain without joints. Unknown fields are
/// rejected so that misspelled keys do not go unnoticed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementRecord {
    #[serde(default)]
    pub target_joints: Vec<f64>,
    #[serde(default)]
    pub camera_joints: Vec<f64>,
    pub pose: PoseRecord,
}

impl MeasurementRecord {
    /// Converts the record, normalising its quaternion.
    pub fn to_measurement(&self) -> Result<KinematicMeasurement, UtilError> {
        Ok(KinematicMeasurement {
            camera_chain_joints: self.camera_joints.clone(),
            target_chain_joints: self.target_joints.clone(),
            camera_to_target: self.pose.to_isometry()?,
        })
    }
}

/// Correspondence record of a measurement file.
///
/// The correspondence fields depend on the sensor: `{in_image: [u, v],
/// in_target: [x, y, z]}` for a camera, `{in_sensor: [x, y, z], in_target:
/// [x, y, z]}` for a metric sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservationRecord<C> {
    #[serde(default)]
    pub target_joints: Vec<f64>,
    #[serde(default)]
    pub camera_joints: Vec<f64>,
    pub correspondences: Vec<C>,
}

impl<C: Correspondence> ObservationRecord<C> {
    pub fn to_observation(&self) -> KinematicObservation<C> {
        KinematicObservation {
            correspondences: self.correspondences.clone(),
            camera_chain_joints: self.camera_joints.clone(),
            target_chain_joints: self.target_joints.clone(),
        }
    }
}

/// Splits a YAML document into named records and converts each of them.
///
/// The document is either a mapping from record names to records or a sequence
/// of records. Records are returned in document order. `source` names the
/// input in error messages.
fn parse_records<R, T>(
    contents: &str,
    source: &str,
    convert: impl Fn(R) -> Result<T, UtilError>,
) -> Result<Vec<T>, UtilError>
where
    R: DeserializeOwned,
{
    let document: serde_yaml::Value =
        serde_yaml::from_str(contents).map_err(|e| UtilError::Parse {
            location: match e.location() {
                Some(loc) => format!("{source}:{}:{}", loc.line(), loc.column()),
                None => source.to_string(),
            },
            message: e.to_string(),
        })?;

    let records: Vec<(String, serde_yaml::Value)> = match document {
        serde_yaml::Value::Null => Vec::new(),
        serde_yaml::Value::Mapping(map) => map
            .into_iter()
            .map(|(key, value)| (record_key(&key), value))
            .collect(),
        serde_yaml::Value::Sequence(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, value)| (i.to_string(), value))
            .collect(),
        _ => {
            return Err(UtilError::Parse {
                location: source.to_string(),
                message: "expected a mapping or a sequence of records".to_string(),
            })
        }
    };

    records
        .into_iter()
        .map(|(key, value)| {
            let location = || format!("{source}, record '{key}'");
            let record: R = serde_yaml::from_value(value).map_err(|e| UtilError::Parse {
                location: location(),
                message: e.to_string(),
            })?;
            convert(record).map_err(|e| UtilError::Parse {
                location: location(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Parses pose measurement records from YAML text.
///
/// # Arguments
///
/// * `contents` - A mapping from record names to records, or a sequence of
///   records, each `{target_joints, camera_joints, pose: {x, y, z, qw, qx, qy, qz}}`.
/// * `source` - Name of the input used in error messages.
///
/// # Errors
///
/// [`UtilError::Parse`] naming `source` and the record for malformed YAML, a
/// missing pose field or a quaternion that cannot be normalised.
pub fn parse_measurements(
    contents: &str,
    source: &str,
) -> Result<Vec<KinematicMeasurement>, UtilError> {
    parse_records(contents, source, |record: MeasurementRecord| {
        record.to_measurement()
    })
}

/// Parses correspondence observation records from YAML text.
///
/// Uses the same document layout and error reporting as [`parse_measurements`].
pub fn parse_observations<C: Correspondence + DeserializeOwned>(
    contents: &str,
    source: &str,
) -> Result<Vec<KinematicObservation<C>>, UtilError> {
    parse_records(contents, source, |record: ObservationRecord<C>| {
        Ok(record.to_observation())
    })
}

fn record_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}

/// Reads measurement records from a YAML file.
pub fn load_measurements(path: impl AsRef<Path>) -> Result<Vec<KinematicMeasurement>, UtilError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let measurements = parse_measurements(&contents, &path.display().to_string())?;
    log::info!(
        "Loaded {} measurements from {}",
        measurements.len(),
        path.display()
    );
    Ok(measurements)
}

/// Reads correspondence observation records from a YAML file.
pub fn load_observations<C: Correspondence + DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<Vec<KinematicObservation<C>>, UtilError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let observations = parse_observations(&contents, &path.display().to_string())?;
    log::info!(
        "Loaded {} observations from {}",
        observations.len(),
        path.display()
    );
    Ok(observations)
}

/// A chain segment in a configuration file. Omitted limits are unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub d: f64,
    pub theta: f64,
    pub r: f64,
    pub alpha: f64,
    #[serde(default = "default_joint_type")]
    pub joint_type: JointType,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

fn default_joint_type() -> JointType {
    JointType::Revolute
}

/// A kinematic chain in a configuration file. No segments means a fixed base.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub base: PoseRecord,
    pub segments: Vec<SegmentConfig>,
}

impl ChainConfig {
    /// Builds the chain. Unnamed segments are called `segment<i>`.
    ///
    /// # Errors
    ///
    /// [`UtilError::InvalidData`] if a lower joint limit exceeds the upper one
    /// or the base quaternion cannot be normalised.
    pub fn to_chain(&self) -> Result<DhChain, UtilError> {
        let transforms = self
            .segments
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let min = s.min.unwrap_or(f64::NEG_INFINITY);
                let max = s.max.unwrap_or(f64::INFINITY);
                if min > max {
                    return Err(UtilError::InvalidData(format!(
                        "segment {i}: lower limit {min} exceeds upper limit {max}"
                    )));
                }
                Ok(DhTransform::new(
                    DhParameters::new(s.d, s.theta, s.r, s.alpha),
                    s.joint_type,
                    min,
                    max,
                    s.name.clone().unwrap_or_else(|| format!("segment{i}")),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DhChain::new(transforms, self.base.to_isometry()?))
    }
}

/// Fixed component indices per parameter group.
///
/// Transforms use `[x, y, z, rx, ry, rz]`, chains the flattened `row * 4 + col`
/// index into the `[d, theta, r, alpha]` offset matrix.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub camera_mount_to_camera: Vec<usize>,
    pub target_mount_to_target: Vec<usize>,
    pub camera_base_to_target_base: Vec<usize>,
    pub camera_chain: Vec<usize>,
    pub target_chain: Vec<usize>,
}

impl MaskConfig {
    fn indices(&self, group: ParameterGroup) -> &[usize] {
        match group {
            ParameterGroup::CameraMountToCamera => &self.camera_mount_to_camera,
            ParameterGroup::TargetMountToTarget => &self.target_mount_to_target,
            ParameterGroup::CameraBaseToTargetBase => &self.camera_base_to_target_base,
            ParameterGroup::CameraChainOffsets => &self.camera_chain,
            ParameterGroup::TargetChainOffsets => &self.target_chain,
        }
    }

    /// Builds the mask for chains with the given numbers of joints.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Mask`] naming the group of an out-of-range index.
    pub fn to_mask(&self, camera_dof: usize, target_dof: usize) -> Result<Mask, CalibrationError> {
        let mut mask = Mask::new(camera_dof, target_dof);
        for group in ParameterGroup::ALL {
            mask.set_fixed_indices(group, self.indices(group))?;
        }
        Ok(mask)
    }
}

fn default_offset_stdev() -> f64 {
    DEFAULT_OFFSET_STDEV
}

fn default_offset_prior_weight() -> f64 {
    100.0
}

fn default_correlation_threshold() -> f64 {
    0.5
}

/// What the records of a measurement file hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// Camera-to-target poses.
    #[default]
    Poses,
    /// Pixel-to-target-point correspondences seen by the configured camera.
    Image,
    /// Sensor-point-to-target-point correspondences.
    Points,
}

/// Configuration of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Measurement file, relative paths resolved against the configuration file.
    pub measurements: PathBuf,
    #[serde(default)]
    pub measurement_kind: MeasurementKind,
    /// Pin-hole camera file (`cam0.intrinsics`, `cam0.resolution`), needed
    /// for image measurements.
    #[serde(default)]
    pub camera: Option<PathBuf>,
    #[serde(default)]
    pub camera_chain: ChainConfig,
    #[serde(default)]
    pub target_chain: ChainConfig,
    #[serde(default)]
    pub camera_mount_to_camera_guess: PoseRecord,
    #[serde(default)]
    pub target_mount_to_target_guess: PoseRecord,
    #[serde(default)]
    pub camera_base_to_target_base_guess: PoseRecord,
    #[serde(default = "default_offset_stdev")]
    pub camera_chain_offset_stdev: f64,
    #[serde(default = "default_offset_stdev")]
    pub target_chain_offset_stdev: f64,
    #[serde(default = "default_offset_prior_weight")]
    pub offset_prior_weight: f64,
    #[serde(default)]
    pub mask: MaskConfig,
    #[serde(default)]
    pub solver: SolverOptions,
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,
}

impl CalibrationConfig {
    /// Parses a configuration; `source` names the input in error messages.
    pub fn from_yaml_str(contents: &str, source: &str) -> Result<Self, UtilError> {
        serde_yaml::from_str(contents).map_err(|e| UtilError::Parse {
            location: match e.location() {
                Some(loc) => format!("{source}:{}:{}", loc.line(), loc.column()),
                None => source.to_string(),
            },
            message: e.to_string(),
        })
    }

    /// Reads the measurement file, and the camera for image measurements.
    ///
    /// # Errors
    ///
    /// * [`UtilError::InvalidData`] if image measurements are configured without a camera.
    /// * [`UtilError::Camera`] if the camera file cannot be loaded.
    /// * I/O and [`UtilError::Parse`] errors of the measurement file.
    pub fn load_data(&self) -> Result<CalibrationData, UtilError> {
        Ok(match self.measurement_kind {
            MeasurementKind::Poses => CalibrationData::Poses(load_measurements(&self.measurements)?),
            MeasurementKind::Image => {
                let camera_path = self.camera.as_ref().ok_or_else(|| {
                    UtilError::InvalidData(
                        "image measurements need a 'camera' intrinsics file".to_string(),
                    )
                })?;
                let camera = PinholeModel::load_from_yaml(&camera_path.display().to_string())?;
                CalibrationData::Image {
                    camera,
                    observations: load_observations::<Correspondence2D3D>(&self.measurements)?,
                }
            }
            MeasurementKind::Points => CalibrationData::Points(
                load_observations::<Correspondence3D3D>(&self.measurements)?,
            ),
        })
    }

    /// Assembles a calibration problem from this configuration and its data.
    pub fn build_problem(&self, data: CalibrationData) -> Result<CalibrationProblem, UtilError> {
        let camera_chain = self.camera_chain.to_chain()?;
        let target_chain = self.target_chain.to_chain()?;
        let mask = self.mask.to_mask(camera_chain.dof(), target_chain.dof())?;

        let mut problem = CalibrationProblem::new(camera_chain, target_chain, data);
        problem.camera_mount_to_camera_guess = self.camera_mount_to_camera_guess.to_isometry()?;
        problem.target_mount_to_target_guess = self.target_mount_to_target_guess.to_isometry()?;
        problem.camera_base_to_target_base_guess =
            self.camera_base_to_target_base_guess.to_isometry()?;
        problem.camera_chain_offset_stdev = self.camera_chain_offset_stdev;
        problem.target_chain_offset_stdev = self.target_chain_offset_stdev;
        problem.mask = mask;
        Ok(problem)
    }
}

/// Loads a [`CalibrationConfig`] and resolves its measurement and camera paths.
///
/// Relative paths are taken relative to the directory of the configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<CalibrationConfig, UtilError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let mut config = CalibrationConfig::from_yaml_str(&contents, &path.display().to_string())?;
    if let Some(dir) = path.parent() {
        let resolve = |file: &Path| {
            if file.is_relative() {
                dir.join(file)
            } else {
                file.to_path_buf()
            }
        };
        config.measurements = resolve(&config.measurements);
        config.camera = config.camera.as_deref().map(resolve);
    }
    Ok(config)
}

/// One calibration pass and its validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub label: String,
    pub result: CalibrationResult,
    /// Pose errors, for pose measurements.
    pub stats: Option<Stats>,
    /// Residual statistics, for correspondence measurements.
    pub reprojection: Option<ProjectionError>,
}

/// Everything exported after a calibration session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub runs: Vec<RunReport>,
    /// Percent error reduction of the run with DH offsets over the run without.
    pub improvement: Option<Stats>,
}

/// Writes `report` as pretty JSON to `output_dir/calibration_report.json`.
pub fn export_calibration_report(
    report: &CalibrationReport,
    output_dir: &Path,
) -> Result<PathBuf, UtilError> {
    ensure_output_dir(output_dir)?;
    let path = output_dir.join("calibration_report.json");
    let file = File::create(&path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)?;
    log::info!("Report written to {}", path.display());
    Ok(path)
}

/// Prints a calibration result followed by its correlation report.
///
/// # Arguments
///
/// * `label` - Heading of the printed section.
/// * `result` - Calibrated transforms, offsets and covariance.
/// * `correlation_threshold` - Absolute correlation above which parameter pairs are listed.
pub fn display_calibration_result(
    label: &str,
    result: &CalibrationResult,
    correlation_threshold: f64,
) {
    println!("\n📊 {label}");
    println!("{}", "=".repeat(label.chars().count() + 3));
    print!("{result}");
    print!(
        "{}",
        result
            .covariance
            .print_correlation_coeff_above_threshold(correlation_threshold)
    );
}

/// Prints pose validation statistics.
///
/// # Arguments
///
/// * `label` - Name of the calibration run.
/// * `stats` - Position and rotation error statistics of that run.
pub fn display_stats(label: &str, stats: &Stats) {
    println!("\n🎯 Validation ({label}):");
    println!("{stats}");
}

/// Prints residual statistics of correspondence measurements.
///
/// # Arguments
///
/// * `label` - Name of the calibration run.
/// * `error` - Residual norms in pixels (image) or metres (points).
pub fn display_reprojection_error(label: &str, error: &ProjectionError) {
    println!("\n🎯 Residuals ({label}):");
    println!("  RMSE:   {:.6}", error.rmse);
    println!("  Mean:   {:.6}", error.mean);
    println!("  Median: {:.6}", error.median);
    println!("  Stddev: {:.6}", error.stddev);
    println!("  Min:    {:.6}", error.min);
    println!("  Max:    {:.6}", error.max);
}

/// Prints the per-field percent change from the run without DH offsets to the
/// run with them; positive values are improvements.
///
/// # Arguments
///
/// * `improvement` - Output of [`Stats::percent_diff`].
pub fn display_improvement(improvement: &Stats) {
    println!("\n📈 Improvement with DH offsets (percent):");
    println!("  Position mean:  {:>8.2} %", improvement.pos_mean);
    println!("  Position stdev: {:>8.2} %", improvement.pos_stdev);
    println!("  Rotation mean:  {:>8.2} %", improvement.rot_mean);
    println!("  Rotation stdev: {:>8.2} %", improvement.rot_stdev);
}
