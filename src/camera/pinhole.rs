//! Implements the Pinhole camera model.
//!
//! This module provides the [`PinholeModel`] struct and its associated methods
//! for representing and working with a simple pinhole camera. It adheres to the
//! [`CameraModel`] trait defined in the parent `camera` module ([`crate::camera`]).
//! The checked `f64` projection simulates what a real camera can see; the
//! unchecked [`PinholeModel::project_generic`] is evaluated inside the
//! optimizer's residuals.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use crate::geometry::real;
use nalgebra::{RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use yaml_rust::YamlLoader;

/// Represents a Pinhole camera model.
///
/// This struct holds the intrinsic parameters (focal length, principal point)
/// and image resolution for a pinhole camera. It assumes no lens distortion.
///
/// # Examples
///
/// ```rust
/// use kinematic_calibration_tools::camera::pinhole::PinholeModel;
/// use kinematic_calibration_tools::camera::{Intrinsics, Resolution};
///
/// let intrinsics = Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 };
/// let resolution = Resolution { width: 640, height: 480 };
/// let pinhole_model = PinholeModel::from_parts(intrinsics, resolution).unwrap();
///
/// assert_eq!(pinhole_model.intrinsics.fx, 500.0);
/// assert_eq!(pinhole_model.resolution.width, 640);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinholeModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
}

impl PinholeModel {
    /// Builds a model from intrinsics and a resolution.
    ///
    /// # Arguments
    ///
    /// * `intrinsics` - Focal lengths and principal point in pixels.
    /// * `resolution` - Image size; [`CameraModel::project`] rejects pixels outside it.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn from_parts(
        intrinsics: Intrinsics,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let model = PinholeModel {
            intrinsics,
            resolution,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Projects a camera-frame point without range checks, for generic scalars.
    ///
    /// Used inside residual functions, where rejecting a point would make the
    /// residual vector change size between iterations.
    ///
    /// # Arguments
    ///
    /// * `point` - Point in the camera frame; `z` must be non-zero.
    ///
    /// # Returns
    ///
    /// Pixel coordinates `(fx * x / z + cx, fy * y / z + cy)`.
    pub fn project_generic<T: RealField>(&self, point: &Vector3<T>) -> Vector2<T> {
        let fx = real::<T>(self.intrinsics.fx);
        let fy = real::<T>(self.intrinsics.fy);
        let cx = real::<T>(self.intrinsics.cx);
        let cy = real::<T>(self.intrinsics.cy);
        let inv_z = T::one() / point.z.clone();
        Vector2::new(
            fx * point.x.clone() * inv_z.clone() + cx,
            fy * point.y.clone() * inv_z + cy,
        )
    }

    /// Whether pixel `(u, v)` lies inside the image.
    fn in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0
            && u < self.resolution.width as f64
            && v >= 0.0
            && v < self.resolution.height as f64
    }
}

impl CameraModel for PinholeModel {
    /// Projects a 3D point from camera coordinates to 2D image coordinates.
    ///
    /// This method applies the pinhole camera projection equations:
    /// `u = fx * X / Z + cx`
    /// `v = fy * Y / Z + cy`
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the 3D point's Z-coordinate is too close to zero.
    /// * [`CameraModelError::ProjectionOutSideImage`]: If the projected 2D point falls outside the camera's resolution.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nalgebra::Vector3;
    /// use kinematic_calibration_tools::camera::pinhole::PinholeModel;
    /// use kinematic_calibration_tools::camera::{CameraModel, Intrinsics, Resolution};
    ///
    /// let model = PinholeModel::from_parts(
    ///     Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 },
    ///     Resolution { width: 640, height: 480 },
    /// )
    /// .unwrap();
    ///
    /// let point_2d = model.project(&Vector3::new(0.1, 0.2, 1.0)).unwrap();
    /// assert!((point_2d.x - 370.0).abs() < 1e-6);
    /// assert!((point_2d.y - 340.0).abs() < 1e-6);
    /// ```
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        // If z is very small, the point is at the camera center
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let projected = self.project_generic(point_3d);

        if !self.in_image(projected.x, projected.y) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }

        Ok(projected)
    }

    /// Loads camera parameters from a YAML file.
    ///
    /// The file is expected to hold `cam0.intrinsics` as `[fx, fy, cx, cy]` and
    /// `cam0.resolution` as `[width, height]`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::IOError`]: If there's an issue reading the file.
    /// * [`CameraModelError::YamlError`]: If the YAML content is malformed.
    /// * [`CameraModelError::InvalidParams`]: If expected fields are missing or of the wrong type.
    /// * Errors from `validate_params` if the loaded parameters are invalid.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::YamlError(format!("{path}: empty document")))?;

        let intrinsics_yaml = doc["cam0"]["intrinsics"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("YAML missing 'intrinsics' or not an array".to_string())
        })?;
        let resolution_yaml = doc["cam0"]["resolution"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("YAML missing 'resolution' or not an array".to_string())
        })?;
        if intrinsics_yaml.len() != 4 || resolution_yaml.len() != 2 {
            return Err(CameraModelError::InvalidParams(
                "'intrinsics' needs 4 values and 'resolution' needs 2".to_string(),
            ));
        }

        let float = |index: usize, name: &str| {
            intrinsics_yaml[index].as_f64().ok_or_else(|| {
                CameraModelError::InvalidParams(format!("Invalid {name}: not a float"))
            })
        };
        let intrinsics = Intrinsics {
            fx: float(0, "fx")?,
            fy: float(1, "fy")?,
            cx: float(2, "cx")?,
            cy: float(3, "cy")?,
        };

        let resolution = Resolution {
            width: resolution_yaml[0].as_i64().ok_or_else(|| {
                CameraModelError::InvalidParams("Invalid width: not an integer".to_string())
            })? as u32,
            height: resolution_yaml[1].as_i64().ok_or_else(|| {
                CameraModelError::InvalidParams("Invalid height: not an integer".to_string())
            })? as u32,
        };

        PinholeModel::from_parts(intrinsics, resolution)
    }

    /// Checks that the focal lengths are positive and the principal point is finite.
    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        Ok(())
    }
}
