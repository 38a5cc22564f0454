//! Data model for calibration inputs.
//!
//! A [`Correspondence`] pairs a feature measured in the sensor frame with the
//! same feature expressed in the target frame. Two concrete kinds exist:
//! [`Correspondence2D3D`] (pixel against target point, measured by a pin-hole
//! camera) and [`Correspondence3D3D`] (metric point against target point, e.g.
//! from a depth sensor). Calibration code is written once over the trait.
//!
//! Correspondences are grouped into observations that carry either the known
//! mount poses ([`Observation`]) or the joint states of both kinematic chains
//! at capture time ([`KinematicObservation`]). Full 6-DoF pose measurements are
//! represented by [`KinematicMeasurement`].

use crate::camera::PinholeModel;
use nalgebra::{DVector, Isometry3, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A sensor-frame measurement paired with its target-frame location.
pub trait Correspondence: Clone + fmt::Debug + Send + Sync + 'static {
    /// Number of residual components contributed by one correspondence.
    const SENSOR_DIM: usize;
    /// Dimension of the target-frame feature.
    const TARGET_DIM: usize = 3;

    /// Sensor model needed to compare a predicted point with the measurement.
    type Sensor: Clone + fmt::Debug + Send + Sync + 'static;

    /// Feature location in the target frame.
    fn in_target(&self) -> &Vector3<f64>;

    /// Residual between the predicted sensor-frame point and the measurement.
    fn residual<T: RealField>(
        &self,
        sensor: &Self::Sensor,
        point_in_sensor: &Vector3<T>,
    ) -> DVector<T>;
}

/// Image pixel observed by a pin-hole camera paired with a target point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correspondence2D3D {
    pub in_image: Vector2<f64>,
    pub in_target: Vector3<f64>,
}

impl Correspondence for Correspondence2D3D {
    const SENSOR_DIM: usize = 2;
    type Sensor = PinholeModel;

    fn in_target(&self) -> &Vector3<f64> {
        &self.in_target
    }

    fn residual<T: RealField>(
        &self,
        sensor: &PinholeModel,
        point_in_sensor: &Vector3<T>,
    ) -> DVector<T> {
        let projected = sensor.project_generic(point_in_sensor);
        let measured = self.in_image.map(crate::geometry::real::<T>);
        DVector::from_column_slice((projected - measured).as_slice())
    }
}

/// Metric point observed in the sensor frame paired with a target point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correspondence3D3D {
    pub in_sensor: Vector3<f64>,
    pub in_target: Vector3<f64>,
}

impl Correspondence for Correspondence3D3D {
    const SENSOR_DIM: usize = 3;
    type Sensor = ();

    fn in_target(&self) -> &Vector3<f64> {
        &self.in_target
    }

    fn residual<T: RealField>(&self, _sensor: &(), point_in_sensor: &Vector3<T>) -> DVector<T> {
        let measured = self.in_sensor.map(crate::geometry::real::<T>);
        DVector::from_column_slice((point_in_sensor - measured).as_slice())
    }
}

/// Correspondences captured with known camera-mount and target-mount poses.
///
/// Both mount poses are expressed in a common reference frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation<C> {
    pub correspondences: Vec<C>,
    pub to_camera_mount: Isometry3<f64>,
    pub to_target_mount: Isometry3<f64>,
}

/// Correspondences captured at known joint states of both chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinematicObservation<C> {
    pub correspondences: Vec<C>,
    pub camera_chain_joints: Vec<f64>,
    pub target_chain_joints: Vec<f64>,
}

/// Full 6-DoF camera-to-target pose measured at known joint states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinematicMeasurement {
    pub camera_chain_joints: Vec<f64>,
    pub target_chain_joints: Vec<f64>,
    pub camera_to_target: Isometry3<f64>,
}

pub type Observation2D3D = Observation<Correspondence2D3D>;
pub type Observation3D3D = Observation<Correspondence3D3D>;
pub type KinObservation2D3D = KinematicObservation<Correspondence2D3D>;
pub type KinObservation3D3D = KinematicObservation<Correspondence3D3D>;
