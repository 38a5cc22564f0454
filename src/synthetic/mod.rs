//! Deterministic synthetic work-cells.
//!
//! A [`Scene`] holds ground-truth chains, transforms and DH offsets and produces
//! exact measurements and observations from it. Used by the tests and by the
//! binary's `--synthetic` demo.

use crate::camera::{CameraModel, PinholeModel};
use crate::geometry::{isometry_to_matrix, transform_point};
use crate::kinematics::{
    translate_rotate_x, DhChain, DhParameters, DhTransform, JointType, KinematicsError,
    DH_PARAMS_PER_SEGMENT,
};
use crate::observation::{
    Correspondence2D3D, Correspondence3D3D, KinObservation2D3D, KinObservation3D3D,
    KinematicMeasurement,
};
use nalgebra::{DMatrix, Isometry3, Matrix4, Vector3};
use std::f64::consts::{FRAC_PI_2, PI};

/// Joint values of the camera chain and the target chain for one capture.
pub type JointState = (Vec<f64>, Vec<f64>);

/// Two-axis target positioner.
///
/// Segment 1 `[0, 0, 0, -pi/2]` with limits `+/-pi`, segment 2
/// `[-0.475, -pi/2, 0, 0]` with limits `+/-2pi`, base offset
/// `translate(2.2, 0, 1.6) * rotX(pi/2)`.
pub fn two_axis_positioner() -> DhChain {
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

/// Evenly spaced values over `[start, end]`.
pub fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..steps)
            .map(|i| start + (end - start) * i as f64 / (steps - 1) as f64)
            .collect(),
    }
}

/// Cartesian product of per-joint value lists, first joint varying slowest.
pub fn joint_grid(axes: &[Vec<f64>]) -> Vec<Vec<f64>> {
    axes.iter().fold(vec![Vec::new()], |states, values| {
        states
            .iter()
            .flat_map(|prefix| {
                values.iter().map(move |&v| {
                    let mut next = prefix.clone();
                    next.push(v);
                    next
                })
            })
            .collect()
    })
}

/// Planar grid of `nx * ny` target points (z = 0) centred on the origin.
pub fn planar_grid(nx: usize, ny: usize, spacing: f64) -> Vec<Vector3<f64>> {
    let x0 = -0.5 * spacing * nx.saturating_sub(1) as f64;
    let y0 = -0.5 * spacing * ny.saturating_sub(1) as f64;
    let mut points = Vec::with_capacity(nx * ny);
    for j in 0..ny {
        for i in 0..nx {
            points.push(Vector3::new(
                x0 + spacing * i as f64,
                y0 + spacing * j as f64,
                0.0,
            ));
        }
    }
    points
}

/// Ground truth of a work-cell.
#[derive(Debug, Clone)]
pub struct Scene {
    pub camera_chain: DhChain,
    pub target_chain: DhChain,
    pub camera_mount_to_camera: Isometry3<f64>,
    pub target_mount_to_target: Isometry3<f64>,
    pub camera_base_to_target_base: Isometry3<f64>,
    /// True `DOF x 4` DH offsets of the camera chain.
    pub camera_chain_offsets: DMatrix<f64>,
    /// True `DOF x 4` DH offsets of the target chain.
    pub target_chain_offsets: DMatrix<f64>,
}

impl Scene {
    /// Scene with zero DH offsets.
    pub fn new(
        camera_chain: DhChain,
        target_chain: DhChain,
        camera_mount_to_camera: Isometry3<f64>,
        target_mount_to_target: Isometry3<f64>,
        camera_base_to_target_base: Isometry3<f64>,
    ) -> Self {
        let camera_chain_offsets = DMatrix::zeros(camera_chain.dof(), DH_PARAMS_PER_SEGMENT);
        let target_chain_offsets = DMatrix::zeros(target_chain.dof(), DH_PARAMS_PER_SEGMENT);
        Self {
            camera_chain,
            target_chain,
            camera_mount_to_camera,
            target_mount_to_target,
            camera_base_to_target_base,
            camera_chain_offsets,
            target_chain_offsets,
        }
    }

    /// True camera-to-target transform at the given joint states.
    pub fn camera_to_target(
        &self,
        camera_joints: &[f64],
        target_joints: &[f64],
    ) -> Result<Isometry3<f64>, KinematicsError> {
        let camera_chain = self.camera_chain.with_offsets(&self.camera_chain_offsets)?;
        let target_chain = self.target_chain.with_offsets(&self.target_chain_offsets)?;
        let camera = camera_chain.forward_kinematics(camera_joints)? * self.camera_mount_to_camera;
        let target = self.camera_base_to_target_base
            * target_chain.forward_kinematics(target_joints)?
            * self.target_mount_to_target;
        Ok(camera.inverse() * target)
    }

    /// Exact pose measurements at each joint state.
    pub fn pose_measurements(
        &self,
        states: &[JointState],
    ) -> Result<Vec<KinematicMeasurement>, KinematicsError> {
        states
            .iter()
            .map(|(camera_joints, target_joints)| {
                Ok(KinematicMeasurement {
                    camera_chain_joints: camera_joints.clone(),
                    target_chain_joints: target_joints.clone(),
                    camera_to_target: self.camera_to_target(camera_joints, target_joints)?,
                })
            })
            .collect()
    }

    fn points_in_camera(
        &self,
        points: &[Vector3<f64>],
        camera_joints: &[f64],
        target_joints: &[f64],
    ) -> Result<Vec<Vector3<f64>>, KinematicsError> {
        let m: Matrix4<f64> = isometry_to_matrix(&self.camera_to_target(camera_joints, target_joints)?);
        Ok(points.iter().map(|p| transform_point(&m, p)).collect())
    }

    /// Exact pixel observations of `points` (target frame) at each joint state.
    ///
    /// Points behind the camera or projecting outside the image are left out
    /// of that capture.
    pub fn image_observations(
        &self,
        camera: &PinholeModel,
        points: &[Vector3<f64>],
        states: &[JointState],
    ) -> Result<Vec<KinObservation2D3D>, KinematicsError> {
        states
            .iter()
            .map(|(camera_joints, target_joints)| {
                let in_camera = self.points_in_camera(points, camera_joints, target_joints)?;
                Ok(KinObservation2D3D {
                    correspondences: points
                        .iter()
                        .zip(&in_camera)
                        .filter_map(|(target, sensor)| {
                            let in_image = camera.project(sensor).ok()?;
                            Some(Correspondence2D3D {
                                in_image,
                                in_target: *target,
                            })
                        })
                        .collect(),
                    camera_chain_joints: camera_joints.clone(),
                    target_chain_joints: target_joints.clone(),
                })
            })
            .collect()
    }

    /// Exact metric observations of `points` (target frame) at each joint state.
    pub fn point_observations(
        &self,
        points: &[Vector3<f64>],
        states: &[JointState],
    ) -> Result<Vec<KinObservation3D3D>, KinematicsError> {
        states
            .iter()
            .map(|(camera_joints, target_joints)| {
                let in_camera = self.points_in_camera(points, camera_joints, target_joints)?;
                Ok(KinObservation3D3D {
                    correspondences: points
                        .iter()
                        .zip(in_camera)
                        .map(|(target, sensor)| Correspondence3D3D {
                            in_sensor: sensor,
                            in_target: *target,
                        })
                        .collect(),
                    camera_chain_joints: camera_joints.clone(),
                    target_chain_joints: target_joints.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_joint_grid_order() {
        let grid = joint_grid(&[vec![0.0, 1.0], vec![10.0, 20.0, 30.0]]);
        assert_eq!(grid.len(), 6);
        assert_eq!(grid[0], vec![0.0, 10.0]);
        assert_eq!(grid[2], vec![0.0, 30.0]);
        assert_eq!(grid[3], vec![1.0, 10.0]);
        assert_eq!(joint_grid(&[]), vec![Vec::<f64>::new()]);
    }

    #[test]
    fn test_linspace_endpoints() {
        let values = linspace(-1.0, 1.0, 5);
        assert_eq!(values.len(), 5);
        assert_relative_eq!(values[0], -1.0);
        assert_relative_eq!(values[2], 0.0);
        assert_relative_eq!(values[4], 1.0);
    }

    #[test]
    fn test_planar_grid_is_centred() {
        let points = planar_grid(3, 2, 0.1);
        assert_eq!(points.len(), 6);
        let centroid = points.iter().sum::<Vector3<f64>>() / points.len() as f64;
        assert_relative_eq!(centroid, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_image_observations_skip_points_outside_the_image() {
        use crate::camera::{Intrinsics, Resolution};

        let scene = Scene::new(
            DhChain::fixed(Isometry3::identity()),
            DhChain::fixed(Isometry3::translation(0.0, 0.0, 2.0)),
            Isometry3::identity(),
            Isometry3::identity(),
            Isometry3::identity(),
        );
        let camera = PinholeModel::from_parts(
            Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
            },
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap();
        let points = [Vector3::new(0.2, -0.1, 0.0), Vector3::new(10.0, 0.0, 0.0)];
        let observations = scene
            .image_observations(&camera, &points, &[(Vec::new(), Vec::new())])
            .unwrap();

        assert_eq!(observations.len(), 1);
        let seen = &observations[0].correspondences;
        assert_eq!(seen.len(), 1);
        assert_relative_eq!(seen[0].in_image.x, 370.0, epsilon = 1e-9);
        assert_relative_eq!(seen[0].in_image.y, 215.0, epsilon = 1e-9);
    }

    #[test]
    fn test_positioner_limits() {
        let chain = two_axis_positioner();
        assert_eq!(chain.dof(), 2);
        assert_eq!(chain.joints_outside_limits(&[3.0, 6.0]), Vec::<usize>::new());
        assert_eq!(chain.joints_outside_limits(&[3.2, 6.3]), vec![0, 1]);
    }
}
