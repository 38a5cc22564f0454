//! Integration tests for work-cell calibration.
//!
//! These tests validate:
//! 1. Recovery of the ground-truth transforms from exact pose measurements
//! 2. Masked components staying at their initial values
//! 3. Detection of unobservable parameter combinations
//! 4. Calibration from 2D-3D and 3D-3D correspondences
//! 5. Validation statistics against the measurements
//! 6. Offsets of a chain carrying the camera, and runs that stop at the iteration limit

use approx::assert_relative_eq;
use kinematic_calibration_tools::camera::{Intrinsics, PinholeModel, Resolution};
use kinematic_calibration_tools::geometry::isometry_from_pose6;
use kinematic_calibration_tools::kinematics::{DhChain, DhParameter};
use kinematic_calibration_tools::optimization::{
    optimize, CalibrationData, CalibrationError, CalibrationProblem, DhMask, ParameterGroup,
    SolverOptions, TransformMask,
};
use kinematic_calibration_tools::synthetic::{
    joint_grid, linspace, planar_grid, two_axis_positioner, JointState, Scene,
};
use kinematic_calibration_tools::validation::{
    compare_to_measurements, compute_kinematic_reprojection_error,
};
use nalgebra::{Isometry3, Point3, Vector3};

const PRIOR_WEIGHT: f64 = 100.0;

fn positioner_scene() -> Scene {
    Scene::new(
        DhChain::fixed(Isometry3::identity()),
        two_axis_positioner(),
        isometry_from_pose6(&[0.1, -0.2, 0.3, 0.1, 0.2, -0.3]),
        isometry_from_pose6(&[0.05, 0.1, 0.02, 0.3, -0.1, 0.2]),
        Isometry3::identity(),
    )
}

/// Camera at 1.6 m height looking at the positioner from the origin.
fn viewing_scene() -> Scene {
    Scene::new(
        DhChain::fixed(Isometry3::identity()),
        two_axis_positioner(),
        Isometry3::face_towards(
            &Point3::new(0.0, 0.0, 1.6),
            &Point3::new(2.2, 0.0, 1.6),
            &Vector3::z(),
        ),
        isometry_from_pose6(&[0.05, 0.1, 0.02, 0.3, -0.1, 0.2]),
        Isometry3::identity(),
    )
}

fn target_states(steps_j1: usize, steps_j2: usize) -> Vec<JointState> {
    joint_grid(&[linspace(-1.2, 1.2, steps_j1), linspace(-2.4, 2.4, steps_j2)])
        .into_iter()
        .map(|target| (Vec::new(), target))
        .collect()
}

fn perturbed(truth: &Isometry3<f64>, delta: [f64; 6]) -> Isometry3<f64> {
    truth * isometry_from_pose6(&delta)
}

/// Pose problem with the aliasing groups masked.
fn pose_problem(scene: &Scene, states: &[JointState]) -> CalibrationProblem {
    let measurements = scene.pose_measurements(states).unwrap();
    let mut problem = CalibrationProblem::new(
        scene.camera_chain.clone(),
        scene.target_chain.clone(),
        CalibrationData::Poses(measurements),
    );
    problem.camera_mount_to_camera_guess = perturbed(
        &scene.camera_mount_to_camera,
        [0.02, -0.01, 0.03, 0.02, -0.03, 0.01],
    );
    problem.target_mount_to_target_guess = perturbed(
        &scene.target_mount_to_target,
        [-0.02, 0.02, 0.01, -0.02, 0.01, 0.03],
    );
    problem.mask.camera_base_to_target_base = TransformMask::ALL;
    problem.mask.target_chain.fix_row(1).unwrap();
    problem
}

#[test]
fn pose_calibration_recovers_ground_truth() {
    let scene = positioner_scene();
    let problem = pose_problem(&scene, &target_states(5, 5));

    let result = optimize(&problem, PRIOR_WEIGHT, &SolverOptions::default()).unwrap();

    assert!(result.converged);
    assert!(result.final_cost_per_obs <= result.initial_cost_per_obs);
    assert!(result.final_cost_per_obs < 1e-10);
    assert_relative_eq!(
        result.camera_mount_to_camera.translation.vector,
        scene.camera_mount_to_camera.translation.vector,
        epsilon = 1e-3
    );
    assert_relative_eq!(
        result.target_mount_to_target.translation.vector,
        scene.target_mount_to_target.translation.vector,
        epsilon = 1e-3
    );
    assert!(
        result
            .camera_mount_to_camera
            .rotation
            .angle_to(&scene.camera_mount_to_camera.rotation)
            < 1e-4
    );
    assert!(
        result
            .target_mount_to_target
            .rotation
            .angle_to(&scene.target_mount_to_target.rotation)
            < 1e-4
    );
    assert_eq!(result.target_chain_offsets.shape(), (2, 4));
    assert_eq!(result.camera_chain_offsets.shape(), (0, 4));
    for value in result.target_chain_offsets.iter() {
        assert!(value.abs() < 1e-4, "offset {value} should vanish");
    }

    let stats = compare_to_measurements(
        &problem.camera_chain,
        &problem.target_chain,
        &result,
        match &problem.data {
            CalibrationData::Poses(m) => m,
            _ => unreachable!(),
        },
    )
    .unwrap();
    assert!(stats.pos_mean < 1e-5);
    assert!(stats.rot_mean < 1e-5);
}

#[test]
fn masked_components_keep_their_initial_values() {
    let scene = positioner_scene();
    let mut problem = pose_problem(&scene, &target_states(4, 4));
    // Rotation known exactly, translation to be estimated.
    problem.camera_mount_to_camera_guess = Isometry3::from_parts(
        (problem.camera_mount_to_camera_guess.translation.vector).into(),
        scene.camera_mount_to_camera.rotation,
    );
    problem.mask.camera_mount_to_camera = TransformMask::ROTATION;
    problem.mask.target_chain = DhMask::all_fixed(2);

    let result = optimize(&problem, PRIOR_WEIGHT, &SolverOptions::default()).unwrap();

    assert_relative_eq!(
        result.camera_mount_to_camera.rotation,
        scene.camera_mount_to_camera.rotation,
        epsilon = 1e-12
    );
    assert_relative_eq!(
        result.camera_mount_to_camera.translation.vector,
        scene.camera_mount_to_camera.translation.vector,
        epsilon = 1e-6
    );
    assert!(result.target_chain_offsets.iter().all(|v| *v == 0.0));
    assert_eq!(
        result.camera_base_to_target_base,
        problem.camera_base_to_target_base_guess
    );

    let labels = &result.covariance.labels;
    assert_eq!(labels.len(), 3 + 6);
    assert!(labels.iter().all(|l| !l.starts_with("target_chain")));
    assert!(labels.iter().all(|l| !l.starts_with("camera_base_to_target_base")));
    assert!(labels.contains(&"camera_mount_to_camera.z".to_string()));
    assert!(!labels.contains(&"camera_mount_to_camera.rx".to_string()));
}

#[test]
fn dh_offsets_reduce_errors_of_a_miscalibrated_chain() {
    let mut scene = positioner_scene();
    scene.target_chain_offsets[(0, 2)] = 0.004;
    scene.target_chain_offsets[(0, 3)] = 0.002;
    let mut with_offsets = pose_problem(&scene, &target_states(5, 6));
    // Offsets of a few millimetres must stay well inside the prior.
    with_offsets.target_chain_offset_stdev = 0.02;
    let mut without_offsets = with_offsets.clone();
    without_offsets.mask.target_chain = DhMask::all_fixed(2);

    let measurements = match &with_offsets.data {
        CalibrationData::Poses(m) => m.clone(),
        _ => unreachable!(),
    };
    let options = SolverOptions::default();
    let stats_with = {
        let result = optimize(&with_offsets, PRIOR_WEIGHT, &options).unwrap();
        assert_relative_eq!(result.target_chain_offsets[(0, 2)], 0.004, epsilon = 5e-4);
        compare_to_measurements(
            &with_offsets.camera_chain,
            &with_offsets.target_chain,
            &result,
            &measurements,
        )
        .unwrap()
    };
    let stats_without = {
        let result = optimize(&without_offsets, PRIOR_WEIGHT, &options).unwrap();
        assert!(result.target_chain_offsets.iter().all(|v| *v == 0.0));
        compare_to_measurements(
            &without_offsets.camera_chain,
            &without_offsets.target_chain,
            &result,
            &measurements,
        )
        .unwrap()
    };

    assert!(stats_with.pos_mean < stats_without.pos_mean);
    let improvement = stats_without.percent_diff(&stats_with);
    assert!(improvement.pos_mean > 50.0);
}

#[test]
fn iteration_limit_reports_non_convergence() {
    let scene = positioner_scene();
    let mut problem = pose_problem(&scene, &target_states(4, 4));
    problem.camera_mount_to_camera_guess = perturbed(
        &scene.camera_mount_to_camera,
        [0.3, -0.2, 0.25, 0.4, -0.3, 0.35],
    );
    problem.target_mount_to_target_guess = perturbed(
        &scene.target_mount_to_target,
        [-0.2, 0.3, 0.1, -0.35, 0.25, 0.4],
    );
    let options = SolverOptions {
        max_iterations: 1,
        ..SolverOptions::default()
    };

    let result = optimize(&problem, PRIOR_WEIGHT, &options).unwrap();

    assert!(!result.converged);
    assert!(result.initial_cost_per_obs > 0.0);
    assert!(result.final_cost_per_obs > 0.0);
    assert!(result.final_cost_per_obs <= result.initial_cost_per_obs);
}

#[test]
fn camera_chain_offsets_are_recovered() {
    // Camera carried by the positioner, target fixed in the cell.
    let mut scene = Scene::new(
        two_axis_positioner(),
        DhChain::fixed(isometry_from_pose6(&[2.0, 0.0, 1.0, 0.0, 0.0, 0.0])),
        isometry_from_pose6(&[0.1, -0.2, 0.3, 0.1, 0.2, -0.3]),
        isometry_from_pose6(&[0.05, 0.1, 0.02, 0.3, -0.1, 0.2]),
        Isometry3::identity(),
    );
    scene.camera_chain_offsets[(0, 2)] = 0.004;
    scene.camera_chain_offsets[(0, 3)] = 0.002;
    let states: Vec<JointState> = target_states(5, 6)
        .into_iter()
        .map(|(_, joints)| (joints, Vec::new()))
        .collect();

    let mut problem = CalibrationProblem::new(
        scene.camera_chain.clone(),
        scene.target_chain.clone(),
        CalibrationData::Poses(scene.pose_measurements(&states).unwrap()),
    );
    problem.camera_mount_to_camera_guess = perturbed(
        &scene.camera_mount_to_camera,
        [0.02, -0.01, 0.03, 0.02, -0.03, 0.01],
    );
    problem.target_mount_to_target_guess = perturbed(
        &scene.target_mount_to_target,
        [-0.02, 0.02, 0.01, -0.02, 0.01, 0.03],
    );
    // Base-to-base aliases the target mount, the base d/theta offsets and the
    // last camera segment alias the two mounts.
    problem.mask.camera_base_to_target_base = TransformMask::ALL;
    problem.mask.camera_chain.fix(0, DhParameter::D).unwrap();
    problem.mask.camera_chain.fix(0, DhParameter::Theta).unwrap();
    problem.mask.camera_chain.fix_row(1).unwrap();

    let result = optimize(&problem, 1e6, &SolverOptions::default()).unwrap();

    assert!(result.converged);
    assert!(result.final_cost_per_obs < 1e-10);
    assert_eq!(result.camera_chain_offsets.shape(), (2, 4));
    assert_eq!(result.target_chain_offsets.shape(), (0, 4));
    assert_relative_eq!(result.camera_chain_offsets[(0, 2)], 0.004, epsilon = 1e-6);
    assert_relative_eq!(result.camera_chain_offsets[(0, 3)], 0.002, epsilon = 1e-6);
    assert_eq!(result.camera_chain_offsets[(0, 0)], 0.0);
    assert!(result.camera_chain_offsets.row(1).iter().all(|v| *v == 0.0));
    assert_relative_eq!(
        result.camera_mount_to_camera.to_homogeneous(),
        scene.camera_mount_to_camera.to_homogeneous(),
        epsilon = 1e-5
    );
    assert!(result
        .covariance
        .labels
        .iter()
        .any(|l| l.starts_with("camera_chain")));

    let stats = compare_to_measurements(
        &problem.camera_chain,
        &problem.target_chain,
        &result,
        match &problem.data {
            CalibrationData::Poses(m) => m,
            _ => unreachable!(),
        },
    )
    .unwrap();
    assert!(stats.pos_mean < 1e-5);
}

#[test]
fn aliasing_transforms_make_the_covariance_fail() {
    let scene = Scene::new(
        DhChain::fixed(Isometry3::identity()),
        DhChain::fixed(Isometry3::identity()),
        isometry_from_pose6(&[0.1, 0.0, 0.0, 0.0, 0.0, 0.1]),
        isometry_from_pose6(&[0.0, 0.2, 0.0, 0.1, 0.0, 0.0]),
        Isometry3::identity(),
    );
    let states: Vec<JointState> = vec![(Vec::new(), Vec::new()); 3];
    let problem = CalibrationProblem::new(
        scene.camera_chain.clone(),
        scene.target_chain.clone(),
        CalibrationData::Poses(scene.pose_measurements(&states).unwrap()),
    );

    match optimize(&problem, PRIOR_WEIGHT, &SolverOptions::default()) {
        Err(CalibrationError::Covariance(message)) => {
            assert!(message.contains("rank deficient"));
        }
        other => panic!("expected a covariance error, got {other:?}"),
    }
}

#[test]
fn configuration_errors_are_reported_before_solving() {
    let scene = positioner_scene();
    let mut problem = pose_problem(&scene, &target_states(2, 2));
    if let CalibrationData::Poses(measurements) = &mut problem.data {
        measurements[1].target_chain_joints.push(0.0);
    }
    assert!(matches!(
        optimize(&problem, PRIOR_WEIGHT, &SolverOptions::default()),
        Err(CalibrationError::JointCountMismatch {
            chain: "target",
            observation: 1,
            expected: 2,
            actual: 3,
        })
    ));

    let mut problem = pose_problem(&scene, &target_states(2, 2));
    problem.mask.camera_chain = DhMask::free(1);
    assert!(matches!(
        optimize(&problem, PRIOR_WEIGHT, &SolverOptions::default()),
        Err(CalibrationError::Mask {
            group: ParameterGroup::CameraChainOffsets,
            ..
        })
    ));

    let problem = pose_problem(&scene, &target_states(2, 2));
    assert!(matches!(
        optimize(&problem, 0.0, &SolverOptions::default()),
        Err(CalibrationError::Configuration(_))
    ));
}

#[test]
fn image_calibration_recovers_mount_transforms() {
    let scene = viewing_scene();
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
    let points = planar_grid(5, 4, 0.05);
    let states: Vec<JointState> = joint_grid(&[linspace(-0.6, 0.6, 4), linspace(-0.8, 0.8, 4)])
        .into_iter()
        .map(|target| (Vec::new(), target))
        .collect();
    let observations = scene.image_observations(&camera, &points, &states).unwrap();

    let mut problem = CalibrationProblem::new(
        scene.camera_chain.clone(),
        scene.target_chain.clone(),
        CalibrationData::Image {
            camera: camera.clone(),
            observations: observations.clone(),
        },
    );
    problem.camera_mount_to_camera_guess = perturbed(
        &scene.camera_mount_to_camera,
        [0.01, -0.01, 0.02, 0.01, -0.02, 0.01],
    );
    problem.target_mount_to_target_guess = perturbed(
        &scene.target_mount_to_target,
        [-0.01, 0.01, 0.01, -0.01, 0.01, 0.02],
    );
    problem.mask.camera_base_to_target_base = TransformMask::ALL;
    problem.mask.target_chain = DhMask::all_fixed(2);

    let result = optimize(&problem, PRIOR_WEIGHT, &SolverOptions::default()).unwrap();

    assert!(result.converged);
    assert!(result.final_cost_per_obs < 1e-8);
    assert_relative_eq!(
        result.camera_mount_to_camera.to_homogeneous(),
        scene.camera_mount_to_camera.to_homogeneous(),
        epsilon = 1e-5
    );
    assert_relative_eq!(
        result.target_mount_to_target.to_homogeneous(),
        scene.target_mount_to_target.to_homogeneous(),
        epsilon = 1e-5
    );

    let error = compute_kinematic_reprojection_error(
        &problem.camera_chain,
        &problem.target_chain,
        &result,
        &observations,
        &camera,
    )
    .unwrap();
    assert!(error.rmse < 1e-4);
}

#[test]
fn point_calibration_recovers_mount_transforms() {
    let scene = viewing_scene();
    let points = planar_grid(4, 4, 0.1);
    let states: Vec<JointState> = joint_grid(&[linspace(-0.6, 0.6, 3), linspace(-0.8, 0.8, 3)])
        .into_iter()
        .map(|target| (Vec::new(), target))
        .collect();
    let observations = scene.point_observations(&points, &states).unwrap();

    let mut problem = CalibrationProblem::new(
        scene.camera_chain.clone(),
        scene.target_chain.clone(),
        CalibrationData::Points(observations),
    );
    problem.camera_mount_to_camera_guess = perturbed(
        &scene.camera_mount_to_camera,
        [0.02, 0.01, -0.02, 0.02, 0.01, -0.01],
    );
    problem.target_mount_to_target_guess = perturbed(
        &scene.target_mount_to_target,
        [0.01, 0.02, -0.01, 0.03, 0.0, -0.02],
    );
    problem.mask.camera_base_to_target_base = TransformMask::ALL;
    problem.mask.target_chain = DhMask::all_fixed(2);

    let result = optimize(&problem, PRIOR_WEIGHT, &SolverOptions::default()).unwrap();

    assert!(result.converged);
    assert_relative_eq!(
        result.camera_mount_to_camera.to_homogeneous(),
        scene.camera_mount_to_camera.to_homogeneous(),
        epsilon = 1e-6
    );
    assert_relative_eq!(
        result.target_mount_to_target.to_homogeneous(),
        scene.target_mount_to_target.to_homogeneous(),
        epsilon = 1e-6
    );
    assert_eq!(result.covariance.dim(), 12);
}
