//! Entry point of the kinematic calibration.

use crate::geometry::{isometry_from_pose6, POSE_DIM};
use crate::kinematics::DH_PARAMS_PER_SEGMENT;
use crate::optimization::cost::ResidualModel;
use crate::optimization::covariance::Covariance;
use crate::optimization::layout::ParameterLayout;
use crate::optimization::mask::ParameterGroup;
use crate::optimization::problem::CalibrationProblem;
use crate::optimization::{CalibrationError, SolverOptions};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Isometry3};
use serde::{Deserialize, Serialize};
use std::fmt;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

/// Outcome of [`optimize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Whether the solution satisfies the first-order convergence test.
    pub converged: bool,
    /// Sum of squared residuals per observation at the initial guess.
    pub initial_cost_per_obs: f64,
    /// Sum of squared residuals per observation at the solution.
    pub final_cost_per_obs: f64,
    pub camera_mount_to_camera: Isometry3<f64>,
    pub target_mount_to_target: Isometry3<f64>,
    pub camera_base_to_target_base: Isometry3<f64>,
    /// `DOF x 4` offsets `[d, theta, r, alpha]` of the camera chain.
    pub camera_chain_offsets: DMatrix<f64>,
    /// `DOF x 4` offsets `[d, theta, r, alpha]` of the target chain.
    pub target_chain_offsets: DMatrix<f64>,
    pub covariance: Covariance,
}

/// Calibrates the work-cell described by `problem`.
///
/// The free parameters are the unmasked components of the three transform
/// guesses (as `[x, y, z, rx, ry, rz]`) and of both chains' DH offsets
/// (starting at zero). Each free offset is pulled towards zero by a prior with
/// standard deviation `stdev * offset_prior_weight`, so a larger weight makes
/// the priors weaker.
///
/// Reaching the iteration limit is not an error: the result then carries
/// `converged = false` together with the best parameters found.
///
/// # Arguments
///
/// * `problem` - Chains, guesses, measurements, offset priors and mask.
/// * `offset_prior_weight` - Positive scale of the offset prior standard deviations.
/// * `options` - Solver settings.
///
/// # Errors
///
/// * Configuration errors from [`CalibrationProblem::validate`] and invalid
///   solver options, reported before any numerical work.
/// * [`CalibrationError::ThreadPool`] if the worker pool cannot be created.
/// * [`CalibrationError::Covariance`] if the Jacobian at the solution is rank
///   deficient, e.g. when aliasing transforms are left free together.
pub fn optimize(
    problem: &CalibrationProblem,
    offset_prior_weight: f64,
    options: &SolverOptions,
) -> Result<CalibrationResult, CalibrationError> {
    if !(offset_prior_weight.is_finite() && offset_prior_weight > 0.0) {
        return Err(CalibrationError::Configuration(format!(
            "offset_prior_weight must be positive and finite, got {offset_prior_weight}"
        )));
    }
    options.validate()?;
    problem.validate()?;

    let model = ResidualModel::new(problem, offset_prior_weight);
    let layout = model.layout();
    let initial_free = layout.initial_free();
    let initial_cost_per_obs = model.cost_per_observation(&initial_free);

    info!(
        "Calibrating with {} {} observations, {} free parameters, {} residuals",
        problem.observation_count(),
        problem.data.kind(),
        layout.free_len(),
        model.residual_dim()
    );
    info!("Initial cost per observation: {initial_cost_per_obs:.6e}");

    if layout.free_len() == 0 {
        warn!("Every parameter is masked, nothing to optimize");
        return Ok(assemble_result(
            problem,
            layout,
            &initial_free,
            true,
            initial_cost_per_obs,
            initial_cost_per_obs,
            Covariance::empty(),
        ));
    }

    let final_free = solve(&model, options)?;
    let final_free = match final_free {
        Some(free) => free,
        None => {
            warn!("Levenberg-Marquardt returned no solution, keeping the initial guess");
            initial_free.clone()
        }
    };

    let mut final_cost_per_obs = model.cost_per_observation(&final_free);
    let final_free = if final_cost_per_obs > initial_cost_per_obs {
        warn!(
            "Solver ended above the initial cost ({final_cost_per_obs:.6e} > {initial_cost_per_obs:.6e}), keeping the initial guess"
        );
        final_cost_per_obs = initial_cost_per_obs;
        initial_free
    } else {
        final_free
    };
    info!("Final cost per observation: {final_cost_per_obs:.6e}");

    let residuals = model.residuals(&final_free);
    let jacobian = model.jacobian(&final_free);
    let converged =
        first_order_converged(&jacobian, &residuals, problem.observation_count(), options);
    if converged {
        info!("Calibration converged");
    } else {
        warn!("Calibration did not converge");
    }

    let covariance = Covariance::from_jacobian(&jacobian, layout.free_labels()).map_err(|e| {
        warn!("{e}");
        e
    })?;

    Ok(assemble_result(
        problem,
        layout,
        &final_free,
        converged,
        initial_cost_per_obs,
        final_cost_per_obs,
        covariance,
    ))
}

/// Runs Levenberg-Marquardt on a dedicated worker pool.
fn solve(
    model: &ResidualModel,
    options: &SolverOptions,
) -> Result<Option<Vec<f64>>, CalibrationError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.num_threads)
        .build()
        .map_err(|e| CalibrationError::ThreadPool(e.to_string()))?;
    let initial_values = model.layout().initial_values();
    let optimizer_options = options.to_optimizer_options();

    debug!(
        "Starting tiny-solver Levenberg-Marquardt on {} threads",
        pool.current_num_threads()
    );
    let solution = pool.install(|| {
        let tiny_problem = model.build_problem();
        let optimizer = LevenbergMarquardtOptimizer::default();
        optimizer.optimize(&tiny_problem, &initial_values, Some(optimizer_options))
    });
    debug!("Optimization finished");

    Ok(solution.map(|values| model.layout().free_from_solution(&values)))
}

/// First-order test: the Gauss-Newton step predicted from the final Jacobian
/// would not reduce the cost noticeably.
///
/// With `J = U S V^T`, the Gauss-Newton step lowers the sum of squares by
/// `||U^T r||^2` over the numerically non-zero singular directions.
fn first_order_converged(
    jacobian: &DMatrix<f64>,
    residuals: &DVector<f64>,
    observation_count: usize,
    options: &SolverOptions,
) -> bool {
    let sum_squared = residuals.norm_squared();
    if sum_squared <= options.min_error {
        return true;
    }
    let (m, n) = jacobian.shape();
    let svd = jacobian.clone().svd(true, false);
    let Some(u) = svd.u else {
        return false;
    };
    let tolerance = svd.singular_values.max() * f64::EPSILON * m.max(n) as f64;
    let predicted: f64 = u
        .column_iter()
        .zip(svd.singular_values.iter())
        .filter(|(_, s)| **s > tolerance)
        .map(|(column, _)| column.dot(residuals).powi(2))
        .sum();

    let count = observation_count as f64;
    let cost = sum_squared / count;
    let predicted_decrease = predicted / count;
    debug!("Predicted Gauss-Newton decrease per observation: {predicted_decrease:.3e}");
    predicted_decrease <= options.convergence_tolerance * cost
        || predicted_decrease <= options.min_abs_decrease
}

#[allow(clippy::too_many_arguments)]
fn assemble_result(
    problem: &CalibrationProblem,
    layout: &ParameterLayout,
    free: &[f64],
    converged: bool,
    initial_cost_per_obs: f64,
    final_cost_per_obs: f64,
    covariance: Covariance,
) -> CalibrationResult {
    let transform = |group: ParameterGroup, guess: &Isometry3<f64>| {
        if layout.block(group).is_active() {
            let values = layout.group_values(group, free);
            debug_assert_eq!(values.len(), POSE_DIM);
            isometry_from_pose6(&values)
        } else {
            *guess
        }
    };
    let offsets = |group: ParameterGroup, dof: usize| {
        DMatrix::from_row_slice(dof, DH_PARAMS_PER_SEGMENT, &layout.group_values(group, free))
    };

    CalibrationResult {
        converged,
        initial_cost_per_obs,
        final_cost_per_obs,
        camera_mount_to_camera: transform(
            ParameterGroup::CameraMountToCamera,
            &problem.camera_mount_to_camera_guess,
        ),
        target_mount_to_target: transform(
            ParameterGroup::TargetMountToTarget,
            &problem.target_mount_to_target_guess,
        ),
        camera_base_to_target_base: transform(
            ParameterGroup::CameraBaseToTargetBase,
            &problem.camera_base_to_target_base_guess,
        ),
        camera_chain_offsets: offsets(
            ParameterGroup::CameraChainOffsets,
            problem.camera_chain.dof(),
        ),
        target_chain_offsets: offsets(
            ParameterGroup::TargetChainOffsets,
            problem.target_chain.dof(),
        ),
        covariance,
    }
}

impl fmt::Display for CalibrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Did converge?: {}", self.converged)?;
        writeln!(
            f,
            "Initial cost?: {:.6} (per observation, square root)",
            self.initial_cost_per_obs.sqrt()
        )?;
        writeln!(
            f,
            "Final cost?: {:.6} (per observation, square root)",
            self.final_cost_per_obs.sqrt()
        )?;
        let transforms = [
            ("Camera mount to camera", &self.camera_mount_to_camera),
            ("Target mount to target", &self.target_mount_to_target),
            (
                "Camera chain base to target chain base",
                &self.camera_base_to_target_base,
            ),
        ];
        for (name, iso) in transforms {
            let t = iso.translation.vector;
            let (roll, pitch, yaw) = iso.rotation.euler_angles();
            writeln!(f, "{name}:")?;
            writeln!(f, "  translation: [{:.6}, {:.6}, {:.6}]", t.x, t.y, t.z)?;
            writeln!(
                f,
                "  euler ZYX: [{:.6}, {:.6}, {:.6}]",
                yaw, pitch, roll
            )?;
        }
        let offsets = [
            ("Camera chain DH offsets", &self.camera_chain_offsets),
            ("Target chain DH offsets", &self.target_chain_offsets),
        ];
        for (name, matrix) in offsets {
            writeln!(f, "{name} [d, theta, r, alpha]:")?;
            for row in matrix.row_iter() {
                let values: Vec<String> = row.iter().map(|v| format!("{v:.6}")).collect();
                writeln!(f, "  [{}]", values.join(", "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::{DhChain, DhParameters, DhTransform};
    use crate::observation::KinematicMeasurement;
    use crate::optimization::{CalibrationData, DhMask, TransformMask};

    fn problem() -> CalibrationProblem {
        let target_chain = DhChain::new(
            vec![DhTransform::revolute(DhParameters::new(0.0, 0.0, 0.2, 0.4), "j1")],
            isometry_from_pose6(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.3]),
        );
        let measurements = [0.1, 0.5]
            .iter()
            .map(|&q| KinematicMeasurement {
                camera_chain_joints: vec![],
                target_chain_joints: vec![q],
                camera_to_target: isometry_from_pose6(&[0.0, 0.0, 1.0, 0.0, 0.0, q]),
            })
            .collect();
        CalibrationProblem::new(
            DhChain::fixed(Isometry3::identity()),
            target_chain,
            CalibrationData::Poses(measurements),
        )
    }

    #[test]
    fn test_fully_masked_problem_returns_guesses() {
        let mut problem = problem();
        problem.camera_mount_to_camera_guess = isometry_from_pose6(&[0.1, 0.2, 0.3, 0.0, 0.1, 0.0]);
        problem.mask.camera_mount_to_camera = TransformMask::ALL;
        problem.mask.target_mount_to_target = TransformMask::ALL;
        problem.mask.camera_base_to_target_base = TransformMask::ALL;
        problem.mask.target_chain = DhMask::all_fixed(1);

        let result = optimize(&problem, 100.0, &SolverOptions::default()).unwrap();
        assert!(result.converged);
        assert_eq!(result.initial_cost_per_obs, result.final_cost_per_obs);
        assert_eq!(
            result.camera_mount_to_camera,
            problem.camera_mount_to_camera_guess
        );
        assert_eq!(result.covariance.dim(), 0);
        assert!(result.target_chain_offsets.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_invalid_prior_weight_is_rejected() {
        for weight in [0.0, -1.0, f64::NAN] {
            assert!(matches!(
                optimize(&problem(), weight, &SolverOptions::default()),
                Err(CalibrationError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_first_order_test_on_a_linear_fit() {
        let options = SolverOptions::default();
        let jacobian = DMatrix::from_row_slice(3, 1, &[1.0, 1.0, 1.0]);
        // Residuals orthogonal to the column space: no further decrease possible.
        let at_minimum = DVector::from_vec(vec![1.0, -2.0, 1.0]);
        assert!(first_order_converged(&jacobian, &at_minimum, 3, &options));
        let away = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        assert!(!first_order_converged(&jacobian, &away, 3, &options));
    }

    #[test]
    fn test_display_lists_every_section() {
        let result = CalibrationResult {
            converged: false,
            initial_cost_per_obs: 4.0,
            final_cost_per_obs: 1.0,
            camera_mount_to_camera: Isometry3::identity(),
            target_mount_to_target: Isometry3::identity(),
            camera_base_to_target_base: Isometry3::identity(),
            camera_chain_offsets: DMatrix::zeros(0, 4),
            target_chain_offsets: DMatrix::from_row_slice(1, 4, &[0.001, 0.0, 0.0, 0.0]),
            covariance: Covariance::empty(),
        };
        let text = result.to_string();
        assert!(text.contains("Did converge?: false"));
        assert!(text.contains("Initial cost?: 2.000000"));
        assert!(text.contains("Final cost?: 1.000000"));
        assert!(text.contains("Camera chain base to target chain base:"));
        assert!(text.contains("[0.001000, 0.000000, 0.000000, 0.000000]"));
    }
}
