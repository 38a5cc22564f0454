//! Residual functions of the calibration problem.
//!
//! Every residual block sees the full set of active solver variables, expands
//! them into a [`CalibrationState`] and evaluates one [`ResidualTerm`]:
//!
//! * a pose measurement, 6 residuals `[t_pred - t_meas, log(R_meas^T R_pred)]`,
//! * an observation of correspondences, `SENSOR_DIM` residuals per point,
//! * the zero-mean prior on one chain's free DH offsets.
//!
//! The same terms are evaluated on `f64` for cost reporting, on tiny-solver's
//! dual numbers during the solve, and on `num_dual::Dual64` for the final
//! Jacobian.

use crate::geometry::{
    log_rotation, rigid_inverse, rotation_part, transform_point, translation_part,
};
use crate::kinematics::DhChain;
use crate::observation::{Correspondence, KinematicObservation};
use crate::optimization::layout::{CalibrationState, ParameterLayout};
use crate::optimization::mask::ParameterGroup;
use crate::optimization::problem::{CalibrationData, CalibrationProblem};
use nalgebra::{DMatrix, DVector, Matrix4, RealField, Vector3};
use num_dual::Dual64;
use std::sync::Arc;
use tiny_solver::factors::Factor;

/// Immutable data shared by all residual blocks.
#[derive(Debug)]
pub(crate) struct ResidualContext {
    pub layout: ParameterLayout,
    pub camera_chain: DhChain,
    pub target_chain: DhChain,
}

impl ResidualContext {
    /// Camera-to-target transform predicted at the given joint states.
    pub fn predict_camera_to_target<T: RealField>(
        &self,
        state: &CalibrationState<T>,
        camera_joints: &[f64],
        target_joints: &[f64],
    ) -> Matrix4<T> {
        let camera = self
            .camera_chain
            .forward_kinematics_generic(camera_joints, &state.camera_chain_offsets)
            * &state.camera_mount_to_camera;
        let target = &state.camera_base_to_target_base
            * self
                .target_chain
                .forward_kinematics_generic(target_joints, &state.target_chain_offsets)
            * &state.target_mount_to_target;
        rigid_inverse(&camera) * target
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PoseResidual {
    camera_joints: Vec<f64>,
    target_joints: Vec<f64>,
    measured: Matrix4<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct CorrespondenceResidual<C: Correspondence> {
    sensor: Arc<C::Sensor>,
    observation: Arc<KinematicObservation<C>>,
}

impl<C: Correspondence> CorrespondenceResidual<C> {
    fn evaluate<T: RealField>(&self, ctx: &ResidualContext, state: &CalibrationState<T>) -> DVector<T> {
        let camera_to_target = ctx.predict_camera_to_target(
            state,
            &self.observation.camera_chain_joints,
            &self.observation.target_chain_joints,
        );
        let mut residuals = DVector::zeros(self.dim());
        for (i, correspondence) in self.observation.correspondences.iter().enumerate() {
            let in_target: Vector3<T> = correspondence.in_target().map(crate::geometry::real::<T>);
            let in_sensor = transform_point(&camera_to_target, &in_target);
            let r = correspondence.residual(&self.sensor, &in_sensor);
            residuals
                .rows_mut(i * C::SENSOR_DIM, C::SENSOR_DIM)
                .copy_from(&r);
        }
        residuals
    }

    fn dim(&self) -> usize {
        self.observation.correspondences.len() * C::SENSOR_DIM
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OffsetPrior {
    group: ParameterGroup,
    free_indices: Vec<usize>,
    inv_sigma: f64,
}

#[derive(Debug, Clone)]
pub(crate) enum ResidualTerm {
    Pose(PoseResidual),
    Image(CorrespondenceResidual<crate::observation::Correspondence2D3D>),
    Points(CorrespondenceResidual<crate::observation::Correspondence3D3D>),
    Prior(OffsetPrior),
}

impl ResidualTerm {
    pub fn dim(&self) -> usize {
        match self {
            ResidualTerm::Pose(_) => 6,
            ResidualTerm::Image(c) => c.dim(),
            ResidualTerm::Points(c) => c.dim(),
            ResidualTerm::Prior(p) => p.free_indices.len(),
        }
    }

    pub fn evaluate<T: RealField>(
        &self,
        ctx: &ResidualContext,
        state: &CalibrationState<T>,
    ) -> DVector<T> {
        match self {
            ResidualTerm::Pose(pose) => {
                let predicted =
                    ctx.predict_camera_to_target(state, &pose.camera_joints, &pose.target_joints);
                let measured: Matrix4<T> = pose.measured.map(crate::geometry::real::<T>);
                let dt = translation_part(&predicted) - translation_part(&measured);
                let dr = log_rotation(
                    &(rotation_part(&measured).transpose() * rotation_part(&predicted)),
                );
                DVector::from_iterator(6, dt.iter().chain(dr.iter()).cloned())
            }
            ResidualTerm::Image(c) => c.evaluate(ctx, state),
            ResidualTerm::Points(c) => c.evaluate(ctx, state),
            ResidualTerm::Prior(prior) => {
                let offsets = match prior.group {
                    ParameterGroup::CameraChainOffsets => &state.camera_chain_offsets,
                    _ => &state.target_chain_offsets,
                };
                let w = crate::geometry::real::<T>(prior.inv_sigma);
                DVector::from_iterator(
                    prior.free_indices.len(),
                    prior
                        .free_indices
                        .iter()
                        .map(|&i| offsets[i].clone() * w.clone()),
                )
            }
        }
    }
}

/// One residual term as a tiny-solver factor.
struct TermFactor {
    ctx: Arc<ResidualContext>,
    term: ResidualTerm,
}

impl<T: RealField> Factor<T> for TermFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let state = self.ctx.layout.expand(params);
        self.term.evaluate(&self.ctx, &state)
    }
}

/// All residual terms of a problem.
pub(crate) struct ResidualModel {
    ctx: Arc<ResidualContext>,
    terms: Vec<ResidualTerm>,
    observation_count: usize,
}

impl ResidualModel {
    /// Builds the residual terms; the problem must already be validated.
    pub fn new(problem: &CalibrationProblem, offset_prior_weight: f64) -> Self {
        let layout = ParameterLayout::new(problem);
        let mut terms: Vec<ResidualTerm> = match &problem.data {
            CalibrationData::Poses(measurements) => measurements
                .iter()
                .map(|m| {
                    ResidualTerm::Pose(PoseResidual {
                        camera_joints: m.camera_chain_joints.clone(),
                        target_joints: m.target_chain_joints.clone(),
                        measured: m.camera_to_target.to_homogeneous(),
                    })
                })
                .collect(),
            CalibrationData::Image {
                camera,
                observations,
            } => {
                let sensor = Arc::new(camera.clone());
                observations
                    .iter()
                    .map(|o| {
                        ResidualTerm::Image(CorrespondenceResidual {
                            sensor: Arc::clone(&sensor),
                            observation: Arc::new(o.clone()),
                        })
                    })
                    .collect()
            }
            CalibrationData::Points(observations) => {
                let sensor = Arc::new(());
                observations
                    .iter()
                    .map(|o| {
                        ResidualTerm::Points(CorrespondenceResidual {
                            sensor: Arc::clone(&sensor),
                            observation: Arc::new(o.clone()),
                        })
                    })
                    .collect()
            }
        };

        let priors = [
            (
                ParameterGroup::CameraChainOffsets,
                problem.camera_chain_offset_stdev,
            ),
            (
                ParameterGroup::TargetChainOffsets,
                problem.target_chain_offset_stdev,
            ),
        ];
        for (group, stdev) in priors {
            let free_indices = layout.block(group).projection.free_indices().to_vec();
            if !free_indices.is_empty() {
                terms.push(ResidualTerm::Prior(OffsetPrior {
                    group,
                    free_indices,
                    inv_sigma: 1.0 / (stdev * offset_prior_weight),
                }));
            }
        }

        Self {
            ctx: Arc::new(ResidualContext {
                layout,
                camera_chain: problem.camera_chain.clone(),
                target_chain: problem.target_chain.clone(),
            }),
            terms,
            observation_count: problem.observation_count(),
        }
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.ctx.layout
    }

    pub fn residual_dim(&self) -> usize {
        self.terms.iter().map(ResidualTerm::dim).sum()
    }

    /// Stacked residuals for a concatenated free vector.
    pub fn residuals<T: RealField>(&self, free: &[T]) -> DVector<T> {
        let state = self.ctx.layout.expand(&self.ctx.layout.split(free));
        let mut out = DVector::zeros(self.residual_dim());
        let mut row = 0;
        for term in &self.terms {
            let r = term.evaluate(&self.ctx, &state);
            out.rows_mut(row, r.len()).copy_from(&r);
            row += r.len();
        }
        out
    }

    /// Sum of squared residuals divided by the number of observations.
    pub fn cost_per_observation(&self, free: &[f64]) -> f64 {
        self.residuals(free).norm_squared() / self.observation_count as f64
    }

    /// Jacobian of the stacked residuals by forward-mode differentiation.
    pub fn jacobian(&self, free: &[f64]) -> DMatrix<f64> {
        let n = free.len();
        let mut jacobian = DMatrix::zeros(self.residual_dim(), n);
        for col in 0..n {
            let seeded: Vec<Dual64> = free
                .iter()
                .enumerate()
                .map(|(i, &v)| Dual64::new(v, if i == col { 1.0 } else { 0.0 }))
                .collect();
            let r = self.residuals(&seeded);
            for (row, value) in r.iter().enumerate() {
                jacobian[(row, col)] = value.eps;
            }
        }
        jacobian
    }

    /// tiny-solver problem with one residual block per term.
    pub fn build_problem(&self) -> tiny_solver::Problem {
        let variables = self.ctx.layout.variable_names();
        let mut problem = tiny_solver::Problem::new();
        for term in &self.terms {
            let factor = TermFactor {
                ctx: Arc::clone(&self.ctx),
                term: term.clone(),
            };
            problem.add_residual_block(term.dim(), &variables, Box::new(factor), None);
        }
        problem
    }
}
