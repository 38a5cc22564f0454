//! Layout of the solver's free-parameter vector.
//!
//! Every [`ParameterGroup`] owns a block of components: a pose block
//! `[x, y, z, rx, ry, rz]` for the transforms, a row-major `DOF x 4` block for
//! the chain offsets. The block's mask decides which components the solver sees.
//! Blocks without free components are left out of the solver entirely and are
//! evaluated from their nominal values.

use crate::geometry::{isometry_to_matrix, pose6_from_isometry, pose6_to_matrix, real};
use crate::kinematics::{DhChain, DhParameter, DH_PARAMS_PER_SEGMENT};
use crate::optimization::mask::{ComponentMask, ParameterGroup, Projection};
use crate::optimization::problem::CalibrationProblem;
use nalgebra::{DVector, Isometry3, Matrix4, RealField};
use std::collections::HashMap;

const POSE_LABELS: [&str; 6] = ["x", "y", "z", "rx", "ry", "rz"];

#[derive(Debug, Clone)]
pub(crate) struct ParameterBlock {
    pub group: ParameterGroup,
    pub projection: Projection,
    /// Full component values the block starts from (and keeps where fixed).
    pub nominal: Vec<f64>,
    /// Exact initial transform for pose blocks.
    pub guess: Option<Isometry3<f64>>,
    pub labels: Vec<String>,
}

impl ParameterBlock {
    fn pose(group: ParameterGroup, mask: &dyn ComponentMask, guess: &Isometry3<f64>) -> Self {
        Self {
            group,
            projection: mask.projection(),
            nominal: pose6_from_isometry(guess).to_vec(),
            guess: Some(*guess),
            labels: POSE_LABELS
                .iter()
                .map(|c| format!("{}.{}", group.key(), c))
                .collect(),
        }
    }

    fn chain(group: ParameterGroup, mask: &dyn ComponentMask, chain: &DhChain) -> Self {
        let labels = chain
            .transforms()
            .iter()
            .enumerate()
            .flat_map(|(i, segment)| {
                let segment_name = if segment.name.is_empty() {
                    format!("segment{i}")
                } else {
                    segment.name.clone()
                };
                DhParameter::ALL
                    .into_iter()
                    .map(move |p| format!("{}.{}.{}", group.key(), segment_name, p.name()))
            })
            .collect();
        Self {
            group,
            projection: mask.projection(),
            nominal: vec![0.0; chain.dof() * DH_PARAMS_PER_SEGMENT],
            guess: None,
            labels,
        }
    }

    pub fn is_active(&self) -> bool {
        self.projection.free_len() > 0
    }

    fn full_values<T: RealField>(&self, free: Option<&[T]>) -> Vec<T> {
        match free {
            Some(free) => self.projection.embed(free, &self.nominal),
            None => self.nominal.iter().map(|&v| real::<T>(v)).collect(),
        }
    }

    fn transform<T: RealField>(&self, free: Option<&[T]>) -> Matrix4<T> {
        match (free, &self.guess) {
            (None, Some(guess)) => isometry_to_matrix(guess),
            _ => pose6_to_matrix(&self.full_values(free)),
        }
    }
}

/// Unknowns of a problem expanded to full values for a given scalar type.
pub(crate) struct CalibrationState<T: RealField> {
    pub camera_mount_to_camera: Matrix4<T>,
    pub target_mount_to_target: Matrix4<T>,
    pub camera_base_to_target_base: Matrix4<T>,
    pub camera_chain_offsets: Vec<T>,
    pub target_chain_offsets: Vec<T>,
}

#[derive(Debug, Clone)]
pub(crate) struct ParameterLayout {
    /// One block per group, in [`ParameterGroup::ALL`] order.
    blocks: Vec<ParameterBlock>,
}

impl ParameterLayout {
    pub fn new(problem: &CalibrationProblem) -> Self {
        let mask = &problem.mask;
        let blocks = ParameterGroup::ALL
            .iter()
            .map(|&group| match group {
                ParameterGroup::CameraMountToCamera => ParameterBlock::pose(
                    group,
                    mask.group(group),
                    &problem.camera_mount_to_camera_guess,
                ),
                ParameterGroup::TargetMountToTarget => ParameterBlock::pose(
                    group,
                    mask.group(group),
                    &problem.target_mount_to_target_guess,
                ),
                ParameterGroup::CameraBaseToTargetBase => ParameterBlock::pose(
                    group,
                    mask.group(group),
                    &problem.camera_base_to_target_base_guess,
                ),
                ParameterGroup::CameraChainOffsets => {
                    ParameterBlock::chain(group, mask.group(group), &problem.camera_chain)
                }
                ParameterGroup::TargetChainOffsets => {
                    ParameterBlock::chain(group, mask.group(group), &problem.target_chain)
                }
            })
            .collect();
        Self { blocks }
    }

    pub fn block(&self, group: ParameterGroup) -> &ParameterBlock {
        let index = ParameterGroup::ALL
            .iter()
            .position(|g| *g == group)
            .unwrap_or_default();
        &self.blocks[index]
    }

    /// Blocks handed to the solver, in solver order.
    pub fn active_blocks(&self) -> impl Iterator<Item = &ParameterBlock> {
        self.blocks.iter().filter(|b| b.is_active())
    }

    pub fn variable_names(&self) -> Vec<&'static str> {
        self.active_blocks().map(|b| b.group.key()).collect()
    }

    pub fn free_len(&self) -> usize {
        self.active_blocks().map(|b| b.projection.free_len()).sum()
    }

    pub fn free_labels(&self) -> Vec<String> {
        self.active_blocks()
            .flat_map(|b| {
                b.projection
                    .free_indices()
                    .iter()
                    .map(|&i| b.labels[i].clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Free values at the starting point, concatenated in solver order.
    pub fn initial_free(&self) -> Vec<f64> {
        self.active_blocks()
            .flat_map(|b| b.projection.project(&b.nominal))
            .collect()
    }

    pub fn initial_values(&self) -> HashMap<String, DVector<f64>> {
        self.active_blocks()
            .map(|b| {
                (
                    b.group.key().to_string(),
                    DVector::from_vec(b.projection.project(&b.nominal)),
                )
            })
            .collect()
    }

    /// Splits a concatenated free vector into per-block vectors in solver order.
    pub fn split<T: RealField>(&self, free: &[T]) -> Vec<DVector<T>> {
        let mut offset = 0;
        self.active_blocks()
            .map(|b| {
                let n = b.projection.free_len();
                let block = DVector::from_column_slice(&free[offset..offset + n]);
                offset += n;
                block
            })
            .collect()
    }

    /// Concatenates a solver solution in solver order; missing blocks keep their start values.
    pub fn free_from_solution(&self, solution: &HashMap<String, DVector<f64>>) -> Vec<f64> {
        self.active_blocks()
            .flat_map(|b| match solution.get(b.group.key()) {
                Some(values) => values.iter().copied().collect::<Vec<_>>(),
                None => b.projection.project(&b.nominal),
            })
            .collect()
    }

    /// Expands per-block solver values (solver order) into the full state.
    pub fn expand<T: RealField>(&self, params: &[DVector<T>]) -> CalibrationState<T> {
        let mut free_by_group: HashMap<ParameterGroup, &[T]> = HashMap::new();
        for (block, values) in self.active_blocks().zip(params) {
            free_by_group.insert(block.group, values.as_slice());
        }
        let free = |group: ParameterGroup| free_by_group.get(&group).copied();

        CalibrationState {
            camera_mount_to_camera: self
                .block(ParameterGroup::CameraMountToCamera)
                .transform(free(ParameterGroup::CameraMountToCamera)),
            target_mount_to_target: self
                .block(ParameterGroup::TargetMountToTarget)
                .transform(free(ParameterGroup::TargetMountToTarget)),
            camera_base_to_target_base: self
                .block(ParameterGroup::CameraBaseToTargetBase)
                .transform(free(ParameterGroup::CameraBaseToTargetBase)),
            camera_chain_offsets: self
                .block(ParameterGroup::CameraChainOffsets)
                .full_values(free(ParameterGroup::CameraChainOffsets)),
            target_chain_offsets: self
                .block(ParameterGroup::TargetChainOffsets)
                .full_values(free(ParameterGroup::TargetChainOffsets)),
        }
    }

    /// Full component values of `group` for a concatenated free vector.
    pub fn group_values(&self, group: ParameterGroup, free: &[f64]) -> Vec<f64> {
        let mut offset = 0;
        for block in self.active_blocks() {
            let n = block.projection.free_len();
            if block.group == group {
                return block.full_values(Some(&free[offset..offset + n]));
            }
            offset += n;
        }
        self.block(group).nominal.clone()
    }
}
