//! Parameter masks.
//!
//! A mask marks components of an unknown as locally fixed: they keep their
//! nominal or initial value and are excluded from the solver's parameter vector.
//! Rigid transforms use a 6-bit [`TransformMask`] over `[x, y, z, rx, ry, rz]`,
//! kinematic chains use a [`DhMask`] with 4 bits per segment over
//! `[d, theta, r, alpha]`. Both feed the same [`Projection`], which maps the
//! full component vector to its free subset and back.

use crate::geometry::{real, POSE_DIM};
use crate::kinematics::{DhParameter, DH_PARAMS_PER_SEGMENT};
use crate::optimization::CalibrationError;
use nalgebra::{DMatrix, RealField};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MaskError {
    #[error("index {index} out of range for {len} components")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("expected {expected} rows, got {actual}")]
    RowCount { expected: usize, actual: usize },
    #[error("expected {expected} columns, got {actual}")]
    ColumnCount { expected: usize, actual: usize },
}

/// Common view over the mask kinds.
pub trait ComponentMask {
    /// Total number of components covered by the mask.
    fn component_count(&self) -> usize;

    fn is_fixed(&self, index: usize) -> bool;

    fn fixed_indices(&self) -> Vec<usize> {
        (0..self.component_count())
            .filter(|&i| self.is_fixed(i))
            .collect()
    }

    fn free_count(&self) -> usize {
        (0..self.component_count())
            .filter(|&i| !self.is_fixed(i))
            .count()
    }

    fn projection(&self) -> Projection {
        Projection::new((0..self.component_count()).map(|i| self.is_fixed(i)).collect())
    }
}

/// Fixed components of a rigid transform `[x, y, z, rx, ry, rz]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransformMask(u8);

impl TransformMask {
    pub const FREE: TransformMask = TransformMask(0);
    pub const TRANSLATION: TransformMask = TransformMask(0b000_111);
    pub const ROTATION: TransformMask = TransformMask(0b111_000);
    pub const ALL: TransformMask = TransformMask(0b111_111);

    pub fn from_indices(indices: &[usize]) -> Result<Self, MaskError> {
        let mut mask = Self::FREE;
        for &index in indices {
            mask.fix(index)?;
        }
        Ok(mask)
    }

    pub fn fix(&mut self, index: usize) -> Result<(), MaskError> {
        if index >= POSE_DIM {
            return Err(MaskError::IndexOutOfRange {
                index,
                len: POSE_DIM,
            });
        }
        self.0 |= 1 << index;
        Ok(())
    }

    pub fn union(self, other: TransformMask) -> TransformMask {
        TransformMask(self.0 | other.0)
    }

    pub fn is_all_fixed(&self) -> bool {
        *self == Self::ALL
    }
}

impl ComponentMask for TransformMask {
    fn component_count(&self) -> usize {
        POSE_DIM
    }

    fn is_fixed(&self, index: usize) -> bool {
        index < POSE_DIM && self.0 & (1 << index) != 0
    }
}

/// Fixed DH parameters of a chain, 4 bits per segment in `[d, theta, r, alpha]` order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DhMask {
    rows: Vec<u8>,
}

impl DhMask {
    const ROW_BITS: u8 = 0b1111;

    /// All parameters of a `dof`-segment chain free.
    pub fn free(dof: usize) -> Self {
        Self { rows: vec![0; dof] }
    }

    /// All parameters of a `dof`-segment chain fixed (nominal kinematics).
    pub fn all_fixed(dof: usize) -> Self {
        Self {
            rows: vec![Self::ROW_BITS; dof],
        }
    }

    /// Mask from a `DOF x 4` grid where `true` marks a fixed parameter.
    pub fn from_grid(grid: &DMatrix<bool>) -> Result<Self, MaskError> {
        if grid.ncols() != DH_PARAMS_PER_SEGMENT {
            return Err(MaskError::ColumnCount {
                expected: DH_PARAMS_PER_SEGMENT,
                actual: grid.ncols(),
            });
        }
        let rows = (0..grid.nrows())
            .map(|row| {
                (0..DH_PARAMS_PER_SEGMENT)
                    .filter(|&col| grid[(row, col)])
                    .fold(0u8, |bits, col| bits | (1 << col))
            })
            .collect();
        Ok(Self { rows })
    }

    pub fn from_rows(rows: &[[bool; DH_PARAMS_PER_SEGMENT]]) -> Self {
        let rows = rows
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, fixed)| **fixed)
                    .fold(0u8, |bits, (col, _)| bits | (1 << col))
            })
            .collect();
        Self { rows }
    }

    /// Mask from flattened row-major indices `row * 4 + column`.
    pub fn from_indices(dof: usize, indices: &[usize]) -> Result<Self, MaskError> {
        let mut mask = Self::free(dof);
        let len = dof * DH_PARAMS_PER_SEGMENT;
        for &index in indices {
            if index >= len {
                return Err(MaskError::IndexOutOfRange { index, len });
            }
            mask.rows[index / DH_PARAMS_PER_SEGMENT] |= 1 << (index % DH_PARAMS_PER_SEGMENT);
        }
        Ok(mask)
    }

    pub fn dof(&self) -> usize {
        self.rows.len()
    }

    pub fn fix(&mut self, row: usize, parameter: DhParameter) -> Result<(), MaskError> {
        let len = self.rows.len();
        let bits = self
            .rows
            .get_mut(row)
            .ok_or(MaskError::IndexOutOfRange { index: row, len })?;
        *bits |= 1 << parameter.index();
        Ok(())
    }

    pub fn fix_row(&mut self, row: usize) -> Result<(), MaskError> {
        let len = self.rows.len();
        let bits = self
            .rows
            .get_mut(row)
            .ok_or(MaskError::IndexOutOfRange { index: row, len })?;
        *bits = Self::ROW_BITS;
        Ok(())
    }

    pub fn row(&self, row: usize) -> [bool; DH_PARAMS_PER_SEGMENT] {
        let bits = self.rows.get(row).copied().unwrap_or(0);
        std::array::from_fn(|col| bits & (1 << col) != 0)
    }
}

impl ComponentMask for DhMask {
    fn component_count(&self) -> usize {
        self.rows.len() * DH_PARAMS_PER_SEGMENT
    }

    fn is_fixed(&self, index: usize) -> bool {
        self.rows
            .get(index / DH_PARAMS_PER_SEGMENT)
            .is_some_and(|bits| bits & (1 << (index % DH_PARAMS_PER_SEGMENT)) != 0)
    }
}

/// Unknown quantities estimated by a calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroup {
    CameraMountToCamera,
    TargetMountToTarget,
    CameraBaseToTargetBase,
    CameraChainOffsets,
    TargetChainOffsets,
}

impl ParameterGroup {
    pub const ALL: [ParameterGroup; 5] = [
        ParameterGroup::CameraMountToCamera,
        ParameterGroup::TargetMountToTarget,
        ParameterGroup::CameraBaseToTargetBase,
        ParameterGroup::CameraChainOffsets,
        ParameterGroup::TargetChainOffsets,
    ];

    /// Stable identifier, also used as the solver variable name.
    pub fn key(self) -> &'static str {
        match self {
            ParameterGroup::CameraMountToCamera => "camera_mount_to_camera",
            ParameterGroup::TargetMountToTarget => "target_mount_to_target",
            ParameterGroup::CameraBaseToTargetBase => "camera_base_to_target_base",
            ParameterGroup::CameraChainOffsets => "camera_chain",
            ParameterGroup::TargetChainOffsets => "target_chain",
        }
    }

    pub fn is_chain(self) -> bool {
        matches!(
            self,
            ParameterGroup::CameraChainOffsets | ParameterGroup::TargetChainOffsets
        )
    }
}

impl fmt::Display for ParameterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Fixed components for every unknown of a calibration problem.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mask {
    pub camera_mount_to_camera: TransformMask,
    pub target_mount_to_target: TransformMask,
    pub camera_base_to_target_base: TransformMask,
    pub camera_chain: DhMask,
    pub target_chain: DhMask,
}

impl Mask {
    /// Everything free, sized for chains with the given degrees of freedom.
    pub fn new(camera_dof: usize, target_dof: usize) -> Self {
        Self {
            camera_mount_to_camera: TransformMask::FREE,
            target_mount_to_target: TransformMask::FREE,
            camera_base_to_target_base: TransformMask::FREE,
            camera_chain: DhMask::free(camera_dof),
            target_chain: DhMask::free(target_dof),
        }
    }

    pub fn group(&self, group: ParameterGroup) -> &dyn ComponentMask {
        match group {
            ParameterGroup::CameraMountToCamera => &self.camera_mount_to_camera,
            ParameterGroup::TargetMountToTarget => &self.target_mount_to_target,
            ParameterGroup::CameraBaseToTargetBase => &self.camera_base_to_target_base,
            ParameterGroup::CameraChainOffsets => &self.camera_chain,
            ParameterGroup::TargetChainOffsets => &self.target_chain,
        }
    }

    /// Adds `indices` to the fixed set of `group`.
    ///
    /// Chain groups take flattened `row * 4 + column` indices.
    pub fn set_fixed_indices(
        &mut self,
        group: ParameterGroup,
        indices: &[usize],
    ) -> Result<(), CalibrationError> {
        let wrap = |source| CalibrationError::Mask { group, source };
        match group {
            ParameterGroup::CameraMountToCamera => {
                let extra = TransformMask::from_indices(indices).map_err(wrap)?;
                self.camera_mount_to_camera = self.camera_mount_to_camera.union(extra);
            }
            ParameterGroup::TargetMountToTarget => {
                let extra = TransformMask::from_indices(indices).map_err(wrap)?;
                self.target_mount_to_target = self.target_mount_to_target.union(extra);
            }
            ParameterGroup::CameraBaseToTargetBase => {
                let extra = TransformMask::from_indices(indices).map_err(wrap)?;
                self.camera_base_to_target_base = self.camera_base_to_target_base.union(extra);
            }
            ParameterGroup::CameraChainOffsets => {
                let mut all = self.camera_chain.fixed_indices();
                all.extend_from_slice(indices);
                self.camera_chain = DhMask::from_indices(self.camera_chain.dof(), &all).map_err(wrap)?;
            }
            ParameterGroup::TargetChainOffsets => {
                let mut all = self.target_chain.fixed_indices();
                all.extend_from_slice(indices);
                self.target_chain = DhMask::from_indices(self.target_chain.dof(), &all).map_err(wrap)?;
            }
        }
        Ok(())
    }

    pub fn fixed_indices(&self, group: ParameterGroup) -> Vec<usize> {
        self.group(group).fixed_indices()
    }

    /// Number of components left for the solver across all groups.
    pub fn free_parameter_count(&self) -> usize {
        ParameterGroup::ALL
            .iter()
            .map(|&g| self.group(g).free_count())
            .sum()
    }

    /// Checks the chain masks against the chains' degrees of freedom.
    pub fn check_dofs(&self, camera_dof: usize, target_dof: usize) -> Result<(), CalibrationError> {
        let checks = [
            (ParameterGroup::CameraChainOffsets, &self.camera_chain, camera_dof),
            (ParameterGroup::TargetChainOffsets, &self.target_chain, target_dof),
        ];
        for (group, mask, dof) in checks {
            if mask.dof() != dof {
                return Err(CalibrationError::Mask {
                    group,
                    source: MaskError::RowCount {
                        expected: dof,
                        actual: mask.dof(),
                    },
                });
            }
        }
        Ok(())
    }
}

/// Maps a full component vector to its free subset and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    fixed: Vec<bool>,
    free_indices: Vec<usize>,
}

impl Projection {
    pub fn new(fixed: Vec<bool>) -> Self {
        let free_indices = fixed
            .iter()
            .enumerate()
            .filter(|(_, f)| !**f)
            .map(|(i, _)| i)
            .collect();
        Self {
            fixed,
            free_indices,
        }
    }

    pub fn full_len(&self) -> usize {
        self.fixed.len()
    }

    pub fn free_len(&self) -> usize {
        self.free_indices.len()
    }

    pub fn free_indices(&self) -> &[usize] {
        &self.free_indices
    }

    /// Free components of `full`, in order.
    pub fn project(&self, full: &[f64]) -> Vec<f64> {
        self.free_indices.iter().map(|&i| full[i]).collect()
    }

    /// Full vector with free components taken from `free` and fixed ones from `full`.
    pub fn embed<T: RealField>(&self, free: &[T], full: &[f64]) -> Vec<T> {
        debug_assert_eq!(free.len(), self.free_len());
        let mut out: Vec<T> = full.iter().map(|&v| real::<T>(v)).collect();
        for (value, &i) in free.iter().zip(&self.free_indices) {
            out[i] = value.clone();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_mask_constants() {
        assert_eq!(TransformMask::FREE.free_count(), 6);
        assert_eq!(TransformMask::ALL.free_count(), 0);
        assert_eq!(TransformMask::TRANSLATION.fixed_indices(), vec![0, 1, 2]);
        assert_eq!(TransformMask::ROTATION.fixed_indices(), vec![3, 4, 5]);
        assert!(TransformMask::ALL.is_all_fixed());
        assert_eq!(
            TransformMask::from_indices(&[6]),
            Err(MaskError::IndexOutOfRange { index: 6, len: 6 })
        );
    }

    #[test]
    fn test_dh_mask_constructions_agree() {
        let grid = DMatrix::from_row_slice(2, 4, &[false, true, false, false, true, true, true, true]);
        let from_grid = DhMask::from_grid(&grid).unwrap();
        let from_rows = DhMask::from_rows(&[[false, true, false, false], [true; 4]]);
        let from_indices = DhMask::from_indices(2, &[1, 4, 5, 6, 7]).unwrap();
        assert_eq!(from_grid, from_rows);
        assert_eq!(from_grid, from_indices);
        assert_eq!(from_grid.free_count(), 3);
        assert!(DhMask::from_grid(&DMatrix::from_element(2, 3, false)).is_err());
    }

    #[test]
    fn test_masking_a_row_removes_its_free_entries() {
        let mut mask = Mask::new(2, 3);
        mask.target_chain.fix(1, DhParameter::Alpha).unwrap();
        let before = mask.free_parameter_count();
        assert_eq!(before, 18 + 8 + 12 - 1);

        let previously_free = mask.target_chain.row(1).iter().filter(|f| !**f).count();
        mask.target_chain.fix_row(1).unwrap();
        assert_eq!(mask.free_parameter_count(), before - previously_free);
        assert_eq!(previously_free, 3);
    }

    #[test]
    fn test_fixing_a_missing_row_reports_the_row_count() {
        let mut mask = DhMask::free(2);
        assert_eq!(
            mask.fix_row(2),
            Err(MaskError::IndexOutOfRange { index: 2, len: 2 })
        );
        assert_eq!(
            mask.fix(5, DhParameter::Theta),
            Err(MaskError::IndexOutOfRange { index: 5, len: 2 })
        );
        assert_eq!(mask, DhMask::free(2));
    }

    #[test]
    fn test_set_fixed_indices_accumulates() {
        let mut mask = Mask::new(0, 2);
        mask.set_fixed_indices(ParameterGroup::TargetMountToTarget, &[2])
            .unwrap();
        mask.set_fixed_indices(ParameterGroup::TargetMountToTarget, &[5])
            .unwrap();
        assert_eq!(
            mask.fixed_indices(ParameterGroup::TargetMountToTarget),
            vec![2, 5]
        );

        mask.set_fixed_indices(ParameterGroup::TargetChainOffsets, &[4, 5, 6, 7])
            .unwrap();
        assert_eq!(mask.target_chain.row(1), [true; 4]);
        assert_eq!(mask.target_chain.row(0), [false; 4]);

        let err = mask
            .set_fixed_indices(ParameterGroup::TargetChainOffsets, &[8])
            .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::Mask {
                group: ParameterGroup::TargetChainOffsets,
                ..
            }
        ));
    }

    #[test]
    fn test_check_dofs_names_the_group() {
        let mask = Mask::new(1, 2);
        assert!(mask.check_dofs(1, 2).is_ok());
        let err = mask.check_dofs(1, 3).unwrap_err();
        assert!(err.to_string().contains("target_chain"));
    }

    #[test]
    fn test_projection_keeps_fixed_values() {
        let projection = TransformMask::from_indices(&[1, 4]).unwrap().projection();
        let full = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let free = projection.project(&full);
        assert_eq!(free, vec![1.0, 3.0, 4.0, 6.0]);

        let embedded = projection.embed(&[10.0, 30.0, 40.0, 60.0], &full);
        assert_eq!(embedded, vec![10.0, 2.0, 30.0, 40.0, 5.0, 60.0]);
    }
}
