//! Parameter covariance and correlation at the solution.
//!
//! The covariance of the free parameters is `(J^T J)^-1`, evaluated through the
//! singular value decomposition of the Jacobian `J = U S V^T` as
//! `V S^-2 V^T`. A Jacobian whose reciprocal condition number (of `J^T J`)
//! falls below [`MIN_RECIPROCAL_CONDITION`] is treated as rank deficient: some
//! combination of parameters is not observable and the covariance is undefined.

use crate::optimization::CalibrationError;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Smallest accepted `lambda_min / lambda_max` of `J^T J`.
pub const MIN_RECIPROCAL_CONDITION: f64 = 1e-14;

/// Covariance of the free parameters, labelled by parameter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Covariance {
    pub labels: Vec<String>,
    pub matrix: DMatrix<f64>,
}

impl Covariance {
    /// Covariance without any free parameter.
    pub fn empty() -> Self {
        Self {
            labels: Vec::new(),
            matrix: DMatrix::zeros(0, 0),
        }
    }

    /// Computes the covariance from the Jacobian at the solution.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Covariance`] if there are fewer residuals than
    /// parameters or the Jacobian is rank deficient. The message names the
    /// parameters dominating the unobservable direction.
    pub fn from_jacobian(
        jacobian: &DMatrix<f64>,
        labels: Vec<String>,
    ) -> Result<Self, CalibrationError> {
        let (m, n) = jacobian.shape();
        if n != labels.len() {
            return Err(CalibrationError::Covariance(format!(
                "{} labels for {} Jacobian columns",
                labels.len(),
                n
            )));
        }
        if n == 0 {
            return Ok(Self::empty());
        }
        if m < n {
            return Err(CalibrationError::Covariance(format!(
                "{m} residuals cannot determine {n} parameters"
            )));
        }

        let svd = jacobian.clone().svd(false, true);
        let v_t = svd
            .v_t
            .ok_or_else(|| CalibrationError::Covariance("SVD did not produce V".to_string()))?;
        let s = &svd.singular_values;

        let s_max = s.max();
        let (min_index, s_min) = s.argmin();
        if !(s_max > 0.0) || (s_min / s_max).powi(2) < MIN_RECIPROCAL_CONDITION {
            let null_direction = v_t.row(min_index).transpose();
            return Err(CalibrationError::Covariance(format!(
                "Jacobian is rank deficient (condition {:.3e}); unobservable combination of {}",
                if s_max > 0.0 { s_min / s_max } else { 0.0 },
                dominant_labels(&null_direction, &labels).join(", ")
            )));
        }

        let inv_s2 = DVector::from_iterator(n, s.iter().map(|v| 1.0 / (v * v)));
        let v = v_t.transpose();
        let matrix = &v * DMatrix::from_diagonal(&inv_s2) * &v_t;

        Ok(Self { labels, matrix })
    }

    pub fn dim(&self) -> usize {
        self.labels.len()
    }

    pub fn standard_deviations(&self) -> Vec<f64> {
        (0..self.dim())
            .map(|i| self.matrix[(i, i)].max(0.0).sqrt())
            .collect()
    }

    /// Correlation coefficients `cov_ij / (sigma_i sigma_j)`.
    pub fn correlation_matrix(&self) -> DMatrix<f64> {
        let sigma = self.standard_deviations();
        DMatrix::from_fn(self.dim(), self.dim(), |i, j| {
            let denom = sigma[i] * sigma[j];
            if denom > 0.0 {
                self.matrix[(i, j)] / denom
            } else {
                0.0
            }
        })
    }

    /// Parameter pairs whose correlation magnitude exceeds `threshold`.
    pub fn correlation_coeff_above_threshold(&self, threshold: f64) -> Vec<(String, String, f64)> {
        let correlation = self.correlation_matrix();
        let mut pairs = Vec::new();
        for i in 0..self.dim() {
            for j in (i + 1)..self.dim() {
                let rho = correlation[(i, j)];
                if rho.abs() > threshold {
                    pairs.push((self.labels[i].clone(), self.labels[j].clone(), rho));
                }
            }
        }
        pairs
    }

    /// Human-readable report of the pairs returned by
    /// [`Covariance::correlation_coeff_above_threshold`].
    pub fn print_correlation_coeff_above_threshold(&self, threshold: f64) -> String {
        let pairs = self.correlation_coeff_above_threshold(threshold);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Correlation coefficients with magnitude above {threshold}:"
        );
        if pairs.is_empty() {
            let _ = writeln!(out, "  none");
        }
        for (a, b, rho) in pairs {
            let _ = writeln!(out, "  {a} <-> {b}: {rho:.4}");
        }
        out
    }
}

/// Labels with the largest weight in a (unit) direction, strongest first.
fn dominant_labels(direction: &DVector<f64>, labels: &[String]) -> Vec<String> {
    let mut ranked: Vec<(f64, &String)> = direction
        .iter()
        .map(|v| v.abs())
        .zip(labels)
        .filter(|(weight, _)| *weight > 0.1)
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.into_iter().map(|(_, label)| label.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("p{i}")).collect()
    }

    #[test]
    fn test_covariance_matches_normal_equations() {
        let j = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 0.0, 2.0, 1.0, -1.0]);
        let cov = Covariance::from_jacobian(&j, labels(2)).unwrap();
        let expected = (j.transpose() * &j).try_inverse().unwrap();
        assert_relative_eq!(cov.matrix, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_correlation_report_filters_by_threshold() {
        let cov = Covariance {
            labels: labels(3),
            matrix: DMatrix::from_row_slice(3, 3, &[4.0, 1.8, 0.1, 1.8, 1.0, 0.0, 0.1, 0.0, 9.0]),
        };
        let pairs = cov.correlation_coeff_above_threshold(0.5);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "p0");
        assert_eq!(pairs[0].1, "p1");
        assert_relative_eq!(pairs[0].2, 0.9, epsilon = 1e-12);

        let report = cov.print_correlation_coeff_above_threshold(0.5);
        assert!(report.contains("p0 <-> p1: 0.9000"));
        assert!(!report.contains("p2"));
        assert!(cov
            .print_correlation_coeff_above_threshold(0.95)
            .contains("none"));
    }

    #[test]
    fn test_rank_deficiency_names_parameters() {
        // Columns 0 and 2 always move together.
        let j = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 1.0, 2.0, 1.0, 2.0, 0.0, 3.0, 0.0]);
        let err = Covariance::from_jacobian(&j, labels(3)).unwrap_err();
        match err {
            CalibrationError::Covariance(message) => {
                assert!(message.contains("p0"));
                assert!(message.contains("p2"));
                assert!(!message.contains("p1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_covariance() {
        let cov = Covariance::from_jacobian(&DMatrix::zeros(5, 0), Vec::new()).unwrap();
        assert_eq!(cov.dim(), 0);
        assert!(cov.correlation_coeff_above_threshold(0.0).is_empty());
    }
}
