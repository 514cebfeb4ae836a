//! 对数域多元高斯密度.

use nalgebra::DMatrix;

use super::GaussianParameters;
use crate::NumericalError;

/// Cholesky 分解的条件门限: `L_ii^2 / Σ_ii` 低于该值视为奇异.
const CONDITION_THRESHOLD: f64 = 1e-12;

/// 预先分解好协方差的多元高斯密度.
#[derive(Debug, Clone)]
pub struct GaussianDensity {
    n: usize,
    mean: Vec<f64>,
    /// Cholesky 下三角因子, 行优先.
    lower: Vec<f64>,
    log_norm: f64,
}

impl GaussianDensity {
    /// 分解第 `group` 组参数的协方差. 协方差奇异、近奇异或含非有限值时返回
    /// [`NumericalError::SingularCovariance`].
    pub fn new(params: &GaussianParameters, group: usize) -> Result<Self, NumericalError> {
        let n = params.channel_count();
        let singular = NumericalError::SingularCovariance { group };
        if params.mean.iter().any(|v| !v.is_finite())
            || params.covariance.iter().any(|v| !v.is_finite())
        {
            return Err(singular);
        }

        let cov = DMatrix::from_fn(n, n, |i, j| {
            // 只用下三角, 上三角的舍入误差不影响结果.
            if i >= j {
                params.covariance[(i, j)]
            } else {
                params.covariance[(j, i)]
            }
        });
        let l = cov.clone().cholesky().ok_or(singular.clone())?.unpack();

        let mut log_det_half = 0.0;
        for i in 0..n {
            let lii = l[(i, i)];
            if !(lii > 0.0) || lii * lii < CONDITION_THRESHOLD * cov[(i, i)].abs() {
                return Err(singular);
            }
            log_det_half += lii.ln();
        }

        let mut lower = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..=i {
                lower[i * n + j] = l[(i, j)];
            }
        }
        let log_norm = -0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln() - log_det_half;
        Ok(Self {
            n,
            mean: params.mean.to_vec(),
            lower,
            log_norm,
        })
    }

    /// 通道数.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.n
    }

    /// 马氏距离的平方 `(x - μ)ᵀ Σ⁻¹ (x - μ)`.
    pub fn mahalanobis(&self, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.n);
        const STACK: usize = 8;
        let mut stack = [0.0; STACK];
        let mut heap;
        let z: &mut [f64] = if self.n <= STACK {
            &mut stack[..self.n]
        } else {
            heap = vec![0.0; self.n];
            &mut heap
        };

        // 前代求解 L z = x - μ.
        let mut acc = 0.0;
        for i in 0..self.n {
            let row = &self.lower[i * self.n..(i + 1) * self.n];
            let mut s = x[i] - self.mean[i];
            for j in 0..i {
                s -= row[j] * z[j];
            }
            z[i] = s / row[i];
            acc += z[i] * z[i];
        }
        acc
    }

    /// 对数密度.
    #[inline]
    pub fn log_density(&self, x: &[f64]) -> f64 {
        self.log_norm - 0.5 * self.mahalanobis(x)
    }
}
