//! 多项式偏置场.
//!
//! 偏置场在送进来的强度域中是加性的: `corrected = image - field`.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array3, Zip};

use crate::data::map_range;
use crate::mixture::GaussianParameters;
use crate::{ChannelImage, ConfigError, NumericalError, ProbabilityVolumes};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod basis;

pub use basis::{BasisCache, BiasBasis};

/// 正规方程对角线上附加的相对岭项.
const RIDGE: f64 = 1e-10;

/// 每个通道一组偏置场系数.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BiasFieldModel {
    order: u32,
    coefficients: Vec<Vec<f64>>,
}

impl BiasFieldModel {
    /// 全零系数 (偏置场恒为 0).
    pub fn zeros(basis: &BiasBasis, channel_count: usize) -> Self {
        Self {
            order: basis.order(),
            coefficients: vec![vec![0.0; basis.term_count()]; channel_count],
        }
    }

    /// 由给定系数构建. 每个通道的系数个数必须等于基函数个数.
    pub fn new(basis: &BiasBasis, coefficients: Vec<Vec<f64>>) -> Result<Self, ConfigError> {
        for c in &coefficients {
            basis.check_len(c.len())?;
            if c.iter().any(|v| !v.is_finite()) {
                return Err(ConfigError::InvalidParameter("偏置场系数含有非有限值".into()));
            }
        }
        Ok(Self {
            order: basis.order(),
            coefficients,
        })
    }

    /// 多项式阶数. 0 表示关闭.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// 通道数.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.coefficients.len()
    }

    /// 所有通道的系数.
    #[inline]
    pub fn coefficients(&self) -> &[Vec<f64>] {
        &self.coefficients
    }

    /// 每个通道的偏置场.
    pub fn fields(&self, basis: &BiasBasis) -> Result<Vec<Array3<f64>>, ConfigError> {
        self.coefficients.iter().map(|c| basis.evaluate(c)).collect()
    }

    /// 对 `images` 做偏置校正: `image - field`.
    pub fn apply<T: AsRef<ChannelImage>>(
        &self,
        basis: &BiasBasis,
        images: &[T],
    ) -> Result<Vec<ChannelImage>, ConfigError> {
        if images.len() != self.channel_count() {
            return Err(ConfigError::ChannelCountMismatch {
                expected: self.channel_count(),
                found: images.len(),
            });
        }
        images
            .iter()
            .zip(&self.coefficients)
            .map(|(img, c)| {
                let field = basis.evaluate(c)?;
                Ok(ChannelImage::new(img.as_ref().data() - &field))
            })
            .collect()
    }
}

/// 加权最小二乘 `(BᵀWB) c = BᵀW r`.
///
/// 优先用 Cholesky 求解, 失败时退回 LU. 没有任何正权重或方程无解时返回
/// [`NumericalError::SingularBiasSystem`].
pub fn fit_weighted(
    basis: &BiasBasis,
    residual: &Array3<f64>,
    weights: &Array3<f64>,
) -> Result<Vec<f64>, NumericalError> {
    let t = basis.term_count();
    if t == 0 {
        return Ok(Vec::new());
    }
    let (nx, ny, nz) = basis.shape();

    let partials = map_range(nx, |x| {
        let mut a = vec![0.0; t * t];
        let mut b = vec![0.0; t];
        let mut phi = vec![0.0; t];
        for y in 0..ny {
            for z in 0..nz {
                let w = weights[(x, y, z)];
                if w <= 0.0 {
                    continue;
                }
                basis.values_at((x, y, z), &mut phi);
                let r = residual[(x, y, z)];
                for i in 0..t {
                    let wi = w * phi[i];
                    b[i] += wi * r;
                    for j in i..t {
                        a[i * t + j] += wi * phi[j];
                    }
                }
            }
        }
        (a, b)
    });
    let mut a = vec![0.0; t * t];
    let mut b = vec![0.0; t];
    for (pa, pb) in partials {
        a.iter_mut().zip(pa).for_each(|(s, v)| *s += v);
        b.iter_mut().zip(pb).for_each(|(s, v)| *s += v);
    }

    let trace: f64 = (0..t).map(|i| a[i * t + i]).sum();
    if !(trace > 0.0) || !trace.is_finite() {
        return Err(NumericalError::SingularBiasSystem);
    }
    let ridge = RIDGE * trace / t as f64;
    let lhs = DMatrix::from_fn(t, t, |i, j| {
        let v = if i <= j { a[i * t + j] } else { a[j * t + i] };
        if i == j {
            v + ridge
        } else {
            v
        }
    });
    let rhs = DVector::from_vec(b);

    let solution = match lhs.clone().cholesky() {
        Some(ch) => ch.solve(&rhs),
        None => {
            log::debug!("偏置场正规方程 Cholesky 分解失败, 改用 LU");
            lhs.lu().solve(&rhs).ok_or(NumericalError::SingularBiasSystem)?
        }
    };
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(NumericalError::NonFinite { what: "偏置场系数" });
    }
    Ok(solution.iter().copied().collect())
}

/// 由当前后验与高斯参数估计每个通道的偏置场系数.
///
/// 对通道 `ch`, 体素权重 `w_g = post_g / Σ_g[ch, ch]`, 残差
/// `r = y - Σ_g w_g μ_g[ch] / Σ_g w_g`, 再以 `Σ_g w_g` 为权重拟合 `r`.
/// `images` 是未校正的原始图像; `excluded` 中标记的组不参与.
pub fn estimate_bias<T>(
    basis: &BiasBasis,
    images: &[T],
    group_posteriors: &ProbabilityVolumes,
    groups: &[GaussianParameters],
    excluded: &[bool],
) -> Result<Vec<Vec<f64>>, NumericalError>
where
    T: AsRef<ChannelImage> + Sync,
{
    let shape = basis.shape();
    let post = group_posteriors.data();
    images
        .iter()
        .enumerate()
        .map(|(ch, img)| {
            let precision: Vec<f64> = groups
                .iter()
                .zip(excluded)
                .map(|(g, &ex)| {
                    let v = g.covariance[(ch, ch)];
                    if ex || !(v > 0.0) {
                        0.0
                    } else {
                        1.0 / v
                    }
                })
                .collect();

            let mut weights = Array3::zeros(shape);
            let mut residual = Array3::zeros(shape);
            Zip::indexed(&mut weights)
                .and(&mut residual)
                .and(img.as_ref().data())
                .for_each(|(x, y, z), w, r, &v| {
                    let mut sw = 0.0;
                    let mut swm = 0.0;
                    for (g, (p, gp)) in precision.iter().zip(groups).enumerate() {
                        let wg = post[[g, x, y, z]] * p;
                        sw += wg;
                        swm += wg * gp.mean[ch];
                    }
                    if sw > 0.0 {
                        *w = sw;
                        *r = v - swm / sw;
                    }
                });
            fit_weighted(basis, &residual, &weights)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unweighted_fit_recovers_field() {
        let basis = BiasBasis::new((6, 5, 4), 2);
        let coeffs: Vec<f64> = (0..basis.term_count()).map(|t| (t as f64 - 4.0) * 0.05).collect();
        let field = basis.evaluate(&coeffs).unwrap();
        let weights = Array3::from_elem(basis.shape(), 2.0);
        let fit = fit_weighted(&basis, &field, &weights).unwrap();
        for (a, b) in fit.iter().zip(&coeffs) {
            assert!((a - b).abs() < 1e-8);
        }
    }

    #[test]
    fn test_zero_weights_are_singular() {
        let basis = BiasBasis::new((3, 3, 3), 1);
        let zeros = Array3::zeros(basis.shape());
        assert_eq!(
            fit_weighted(&basis, &zeros, &zeros),
            Err(NumericalError::SingularBiasSystem)
        );
        let off = BiasBasis::new((3, 3, 3), 0);
        assert_eq!(fit_weighted(&off, &zeros, &zeros), Ok(vec![]));
    }

    #[test]
    fn test_estimate_bias_two_classes() {
        // 两类: x < 4 为 0, 否则为 50; 叠加一个一阶偏置场.
        let shape = (8, 4, 4);
        let basis = BiasBasis::new(shape, 1);
        let truth = vec![3.0, -1.0, 0.5];
        let field = basis.evaluate(&truth).unwrap();
        let img = ChannelImage::from_fn(shape, |idx| {
            let base = if idx.0 < 4 { 0.0 } else { 50.0 };
            base + field[idx]
        });

        let mut post = ProbabilityVolumes::zeros(2, shape);
        for ((x, y, z), _) in field.indexed_iter() {
            post.data_mut()[[usize::from(x >= 4), x, y, z]] = 1.0;
        }
        let groups = vec![GaussianParameters::scalar(0.0, 1.0), GaussianParameters::scalar(50.0, 1.0)];
        let est = estimate_bias(&basis, &[img.clone()], &post, &groups, &[false, false]).unwrap();
        for (a, b) in est[0].iter().zip(&truth) {
            assert!((a - b).abs() < 1e-8);
        }

        let model = BiasFieldModel::new(&basis, est).unwrap();
        let corrected = model.apply(&basis, &[img.clone()]).unwrap();
        let fields = model.fields(&basis).unwrap();
        assert_eq!(img.data() - &fields[0], *corrected[0].data());
    }

    #[test]
    fn test_model_validation() {
        let basis = BiasBasis::new((4, 4, 4), 1);
        assert!(BiasFieldModel::new(&basis, vec![vec![0.0; 2]]).is_err());
        assert!(BiasFieldModel::new(&basis, vec![vec![f64::NAN; 3]]).is_err());
        let zero = BiasFieldModel::zeros(&basis, 2);
        assert_eq!(zero.channel_count(), 2);
        let img = ChannelImage::from_fn((4, 4, 4), |(x, y, z)| (x + y * z) as f64);
        assert!(zero.apply(&basis, &[img.clone()]).is_err());
        let same = zero.apply(&basis, &[img.clone(), img.clone()]).unwrap();
        assert_eq!(same[1], img);
    }
}
