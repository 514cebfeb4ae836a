//! 加权最大似然估计 (M 步).

use ndarray::Array2;

use super::GaussianParameters;
use crate::classes::ClassMapping;
use crate::consts::MIN_CLASS_MASS;
use crate::data::map_range;
use crate::{ChannelImage, NumericalError, ProbabilityVolumes};

/// 一次参数估计的结果.
#[derive(Debug, Clone)]
pub struct Estimate {
    /// 每组新的高斯参数. 空组保留上一轮参数.
    pub groups: Vec<GaussianParameters>,

    /// 每组累计的后验质量.
    pub masses: Vec<f64>,

    /// 每组是否为空 (累计质量低于 [`MIN_CLASS_MASS`]).
    pub degenerate: Vec<bool>,
}

/// 由逐组后验 `group_posteriors` 与 (偏置校正后的) 图像估计每组的均值与协方差.
///
/// - 均值: `Σ p·y / Σ p`; 协方差: 残差外积的同样加权平均, 并显式对称化.
/// - 对角元低于 `variance_floor[ch]` 时被抬高到该值.
/// - 累计质量低于 [`MIN_CLASS_MASS`] 的组保留 `previous` 中的参数并标记为空组.
///
/// 每个 x 切片的部分和按切片顺序相加, 结果与线程调度无关.
pub fn estimate_mixture<T>(
    group_posteriors: &ProbabilityVolumes,
    images: &[T],
    previous: &[GaussianParameters],
    variance_floor: &[f64],
) -> Result<Estimate, NumericalError>
where
    T: AsRef<ChannelImage> + Sync,
{
    let g_count = group_posteriors.class_count();
    let c_count = images.len();
    let (nx, ny, nz) = group_posteriors.shape();
    debug_assert_eq!(previous.len(), g_count);
    debug_assert_eq!(variance_floor.len(), c_count);
    let post = group_posteriors.data();

    // 第一遍: 质量与一阶矩.
    let partials = map_range(nx, |x| {
        let mut masses = vec![0.0; g_count];
        let mut sums = vec![0.0; g_count * c_count];
        let mut y_vec = vec![0.0; c_count];
        for y in 0..ny {
            for z in 0..nz {
                for (ch, img) in images.iter().enumerate() {
                    y_vec[ch] = img.as_ref()[(x, y, z)];
                }
                for g in 0..g_count {
                    let p = post[[g, x, y, z]];
                    if p <= 0.0 {
                        continue;
                    }
                    masses[g] += p;
                    for ch in 0..c_count {
                        sums[g * c_count + ch] += p * y_vec[ch];
                    }
                }
            }
        }
        (masses, sums)
    });
    let mut masses = vec![0.0; g_count];
    let mut sums = vec![0.0; g_count * c_count];
    for (m, s) in partials {
        masses.iter_mut().zip(m).for_each(|(a, b)| *a += b);
        sums.iter_mut().zip(s).for_each(|(a, b)| *a += b);
    }
    if masses.iter().chain(sums.iter()).any(|v| !v.is_finite()) {
        return Err(NumericalError::NonFinite { what: "类别均值" });
    }

    let degenerate: Vec<bool> = masses.iter().map(|&m| m < MIN_CLASS_MASS).collect();
    let means: Vec<Vec<f64>> = (0..g_count)
        .map(|g| {
            if degenerate[g] {
                previous[g].mean.to_vec()
            } else {
                (0..c_count).map(|ch| sums[g * c_count + ch] / masses[g]).collect()
            }
        })
        .collect();

    // 第二遍: 残差外积.
    let partials = map_range(nx, |x| {
        let mut acc = vec![0.0; g_count * c_count * c_count];
        let mut r = vec![0.0; c_count];
        for y in 0..ny {
            for z in 0..nz {
                for g in (0..g_count).filter(|&g| !degenerate[g]) {
                    let p = post[[g, x, y, z]];
                    if p <= 0.0 {
                        continue;
                    }
                    for (ch, img) in images.iter().enumerate() {
                        r[ch] = img.as_ref()[(x, y, z)] - means[g][ch];
                    }
                    let block = &mut acc[g * c_count * c_count..(g + 1) * c_count * c_count];
                    for i in 0..c_count {
                        for j in 0..=i {
                            block[i * c_count + j] += p * r[i] * r[j];
                        }
                    }
                }
            }
        }
        acc
    });
    let mut second = vec![0.0; g_count * c_count * c_count];
    for part in partials {
        second.iter_mut().zip(part).for_each(|(a, b)| *a += b);
    }

    let mut groups = Vec::with_capacity(g_count);
    for g in 0..g_count {
        if degenerate[g] {
            log::debug!("第 {g} 组高斯参数没有后验质量, 保留上一轮参数");
            groups.push(previous[g].clone());
            continue;
        }
        let block = &second[g * c_count * c_count..(g + 1) * c_count * c_count];
        // 只累加了下三角, 对称填充即完成对称化.
        let mut cov = Array2::from_shape_fn((c_count, c_count), |(i, j)| {
            let (i, j) = if i >= j { (i, j) } else { (j, i) };
            block[i * c_count + j] / masses[g]
        });
        for ch in 0..c_count {
            if !(cov[(ch, ch)] >= variance_floor[ch]) {
                log::warn!(
                    "第 {g} 组第 {ch} 通道方差 {:e} 过小, 抬高到 {:e}",
                    cov[(ch, ch)],
                    variance_floor[ch]
                );
                cov[(ch, ch)] = variance_floor[ch];
            }
        }
        if cov.iter().any(|v| !v.is_finite()) {
            return Err(NumericalError::NonFinite { what: "类别协方差" });
        }
        groups.push(GaussianParameters {
            mean: means[g].iter().copied().collect(),
            covariance: cov,
        });
    }

    Ok(Estimate {
        groups,
        masses,
        degenerate,
    })
}

/// 重估共享参数的子类别的组内相对权重: 每个子类别的权重为它在同组所有类别的
/// 后验质量中所占的份额. 独占一组的类别权重恒为 1. 组内总质量为 0 时保留 `previous`.
pub fn reestimate_relative_weights(
    class_posteriors: &ProbabilityVolumes,
    mapping: &ClassMapping,
    previous: &[f64],
) -> Vec<f64> {
    let masses: Vec<f64> = (0..mapping.class_count())
        .map(|c| class_posteriors.mass(c))
        .collect();
    let mut weights = previous.to_vec();
    for g in 0..mapping.group_count() {
        let members = mapping.classes_in_group(g);
        let total: f64 = members.iter().map(|&c| masses[c]).sum();
        if total < MIN_CLASS_MASS {
            continue;
        }
        for &c in members {
            weights[c] = masses[c] / total;
        }
    }
    weights
}
