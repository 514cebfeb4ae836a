//! E 步: 由先验与高斯参数计算每个体素的类别后验.

use ndarray::Axis;

use crate::classes::ClassMapping;
use crate::data::map_slabs_mut;
use crate::mixture::{GaussianDensity, MixtureParameters};
use crate::{ChannelImage, NumericalError, ProbabilityVolumes};

/// 一次 E 步的结果.
#[derive(Debug, Clone)]
pub struct EStep {
    /// 逐类别后验. 网格内体素和为 1, 网格外 (或所有类别都被排除) 的体素全为 0.
    pub posteriors: ProbabilityVolumes,

    /// 所有有效体素的对数边缘似然之和.
    pub log_likelihood: f64,

    /// 参与计算的体素个数.
    pub valid_voxels: usize,
}

/// 数值稳定的 `ln Σ exp(v)`. 忽略 `-inf`; 全为 `-inf` (或为空) 时返回 `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// 共享参数组内按相对权重重新分配先验:
/// `π̃_c = A_g · ω_c π_c / Σ_{m∈g} ω_m π_m`, 其中 `A_g = Σ_{m∈g} π_m`.
///
/// 组内相对权重全部相等时 `π̃ = π`. 没有共享组时直接返回原先验的副本.
pub fn effective_priors(
    priors: &ProbabilityVolumes,
    mapping: &ClassMapping,
    weights: &[f64],
) -> ProbabilityVolumes {
    let mut out = priors.clone();
    if !mapping.has_shared_groups() {
        return out;
    }
    let mut buf = vec![0.0; mapping.class_count()];
    for mut lane in out.data_mut().lanes_mut(Axis(0)) {
        buf.iter_mut().zip(lane.iter()).for_each(|(b, v)| *b = *v);
        reweight_voxel(mapping, weights, &mut buf);
        lane.iter_mut().zip(&buf).for_each(|(v, b)| *v = *b);
    }
    out
}

/// 对单个体素 (或亚体素) 的类别先验向量做 [`effective_priors`] 的重分配.
pub(crate) fn reweight_voxel(mapping: &ClassMapping, weights: &[f64], prior: &mut [f64]) {
    for g in 0..mapping.group_count() {
        let members = mapping.classes_in_group(g);
        if members.len() == 1 {
            continue;
        }
        let total: f64 = members.iter().map(|&m| prior[m]).sum();
        let weighted: f64 = members.iter().map(|&m| weights[m] * prior[m]).sum();
        if weighted > 0.0 {
            for &c in members {
                prior[c] = total * weights[c] * prior[c] / weighted;
            }
        }
    }
}

/// 为所有未被排除的组分解协方差. 被排除的组为 `None`.
pub fn densities(
    mixture: &MixtureParameters,
    excluded: &[bool],
) -> Result<Vec<Option<GaussianDensity>>, NumericalError> {
    mixture
        .groups()
        .iter()
        .enumerate()
        .map(|(g, params)| {
            if excluded.get(g).copied().unwrap_or(false) {
                Ok(None)
            } else {
                GaussianDensity::new(params, g).map(Some)
            }
        })
        .collect()
}

/// 标准 (非部分容积) E 步.
///
/// 对每个体素计算 `ln π_c + ln N(y | μ_g(c), Σ_g(c))`, 再以 log-sum-exp 归一化.
/// `priors` 应为 [`effective_priors`] 的结果. `excluded` 中标记的组不参与,
/// 其类别后验为 0. 先验全为 0 的体素不参与, 后验全为 0.
pub fn e_step<T>(
    priors: &ProbabilityVolumes,
    images: &[T],
    mixture: &MixtureParameters,
    mapping: &ClassMapping,
    excluded: &[bool],
) -> Result<EStep, NumericalError>
where
    T: AsRef<ChannelImage> + Sync,
{
    let dens = densities(mixture, excluded)?;
    let class_count = mapping.class_count();
    let (_, ny, nz) = priors.shape();
    let prior = priors.data();

    let mut posteriors = ProbabilityVolumes::zeros(class_count, priors.shape());
    let partials = map_slabs_mut(posteriors.data_mut(), |x, mut slab| {
        let mut y_vec = vec![0.0; images.len()];
        let mut logs = vec![f64::NEG_INFINITY; class_count];
        let mut ll = 0.0;
        let mut valid = 0usize;
        let mut finite = true;
        for y in 0..ny {
            for z in 0..nz {
                for (ch, img) in images.iter().enumerate() {
                    y_vec[ch] = img.as_ref()[(x, y, z)];
                }
                let mut any = false;
                for (c, l) in logs.iter_mut().enumerate() {
                    let p = prior[[c, x, y, z]];
                    *l = match &dens[mapping.group_of_class(c)] {
                        Some(d) if p > 0.0 => {
                            any = true;
                            p.ln() + d.log_density(&y_vec)
                        }
                        _ => f64::NEG_INFINITY,
                    };
                }
                if !any {
                    continue;
                }
                let lse = log_sum_exp(&logs);
                if !lse.is_finite() {
                    finite = false;
                    continue;
                }
                for (c, l) in logs.iter().enumerate() {
                    slab[(c, y, z)] = (l - lse).exp();
                }
                ll += lse;
                valid += 1;
            }
        }
        (ll, valid, finite)
    });

    let mut log_likelihood = 0.0;
    let mut valid_voxels = 0;
    for (ll, valid, finite) in partials {
        if !finite {
            return Err(NumericalError::NonFinite { what: "后验" });
        }
        log_likelihood += ll;
        valid_voxels += valid;
    }
    if valid_voxels == 0 {
        return Err(NumericalError::NoValidVoxels);
    }
    Ok(EStep {
        posteriors,
        log_likelihood,
        valid_voxels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixture::GaussianParameters;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_log_sum_exp() {
        assert!(f64_eq(log_sum_exp(&[0.0, 0.0]), 2f64.ln()));
        assert!(f64_eq(log_sum_exp(&[-1000.0, f64::NEG_INFINITY]), -1000.0));
        assert_eq!(log_sum_exp(&[f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_two_class_posterior() {
        let shape = (2, 1, 1);
        let mut priors = ProbabilityVolumes::zeros(2, shape);
        priors.data_mut().index_axis_mut(Axis(1), 0).fill(0.5);
        let images = vec![ChannelImage::from_fn(shape, |_| 1.0)];
        let mapping = ClassMapping::identity(2);
        let mixture = MixtureParameters::with_uniform_weights(
            vec![GaussianParameters::scalar(0.0, 1.0), GaussianParameters::scalar(2.0, 1.0)],
            &mapping,
        )
        .unwrap();

        let e = e_step(&priors, &images, &mixture, &mapping, &[false, false]).unwrap();
        // y = 1 与两个均值等距.
        assert!(f64_eq(e.posteriors.voxel((0, 0, 0))[0], 0.5));
        assert_eq!(e.posteriors.voxel_sum((1, 0, 0)), 0.0);
        assert_eq!(e.valid_voxels, 1);
        let expected = -0.5 * (2.0 * std::f64::consts::PI).ln() - 0.5;
        assert!(f64_eq(e.log_likelihood, expected));

        // 排除第 1 组后, 后验全部归第 0 类.
        let e = e_step(&priors, &images, &mixture, &mapping, &[false, true]).unwrap();
        assert!(f64_eq(e.posteriors.voxel((0, 0, 0))[0], 1.0));
        assert_eq!(e.posteriors.voxel((0, 0, 0))[1], 0.0);

        assert_eq!(
            e_step(&priors, &images, &mixture, &mapping, &[true, true]).unwrap_err(),
            NumericalError::NoValidVoxels
        );
    }

    #[test]
    fn test_singular_group_is_reported() {
        let shape = (1, 1, 1);
        let mut priors = ProbabilityVolumes::zeros(2, shape);
        priors.data_mut().fill(0.5);
        let images = vec![ChannelImage::from_fn(shape, |_| 1.0)];
        let mapping = ClassMapping::identity(2);
        let mixture = MixtureParameters::with_uniform_weights(
            vec![GaussianParameters::scalar(0.0, 1.0), GaussianParameters::scalar(2.0, 0.0)],
            &mapping,
        )
        .unwrap();
        assert_eq!(
            e_step(&priors, &images, &mixture, &mapping, &[false, false]).unwrap_err(),
            NumericalError::SingularCovariance { group: 1 }
        );
        // 被排除的组不做分解.
        assert!(e_step(&priors, &images, &mixture, &mapping, &[false, true]).is_ok());
    }

    #[test]
    fn test_effective_priors() {
        let mapping = ClassMapping::new(3, &[], &[0, 0, 1]).unwrap();
        let mut priors = ProbabilityVolumes::zeros(3, (1, 1, 1));
        priors.data_mut()[[0, 0, 0, 0]] = 0.2;
        priors.data_mut()[[1, 0, 0, 0]] = 0.4;
        priors.data_mut()[[2, 0, 0, 0]] = 0.4;

        let same = effective_priors(&priors, &mapping, &[0.5, 0.5, 1.0]);
        assert!(f64_eq(same.voxel((0, 0, 0))[0], 0.2));
        assert!(f64_eq(same.voxel((0, 0, 0))[1], 0.4));

        // ω = (0.8, 0.2): A = 0.6, 分母 0.16 + 0.08 = 0.24.
        let p = effective_priors(&priors, &mapping, &[0.8, 0.2, 1.0]);
        assert!(f64_eq(p.voxel((0, 0, 0))[0], 0.6 * 0.16 / 0.24));
        assert!(f64_eq(p.voxel((0, 0, 0))[1], 0.6 * 0.08 / 0.24));
        assert!(f64_eq(p.voxel((0, 0, 0))[2], 0.4));
        assert!(f64_eq(p.voxel_sum((0, 0, 0)), 1.0));
    }
}
