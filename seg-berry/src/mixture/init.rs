//! 混合模型参数的初始化.

use itertools::{iproduct, Itertools};
use ndarray::{Array1, Array2, Array3};
use ordered_float::OrderedFloat;

use super::{estimate_mixture, GaussianParameters, MixtureParameters};
use crate::classes::ClassMapping;
use crate::consts::COVARIANCE_FLOOR;
use crate::data::map_range;
use crate::{ChannelImage, Initialization, NumericalError, ProbabilityVolumes, SegResult};

/// 两组均值之差 (以全局标准差为单位) 低于该值时视为无法区分.
const DISTINGUISHABLE: f64 = 1e-3;

/// `mask` 内所有体素的多通道均值与协方差.
pub fn global_statistics<T>(images: &[T], mask: &Array3<bool>) -> Result<GaussianParameters, NumericalError>
where
    T: AsRef<ChannelImage> + Sync,
{
    let c_count = images.len();
    let (nx, ny, nz) = mask.dim();

    let partials = map_range(nx, |x| {
        let mut n = 0usize;
        let mut sum = vec![0.0; c_count];
        for (y, z) in iproduct!(0..ny, 0..nz).filter(|&(y, z)| mask[(x, y, z)]) {
            n += 1;
            for (s, img) in sum.iter_mut().zip(images) {
                *s += img.as_ref()[(x, y, z)];
            }
        }
        (n, sum)
    });
    let mut n = 0;
    let mut mean = vec![0.0; c_count];
    for (pn, ps) in partials {
        n += pn;
        mean.iter_mut().zip(ps).for_each(|(a, b)| *a += b);
    }
    if n == 0 {
        return Err(NumericalError::NoValidVoxels);
    }
    mean.iter_mut().for_each(|m| *m /= n as f64);

    let partials = map_range(nx, |x| {
        let mut acc = Array2::<f64>::zeros((c_count, c_count));
        let mut r = vec![0.0; c_count];
        for (y, z) in iproduct!(0..ny, 0..nz).filter(|&(y, z)| mask[(x, y, z)]) {
            for (ch, img) in images.iter().enumerate() {
                r[ch] = img.as_ref()[(x, y, z)] - mean[ch];
            }
            for (i, j) in iproduct!(0..c_count, 0..c_count) {
                acc[(i, j)] += r[i] * r[j];
            }
        }
        acc
    });
    let mut cov = Array2::<f64>::zeros((c_count, c_count));
    for part in partials {
        cov += &part;
    }
    cov /= n as f64;
    if mean.iter().chain(cov.iter()).any(|v| !v.is_finite()) {
        return Err(NumericalError::NonFinite { what: "全局统计量" });
    }

    Ok(GaussianParameters {
        mean: Array1::from(mean),
        covariance: cov,
    })
}

/// 每个通道的方差下限: [`COVARIANCE_FLOOR`] 乘以该通道的全局方差.
/// 全局方差为 0 (常数通道) 时取 [`COVARIANCE_FLOOR`] 本身.
pub fn variance_floor(global: &GaussianParameters) -> Vec<f64> {
    global
        .covariance
        .diag()
        .iter()
        .map(|&v| if v > 0.0 { COVARIANCE_FLOOR * v } else { COVARIANCE_FLOOR })
        .collect()
}

/// 按 `strategy` 计算初始混合模型参数. 相对权重取组内均匀值.
///
/// - [`Initialization::PriorWeighted`]: 以图谱先验为权重的矩估计;
/// - [`Initialization::IntensityQuantiles`]: 按第一个通道的强度排序后等分为
///   组数个区间, 以区间内的均值与协方差作为各组参数 (区间不足两个体素时
///   协方差取全局协方差除以组数的平方);
/// - [`Initialization::Auto`]: 先做先验加权估计, 若任意两组均值无法区分
///   (例如平坦图谱) 则退回强度分位数.
pub fn initial_parameters<T>(
    strategy: Initialization,
    priors: &ProbabilityVolumes,
    images: &[T],
    mapping: &ClassMapping,
) -> SegResult<MixtureParameters>
where
    T: AsRef<ChannelImage> + Sync,
{
    let mask = crate::prior::inside_mask(priors);
    let global = global_statistics(images, &mask)?;
    let floor = variance_floor(&global);

    let groups = match strategy {
        Initialization::PriorWeighted => prior_weighted(priors, images, mapping, &global, &floor)?,
        Initialization::IntensityQuantiles => {
            intensity_quantiles(images, &mask, mapping.group_count(), &global, &floor)
        }
        Initialization::Auto => {
            let groups = prior_weighted(priors, images, mapping, &global, &floor)?;
            if distinguishable(&groups, &global) {
                groups
            } else {
                log::warn!("图谱先验无法区分各组均值, 改用强度分位数初始化");
                intensity_quantiles(images, &mask, mapping.group_count(), &global, &floor)
            }
        }
    };
    Ok(MixtureParameters::with_uniform_weights(groups, mapping)?)
}

fn prior_weighted<T>(
    priors: &ProbabilityVolumes,
    images: &[T],
    mapping: &ClassMapping,
    global: &GaussianParameters,
    floor: &[f64],
) -> Result<Vec<GaussianParameters>, NumericalError>
where
    T: AsRef<ChannelImage> + Sync,
{
    let group_priors = mapping.group_volumes(priors);
    let previous = vec![global.clone(); mapping.group_count()];
    Ok(estimate_mixture(&group_priors, images, &previous, floor)?.groups)
}

fn intensity_quantiles<T>(
    images: &[T],
    mask: &Array3<bool>,
    group_count: usize,
    global: &GaussianParameters,
    floor: &[f64],
) -> Vec<GaussianParameters>
where
    T: AsRef<ChannelImage>,
{
    let (nx, ny, nz) = mask.dim();
    let first = images[0].as_ref();
    let mut voxels: Vec<_> = iproduct!(0..nx, 0..ny, 0..nz)
        .filter(|&idx| mask[idx])
        .collect();
    voxels.sort_by_key(|&idx| OrderedFloat(first[idx]));

    let n = voxels.len();
    let c_count = images.len();
    let fallback = &global.covariance / (group_count * group_count) as f64;
    (0..group_count)
        .map(|g| {
            let bin = &voxels[g * n / group_count..(g + 1) * n / group_count];
            if bin.is_empty() {
                return GaussianParameters {
                    mean: global.mean.clone(),
                    covariance: floored(fallback.clone(), floor),
                };
            }
            let mean: Array1<f64> = images
                .iter()
                .map(|img| {
                    let img = img.as_ref();
                    bin.iter().map(|&idx| img[idx]).sum::<f64>() / bin.len() as f64
                })
                .collect();
            let covariance = if bin.len() < 2 {
                fallback.clone()
            } else {
                let mut cov = Array2::<f64>::zeros((c_count, c_count));
                let mut r = vec![0.0; c_count];
                for &idx in bin {
                    for (ch, img) in images.iter().enumerate() {
                        r[ch] = img.as_ref()[idx] - mean[ch];
                    }
                    for (i, j) in iproduct!(0..c_count, 0..c_count) {
                        cov[(i, j)] += r[i] * r[j];
                    }
                }
                cov / bin.len() as f64
            };
            GaussianParameters {
                mean,
                covariance: floored(covariance, floor),
            }
        })
        .collect()
}

fn floored(mut covariance: Array2<f64>, floor: &[f64]) -> Array2<f64> {
    for (ch, &f) in floor.iter().enumerate() {
        if covariance[(ch, ch)] < f {
            covariance[(ch, ch)] = f;
        }
    }
    covariance
}

/// 任意两组均值在至少一个通道上相差超过 [`DISTINGUISHABLE`] 个全局标准差.
fn distinguishable(groups: &[GaussianParameters], global: &GaussianParameters) -> bool {
    let std: Vec<f64> = global.covariance.diag().iter().map(|v| v.sqrt()).collect();
    groups.iter().tuple_combinations().all(|(a, b)| {
        a.mean
            .iter()
            .zip(&b.mean)
            .zip(&std)
            .any(|((x, y), s)| (x - y).abs() > DISTINGUISHABLE * s)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::rasterize;
    use crate::AtlasMesh;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    /// x < 3 为 0, 否则为 10.
    fn step_image(shape: (usize, usize, usize)) -> ChannelImage {
        ChannelImage::from_fn(shape, |(x, _, _)| if x < 3 { 0.0 } else { 10.0 })
    }

    #[test]
    fn test_global_statistics() {
        let shape = (6, 2, 2);
        let img = step_image(shape);
        let mask = Array3::from_elem(shape, true);
        let g = global_statistics(&[img.clone()], &mask).unwrap();
        assert!(f64_eq(g.mean[0], 5.0));
        assert!(f64_eq(g.covariance[(0, 0)], 25.0));

        let none = Array3::from_elem(shape, false);
        assert_eq!(
            global_statistics(&[img], &none).unwrap_err(),
            NumericalError::NoValidVoxels
        );
    }

    #[test]
    fn test_quantiles_on_flat_prior() {
        let shape = (6, 2, 2);
        let img = step_image(shape);
        let mesh = AtlasMesh::uniform(shape, 2).unwrap();
        let mapping = ClassMapping::identity(2);
        let priors = rasterize(&mesh, &mapping, shape);

        let p = initial_parameters(Initialization::IntensityQuantiles, &priors, &[img.clone()], &mapping)
            .unwrap();
        assert!(f64_eq(p.group(0).mean[0], 0.0));
        assert!(f64_eq(p.group(1).mean[0], 10.0));
        // 区间内强度恒定, 方差被抬高到下限.
        assert!(f64_eq(p.group(1).covariance[(0, 0)], 25.0 * COVARIANCE_FLOOR));

        // 平坦先验下先验加权的两组均值相同, Auto 退回分位数.
        let w = initial_parameters(Initialization::PriorWeighted, &priors, &[img.clone()], &mapping)
            .unwrap();
        assert!(f64_eq(w.group(0).mean[0], w.group(1).mean[0]));
        let auto = initial_parameters(Initialization::Auto, &priors, &[img], &mapping).unwrap();
        assert_eq!(auto, p);
    }

    #[test]
    fn test_prior_weighted_follows_atlas() {
        let shape = (6, 2, 2);
        let img = step_image(shape);
        // 类别 0 占据 x < 3, 类别 1 占据 x >= 3.
        let mesh = AtlasMesh::cuboid(shape, (6, 1, 1), 2, |p| {
            if p[0] < 2.75 {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            }
        })
        .unwrap();
        let mapping = ClassMapping::identity(2);
        let priors = rasterize(&mesh, &mapping, shape);
        let p = initial_parameters(Initialization::Auto, &priors, &[img], &mapping).unwrap();
        assert!(p.group(0).mean[0] < 2.0);
        assert!(p.group(1).mean[0] > 8.0);
        assert_eq!(p.relative_weights(), &[1.0, 1.0]);
    }
}
