//! 空间先验采样.
//!
//! 把图谱网格光栅化到规则采样网格上 (体素或亚体素), 得到逐类别的先验概率体.

use std::sync::Arc;

use ndarray::{Array2, Array3, Axis};

use crate::classes::ClassMapping;
use crate::consts::BARYCENTRIC_TOLERANCE;
use crate::data::map_slabs_mut;
use crate::mesh::TetraLocator;
use crate::{AtlasMesh, ConfigError, Idx3d, ProbabilityVolumes};

/// 把网格光栅化到形状为 `shape` 的采样网格上, 采样点为整数坐标 `(x, y, z)`.
///
/// 对每个采样点, 找到包含它的四面体 (共享面上的点归属网格中靠前的四面体),
/// 以重心坐标插值节点 alpha 向量, 按 `mapping` 合并为类别先验并归一化.
/// 网格之外的点所有类别先验均为 0, 不做外推.
pub fn rasterize(mesh: &AtlasMesh, mapping: &ClassMapping, shape: Idx3d) -> ProbabilityVolumes {
    debug_assert_eq!(mesh.class_count(), mapping.mesh_class_count());

    let locators: Vec<TetraLocator> = (0..mesh.tetrahedron_count())
        .filter_map(|t| TetraLocator::new(mesh, t))
        .collect();

    // 每个 x 切片只需要检查与它相交的四面体. 桶内保持网格顺序.
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); shape.0];
    for (i, loc) in locators.iter().enumerate() {
        let (min, max) = loc.bounds();
        let (lo, hi) = grid_range(min[0], max[0], shape.0);
        for bucket in buckets.iter_mut().take(hi).skip(lo) {
            bucket.push(i);
        }
    }

    let class_count = mapping.class_count();
    let alphas = mesh.alphas();
    let mut out = ProbabilityVolumes::zeros(class_count, shape);
    map_slabs_mut(out.data_mut(), |x, mut slab| {
        let mut filled = Array2::from_elem((shape.1, shape.2), false);
        let mut native = vec![0.0; mesh.class_count()];
        let mut merged = vec![0.0; class_count];

        for loc in buckets[x].iter().map(|&i| &locators[i]) {
            let (min, max) = loc.bounds();
            let (ylo, yhi) = grid_range(min[1], max[1], shape.1);
            let (zlo, zhi) = grid_range(min[2], max[2], shape.2);
            for y in ylo..yhi {
                for z in zlo..zhi {
                    if filled[(y, z)] {
                        continue;
                    }
                    let Some((nodes, bary)) = loc.locate([x as f64, y as f64, z as f64]) else {
                        continue;
                    };
                    filled[(y, z)] = true;

                    native.iter_mut().for_each(|v| *v = 0.0);
                    for (n, w) in nodes.iter().zip(bary) {
                        for (v, a) in native.iter_mut().zip(alphas.row(*n)) {
                            *v += w * a;
                        }
                    }
                    mapping.merge_alphas(&native, &mut merged);
                    let sum: f64 = merged.iter().sum();
                    if sum > 0.0 {
                        for (c, p) in merged.iter().enumerate() {
                            slab[(c, y, z)] = p / sum;
                        }
                    }
                }
            }
        }
    });
    out
}

/// 连续区间 `[lo, hi]` 覆盖的整数采样点范围 (左闭右开), 截断到 `0..n`.
fn grid_range(lo: f64, hi: f64, n: usize) -> (usize, usize) {
    let a = (lo - BARYCENTRIC_TOLERANCE).ceil().max(0.0);
    let b = (hi + BARYCENTRIC_TOLERANCE).floor();
    if b < 0.0 || a > b {
        return (0, 0);
    }
    (a as usize, (b as usize + 1).min(n))
}

/// 有先验质量 (即位于网格内) 的体素.
pub fn inside_mask(priors: &ProbabilityVolumes) -> Array3<bool> {
    priors.data().map_axis(Axis(0), |v| v.sum() > 0.0)
}

/// 带缓存的先验采样器.
///
/// 光栅化结果以 (网格代数, 形状) 为键缓存. 只有通过 [`Self::set_mesh`]
/// 替换网格才会使缓存失效, 原地修改网格不会被察觉.
#[derive(Debug, Default)]
pub struct PriorSampler {
    mesh: Option<Arc<AtlasMesh>>,
    mapping: Option<ClassMapping>,
    generation: u64,
    cache: Option<CachedPriors>,
}

#[derive(Debug)]
struct CachedPriors {
    generation: u64,
    shape: Idx3d,
    priors: Arc<ProbabilityVolumes>,
}

impl PriorSampler {
    /// 尚未设置网格的采样器.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置网格与类别映射. 映射的网格类别数必须与网格一致.
    pub fn set_mesh(&mut self, mesh: Arc<AtlasMesh>, mapping: ClassMapping) -> Result<(), ConfigError> {
        if mapping.mesh_class_count() != mesh.class_count() {
            return Err(ConfigError::ClassCountMismatch {
                expected: mesh.class_count(),
                found: mapping.mesh_class_count(),
            });
        }
        self.mesh = Some(mesh);
        self.mapping = Some(mapping);
        self.invalidate();
        Ok(())
    }

    /// 当前网格.
    pub fn mesh(&self) -> Result<&Arc<AtlasMesh>, ConfigError> {
        self.mesh.as_ref().ok_or(ConfigError::MissingMesh)
    }

    /// 当前类别映射.
    pub fn mapping(&self) -> Result<&ClassMapping, ConfigError> {
        self.mapping.as_ref().ok_or(ConfigError::MissingMesh)
    }

    /// 网格代数. 每次 [`Self::set_mesh`] 或 [`Self::invalidate`] 后递增.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 丢弃缓存.
    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.cache = None;
    }

    /// 获取形状为 `shape` 的先验. 缓存命中时不会重新光栅化.
    pub fn priors(&mut self, shape: Idx3d) -> Result<Arc<ProbabilityVolumes>, ConfigError> {
        let mesh = self.mesh.as_ref().ok_or(ConfigError::MissingMesh)?;
        let mapping = self.mapping.as_ref().ok_or(ConfigError::MissingMesh)?;
        if let Some(c) = &self.cache {
            if c.generation == self.generation && c.shape == shape {
                return Ok(Arc::clone(&c.priors));
            }
        }
        log::trace!("光栅化图谱先验, 形状 {shape:?}, 网格代数 {}", self.generation);
        let priors = Arc::new(rasterize(mesh, mapping, shape));
        self.cache = Some(CachedPriors {
            generation: self.generation,
            shape,
            priors: Arc::clone(&priors),
        });
        Ok(priors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::PROBABILITY_TOLERANCE;

    #[test]
    fn test_uniform_mesh_priors() {
        let shape = (4, 3, 5);
        let mesh = AtlasMesh::uniform(shape, 4).unwrap();
        let p = rasterize(&mesh, &ClassMapping::identity(4), shape);
        assert_eq!(p.class_count(), 4);
        for v in p.data().iter() {
            assert!((v - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn test_outside_is_zero() {
        // 网格只覆盖 x < 2 的体素.
        let mesh = AtlasMesh::uniform((2, 3, 3), 2).unwrap();
        let p = rasterize(&mesh, &ClassMapping::identity(2), (4, 3, 3));
        let mask = inside_mask(&p);
        assert!(mask[(1, 2, 2)]);
        assert!(!mask[(2, 0, 0)]);
        assert_eq!(p.voxel_sum((3, 1, 1)), 0.0);
        assert!((p.voxel_sum((0, 1, 1)) - 1.0).abs() < PROBABILITY_TOLERANCE);
    }

    #[test]
    fn test_merged_priors_follow_lookup() {
        let shape = (5, 5, 5);
        let mesh = AtlasMesh::cuboid(shape, (2, 2, 2), 3, |p| {
            let t = ((p[0] + 0.5) / 5.0).clamp(0.0, 1.0);
            vec![0.5 * t, 0.5 * t, 1.0 - t]
        })
        .unwrap();
        let mapping = ClassMapping::new(3, &[0, 0, 1], &[]).unwrap();
        let p = rasterize(&mesh, &mapping, shape);
        assert_eq!(p.class_count(), 2);
        for x in 0..5 {
            let t = (x as f64 + 0.5) / 5.0;
            let v = p.voxel((x, 2, 3));
            assert!((v[0] - t).abs() < 1e-9);
            assert!((v[0] + v[1] - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_sampler_cache() {
        let mut s = PriorSampler::new();
        assert_eq!(s.priors((2, 2, 2)).unwrap_err(), ConfigError::MissingMesh);

        let mesh = Arc::new(AtlasMesh::uniform((2, 2, 2), 2).unwrap());
        s.set_mesh(Arc::clone(&mesh), ClassMapping::identity(2)).unwrap();
        let a = s.priors((2, 2, 2)).unwrap();
        let b = s.priors((2, 2, 2)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        s.set_mesh(mesh, ClassMapping::identity(2)).unwrap();
        let c = s.priors((2, 2, 2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(*a, *c);

        let bad = s.set_mesh(
            Arc::new(AtlasMesh::uniform((2, 2, 2), 3).unwrap()),
            ClassMapping::identity(2),
        );
        assert!(bad.is_err());
    }
}
