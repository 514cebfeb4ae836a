//! 部分容积模型.
//!
//! 每个体素被划分为 `N` 个亚体素, 每个亚体素有各自的图谱先验 (由超分辨率网格
//! 光栅化而来). 体素的组成被建模为纯类别或两类混合, 混合配置的高斯参数按混合比例
//! 线性插值. 由此得到体素分辨率的后验, 以及亚体素分辨率的后验与似然.

use std::sync::Arc;

use ndarray::{Array3, Array4};

use crate::classes::ClassMapping;
use crate::data::{map_range, map_slabs_mut};
use crate::mixture::MixtureParameters;
use crate::posterior::{reweight_voxel, EStep};
use crate::prior::rasterize;
use crate::{AtlasMesh, ChannelImage, ConfigError, Idx3d, NumericalError, ProbabilityVolumes, SegResult};

mod configs;
mod grid;

use configs::{normalized_weights, pair_polynomial, ConfigTable, VoxelSolver};

pub use grid::SubvoxelGrid;

/// 部分容积引擎的状态.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PvState {
    /// 上采样因子为 `[1, 1, 1]`, 分割走标准 E 步.
    Disabled,

    /// 网格、类别映射或上采样因子已改变, 亚体素先验需要重建.
    Building,

    /// 亚体素先验已就绪.
    Ready,
}

/// 亚体素分辨率的分割结果.
#[derive(Debug, Clone)]
pub struct SuperResolution {
    /// 每个亚体素的类别后验 `P(s = c | y)`.
    pub posteriors: ProbabilityVolumes,

    /// 每个亚体素的类别似然 `P(y | s = c)`.
    pub likelihoods: ProbabilityVolumes,
}

#[derive(Debug)]
struct SubvoxelPriorCache {
    shape: Idx3d,
    mesh: Arc<AtlasMesh>,
    priors: Arc<ProbabilityVolumes>,
}

/// 部分容积引擎: 管理亚体素先验缓存与配置层面的 E 步.
#[derive(Debug)]
pub struct PartialVolumeEngine {
    grid: SubvoxelGrid,
    state: PvState,
    cache: Option<SubvoxelPriorCache>,
}

impl Default for PartialVolumeEngine {
    fn default() -> Self {
        Self::new(SubvoxelGrid::default())
    }
}

impl PartialVolumeEngine {
    /// 以给定亚体素划分创建引擎. 缓存为空.
    pub fn new(grid: SubvoxelGrid) -> Self {
        Self {
            state: Self::idle_state(&grid),
            grid,
            cache: None,
        }
    }

    fn idle_state(grid: &SubvoxelGrid) -> PvState {
        if grid.is_identity() {
            PvState::Disabled
        } else {
            PvState::Building
        }
    }

    /// 亚体素划分.
    #[inline]
    pub fn grid(&self) -> SubvoxelGrid {
        self.grid
    }

    /// 当前状态.
    #[inline]
    pub fn state(&self) -> PvState {
        self.state
    }

    /// 是否启用 (上采样因子不全为 1).
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.grid.is_identity()
    }

    /// 更换亚体素划分. 划分改变时缓存失效.
    pub fn set_grid(&mut self, grid: SubvoxelGrid) {
        if grid != self.grid {
            self.grid = grid;
            self.invalidate();
        }
    }

    /// 丢弃亚体素先验缓存 (网格或类别映射已改变).
    pub fn invalidate(&mut self) {
        self.cache = None;
        self.state = Self::idle_state(&self.grid);
    }

    /// 构建 (或复用) 体素网格形状为 `shape` 的亚体素先验.
    ///
    /// 即使划分为恒等, 也会构建缓存, 此时状态仍为 [`PvState::Disabled`].
    pub fn prepare(&mut self, mesh: &AtlasMesh, mapping: &ClassMapping, shape: Idx3d) {
        if self.cache.as_ref().is_some_and(|c| c.shape == shape) {
            return;
        }
        let factors = self.grid.factors();
        let super_shape = self.grid.super_shape(shape);
        log::trace!("构建亚体素先验, 因子 {factors:?}, 亚体素网格 {super_shape:?}");
        let super_mesh = Arc::new(mesh.to_super_resolution(factors));
        let priors = Arc::new(rasterize(&super_mesh, mapping, super_shape));
        self.cache = Some(SubvoxelPriorCache {
            shape,
            mesh: super_mesh,
            priors,
        });
        if self.is_active() {
            self.state = PvState::Ready;
        }
    }

    fn cache(&self) -> Result<&SubvoxelPriorCache, ConfigError> {
        self.cache.as_ref().ok_or(ConfigError::MissingMesh)
    }

    /// 缓存必须是按 `images` 的形状构建的.
    fn cache_for<T: AsRef<ChannelImage>>(&self, images: &[T]) -> Result<&SubvoxelPriorCache, ConfigError> {
        let cache = self.cache()?;
        if let Some(img) = images.iter().find(|img| img.as_ref().shape() != cache.shape) {
            return Err(ConfigError::GeometryMismatch {
                expected: cache.shape,
                found: img.as_ref().shape(),
            });
        }
        Ok(cache)
    }

    /// 超分辨率网格 (节点坐标位于亚体素网格坐标系).
    pub fn super_mesh(&self) -> Option<&Arc<AtlasMesh>> {
        self.cache.as_ref().map(|c| &c.mesh)
    }

    /// 亚体素先验, 形状为 `(class, X, Y, Z)`.
    pub fn super_priors(&self) -> Option<&Arc<ProbabilityVolumes>> {
        self.cache.as_ref().map(|c| &c.priors)
    }

    /// 把体素图像复制到亚体素网格.
    pub fn super_images<T: AsRef<ChannelImage>>(&self, images: &[T]) -> Vec<ChannelImage> {
        images
            .iter()
            .map(|img| ChannelImage::new(self.grid.upsample(img.as_ref().data())))
            .collect()
    }

    /// 体素 `idx` 的亚体素先验, 写入 `out` (形状 `(N, 类别)`, 行优先).
    fn gather_prior(&self, priors: &ProbabilityVolumes, idx: Idx3d, out: &mut [f64]) {
        let data = priors.data();
        let k = priors.class_count();
        for (row, (sx, sy, sz)) in out.chunks_exact_mut(k).zip(self.grid.subvoxels(idx)) {
            for (c, v) in row.iter_mut().enumerate() {
                *v = data[[c, sx, sy, sz]];
            }
        }
    }

    /// 每个体素上两类族 `(a, b)` 中 `a` 所占的期望比例 (只由先验决定).
    ///
    /// 计入纯 `a` (比例 1) 与纯 `b` (比例 0) 两个端点. 该族先验为 0 的体素取 0.5.
    pub fn mixing_probability(&self, a: usize, b: usize) -> Result<Array3<f64>, ConfigError> {
        let cache = self.cache()?;
        let k = cache.priors.class_count();
        if a >= k || b >= k || a == b {
            return Err(ConfigError::InvalidParameter(format!(
                "混合类别 ({a}, {b}) 非法, 类别数为 {k}"
            )));
        }
        let n = self.grid.count();
        let mut prior = vec![0.0; n * k];
        let mut poly = Vec::with_capacity(n + 1);
        Ok(Array3::from_shape_fn(cache.shape, |idx| {
            self.gather_prior(&cache.priors, idx, &mut prior);
            if pair_polynomial(&prior, k, a, b, &mut poly).is_none() {
                return 0.5;
            }
            let total: f64 = poly.iter().sum();
            if total <= 0.0 {
                return 0.5;
            }
            let expected: f64 = poly.iter().enumerate().map(|(i, q)| i as f64 * q).sum();
            (expected / (n as f64 * total)).clamp(0.0, 1.0)
        }))
    }

    /// 配置层面的 E 步, 输出体素分辨率的类别后验.
    ///
    /// 体素的某个亚体素完全落在网格外时, 所有配置先验均为 0, 该体素不参与.
    pub fn e_step<T>(
        &self,
        images: &[T],
        mixture: &MixtureParameters,
        mapping: &ClassMapping,
        excluded: &[bool],
    ) -> SegResult<EStep>
    where
        T: AsRef<ChannelImage> + Sync,
    {
        let cache = self.cache_for(images)?;
        let table = ConfigTable::new(self.grid.count(), mixture, mapping, excluded)?;
        let k = mapping.class_count();
        let n = self.grid.count();
        let (_, ny, nz) = cache.shape;
        let weights = mixture.relative_weights();
        let shared = mapping.has_shared_groups();

        let mut posteriors = ProbabilityVolumes::zeros(k, cache.shape);
        let partials = map_slabs_mut(posteriors.data_mut(), |x, mut slab| {
            let mut solver = VoxelSolver::new(&table);
            let mut prior = vec![0.0; n * k];
            let mut y_vec = vec![0.0; images.len()];
            let mut w = vec![0.0; table.len()];
            let mut post = vec![0.0; k];
            let mut ll = 0.0;
            let mut valid = 0usize;
            let mut finite = true;
            for y in 0..ny {
                for z in 0..nz {
                    self.gather_prior(&cache.priors, (x, y, z), &mut prior);
                    if shared {
                        prior
                            .chunks_exact_mut(k)
                            .for_each(|row| reweight_voxel(mapping, weights, row));
                    }
                    for (ch, img) in images.iter().enumerate() {
                        y_vec[ch] = img.as_ref()[(x, y, z)];
                    }
                    let Some(fit) = solver.solve(&prior, &y_vec) else {
                        continue;
                    };
                    if !fit.log_evidence.is_finite() {
                        finite = false;
                        continue;
                    }
                    normalized_weights(&solver.log_joint, fit.log_evidence, &mut w);
                    solver.class_fractions(&w, &mut post);
                    for (c, p) in post.iter().enumerate() {
                        slab[(c, y, z)] = *p;
                    }
                    ll += fit.log_likelihood();
                    valid += 1;
                }
            }
            (ll, valid, finite)
        });

        let mut log_likelihood = 0.0;
        let mut valid_voxels = 0;
        for (ll, valid, finite) in partials {
            if !finite {
                return Err(NumericalError::NonFinite { what: "部分容积后验" }.into());
            }
            log_likelihood += ll;
            valid_voxels += valid;
        }
        if valid_voxels == 0 {
            return Err(NumericalError::NoValidVoxels.into());
        }
        Ok(EStep {
            posteriors,
            log_likelihood,
            valid_voxels,
        })
    }

    /// 亚体素分辨率的后验 `P(s = c | y)` 与似然 `P(y | s = c)`.
    ///
    /// 似然由贝叶斯公式反推: `P(y | s = c) = P(s = c | y) · P(y) / P(s = c)`,
    /// 其中 `P(s = c)` 是配置先验下亚体素 `s` 属于 `c` 的边缘概率.
    pub fn super_resolution<T>(
        &self,
        images: &[T],
        mixture: &MixtureParameters,
        mapping: &ClassMapping,
        excluded: &[bool],
    ) -> SegResult<SuperResolution>
    where
        T: AsRef<ChannelImage> + Sync,
    {
        let cache = self.cache_for(images)?;
        let table = ConfigTable::new(self.grid.count(), mixture, mapping, excluded)?;
        let k = mapping.class_count();
        let n = self.grid.count();
        let (nx, ny, nz) = cache.shape;
        let weights = mixture.relative_weights();
        let shared = mapping.has_shared_groups();

        // 每个 x 切片: 按 (y, z, s, c) 顺序排列的后验与似然.
        let slabs = map_range(nx, |x| {
            let mut solver = VoxelSolver::new(&table);
            let mut prior = vec![0.0; n * k];
            let mut y_vec = vec![0.0; images.len()];
            let mut w_post = vec![0.0; table.len()];
            let mut w_prior = vec![0.0; table.len()];
            let mut marg_prior = vec![0.0; n * k];
            let mut post = vec![0.0; ny * nz * n * k];
            let mut lik = vec![0.0; ny * nz * n * k];
            let mut finite = true;
            for y in 0..ny {
                for z in 0..nz {
                    self.gather_prior(&cache.priors, (x, y, z), &mut prior);
                    if shared {
                        prior
                            .chunks_exact_mut(k)
                            .for_each(|row| reweight_voxel(mapping, weights, row));
                    }
                    for (ch, img) in images.iter().enumerate() {
                        y_vec[ch] = img.as_ref()[(x, y, z)];
                    }
                    let Some(fit) = solver.solve(&prior, &y_vec) else {
                        continue;
                    };
                    if !fit.log_evidence.is_finite() {
                        finite = false;
                        continue;
                    }
                    normalized_weights(&solver.log_joint, fit.log_evidence, &mut w_post);
                    normalized_weights(&solver.log_prior, fit.log_prior_norm, &mut w_prior);
                    let base = (y * nz + z) * n * k;
                    let post_v = &mut post[base..base + n * k];
                    solver.subvoxel_marginals(&prior, &w_post, post_v);
                    solver.subvoxel_marginals(&prior, &w_prior, &mut marg_prior);

                    let evidence = fit.log_likelihood().exp();
                    for ((l, p), m) in lik[base..base + n * k].iter_mut().zip(post_v.iter()).zip(&marg_prior) {
                        *l = if *m > 0.0 { p * evidence / m } else { 0.0 };
                    }
                }
            }
            (post, lik, finite)
        });

        let super_shape = self.grid.super_shape(cache.shape);
        let (sx, sy, sz) = super_shape;
        let mut posteriors = Array4::zeros((k, sx, sy, sz));
        let mut likelihoods = Array4::zeros((k, sx, sy, sz));
        for (x, (post, lik, finite)) in slabs.into_iter().enumerate() {
            if !finite {
                return Err(NumericalError::NonFinite { what: "超分辨率后验" }.into());
            }
            for y in 0..ny {
                for z in 0..nz {
                    let base = (y * nz + z) * n * k;
                    for (s, (ux, uy, uz)) in self.grid.subvoxels((x, y, z)).enumerate() {
                        for c in 0..k {
                            let i = base + s * k + c;
                            posteriors[[c, ux, uy, uz]] = post[i];
                            likelihoods[[c, ux, uy, uz]] = lik[i];
                        }
                    }
                }
            }
        }
        Ok(SuperResolution {
            posteriors: ProbabilityVolumes::from_array(posteriors),
            likelihoods: ProbabilityVolumes::from_array(likelihoods),
        })
    }
}
