//! 分割驱动: 状态机与 EM 外层循环.

use std::sync::Arc;

use ndarray::{Array3, Array4};

use crate::bias::{estimate_bias, BasisCache, BiasBasis, BiasFieldModel};
use crate::classes::ClassMapping;
use crate::mixture::{
    estimate_mixture, global_statistics, initial_parameters, reestimate_relative_weights, variance_floor,
    MixtureParameters,
};
use crate::partial_volume::{PartialVolumeEngine, SuperResolution};
use crate::posterior::{e_step, effective_priors, EStep};
use crate::prior::{inside_mask, rasterize, PriorSampler};
use crate::{
    check_geometry, AtlasMesh, ChannelImage, ConfigError, Idx3d, ProbabilityVolumes, SegResult,
    SegmenterConfig,
};

/// 分割器状态.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SegmenterState {
    /// 缺少输入, 或输入/配置改变后尚未重新初始化.
    Uninitialized,

    /// 初始参数与初始后验已就绪.
    Initialized,

    /// 正在执行 `segment()`.
    Iterating,

    /// 上一次 `segment()` 在迭代上限之前收敛.
    Converged,

    /// 上一次 `segment()` 达到迭代上限而未收敛.
    MaxIterationsReached,
}

/// 一次 `segment()` 调用的结果.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentReport {
    /// 本次调用执行的 EM 迭代次数.
    pub iterations: usize,

    /// 最终的对数似然.
    pub log_likelihood: f64,

    /// 是否因相对变化量低于门限而停止.
    pub converged: bool,

    /// 每次迭代后的对数似然.
    pub history: Vec<f64>,
}

/// 已提交的模型. `segment()` 在副本上迭代, 成功后才整体替换.
#[derive(Debug, Clone)]
struct Model {
    mixture: MixtureParameters,
    bias: BiasFieldModel,
    corrected: Vec<ChannelImage>,
    posteriors: ProbabilityVolumes,
    log_likelihood: f64,
    variance_floor: Vec<f64>,
    degenerate: Vec<bool>,
    iterations: usize,
}

/// 以图谱网格为先验的多通道 EM 分割器.
///
/// 典型用法: [`Self::set_images`] → [`Self::set_atlas_mesh`] → [`Self::segment`] →
/// 读取 [`Self::posteriors`] 等结果. 所有读取结果的方法都会先调用
/// [`Self::ensure_initialized`], 因此在 `segment()` 之前也能得到初始状态下的结果.
#[derive(Debug)]
pub struct EmSegmenter {
    config: SegmenterConfig,
    images: Vec<Arc<ChannelImage>>,
    sampler: PriorSampler,
    pv: PartialVolumeEngine,
    basis_cache: BasisCache,
    seed_mixture: Option<MixtureParameters>,
    seed_bias: Option<Vec<Vec<f64>>>,
    model: Option<Model>,
    state: SegmenterState,
}

impl Default for EmSegmenter {
    fn default() -> Self {
        Self {
            config: SegmenterConfig::default(),
            images: Vec::new(),
            sampler: PriorSampler::new(),
            pv: PartialVolumeEngine::default(),
            basis_cache: BasisCache::new(),
            seed_mixture: None,
            seed_bias: None,
            model: None,
            state: SegmenterState::Uninitialized,
        }
    }
}

impl EmSegmenter {
    /// 默认配置的分割器.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定配置创建分割器.
    pub fn with_config(config: SegmenterConfig) -> Result<Self, ConfigError> {
        let mut s = Self::new();
        s.set_config(config)?;
        Ok(s)
    }

    /// 丢弃已提交的模型, 回到未初始化状态.
    fn reset_model(&mut self) {
        self.model = None;
        self.state = SegmenterState::Uninitialized;
    }

    /// 丢弃模型, 但保留其混合模型参数作为下一次初始化的起点.
    fn reset_keeping_mixture(&mut self) {
        if let Some(m) = self.model.take() {
            self.seed_mixture = Some(m.mixture);
        }
        self.reset_model();
    }

    // ----- 输入 -----

    /// 设置输入通道图像. 所有通道形状必须一致且数值有限.
    /// 模型需要重新初始化.
    pub fn set_images<I>(&mut self, images: impl IntoIterator<Item = I>) -> Result<(), ConfigError>
    where
        I: Into<Arc<ChannelImage>>,
    {
        let images: Vec<Arc<ChannelImage>> = images.into_iter().map(Into::into).collect();
        check_geometry(&images)?;
        self.images = images;
        self.reset_model();
        Ok(())
    }

    /// 设置图谱网格与两张查找表 (为空时视为恒等映射). 模型需要重新初始化.
    pub fn set_atlas_mesh(
        &mut self,
        mesh: impl Into<Arc<AtlasMesh>>,
        lookup: &[usize],
        independent: &[usize],
    ) -> Result<(), ConfigError> {
        let mesh = mesh.into();
        let mapping = ClassMapping::new(mesh.class_count(), lookup, independent)?;
        self.sampler.set_mesh(mesh, mapping)?;
        self.pv.invalidate();
        self.reset_model();
        Ok(())
    }

    // ----- 配置 -----

    /// 替换全部配置.
    ///
    /// 偏置场阶数或部分容积因子改变时, 模型需要重新初始化 (保留混合模型参数);
    /// 其余参数只影响之后的 `segment()`.
    pub fn set_config(&mut self, config: SegmenterConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let grid = config.subvoxel_grid()?;
        let structural = config.bias_field_order != self.config.bias_field_order
            || config.partial_volume_factors != self.config.partial_volume_factors;
        self.pv.set_grid(grid);
        self.config = config;
        if structural {
            self.reset_keeping_mixture();
        }
        Ok(())
    }

    /// 当前配置.
    #[inline]
    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// 设置最大迭代次数.
    pub fn set_max_iterations(&mut self, max_iterations: usize) -> Result<(), ConfigError> {
        self.set_config(SegmenterConfig {
            max_iterations: Some(max_iterations),
            ..self.config.clone()
        })
    }

    /// 设置收敛门限.
    pub fn set_stop_criterion(&mut self, stop_criterion: f64) -> Result<(), ConfigError> {
        self.set_config(SegmenterConfig {
            stop_criterion,
            ..self.config.clone()
        })
    }

    /// 设置偏置场多项式阶数.
    pub fn set_bias_field_order(&mut self, order: u32) -> Result<(), ConfigError> {
        self.set_config(SegmenterConfig {
            bias_field_order: order,
            ..self.config.clone()
        })
    }

    /// 设置部分容积上采样因子.
    pub fn set_partial_volume_factors(&mut self, factors: [usize; 3]) -> Result<(), ConfigError> {
        self.set_config(SegmenterConfig {
            partial_volume_factors: factors,
            ..self.config.clone()
        })
    }

    /// 设置是否重估共享类别的组内相对权重.
    pub fn set_reestimate_shared_class_weights(&mut self, on: bool) -> Result<(), ConfigError> {
        self.set_config(SegmenterConfig {
            reestimate_shared_class_weights: on,
            ..self.config.clone()
        })
    }

    /// 指定混合模型参数作为下一次初始化的起点 (跳过自动初始化).
    /// 已有的偏置场系数被保留.
    pub fn set_mixture_parameters(&mut self, params: MixtureParameters) -> Result<(), ConfigError> {
        let channels = if self.images.is_empty() {
            params.channel_count()
        } else {
            self.images.len()
        };
        match self.sampler.mapping() {
            Ok(mapping) => params.check_compatible(mapping, channels)?,
            Err(_) if params.channel_count() != channels => {
                return Err(ConfigError::ChannelCountMismatch {
                    expected: channels,
                    found: params.channel_count(),
                })
            }
            Err(_) => {}
        }
        if let Some(m) = self.model.take() {
            self.seed_bias = Some(m.bias.coefficients().to_vec());
        }
        self.seed_mixture = Some(params);
        self.reset_model();
        Ok(())
    }

    /// 指定每个通道的偏置场系数. 需要先设置图像, 系数个数必须与当前阶数匹配.
    /// 已有的混合模型参数被保留.
    pub fn set_bias_coefficients(&mut self, coefficients: Vec<Vec<f64>>) -> Result<(), ConfigError> {
        let shape = self.shape()?;
        if coefficients.len() != self.images.len() {
            return Err(ConfigError::ChannelCountMismatch {
                expected: self.images.len(),
                found: coefficients.len(),
            });
        }
        let basis = self.basis_cache.get_or_build(shape, self.config.bias_field_order);
        BiasFieldModel::new(&basis, coefficients.clone())?;
        self.seed_bias = Some(coefficients);
        self.reset_keeping_mixture();
        Ok(())
    }

    fn shape(&self) -> Result<Idx3d, ConfigError> {
        self.images
            .first()
            .map(|img| img.shape())
            .ok_or(ConfigError::MissingImages)
    }

    // ----- 初始化 -----

    /// 保证模型已初始化: 光栅化先验 (以及亚体素先验), 计算初始混合模型参数、
    /// 偏置场系数 (默认全零) 与校正后的图像, 并做一次 E 步得到初始后验.
    ///
    /// 模型已存在时什么也不做. 出错时不修改任何状态.
    pub fn ensure_initialized(&mut self) -> SegResult<()> {
        if self.model.is_some() {
            return Ok(());
        }
        let shape = self.shape()?;
        let priors = self.sampler.priors(shape)?;
        let mapping = self.sampler.mapping()?;
        if self.pv.is_active() {
            self.pv.prepare(self.sampler.mesh()?, mapping, shape);
        }

        let basis = self.basis_cache.get_or_build(shape, self.config.bias_field_order);
        let bias = match &self.seed_bias {
            Some(c) if c.len() == self.images.len() => BiasFieldModel::new(&basis, c.clone())?,
            Some(c) => {
                return Err(ConfigError::ChannelCountMismatch {
                    expected: self.images.len(),
                    found: c.len(),
                }
                .into())
            }
            None => BiasFieldModel::zeros(&basis, self.images.len()),
        };
        let corrected = bias.apply(&basis, &self.images)?;

        let mixture = match &self.seed_mixture {
            Some(m) => {
                m.check_compatible(mapping, self.images.len())?;
                m.clone()
            }
            None => initial_parameters(self.config.initialization, &priors, &corrected, mapping)?,
        };
        let floor = variance_floor(&global_statistics(&corrected, &inside_mask(&priors))?);

        let degenerate = vec![false; mapping.group_count()];
        let e = self.run_e_step(&priors, &corrected, &mixture, &degenerate)?;
        log::debug!("初始化完成, 初始对数似然 {:.6}", e.log_likelihood);

        self.model = Some(Model {
            mixture,
            bias,
            corrected,
            posteriors: e.posteriors,
            log_likelihood: e.log_likelihood,
            variance_floor: floor,
            degenerate,
            iterations: 0,
        });
        self.seed_mixture = None;
        self.seed_bias = None;
        self.state = SegmenterState::Initialized;
        Ok(())
    }

    /// 按当前设置选择标准 E 步或部分容积 E 步.
    fn run_e_step(
        &self,
        priors: &ProbabilityVolumes,
        images: &[ChannelImage],
        mixture: &MixtureParameters,
        excluded: &[bool],
    ) -> SegResult<EStep> {
        let mapping = self.sampler.mapping()?;
        if self.pv.is_active() {
            return self.pv.e_step(images, mixture, mapping, excluded);
        }
        let e = if mapping.has_shared_groups() {
            let eff = effective_priors(priors, mapping, mixture.relative_weights());
            e_step(&eff, images, mixture, mapping, excluded)?
        } else {
            e_step(priors, images, mixture, mapping, excluded)?
        };
        Ok(e)
    }

    // ----- 分割 -----

    /// 执行 EM 迭代直到收敛或达到迭代上限.
    ///
    /// 每次迭代依次为: 混合模型参数更新 (可选地重估相对权重), 偏置场更新
    /// (阶数大于 0 时), E 步. 对数似然的相对变化量低于门限即视为收敛.
    /// 迭代在模型副本上进行, 出错时已提交的模型保持不变.
    pub fn segment(&mut self) -> SegResult<SegmentReport> {
        self.ensure_initialized()?;
        let shape = self.shape()?;
        let priors = self.sampler.priors(shape)?;
        if self.pv.is_active() {
            // 固定参数分割失败时缓存可能停留在别的形状上.
            self.pv.prepare(self.sampler.mesh()?, self.sampler.mapping()?, shape);
        }
        let basis = self.basis_cache.get_or_build(shape, self.config.bias_field_order);
        let Some(mut model) = self.model.clone() else {
            return Err(ConfigError::MissingImages.into());
        };

        let previous = self.state;
        self.state = SegmenterState::Iterating;
        match self.iterate(&mut model, &priors, &basis) {
            Ok(report) => {
                self.state = if report.converged {
                    SegmenterState::Converged
                } else {
                    SegmenterState::MaxIterationsReached
                };
                self.model = Some(model);
                Ok(report)
            }
            Err(e) => {
                log::warn!("分割中止: {e}");
                self.state = previous;
                Err(e)
            }
        }
    }

    fn iterate(
        &self,
        model: &mut Model,
        priors: &ProbabilityVolumes,
        basis: &BiasBasis,
    ) -> SegResult<SegmentReport> {
        let mapping = self.sampler.mapping()?;
        let max = self.config.effective_max_iterations();
        let stop = self.config.stop_criterion;

        // 空类别标记只在一次调用内有效. 上一次调用遗留的空类别重新参与计算.
        let mut excluded = vec![false; mapping.group_count()];
        if model.degenerate.iter().any(|&d| d) {
            let e = self.run_e_step(priors, &model.corrected, &model.mixture, &excluded)?;
            model.posteriors = e.posteriors;
            model.log_likelihood = e.log_likelihood;
        }

        let mut ll = model.log_likelihood;
        let mut history = Vec::with_capacity(max);
        let mut converged = false;
        for it in 1..=max {
            let group_post = mapping.group_volumes(&model.posteriors);
            let est = estimate_mixture(&group_post, &model.corrected, model.mixture.groups(), &model.variance_floor)?;
            for (g, (&d, ex)) in est.degenerate.iter().zip(excluded.iter_mut()).enumerate() {
                if d && !*ex {
                    log::warn!("第 {g} 组在第 {it} 次迭代中成为空类别, 本次分割中不再参与计算");
                    *ex = true;
                }
            }
            model.mixture.set_groups(est.groups);
            if self.config.reestimate_shared_class_weights && mapping.has_shared_groups() {
                let w = reestimate_relative_weights(&model.posteriors, mapping, model.mixture.relative_weights());
                model.mixture.set_relative_weights(w);
            }

            if basis.term_count() > 0 {
                let coeffs = estimate_bias(basis, &self.images, &group_post, model.mixture.groups(), &excluded)?;
                model.bias = BiasFieldModel::new(basis, coeffs)?;
                model.corrected = model.bias.apply(basis, &self.images)?;
            }

            let e = self.run_e_step(priors, &model.corrected, &model.mixture, &excluded)?;
            let change = (e.log_likelihood - ll).abs() / e.log_likelihood.abs().max(f64::MIN_POSITIVE);
            log::debug!(
                "第 {it} 次迭代: 对数似然 {:.6}, 相对变化 {change:.3e}, 有效体素 {}",
                e.log_likelihood,
                e.valid_voxels
            );
            ll = e.log_likelihood;
            history.push(ll);
            model.posteriors = e.posteriors;
            model.log_likelihood = ll;
            if change < stop {
                converged = true;
                break;
            }
        }

        model.degenerate = excluded;
        model.iterations = history.len();
        if converged {
            log::info!("EM 在第 {} 次迭代收敛, 对数似然 {ll:.6}", history.len());
        } else {
            log::info!("EM 达到迭代上限 {max}, 对数似然 {ll:.6}");
        }
        Ok(SegmentReport {
            iterations: history.len(),
            log_likelihood: ll,
            converged,
            history,
        })
    }

    /// 固定参数分割: 替换输入图像, 以当前 (或预先指定的) 混合模型参数做一次 E 步.
    ///
    /// 不估计偏置场 (新图像的偏置场恒为 0), 不更新混合模型参数.
    /// 出错时不修改任何状态.
    pub fn segment_with_current_parameters<I>(
        &mut self,
        images: impl IntoIterator<Item = I>,
    ) -> SegResult<SegmentReport>
    where
        I: Into<Arc<ChannelImage>>,
    {
        let images: Vec<Arc<ChannelImage>> = images.into_iter().map(Into::into).collect();
        let shape = check_geometry(&images)?;
        let mixture = match (&self.model, &self.seed_mixture) {
            (Some(m), _) => m.mixture.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => return Err(ConfigError::MissingMixtureParameters.into()),
        };
        let priors = self.sampler.priors(shape)?;
        let mapping = self.sampler.mapping()?;
        mixture.check_compatible(mapping, images.len())?;
        if self.pv.is_active() {
            self.pv.prepare(self.sampler.mesh()?, mapping, shape);
        }

        let basis = self.basis_cache.get_or_build(shape, self.config.bias_field_order);
        let bias = BiasFieldModel::zeros(&basis, images.len());
        let corrected = bias.apply(&basis, &images)?;
        let floor = variance_floor(&global_statistics(&corrected, &inside_mask(&priors))?);
        let degenerate = vec![false; mapping.group_count()];
        let e = self.run_e_step(&priors, &corrected, &mixture, &degenerate)?;
        log::debug!("固定参数分割, 对数似然 {:.6}", e.log_likelihood);

        self.images = images;
        self.model = Some(Model {
            mixture,
            bias,
            corrected,
            posteriors: e.posteriors,
            log_likelihood: e.log_likelihood,
            variance_floor: floor,
            degenerate,
            iterations: 0,
        });
        self.seed_mixture = None;
        self.seed_bias = None;
        self.state = SegmenterState::Initialized;
        Ok(SegmentReport {
            iterations: 0,
            log_likelihood: e.log_likelihood,
            converged: true,
            history: vec![e.log_likelihood],
        })
    }

    // ----- 结果 -----

    fn model(&mut self) -> SegResult<&Model> {
        self.ensure_initialized()?;
        self.model
            .as_ref()
            .ok_or_else(|| ConfigError::MissingImages.into())
    }

    /// 当前状态.
    #[inline]
    pub fn state(&self) -> SegmenterState {
        self.state
    }

    /// 类别映射.
    pub fn class_mapping(&self) -> Result<&ClassMapping, ConfigError> {
        self.sampler.mapping()
    }

    /// 逐类别后验.
    pub fn posteriors(&mut self) -> SegResult<&ProbabilityVolumes> {
        Ok(&self.model()?.posteriors)
    }

    /// 按图谱 alpha 的比例把类别后验拆回网格类别.
    ///
    /// 某体素上某类别的网格类别先验全为 0 时, 该类别的后验在其网格类别间均分.
    pub fn native_posteriors(&mut self) -> SegResult<ProbabilityVolumes> {
        self.ensure_initialized()?;
        let shape = self.shape()?;
        let mesh = self.sampler.mesh()?;
        let mapping = self.sampler.mapping()?;
        let model = self.model.as_ref().ok_or(ConfigError::MissingImages)?;
        let native = rasterize(mesh, &ClassMapping::identity(mesh.class_count()), shape);
        let members: Vec<Vec<usize>> = (0..mapping.class_count()).map(|c| mapping.mesh_classes_of(c)).collect();

        let (nx, ny, nz) = shape;
        let post = model.posteriors.data();
        let prior = native.data();
        let out = Array4::from_shape_fn((mapping.mesh_class_count(), nx, ny, nz), |(m, x, y, z)| {
            let c = mapping.class_of_mesh_class(m);
            let p = post[[c, x, y, z]];
            if p == 0.0 {
                return 0.0;
            }
            let total: f64 = members[c].iter().map(|&k| prior[[k, x, y, z]]).sum();
            if total > 0.0 {
                p * prior[[m, x, y, z]] / total
            } else {
                p / members[c].len() as f64
            }
        });
        Ok(ProbabilityVolumes::from_array(out))
    }

    /// 图谱类别先验 (体素分辨率, 未按相对权重重分配).
    pub fn priors(&mut self) -> SegResult<Arc<ProbabilityVolumes>> {
        let shape = self.shape()?;
        Ok(self.sampler.priors(shape)?)
    }

    /// 偏置校正后的图像.
    pub fn bias_corrected_images(&mut self) -> SegResult<&[ChannelImage]> {
        Ok(&self.model()?.corrected)
    }

    /// 每个通道的偏置场. 满足 `image - field == corrected`.
    pub fn bias_fields(&mut self) -> SegResult<Vec<Array3<f64>>> {
        self.ensure_initialized()?;
        let shape = self.shape()?;
        let basis = self.basis_cache.get_or_build(shape, self.config.bias_field_order);
        Ok(self.model()?.bias.fields(&basis)?)
    }

    /// 每个通道的偏置场系数.
    pub fn bias_coefficients(&mut self) -> SegResult<&[Vec<f64>]> {
        Ok(self.model()?.bias.coefficients())
    }

    /// 混合模型参数.
    pub fn mixture_parameters(&mut self) -> SegResult<&MixtureParameters> {
        Ok(&self.model()?.mixture)
    }

    /// 类别的组内相对权重.
    pub fn relative_weights(&mut self) -> SegResult<&[f64]> {
        Ok(self.model()?.mixture.relative_weights())
    }

    /// 当前模型的对数似然.
    pub fn log_likelihood(&mut self) -> SegResult<f64> {
        Ok(self.model()?.log_likelihood)
    }

    /// 上一次 `segment()` 执行的迭代次数. 尚未分割时为 0.
    pub fn iteration_count(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.iterations)
    }

    /// 最大后验标签图. 网格外体素为 [`crate::consts::BACKGROUND_LABEL`].
    pub fn label_volume(&mut self) -> SegResult<Array3<u16>> {
        Ok(self.model()?.posteriors.argmax_labels())
    }

    /// 上一次 `segment()` 中成为空类别的高斯参数组.
    pub fn degenerate_groups(&self) -> Vec<usize> {
        self.model.as_ref().map_or_else(Vec::new, |m| {
            m.degenerate
                .iter()
                .enumerate()
                .filter_map(|(g, &d)| d.then_some(g))
                .collect()
        })
    }

    // ----- 超分辨率结果 -----

    fn prepare_super_resolution(&mut self) -> SegResult<()> {
        self.ensure_initialized()?;
        let shape = self.shape()?;
        self.pv
            .prepare(self.sampler.mesh()?, self.sampler.mapping()?, shape);
        Ok(())
    }

    /// 亚体素先验.
    pub fn super_resolution_priors(&mut self) -> SegResult<Arc<ProbabilityVolumes>> {
        self.prepare_super_resolution()?;
        let priors = self.pv.super_priors().ok_or(ConfigError::MissingMesh)?;
        Ok(Arc::clone(priors))
    }

    /// 超分辨率网格.
    pub fn super_resolution_mesh(&mut self) -> SegResult<Arc<AtlasMesh>> {
        self.prepare_super_resolution()?;
        let mesh = self.pv.super_mesh().ok_or(ConfigError::MissingMesh)?;
        Ok(Arc::clone(mesh))
    }

    /// 复制到亚体素网格的偏置校正图像.
    pub fn super_resolution_images(&mut self) -> SegResult<Vec<ChannelImage>> {
        self.prepare_super_resolution()?;
        let model = self.model.as_ref().ok_or(ConfigError::MissingImages)?;
        Ok(self.pv.super_images(&model.corrected))
    }

    /// 体素内类别 `a`, `b` 混合时 `a` 所占比例的先验期望, 见
    /// [`PartialVolumeEngine::mixing_probability`].
    pub fn mixing_probability(&mut self, a: usize, b: usize) -> SegResult<Array3<f64>> {
        self.prepare_super_resolution()?;
        Ok(self.pv.mixing_probability(a, b)?)
    }

    /// 亚体素后验与似然.
    pub fn super_resolution(&mut self) -> SegResult<SuperResolution> {
        self.prepare_super_resolution()?;
        let mapping = self.sampler.mapping()?;
        let model = self.model.as_ref().ok_or(ConfigError::MissingImages)?;
        self.pv
            .super_resolution(&model.corrected, &model.mixture, mapping, &model.degenerate)
    }

    /// 亚体素后验 `P(s = c | y)`.
    pub fn super_resolution_posteriors(&mut self) -> SegResult<ProbabilityVolumes> {
        Ok(self.super_resolution()?.posteriors)
    }

    /// 亚体素似然 `P(y | s = c)`.
    pub fn super_resolution_likelihoods(&mut self) -> SegResult<ProbabilityVolumes> {
        Ok(self.super_resolution()?.likelihoods)
    }
}
