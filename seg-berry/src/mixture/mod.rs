//! 多通道高斯混合模型参数.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2};

use crate::classes::ClassMapping;
use crate::ConfigError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

mod density;
mod estimate;
mod init;

pub use density::GaussianDensity;
pub use estimate::{estimate_mixture, reestimate_relative_weights, Estimate};
pub use init::{global_statistics, initial_parameters, variance_floor};

/// 一组高斯参数: 均值向量 (长度为通道数) 与协方差矩阵 (通道数 × 通道数).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GaussianParameters {
    /// 均值向量.
    pub mean: Array1<f64>,

    /// 协方差矩阵. 对称半正定.
    pub covariance: Array2<f64>,
}

impl GaussianParameters {
    /// 构建并检查维度.
    pub fn new(mean: Array1<f64>, covariance: Array2<f64>) -> Result<Self, ConfigError> {
        let c = mean.len();
        if c == 0 || covariance.dim() != (c, c) {
            return Err(ConfigError::InvalidParameter(format!(
                "均值长度 {c} 与协方差形状 {:?} 不匹配",
                covariance.dim()
            )));
        }
        Ok(Self { mean, covariance })
    }

    /// 单通道参数.
    pub fn scalar(mean: f64, variance: f64) -> Self {
        Self {
            mean: Array1::from_elem(1, mean),
            covariance: Array2::from_elem((1, 1), variance),
        }
    }

    /// 通道数.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.mean.len()
    }

    /// 与 `other` 按比例 `f : (1 - f)` 线性混合得到的高斯参数
    /// (均值与协方差均线性混合).
    pub fn mixed(&self, other: &Self, f: f64) -> Self {
        Self {
            mean: &self.mean * f + &other.mean * (1.0 - f),
            covariance: &self.covariance * f + &other.covariance * (1.0 - f),
        }
    }
}

/// 混合模型参数: 每个高斯参数组一组均值/协方差, 每个类别一个组内相对权重.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MixtureParameters {
    groups: Vec<GaussianParameters>,

    /// 类别的组内相对权重. 同组权重之和为 1.
    relative_weights: Vec<f64>,
}

impl MixtureParameters {
    /// 构建参数. 所有组的通道数必须一致; 相对权重必须非负且同组和为正.
    /// 权重在组内被重新归一化.
    pub fn new(
        groups: Vec<GaussianParameters>,
        relative_weights: Vec<f64>,
        mapping: &ClassMapping,
    ) -> Result<Self, ConfigError> {
        if groups.len() != mapping.group_count() {
            return Err(ConfigError::ClassCountMismatch {
                expected: mapping.group_count(),
                found: groups.len(),
            });
        }
        if relative_weights.len() != mapping.class_count() {
            return Err(ConfigError::ClassCountMismatch {
                expected: mapping.class_count(),
                found: relative_weights.len(),
            });
        }
        let channels = groups.first().map_or(0, GaussianParameters::channel_count);
        if let Some(g) = groups.iter().find(|g| g.channel_count() != channels) {
            return Err(ConfigError::ChannelCountMismatch {
                expected: channels,
                found: g.channel_count(),
            });
        }
        if relative_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::InvalidParameter("相对权重必须为非负有限值".into()));
        }

        let mut relative_weights = relative_weights;
        for g in 0..mapping.group_count() {
            let members = mapping.classes_in_group(g);
            let total: f64 = members.iter().map(|&c| relative_weights[c]).sum();
            if total <= 0.0 {
                return Err(ConfigError::InvalidParameter(format!(
                    "第 {g} 组的相对权重之和为 0"
                )));
            }
            for &c in members {
                relative_weights[c] /= total;
            }
        }
        Ok(Self {
            groups,
            relative_weights,
        })
    }

    /// 相对权重取组内均匀值.
    pub fn with_uniform_weights(
        groups: Vec<GaussianParameters>,
        mapping: &ClassMapping,
    ) -> Result<Self, ConfigError> {
        Self::new(groups, mapping.uniform_relative_weights(), mapping)
    }

    /// 所有高斯参数组.
    #[inline]
    pub fn groups(&self) -> &[GaussianParameters] {
        &self.groups
    }

    /// 第 `g` 组高斯参数.
    #[inline]
    pub fn group(&self, g: usize) -> &GaussianParameters {
        &self.groups[g]
    }

    /// 高斯参数组数.
    #[inline]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// 通道数.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.groups.first().map_or(0, GaussianParameters::channel_count)
    }

    /// 类别的组内相对权重.
    #[inline]
    pub fn relative_weights(&self) -> &[f64] {
        &self.relative_weights
    }

    pub(crate) fn set_groups(&mut self, groups: Vec<GaussianParameters>) {
        debug_assert_eq!(groups.len(), self.groups.len());
        self.groups = groups;
    }

    pub(crate) fn set_relative_weights(&mut self, weights: Vec<f64>) {
        debug_assert_eq!(weights.len(), self.relative_weights.len());
        self.relative_weights = weights;
    }

    /// 检查参数与映射、通道数是否相容.
    pub fn check_compatible(&self, mapping: &ClassMapping, channels: usize) -> Result<(), ConfigError> {
        if self.groups.len() != mapping.group_count() {
            return Err(ConfigError::ClassCountMismatch {
                expected: mapping.group_count(),
                found: self.groups.len(),
            });
        }
        if self.relative_weights.len() != mapping.class_count() {
            return Err(ConfigError::ClassCountMismatch {
                expected: mapping.class_count(),
                found: self.relative_weights.len(),
            });
        }
        if self.channel_count() != channels {
            return Err(ConfigError::ChannelCountMismatch {
                expected: channels,
                found: self.channel_count(),
            });
        }
        Ok(())
    }
}

/// 矩阵是否对称 (容差 `eps`) 且半正定 (所有特征值 `>= -eps`).
pub fn is_symmetric_psd(m: &Array2<f64>, eps: f64) -> bool {
    let (r, c) = m.dim();
    if r != c {
        return false;
    }
    for i in 0..r {
        for j in 0..i {
            if (m[(i, j)] - m[(j, i)]).abs() > eps {
                return false;
            }
        }
    }
    let dm = DMatrix::from_fn(r, c, |i, j| m[(i, j)]);
    SymmetricEigen::new(dm).eigenvalues.iter().all(|&l| l >= -eps)
}
