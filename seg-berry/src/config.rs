//! 分割器配置.

use crate::consts::{
    DEFAULT_BIAS_FIELD_ORDER, DEFAULT_MAX_ITERATIONS, DEFAULT_PARTIAL_VOLUME_MAX_ITERATIONS,
    DEFAULT_STOP_CRITERION, MAX_BIAS_FIELD_ORDER,
};
use crate::partial_volume::SubvoxelGrid;
use crate::ConfigError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 混合模型参数的初始化策略.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Initialization {
    /// 先验加权估计; 若各组均值无法区分 (例如平坦图谱) 则改用强度分位数.
    #[default]
    Auto,

    /// 以图谱先验为权重的矩估计.
    PriorWeighted,

    /// 按第一个通道的强度分位数划分体素.
    IntensityQuantiles,
}

/// EM 分割的所有可调参数.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SegmenterConfig {
    /// 最大 EM 迭代次数. `None` 时取默认值: 启用部分容积时为
    /// [`DEFAULT_PARTIAL_VOLUME_MAX_ITERATIONS`], 否则为 [`DEFAULT_MAX_ITERATIONS`].
    pub max_iterations: Option<usize>,

    /// 收敛门限: 对数似然相对变化量低于该值即停止.
    pub stop_criterion: f64,

    /// 偏置场多项式阶数, 0 表示关闭.
    pub bias_field_order: u32,

    /// 部分容积上采样因子.
    pub partial_volume_factors: [usize; 3],

    /// 是否重估共享参数的子类别的组内相对权重.
    pub reestimate_shared_class_weights: bool,

    /// 初始化策略.
    pub initialization: Initialization,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            stop_criterion: DEFAULT_STOP_CRITERION,
            bias_field_order: DEFAULT_BIAS_FIELD_ORDER,
            partial_volume_factors: [1; 3],
            reestimate_shared_class_weights: false,
            initialization: Initialization::Auto,
        }
    }
}

impl SegmenterConfig {
    /// 检查所有参数.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == Some(0) {
            return Err(ConfigError::InvalidParameter("最大迭代次数必须为正".into()));
        }
        if !(self.stop_criterion.is_finite() && self.stop_criterion >= 0.0) {
            return Err(ConfigError::InvalidParameter(format!(
                "收敛门限 {} 必须为非负有限值",
                self.stop_criterion
            )));
        }
        if self.bias_field_order > MAX_BIAS_FIELD_ORDER {
            return Err(ConfigError::InvalidParameter(format!(
                "偏置场阶数 {} 超过上限 {MAX_BIAS_FIELD_ORDER}",
                self.bias_field_order
            )));
        }
        self.subvoxel_grid()?;
        Ok(())
    }

    /// 部分容积的亚体素划分.
    pub fn subvoxel_grid(&self) -> Result<SubvoxelGrid, ConfigError> {
        SubvoxelGrid::new(self.partial_volume_factors)
    }

    /// 实际使用的最大迭代次数.
    pub fn effective_max_iterations(&self) -> usize {
        self.max_iterations.unwrap_or_else(|| {
            if self.partial_volume_factors.iter().any(|&f| f != 1) {
                DEFAULT_PARTIAL_VOLUME_MAX_ITERATIONS
            } else {
                DEFAULT_MAX_ITERATIONS
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = SegmenterConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.effective_max_iterations(), 30);
        assert_eq!(c.initialization, Initialization::Auto);

        let pv = SegmenterConfig {
            partial_volume_factors: [2, 2, 1],
            ..Default::default()
        };
        assert_eq!(pv.effective_max_iterations(), 100);
        let capped = SegmenterConfig {
            max_iterations: Some(7),
            ..pv
        };
        assert_eq!(capped.effective_max_iterations(), 7);
    }

    #[test]
    fn test_invalid() {
        let bad = [
            SegmenterConfig {
                max_iterations: Some(0),
                ..Default::default()
            },
            SegmenterConfig {
                stop_criterion: f64::NAN,
                ..Default::default()
            },
            SegmenterConfig {
                bias_field_order: 7,
                ..Default::default()
            },
            SegmenterConfig {
                partial_volume_factors: [1, 0, 1],
                ..Default::default()
            },
        ];
        for c in bad {
            assert!(matches!(c.validate(), Err(ConfigError::InvalidParameter(_))));
        }
    }
}
