//! 运行时错误.

use crate::Idx3d;
use thiserror::Error;

/// 配置错误. 在修改任何状态之前即返回, 调用者修正配置后可以重试.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// 尚未设置图谱网格.
    #[error("尚未设置图谱网格")]
    MissingMesh,

    /// 尚未设置输入图像.
    #[error("尚未设置输入图像")]
    MissingImages,

    /// 固定参数分割时没有任何可用的混合模型参数.
    #[error("没有可用的混合模型参数")]
    MissingMixtureParameters,

    /// 通道数不一致.
    #[error("通道数不一致: 期望 {expected}, 实际 {found}")]
    ChannelCountMismatch {
        /// 期望的通道数.
        expected: usize,
        /// 实际的通道数.
        found: usize,
    },

    /// 通道之间 (或与已有模型之间) 体素网格形状不一致.
    #[error("体素网格形状不一致: 期望 {expected:?}, 实际 {found:?}")]
    GeometryMismatch {
        /// 期望的形状.
        expected: Idx3d,
        /// 实际的形状.
        found: Idx3d,
    },

    /// 类别查找表非法.
    #[error("类别查找表非法: {0}")]
    InvalidLookupTable(String),

    /// 类别 (或高斯参数组) 个数不一致.
    #[error("类别数不一致: 期望 {expected}, 实际 {found}")]
    ClassCountMismatch {
        /// 期望的个数.
        expected: usize,
        /// 实际的个数.
        found: usize,
    },

    /// 偏置场系数个数与多项式阶数不匹配.
    #[error("偏置场系数与阶数不匹配: 阶数 {order} 需要 {expected} 个系数, 实际 {found}")]
    BiasOrderMismatch {
        /// 多项式阶数.
        order: u32,
        /// 该阶数 (及网格) 对应的系数个数.
        expected: usize,
        /// 实际提供的系数个数.
        found: usize,
    },

    /// 网格非法.
    #[error("网格非法: {0}")]
    InvalidMesh(String),

    /// 其它非法参数.
    #[error("非法参数: {0}")]
    InvalidParameter(String),
}

/// 数值错误.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NumericalError {
    /// 某组高斯参数的协方差矩阵奇异、非正定或含非有限值.
    #[error("第 {group} 组高斯参数的协方差矩阵奇异")]
    SingularCovariance {
        /// 高斯参数组索引.
        group: usize,
    },

    /// 计算过程中出现 NaN / inf.
    #[error("计算{what}时出现非有限数值")]
    NonFinite {
        /// 出错的计算环节.
        what: &'static str,
    },

    /// 偏置场正规方程无解.
    #[error("偏置场正规方程奇异")]
    SingularBiasSystem,

    /// 没有任何体素参与估计 (例如网格完全落在图像之外).
    #[error("没有任何有效体素")]
    NoValidVoxels,
}

/// 分割错误.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SegError {
    /// 配置错误.
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 数值错误. 当前 `segment()` 调用被中止, 模型状态保持调用前的样子.
    #[error("数值错误: {0}")]
    Numerical(#[from] NumericalError),
}

impl SegError {
    /// 是否为配置错误.
    #[inline]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// 是否为数值错误.
    #[inline]
    pub fn is_numerical(&self) -> bool {
        matches!(self, Self::Numerical(_))
    }
}

/// 分割运行时错误.
pub type SegResult<T> = Result<T, SegError>;
