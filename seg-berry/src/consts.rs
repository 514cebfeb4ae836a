//! 通用常量.

/// 默认最大 EM 迭代次数.
pub const DEFAULT_MAX_ITERATIONS: usize = 30;

/// 任一部分容积上采样因子不为 1 时的默认最大 EM 迭代次数.
///
/// 部分容积模型收敛得更慢.
pub const DEFAULT_PARTIAL_VOLUME_MAX_ITERATIONS: usize = 100;

/// 默认收敛门限 (对数似然的相对变化量).
pub const DEFAULT_STOP_CRITERION: f64 = 1e-5;

/// 默认偏置场多项式阶数. 0 表示关闭偏置场校正.
pub const DEFAULT_BIAS_FIELD_ORDER: u32 = 0;

/// 允许的最大偏置场多项式阶数.
pub const MAX_BIAS_FIELD_ORDER: u32 = 6;

/// 类别 (高斯参数组) 累计后验质量低于该值时视为空类别.
pub const MIN_CLASS_MASS: f64 = 1e-8;

/// 方差下限, 相对于该通道的全局方差.
pub const COVARIANCE_FLOOR: f64 = 1e-6;

/// 判断点是否位于四面体内部时, 重心坐标允许的负容差.
pub const BARYCENTRIC_TOLERANCE: f64 = 1e-9;

/// 体积小于该值的四面体被视为退化, 光栅化时跳过.
pub const DEGENERATE_VOLUME: f64 = 1e-12;

/// 概率之和的检查容差.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// MAP 标签图中, 网格外 (没有任何先验) 体素的标签值.
pub const BACKGROUND_LABEL: u16 = u16::MAX;
