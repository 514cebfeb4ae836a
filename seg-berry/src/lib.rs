#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 以四面体概率图谱网格为空间先验, 对一个或多个已配准的 MRI 通道进行
//! EM (Expectation-Maximization) 组织分割, 同时估计每个通道的多项式偏置场、
//! 每个类别的多通道高斯统计量, 并可选地进行亚体素部分容积建模.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 文件读写 (nifti 等)、网格形变/配准、图谱训练都不在本 crate 的范围内.
//!   调用者以内存中的 [`ChannelImage`] 和 [`AtlasMesh`] 的形式提供输入.
//! 2. 偏置场在 "送进来的强度域" 中是加性的. 若要对乘性偏置建模,
//!   调用者应该先把图像取对数再交给分割器.
//! 3. 配置错误与数值错误统一通过 [`SegError`] 返回, 不会 panic.
//!
//! # 开发计划
//!
//! ### 图谱先验光栅化 ✅
//!
//! 对每个体素 (或亚体素) 中心, 找到包含它的四面体, 以重心坐标插值节点上的
//! alpha 向量, 再按查找表合并为类别先验. 网格外的体素先验全为 0.
//!
//! 实现位于 `seg-berry/src/prior.rs`, 几何部分位于 `seg-berry/src/mesh`.
//!
//! ### 类别查找表 & 共享类别 ✅
//!
//! 网格类别 -> 类别 -> 高斯参数组 两级映射. 共享同一组高斯参数的类别
//! 可以单独重估相对权重.
//!
//! 实现位于 `seg-berry/src/classes.rs`.
//!
//! ### 高斯混合参数估计 ✅
//!
//! 加权最大似然估计均值与协方差; 空类别冻结参数; 零方差通道正则化.
//!
//! 实现位于 `seg-berry/src/mixture`.
//!
//! ### 多项式偏置场 ✅
//!
//! 可分离的离散正交多项式基, 以 (网格形状, 阶数) 为键缓存. 加权最小二乘拟合.
//!
//! 实现位于 `seg-berry/src/bias`.
//!
//! ### E 步 ✅
//!
//! 对数域高斯密度 + log-sum-exp 归一化.
//!
//! 实现位于 `seg-berry/src/posterior.rs`.
//!
//! ### 部分容积模型 ✅
//!
//! 亚体素先验缓存, 纯类别/两类混合配置, 超分辨率后验与似然.
//!
//! 实现位于 `seg-berry/src/partial_volume`.
//!
//! ### 分割驱动 ✅
//!
//! 显式状态机, `segment()` 外层循环, 固定参数分割模式.
//!
//! 实现位于 `seg-berry/src/segmenter.rs`.

/// 三维索引 `(x, y, z)`, 同时也用作体数据形状.
pub type Idx3d = (usize, usize, usize);

/// 体素坐标系下的连续点 `[x, y, z]`. 体素 `(i, j, k)` 的中心位于 `[i, j, k]`.
pub type Point3 = [f64; 3];

pub mod consts;

mod error;

pub use error::{ConfigError, NumericalError, SegError, SegResult};

/// 通道图像与概率体数据.
mod data;

pub use data::{check_geometry, ChannelImage, ProbabilityVolumes};

pub mod mesh;

pub use mesh::AtlasMesh;

pub mod classes;

pub mod prior;

pub mod mixture;

pub mod bias;

pub mod posterior;

pub mod partial_volume;

mod config;

pub use config::{Initialization, SegmenterConfig};

mod segmenter;

pub use segmenter::{EmSegmenter, SegmentReport, SegmenterState};

pub mod prelude;
