use itertools::iproduct;
use ndarray::Array3;

use crate::{ConfigError, Idx3d};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 亚体素划分: 每个体素沿三个轴分别被切成 `factors` 份.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubvoxelGrid {
    factors: [usize; 3],
}

impl Default for SubvoxelGrid {
    fn default() -> Self {
        Self { factors: [1; 3] }
    }
}

impl SubvoxelGrid {
    /// 检查每个因子至少为 1.
    pub fn new(factors: [usize; 3]) -> Result<Self, ConfigError> {
        if factors.iter().any(|&f| f == 0) {
            return Err(ConfigError::InvalidParameter(format!(
                "部分容积上采样因子 {factors:?} 必须不小于 1"
            )));
        }
        Ok(Self { factors })
    }

    /// 每个轴的上采样因子.
    #[inline]
    pub fn factors(&self) -> [usize; 3] {
        self.factors
    }

    /// 每个体素的亚体素个数 `N`.
    #[inline]
    pub fn count(&self) -> usize {
        self.factors.iter().product()
    }

    /// 是否为恒等划分 (`[1, 1, 1]`).
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.count() == 1
    }

    /// 亚体素网格形状.
    #[inline]
    pub fn super_shape(&self, (x, y, z): Idx3d) -> Idx3d {
        let [fx, fy, fz] = self.factors;
        (x * fx, y * fy, z * fz)
    }

    /// 体素 `idx` 的所有亚体素在亚体素网格中的坐标, 顺序固定.
    pub fn subvoxels(&self, (x, y, z): Idx3d) -> impl Iterator<Item = Idx3d> {
        let [fx, fy, fz] = self.factors;
        iproduct!(0..fx, 0..fy, 0..fz).map(move |(a, b, c)| (x * fx + a, y * fy + b, z * fz + c))
    }

    /// 把体数据复制到亚体素网格 (每个亚体素取所在体素的值).
    pub fn upsample(&self, volume: &Array3<f64>) -> Array3<f64> {
        let [fx, fy, fz] = self.factors;
        Array3::from_shape_fn(self.super_shape(volume.dim()), |(x, y, z)| {
            volume[(x / fx, y / fy, z / fz)]
        })
    }

    /// 把亚体素网格上的数据平均回体素网格.
    pub fn downsample(&self, volume: &Array3<f64>) -> Array3<f64> {
        let [fx, fy, fz] = self.factors;
        let (sx, sy, sz) = volume.dim();
        let n = self.count() as f64;
        Array3::from_shape_fn((sx / fx, sy / fy, sz / fz), |idx| {
            self.subvoxels(idx).map(|s| volume[s]).sum::<f64>() / n
        })
    }
}
