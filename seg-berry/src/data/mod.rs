use std::ops::Index;

use ndarray::{s, Array3, Array4, ArrayView1, ArrayView3, ArrayViewMut3, Axis};
use ordered_float::OrderedFloat;

use crate::consts::BACKGROUND_LABEL;
use crate::{ConfigError, Idx3d};

/// 单个采集通道的 3D 标量图像, 强度以 `f64` 保存, 索引为 `(x, y, z)`.
///
/// 该图像是只读的. 分割器通过 `Arc` 引用它, 在整个 `segment()` 期间不会复制.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelImage {
    data: Array3<f64>,
}

impl Index<Idx3d> for ChannelImage {
    type Output = f64;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl AsRef<ChannelImage> for ChannelImage {
    #[inline]
    fn as_ref(&self) -> &ChannelImage {
        self
    }
}

impl From<Array3<f64>> for ChannelImage {
    #[inline]
    fn from(data: Array3<f64>) -> Self {
        Self::new(data)
    }
}

impl ChannelImage {
    /// 直接包装一个体数据.
    #[inline]
    pub fn new(data: Array3<f64>) -> Self {
        Self { data }
    }

    /// 按位置生成体数据.
    pub fn from_fn<F>(shape: Idx3d, f: F) -> Self
    where
        F: FnMut(Idx3d) -> f64,
    {
        Self::new(Array3::from_shape_fn(shape, f))
    }

    /// 获取数据形状大小.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.data.dim()
    }

    /// 获取数据体素个数.
    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 获取底层体数据.
    #[inline]
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// 获取底层体数据的不可变视图.
    #[inline]
    pub fn view(&self) -> ArrayView3<'_, f64> {
        self.data.view()
    }

    /// 取出底层体数据.
    #[inline]
    pub fn into_inner(self) -> Array3<f64> {
        self.data
    }

    /// 是否所有体素值都是有限数.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// 检查一组通道图像: 非空, 形状一致, 数值有限. 成功时返回公共形状.
pub fn check_geometry<T: AsRef<ChannelImage>>(images: &[T]) -> Result<Idx3d, ConfigError> {
    let first = images.first().ok_or(ConfigError::MissingImages)?.as_ref();
    let expected = first.shape();
    if expected.0 == 0 || expected.1 == 0 || expected.2 == 0 {
        return Err(ConfigError::InvalidParameter(format!(
            "图像形状 {expected:?} 为空"
        )));
    }
    for (ch, img) in images.iter().enumerate() {
        let img = img.as_ref();
        if img.shape() != expected {
            return Err(ConfigError::GeometryMismatch {
                expected,
                found: img.shape(),
            });
        }
        if !img.is_finite() {
            return Err(ConfigError::InvalidParameter(format!(
                "第 {ch} 个通道含有非有限值"
            )));
        }
    }
    Ok(expected)
}

/// 逐类别的概率体数据 (先验或后验), 底层形状为 `(class, x, y, z)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityVolumes {
    data: Array4<f64>,
}

impl ProbabilityVolumes {
    /// 全零概率体.
    #[inline]
    pub fn zeros(class_count: usize, (x, y, z): Idx3d) -> Self {
        Self {
            data: Array4::zeros((class_count, x, y, z)),
        }
    }

    /// 直接包装 `(class, x, y, z)` 形状的数组.
    #[inline]
    pub fn from_array(data: Array4<f64>) -> Self {
        Self { data }
    }

    /// 类别个数.
    #[inline]
    pub fn class_count(&self) -> usize {
        self.data.len_of(Axis(0))
    }

    /// 体素网格形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        let (_, x, y, z) = self.data.dim();
        (x, y, z)
    }

    /// 第 `c` 个类别的概率体. 越界时 panic.
    #[inline]
    pub fn class(&self, c: usize) -> ArrayView3<'_, f64> {
        self.data.index_axis(Axis(0), c)
    }

    /// 某体素上所有类别的概率向量. 越界时 panic.
    #[inline]
    pub fn voxel(&self, (x, y, z): Idx3d) -> ArrayView1<'_, f64> {
        self.data.slice(s![.., x, y, z])
    }

    /// 某体素上所有类别的概率之和.
    #[inline]
    pub fn voxel_sum(&self, idx: Idx3d) -> f64 {
        self.voxel(idx).sum()
    }

    /// 第 `c` 个类别在整个网格上的累计概率质量.
    #[inline]
    pub fn mass(&self, c: usize) -> f64 {
        self.class(c).sum()
    }

    /// 最大后验 (MAP) 标签图. 所有类别概率均为 0 的体素标记为
    /// [`BACKGROUND_LABEL`].
    pub fn argmax_labels(&self) -> Array3<u16> {
        Array3::from_shape_fn(self.shape(), |idx| {
            let v = self.voxel(idx);
            if v.sum() <= 0.0 {
                return BACKGROUND_LABEL;
            }
            v.iter()
                .enumerate()
                .max_by_key(|(_, p)| OrderedFloat(**p))
                .map_or(BACKGROUND_LABEL, |(c, _)| c as u16)
        })
    }

    /// 底层数组.
    #[inline]
    pub fn data(&self) -> &Array4<f64> {
        &self.data
    }

    #[inline]
    pub(crate) fn data_mut(&mut self) -> &mut Array4<f64> {
        &mut self.data
    }

    /// 取出底层数组.
    #[inline]
    pub fn into_inner(self) -> Array4<f64> {
        self.data
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
    }
}

/// 沿 x 方向把 `(class, x, y, z)` 数组切成 `(class, y, z)` 可变 slab, 对每个 slab 调用 `op`.
///
/// 结果按 x 升序收集, 与线程调度无关. 打开 `rayon` feature 时并行执行.
pub(crate) fn map_slabs_mut<R, F>(data: &mut Array4<f64>, op: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize, ArrayViewMut3<f64>) -> R + Sync + Send,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            data.axis_iter_mut(Axis(1))
                .into_par_iter()
                .enumerate()
                .map(|(x, slab)| op(x, slab))
                .collect()
        } else {
            data.axis_iter_mut(Axis(1))
                .enumerate()
                .map(|(x, slab)| op(x, slab))
                .collect()
        }
    }
}

/// 对 `0..n` 中每个索引调用 `op`, 结果按索引升序收集.
///
/// 打开 `rayon` feature 时并行执行.
pub(crate) fn map_range<R, F>(n: usize, op: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Sync + Send,
{
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            (0..n).into_par_iter().map(op).collect()
        } else {
            (0..n).map(op).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_check_geometry() {
        let a = ChannelImage::from_fn((2, 3, 4), |_| 1.0);
        let b = ChannelImage::from_fn((2, 3, 4), |(x, _, _)| x as f64);
        assert_eq!(check_geometry(&[a.clone(), b]), Ok((2, 3, 4)));

        let c = ChannelImage::from_fn((2, 3, 5), |_| 1.0);
        assert_eq!(
            check_geometry(&[a.clone(), c]),
            Err(ConfigError::GeometryMismatch {
                expected: (2, 3, 4),
                found: (2, 3, 5)
            })
        );

        let empty: [ChannelImage; 0] = [];
        assert_eq!(check_geometry(&empty), Err(ConfigError::MissingImages));

        let nan = ChannelImage::from_fn((2, 3, 4), |_| f64::NAN);
        assert!(check_geometry(&[a, nan]).is_err());
    }

    #[test]
    fn test_argmax_labels() {
        let mut p = ProbabilityVolumes::zeros(3, (2, 1, 1));
        p.data_mut()[[2, 0, 0, 0]] = 0.7;
        p.data_mut()[[0, 0, 0, 0]] = 0.3;
        let labels = p.argmax_labels();
        assert_eq!(labels[(0, 0, 0)], 2);
        assert_eq!(labels[(1, 0, 0)], BACKGROUND_LABEL);
        assert!((p.voxel_sum((0, 0, 0)) - 1.0).abs() < 1e-12);
        assert!((p.mass(0) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_map_slabs_in_order() {
        let mut data = Array4::<f64>::zeros((2, 5, 2, 2));
        let xs = map_slabs_mut(&mut data, |x, mut slab| {
            slab.fill(x as f64);
            x
        });
        assert_eq!(xs, vec![0, 1, 2, 3, 4]);
        assert_eq!(data[[1, 3, 1, 0]], 3.0);
        assert_eq!(map_range(4, |i| i * i), vec![0, 1, 4, 9]);
    }
}
