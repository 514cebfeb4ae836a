//! 可分离的离散正交多项式基.

use std::sync::Arc;

use itertools::iproduct;
use ndarray::{Array2, Array3};

use crate::{ConfigError, Idx3d};

/// 三维多项式偏置场基.
///
/// 每个轴上把 `1, t, t², …` (`t` 为归一化到 `[-1, 1]` 的坐标) 在网格点上做
/// Gram-Schmidt 正交化, 得到一组离散正交归一的一维多项式. 三维基函数为三个轴上
/// 一维多项式的乘积 `φ_i(x) φ_j(y) φ_k(z)`, 取 `1 <= i + j + k <= order`.
/// 常数项不在基中, 它被类别均值吸收.
///
/// 某个轴只有 `n` 个网格点时, 该轴上只有次数 `< n` 的多项式.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasBasis {
    shape: Idx3d,
    order: u32,
    /// 每个轴一张表, 形状为 `(次数, 网格点)`.
    axes: [Array2<f64>; 3],
    terms: Vec<[usize; 3]>,
}

impl BiasBasis {
    /// 在形状为 `shape` 的网格上构建 `order` 阶基.
    pub fn new(shape: Idx3d, order: u32) -> Self {
        let axes = [
            axis_polynomials(shape.0, order as usize),
            axis_polynomials(shape.1, order as usize),
            axis_polynomials(shape.2, order as usize),
        ];
        let degrees = [axes[0].nrows(), axes[1].nrows(), axes[2].nrows()];
        let order = order as usize;
        let mut terms: Vec<[usize; 3]> = iproduct!(0..degrees[0], 0..degrees[1], 0..degrees[2])
            .map(|(i, j, k)| [i, j, k])
            .filter(|t| (1..=order).contains(&t.iter().sum::<usize>()))
            .collect();
        // 低次项在前.
        terms.sort_by_key(|t| t.iter().sum::<usize>());
        Self {
            shape,
            order: order as u32,
            axes,
            terms,
        }
    }

    /// 网格形状.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.shape
    }

    /// 多项式阶数.
    #[inline]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// 基函数个数 (即每个通道的系数个数).
    #[inline]
    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    /// 每个基函数在三个轴上的次数 `[i, j, k]`.
    #[inline]
    pub fn terms(&self) -> &[[usize; 3]] {
        &self.terms
    }

    /// 第 `t` 个基函数在体素 `(x, y, z)` 处的值.
    #[inline]
    pub fn value(&self, t: usize, (x, y, z): Idx3d) -> f64 {
        let [i, j, k] = self.terms[t];
        self.axes[0][(i, x)] * self.axes[1][(j, y)] * self.axes[2][(k, z)]
    }

    /// 把所有基函数在体素 `idx` 处的值写入 `out`.
    pub fn values_at(&self, idx: Idx3d, out: &mut [f64]) {
        debug_assert_eq!(out.len(), self.term_count());
        for (t, o) in out.iter_mut().enumerate() {
            *o = self.value(t, idx);
        }
    }

    /// 由系数重建偏置场 `Σ_t c_t φ_t`.
    pub fn evaluate(&self, coefficients: &[f64]) -> Result<Array3<f64>, ConfigError> {
        self.check_len(coefficients.len())?;
        Ok(Array3::from_shape_fn(self.shape, |idx| {
            coefficients
                .iter()
                .enumerate()
                .map(|(t, c)| c * self.value(t, idx))
                .sum()
        }))
    }

    /// 把体数据投影到基上 (非加权最小二乘). 基是正交归一的, 投影即内积.
    pub fn project(&self, field: &Array3<f64>) -> Vec<f64> {
        debug_assert_eq!(field.dim(), self.shape);
        (0..self.term_count())
            .map(|t| field.indexed_iter().map(|(idx, v)| v * self.value(t, idx)).sum())
            .collect()
    }

    pub(crate) fn check_len(&self, found: usize) -> Result<(), ConfigError> {
        if found != self.term_count() {
            return Err(ConfigError::BiasOrderMismatch {
                order: self.order,
                expected: self.term_count(),
                found,
            });
        }
        Ok(())
    }
}

/// 长度为 `n` 的轴上次数 `0..=min(order, n - 1)` 的离散正交归一多项式.
fn axis_polynomials(n: usize, order: usize) -> Array2<f64> {
    let degrees = order.min(n.saturating_sub(1)) + 1;
    let coords: Vec<f64> = (0..n)
        .map(|i| {
            if n > 1 {
                -1.0 + 2.0 * i as f64 / (n - 1) as f64
            } else {
                0.0
            }
        })
        .collect();

    let mut out = Array2::zeros((degrees, n));
    for d in 0..degrees {
        let mut v: Vec<f64> = coords.iter().map(|t| t.powi(d as i32)).collect();
        // 修正的 Gram-Schmidt.
        for prev in 0..d {
            let row = out.row(prev);
            let dot: f64 = v.iter().zip(row.iter()).map(|(a, b)| a * b).sum();
            v.iter_mut().zip(row.iter()).for_each(|(a, b)| *a -= dot * b);
        }
        let norm = v.iter().map(|a| a * a).sum::<f64>().sqrt();
        for (o, a) in out.row_mut(d).iter_mut().zip(&v) {
            *o = a / norm;
        }
    }
    out
}

/// 以 (网格形状, 阶数) 为键的基缓存.
///
/// 只保存最近一次构建的基. 跨迭代、跨 `segment()` 调用复用.
#[derive(Debug, Default)]
pub struct BasisCache {
    basis: Option<Arc<BiasBasis>>,
    builds: usize,
}

impl BasisCache {
    /// 空缓存.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取 (必要时构建) 形状为 `shape`、阶数为 `order` 的基.
    pub fn get_or_build(&mut self, shape: Idx3d, order: u32) -> Arc<BiasBasis> {
        if let Some(b) = &self.basis {
            if b.shape == shape && b.order == order {
                return Arc::clone(b);
            }
        }
        log::trace!("构建偏置场基, 形状 {shape:?}, 阶数 {order}");
        let b = Arc::new(BiasBasis::new(shape, order));
        self.basis = Some(Arc::clone(&b));
        self.builds += 1;
        b
    }

    /// 丢弃缓存.
    #[inline]
    pub fn invalidate(&mut self) {
        self.basis = None;
    }

    /// 累计构建次数.
    #[inline]
    pub fn build_count(&self) -> usize {
        self.builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_term_count() {
        // 阶数 2: 3 个一次项 + 6 个二次项.
        assert_eq!(BiasBasis::new((8, 8, 8), 2).term_count(), 9);
        assert_eq!(BiasBasis::new((8, 8, 8), 1).term_count(), 3);
        assert_eq!(BiasBasis::new((8, 8, 8), 0).term_count(), 0);
        // z 轴只有一个点: 只有 x, y 方向的项.
        assert_eq!(BiasBasis::new((8, 8, 1), 2).term_count(), 5);
        // 两个点的轴最多一次.
        assert_eq!(BiasBasis::new((2, 1, 1), 3).term_count(), 1);
    }

    #[test]
    fn test_orthonormal() {
        let b = BiasBasis::new((5, 4, 3), 3);
        let n = b.term_count();
        for s in 0..n {
            for t in 0..n {
                let dot: f64 = iproduct!(0..5, 0..4, 0..3)
                    .map(|idx| b.value(s, idx) * b.value(t, idx))
                    .sum();
                assert!(f64_eq(dot, if s == t { 1.0 } else { 0.0 }), "{s} {t} {dot}");
            }
            // 与常数正交.
            let mean: f64 = iproduct!(0..5, 0..4, 0..3).map(|idx| b.value(s, idx)).sum();
            assert!(f64_eq(mean, 0.0));
        }
    }

    #[test]
    fn test_evaluate_and_project() {
        let b = BiasBasis::new((6, 5, 4), 2);
        let coeffs: Vec<f64> = (0..b.term_count()).map(|t| 0.1 * t as f64 - 0.3).collect();
        let field = b.evaluate(&coeffs).unwrap();
        let back = b.project(&field);
        for (a, c) in back.iter().zip(&coeffs) {
            assert!(f64_eq(*a, *c));
        }

        assert_eq!(
            b.evaluate(&[1.0]),
            Err(ConfigError::BiasOrderMismatch {
                order: 2,
                expected: 9,
                found: 1
            })
        );
    }

    #[test]
    fn test_cache() {
        let mut cache = BasisCache::new();
        let a = cache.get_or_build((4, 4, 4), 2);
        let b = cache.get_or_build((4, 4, 4), 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.build_count(), 1);
        cache.get_or_build((4, 4, 4), 3);
        assert_eq!(cache.build_count(), 2);
        cache.invalidate();
        cache.get_or_build((4, 4, 4), 3);
        assert_eq!(cache.build_count(), 3);
    }
}
