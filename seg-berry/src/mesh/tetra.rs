//! 四面体定位 (重心坐标).

use nalgebra::{Matrix3, Vector3};

use super::AtlasMesh;
use crate::consts::{BARYCENTRIC_TOLERANCE, DEGENERATE_VOLUME};
use crate::Point3;

/// 预先求好逆矩阵的四面体, 用于快速计算重心坐标.
#[derive(Debug, Clone)]
pub(crate) struct TetraLocator {
    nodes: [usize; 4],
    origin: Vector3<f64>,
    inverse: Matrix3<f64>,
    min: Point3,
    max: Point3,
}

impl TetraLocator {
    /// 为网格中第 `t` 个四面体构建定位器. 四面体退化 (体积近似为 0) 时返回 `None`.
    pub fn new(mesh: &AtlasMesh, t: usize) -> Option<Self> {
        let nodes = mesh.tetrahedra()[t];
        let p = nodes.map(|n| mesh.positions()[n]);
        let v = p.map(|q| Vector3::new(q[0], q[1], q[2]));
        let edges = Matrix3::from_columns(&[v[1] - v[0], v[2] - v[0], v[3] - v[0]]);
        if edges.determinant().abs() / 6.0 < DEGENERATE_VOLUME {
            return None;
        }
        let inverse = edges.try_inverse()?;

        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];
        for q in p {
            for d in 0..3 {
                min[d] = min[d].min(q[d]);
                max[d] = max[d].max(q[d]);
            }
        }
        Some(Self {
            nodes,
            origin: v[0],
            inverse,
            min,
            max,
        })
    }

    /// 包围盒 `(min, max)`.
    #[inline]
    pub fn bounds(&self) -> (Point3, Point3) {
        (self.min, self.max)
    }

    /// 点 `p` 的重心坐标 `[λ0, λ1, λ2, λ3]`.
    #[inline]
    pub fn barycentric(&self, p: Point3) -> [f64; 4] {
        let l = self.inverse * (Vector3::new(p[0], p[1], p[2]) - self.origin);
        [1.0 - l.x - l.y - l.z, l.x, l.y, l.z]
    }

    /// 点在四面体内 (含边界容差) 时返回节点索引与截断、归一化后的重心坐标.
    pub fn locate(&self, p: Point3) -> Option<([usize; 4], [f64; 4])> {
        for d in 0..3 {
            if p[d] < self.min[d] - BARYCENTRIC_TOLERANCE || p[d] > self.max[d] + BARYCENTRIC_TOLERANCE
            {
                return None;
            }
        }
        let b = self.barycentric(p);
        if b.iter().any(|&l| l < -BARYCENTRIC_TOLERANCE) {
            return None;
        }
        // 容差内的微小负值截断为 0.
        let b = b.map(|l| l.max(0.0));
        let sum: f64 = b.iter().sum();
        Some((self.nodes, b.map(|l| l / sum)))
    }
}
