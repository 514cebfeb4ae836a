//! 四面体图谱网格.
//!
//! 网格节点坐标位于体素坐标系中 (体素 `(i, j, k)` 的中心为 `[i, j, k]`),
//! 每个节点携带一个长度为 "网格类别数" 的 alpha (概率) 向量.
//! 本 crate 只读取网格, 唯一的例外是部分容积模型所需的两个派生网格
//! (超分辨率网格及其逆变换), 它们由分割器自行创建和持有.

use ndarray::{Array2, ArrayView1};

use crate::{ConfigError, Idx3d, Point3};

mod tetra;

pub(crate) use tetra::TetraLocator;

/// 四面体, 即 4 个节点索引.
pub type Tetrahedron = [usize; 4];

/// 四面体图谱网格.
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasMesh {
    positions: Vec<Point3>,
    tetrahedra: Vec<Tetrahedron>,
    /// 形状 `(node, mesh class)`.
    alphas: Array2<f64>,
}

impl AtlasMesh {
    /// 构建网格并检查合法性: 节点数与 alpha 行数一致, 四面体索引不越界,
    /// 坐标有限, alpha 有限且非负.
    pub fn new(
        positions: Vec<Point3>,
        tetrahedra: Vec<Tetrahedron>,
        alphas: Array2<f64>,
    ) -> Result<Self, ConfigError> {
        if alphas.nrows() != positions.len() {
            return Err(ConfigError::InvalidMesh(format!(
                "节点数 {} 与 alpha 行数 {} 不一致",
                positions.len(),
                alphas.nrows()
            )));
        }
        if alphas.ncols() == 0 {
            return Err(ConfigError::InvalidMesh("网格类别数为 0".into()));
        }
        if let Some(t) = tetrahedra
            .iter()
            .position(|t| t.iter().any(|&n| n >= positions.len()))
        {
            return Err(ConfigError::InvalidMesh(format!(
                "第 {t} 个四面体的节点索引越界"
            )));
        }
        if positions.iter().flatten().any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidMesh("节点坐标含非有限值".into()));
        }
        if alphas.iter().any(|a| !a.is_finite() || *a < 0.0) {
            return Err(ConfigError::InvalidMesh("alpha 必须为非负有限值".into()));
        }
        Ok(Self {
            positions,
            tetrahedra,
            alphas,
        })
    }

    /// 构建覆盖整个体素网格 `shape` 的长方体网格.
    ///
    /// 网格的包围盒为 `[-0.5, n - 0.5]` (每个轴), 即恰好包住所有体素.
    /// 每个轴被均匀划分为 `cells` 个单元, 每个单元按 Kuhn 剖分切成 6 个四面体
    /// (相邻单元的剖分彼此协调). 节点上的 alpha 向量由 `alpha_fn(节点坐标)` 给出,
    /// 其长度必须为 `class_count`.
    pub fn cuboid<F>(
        shape: Idx3d,
        cells: Idx3d,
        class_count: usize,
        mut alpha_fn: F,
    ) -> Result<Self, ConfigError>
    where
        F: FnMut(Point3) -> Vec<f64>,
    {
        let (cx, cy, cz) = cells;
        if cx == 0 || cy == 0 || cz == 0 {
            return Err(ConfigError::InvalidMesh("单元划分数必须为正".into()));
        }
        let extent = [shape.0 as f64, shape.1 as f64, shape.2 as f64];
        let node_index = |i: usize, j: usize, k: usize| (i * (cy + 1) + j) * (cz + 1) + k;

        let mut positions = Vec::with_capacity((cx + 1) * (cy + 1) * (cz + 1));
        let mut alphas = Array2::zeros(((cx + 1) * (cy + 1) * (cz + 1), class_count));
        for i in 0..=cx {
            for j in 0..=cy {
                for k in 0..=cz {
                    let p = [
                        -0.5 + extent[0] * i as f64 / cx as f64,
                        -0.5 + extent[1] * j as f64 / cy as f64,
                        -0.5 + extent[2] * k as f64 / cz as f64,
                    ];
                    let a = alpha_fn(p);
                    if a.len() != class_count {
                        return Err(ConfigError::InvalidMesh(format!(
                            "alpha 向量长度 {} 与类别数 {class_count} 不一致",
                            a.len()
                        )));
                    }
                    let n = positions.len();
                    debug_assert_eq!(n, node_index(i, j, k));
                    alphas.row_mut(n).assign(&ArrayView1::from(&a[..]));
                    positions.push(p);
                }
            }
        }

        const PERMUTATIONS: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        let mut tetrahedra = Vec::with_capacity(cx * cy * cz * 6);
        for i in 0..cx {
            for j in 0..cy {
                for k in 0..cz {
                    for perm in PERMUTATIONS {
                        let mut cur = [i, j, k];
                        let mut tet = [node_index(i, j, k); 4];
                        for (step, &axis) in perm.iter().enumerate() {
                            cur[axis] += 1;
                            tet[step + 1] = node_index(cur[0], cur[1], cur[2]);
                        }
                        tetrahedra.push(tet);
                    }
                }
            }
        }

        Self::new(positions, tetrahedra, alphas)
    }

    /// 覆盖整个体素网格、各类别先验均为 `1 / class_count` 的网格.
    pub fn uniform(shape: Idx3d, class_count: usize) -> Result<Self, ConfigError> {
        if class_count == 0 {
            return Err(ConfigError::InvalidMesh("网格类别数为 0".into()));
        }
        let p = 1.0 / class_count as f64;
        Self::cuboid(shape, (1, 1, 1), class_count, |_| vec![p; class_count])
    }

    /// 节点坐标逐轴仿射变换 `p' = p * scale + offset` 后的副本.
    pub fn transformed(&self, scale: Point3, offset: Point3) -> Self {
        let positions = self
            .positions
            .iter()
            .map(|p| {
                [
                    p[0] * scale[0] + offset[0],
                    p[1] * scale[1] + offset[1],
                    p[2] * scale[2] + offset[2],
                ]
            })
            .collect();
        Self {
            positions,
            tetrahedra: self.tetrahedra.clone(),
            alphas: self.alphas.clone(),
        }
    }

    /// 变换到亚体素网格坐标系的副本.
    ///
    /// 体素坐标 `x` 对应的亚体素坐标为 `f * x + (f - 1) / 2`, 这样体素中心正好落在
    /// 其 `f` 个亚体素中心的平均位置上.
    pub fn to_super_resolution(&self, factors: [usize; 3]) -> Self {
        let f = factors.map(|f| f as f64);
        self.transformed(f, f.map(|f| (f - 1.0) / 2.0))
    }

    /// [`Self::to_super_resolution`] 的逆变换.
    pub fn from_super_resolution(&self, factors: [usize; 3]) -> Self {
        let f = factors.map(|f| f as f64);
        self.transformed(f.map(|f| 1.0 / f), f.map(|f| -(f - 1.0) / (2.0 * f)))
    }

    /// 在点 `p` 处插值 alpha 向量. 点在网格外时返回 `None`.
    ///
    /// 该函数线性扫描所有四面体, 仅适合少量查询; 整体光栅化请用
    /// [`crate::prior::rasterize`].
    pub fn interpolate(&self, p: Point3) -> Option<Vec<f64>> {
        (0..self.tetrahedra.len())
            .filter_map(|t| TetraLocator::new(self, t))
            .find_map(|loc| loc.locate(p))
            .map(|(nodes, bary)| {
                let mut out = vec![0.0; self.class_count()];
                for (n, w) in nodes.iter().zip(bary) {
                    for (o, a) in out.iter_mut().zip(self.alphas.row(*n)) {
                        *o += w * a;
                    }
                }
                out
            })
    }

    /// 节点坐标.
    #[inline]
    pub fn positions(&self) -> &[Point3] {
        &self.positions
    }

    /// 四面体.
    #[inline]
    pub fn tetrahedra(&self) -> &[Tetrahedron] {
        &self.tetrahedra
    }

    /// 节点 alpha, 形状 `(node, mesh class)`.
    #[inline]
    pub fn alphas(&self) -> &Array2<f64> {
        &self.alphas
    }

    /// 网格类别数.
    #[inline]
    pub fn class_count(&self) -> usize {
        self.alphas.ncols()
    }

    /// 节点个数.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.positions.len()
    }

    /// 四面体个数.
    #[inline]
    pub fn tetrahedron_count(&self) -> usize {
        self.tetrahedra.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f64_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_cuboid_counts() {
        let m = AtlasMesh::uniform((4, 5, 6), 3).unwrap();
        assert_eq!(m.node_count(), 8);
        assert_eq!(m.tetrahedron_count(), 6);
        assert_eq!(m.class_count(), 3);

        let m = AtlasMesh::cuboid((4, 4, 4), (2, 3, 1), 2, |_| vec![0.5, 0.5]).unwrap();
        assert_eq!(m.node_count(), 3 * 4 * 2);
        assert_eq!(m.tetrahedron_count(), 2 * 3 * 6);
    }

    #[test]
    fn test_invalid_mesh() {
        let bad = AtlasMesh::new(
            vec![[0.0; 3]; 4],
            vec![[0, 1, 2, 4]],
            Array2::from_elem((4, 2), 0.5),
        );
        assert!(matches!(bad, Err(ConfigError::InvalidMesh(_))));

        let neg = AtlasMesh::new(
            vec![[0.0; 3]; 4],
            vec![[0, 1, 2, 3]],
            Array2::from_elem((4, 2), -0.5),
        );
        assert!(neg.is_err());

        let wrong_len = AtlasMesh::cuboid((2, 2, 2), (1, 1, 1), 3, |_| vec![1.0]);
        assert!(wrong_len.is_err());
    }

    /// 线性 alpha 场在 Kuhn 剖分下被精确插值.
    #[test]
    fn test_interpolate_linear_field() {
        let m = AtlasMesh::cuboid((4, 4, 4), (2, 2, 2), 2, |p| {
            let t = (p[0] + 0.5) / 4.0;
            vec![t, 1.0 - t]
        })
        .unwrap();
        for p in [[0.0, 0.0, 0.0], [1.3, 2.7, 0.1], [3.0, 3.0, 3.0]] {
            let a = m.interpolate(p).unwrap();
            assert!(f64_eq(a[0], (p[0] + 0.5) / 4.0));
            assert!(f64_eq(a[0] + a[1], 1.0));
        }
        assert!(m.interpolate([5.0, 0.0, 0.0]).is_none());
    }

    #[test]
    fn test_super_resolution_round_trip() {
        let m = AtlasMesh::uniform((3, 3, 3), 2).unwrap();
        let f = [2, 3, 1];
        let sup = m.to_super_resolution(f);
        // 体素 0 的下边界 -0.5 对应亚体素 -0.5.
        assert!(f64_eq(sup.positions()[0][0], -0.5));
        assert!(f64_eq(sup.positions()[0][1], -0.5));
        // 上边界 2.5 对应 3 * f - 0.5.
        let last = sup.positions()[sup.node_count() - 1];
        assert!(f64_eq(last[0], 5.5));
        assert!(f64_eq(last[1], 8.5));
        assert!(f64_eq(last[2], 2.5));

        let back = sup.from_super_resolution(f);
        for (a, b) in back.positions().iter().zip(m.positions()) {
            for d in 0..3 {
                assert!(f64_eq(a[d], b[d]));
            }
        }
    }
}
